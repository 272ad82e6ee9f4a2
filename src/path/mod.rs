use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{DfsError, Result};

/// Component separator of the canonical string form.
pub const SEPARATOR: char = '/';

/// Reserved for application use; never allowed inside a component.
pub const DELIMITER: char = ':';

/// An immutable, rooted path in the distributed filesystem.
///
/// The root is the empty component sequence and prints as `/`. Equality and
/// ordering follow the canonical string form, so `/a/b` sorts before `/a/c`
/// and after `/a`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Path {
    components: Vec<String>,
}

impl Path {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a path string. It must start with `/`; empty components are
    /// dropped, so `//a///b/` is `/a/b`.
    pub fn parse(s: &str) -> Result<Self> {
        if !s.starts_with(SEPARATOR) {
            return Err(DfsError::BadArgument(format!("path {s:?} is not rooted")));
        }
        if s.contains(DELIMITER) {
            return Err(DfsError::BadArgument(format!(
                "path {s:?} contains the reserved delimiter"
            )));
        }
        let components = s
            .split(SEPARATOR)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self { components })
    }

    /// A new path with `component` appended.
    pub fn child(&self, component: &str) -> Result<Self> {
        if component.is_empty() || component.contains(SEPARATOR) || component.contains(DELIMITER)
        {
            return Err(DfsError::BadArgument(format!(
                "invalid path component {component:?}"
            )));
        }
        let mut components = self.components.clone();
        components.push(component.to_string());
        Ok(Self { components })
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Number of components; the root has depth 0.
    pub fn depth(&self) -> usize {
        self.components.len()
    }

    pub fn parent(&self) -> Result<Self> {
        match self.components.split_last() {
            Some((_, rest)) => Ok(Self {
                components: rest.to_vec(),
            }),
            None => Err(DfsError::BadArgument("the root has no parent".into())),
        }
    }

    pub fn last(&self) -> Result<&str> {
        self.components
            .last()
            .map(String::as_str)
            .ok_or_else(|| DfsError::BadArgument("the root has no last component".into()))
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.components.iter().map(String::as_str)
    }

    /// Every proper ancestor, root first, ending at the immediate parent.
    /// Empty for the root.
    pub fn ancestors(&self) -> Vec<Path> {
        (0..self.components.len())
            .map(|len| Self {
                components: self.components[..len].to_vec(),
            })
            .collect()
    }

    /// True if `other` is a prefix of this path. Every path is a subpath of
    /// itself, and the root is a subpath of everything.
    pub fn is_subpath(&self, other: &Path) -> bool {
        self.components.starts_with(&other.components)
    }

    /// Map this path onto a directory of the local filesystem.
    pub fn to_local(&self, root: &std::path::Path) -> PathBuf {
        let mut local = root.to_path_buf();
        local.extend(&self.components);
        local
    }

    /// Every regular file below `dir` on the local filesystem, as paths
    /// relative to `dir`. Blocks on the filesystem; storage servers call it
    /// from the blocking pool to advertise their content.
    pub fn list(dir: &std::path::Path) -> Result<Vec<Path>> {
        let meta = fs::metadata(dir)
            .map_err(|_| DfsError::NotFound(format!("{}", dir.display())))?;
        if !meta.is_dir() {
            return Err(DfsError::BadArgument(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        let mut out = Vec::new();
        walk(dir, &Path::root(), &mut out)?;
        out.sort();
        Ok(out)
    }
}

fn walk(dir: &std::path::Path, prefix: &Path, out: &mut Vec<Path>) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| DfsError::Io(e.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|e| DfsError::Io(e.to_string()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Ok(path) = prefix.child(&name) else {
            // Names we cannot express (e.g. containing ':') are not exported.
            continue;
        };
        let file_type = entry.file_type().map_err(|e| DfsError::Io(e.to_string()))?;
        if file_type.is_dir() {
            walk(&entry.path(), &path, out)?;
        } else if file_type.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return f.write_str("/");
        }
        for c in &self.components {
            write!(f, "/{c}")?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = DfsError;

    fn from_str(s: &str) -> Result<Self> {
        Path::parse(s)
    }
}

impl TryFrom<String> for Path {
    type Error = DfsError;

    fn try_from(s: String) -> Result<Self> {
        Path::parse(&s)
    }
}

impl From<Path> for String {
    fn from(path: Path) -> Self {
        path.to_string()
    }
}

impl Ord for Path {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl PartialOrd for Path {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
