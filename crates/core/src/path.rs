//! Canonical store paths
//!
//! Every path the engine touches is first canonicalized into a
//! [`StorePath`]: an absolute `/a/b/c` string with no empty, `.`, or
//! unresolvable `..` components. History roots, journal entry paths, and
//! execution opt-out prefixes all compare component-wise, so prefix
//! relationships are well defined ( `/doc` is a prefix of `/doc/title` but
//! not of `/document` ).

use crate::error::{Error, Result};

/// A canonical absolute path into the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath {
    canonical: String,
}

impl StorePath {
    /// Parse and canonicalize a raw path string.
    ///
    /// Rules: the path must start with `/`; repeated separators collapse;
    /// `.` components are dropped; `..` pops the previous component and
    /// fails if it would escape the root; the root itself is `/`.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::InvalidPath("path may not be empty".to_string()));
        }
        if !raw.starts_with('/') {
            return Err(Error::InvalidPath(format!("path must be absolute: '{raw}'")));
        }

        let mut components: Vec<&str> = Vec::new();
        for component in raw.split('/') {
            match component {
                "" | "." => continue,
                ".." => {
                    if components.pop().is_none() {
                        return Err(Error::InvalidPathComponent(format!(
                            "path escapes the root: '{raw}'"
                        )));
                    }
                }
                other => {
                    if other.contains('\0') {
                        return Err(Error::InvalidPathComponent(format!(
                            "path component contains NUL: '{raw}'"
                        )));
                    }
                    components.push(other);
                }
            }
        }

        let canonical = if components.is_empty() {
            "/".to_string()
        } else {
            let mut joined = String::with_capacity(raw.len());
            for component in &components {
                joined.push('/');
                joined.push_str(component);
            }
            joined
        };

        Ok(StorePath { canonical })
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// The path components, root-first. The root path `/` has none.
    pub fn components(&self) -> Vec<String> {
        if self.canonical == "/" {
            return Vec::new();
        }
        self.canonical
            .split('/')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Component-wise prefix test. Every path is a prefix of itself.
    pub fn is_prefix_of(&self, other: &StorePath) -> bool {
        if self.canonical == "/" {
            return true;
        }
        if other.canonical == self.canonical {
            return true;
        }
        other
            .canonical
            .strip_prefix(&self.canonical)
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// The part of `self` below `root`, as a relative string without a
    /// leading slash. Empty when `self == root`. `None` when `self` is not
    /// under `root`.
    pub fn relative_to(&self, root: &StorePath) -> Option<String> {
        if !root.is_prefix_of(self) {
            return None;
        }
        if self.canonical == root.canonical {
            return Some(String::new());
        }
        if root.canonical == "/" {
            return Some(self.canonical[1..].to_string());
        }
        Some(self.canonical[root.canonical.len() + 1..].to_string())
    }

    /// Resolve `candidate` against this path when it is relative, then
    /// canonicalize. Absolute candidates are canonicalized as-is.
    pub fn resolve(&self, candidate: &str) -> Result<StorePath> {
        if candidate.is_empty() {
            return Err(Error::InvalidPath("path may not be empty".to_string()));
        }
        if candidate.starts_with('/') {
            return StorePath::parse(candidate);
        }
        if self.canonical == "/" {
            return StorePath::parse(&format!("/{candidate}"));
        }
        StorePath::parse(&format!("{}/{candidate}", self.canonical))
    }
}

impl std::fmt::Display for StorePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Compute the components of `path` relative to `root_components`.
///
/// Fails with `InvalidPermissions` when `path` does not lie under the root.
pub fn relative_components(
    root_components: &[String],
    path: &StorePath,
) -> Result<Vec<String>> {
    let components = path.components();
    if components.len() < root_components.len()
        || components[..root_components.len()] != *root_components
    {
        return Err(Error::InvalidPermissions(format!(
            "path outside history root: '{path}'"
        )));
    }
    Ok(components[root_components.len()..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonicalizes() {
        assert_eq!(StorePath::parse("/a//b/").unwrap().as_str(), "/a/b");
        assert_eq!(StorePath::parse("/a/./b").unwrap().as_str(), "/a/b");
        assert_eq!(StorePath::parse("/a/b/../c").unwrap().as_str(), "/a/c");
        assert_eq!(StorePath::parse("/").unwrap().as_str(), "/");
        assert_eq!(StorePath::parse("//").unwrap().as_str(), "/");
    }

    #[test]
    fn test_parse_rejects_relative_and_escaping() {
        assert!(matches!(
            StorePath::parse("doc/title"),
            Err(Error::InvalidPath(_))
        ));
        assert!(matches!(
            StorePath::parse("/.."),
            Err(Error::InvalidPathComponent(_))
        ));
        assert!(matches!(StorePath::parse(""), Err(Error::InvalidPath(_))));
    }

    #[test]
    fn test_components() {
        assert_eq!(
            StorePath::parse("/doc/title").unwrap().components(),
            vec!["doc".to_string(), "title".to_string()]
        );
        assert!(StorePath::parse("/").unwrap().components().is_empty());
    }

    #[test]
    fn test_prefix_relationships() {
        let root = StorePath::parse("/doc").unwrap();
        let inside = StorePath::parse("/doc/title").unwrap();
        let sibling = StorePath::parse("/document").unwrap();

        assert!(root.is_prefix_of(&inside));
        assert!(root.is_prefix_of(&root));
        assert!(!root.is_prefix_of(&sibling));
        assert!(StorePath::parse("/").unwrap().is_prefix_of(&sibling));
    }

    #[test]
    fn test_relative_to() {
        let root = StorePath::parse("/doc").unwrap();
        let inside = StorePath::parse("/doc/a/b").unwrap();
        assert_eq!(inside.relative_to(&root).unwrap(), "a/b");
        assert_eq!(root.relative_to(&root).unwrap(), "");
        assert!(StorePath::parse("/other")
            .unwrap()
            .relative_to(&root)
            .is_none());
    }

    #[test]
    fn test_relative_components_rejects_outside_paths() {
        let root = vec!["doc".to_string()];
        let ok = StorePath::parse("/doc/title").unwrap();
        assert_eq!(
            relative_components(&root, &ok).unwrap(),
            vec!["title".to_string()]
        );

        let bad = StorePath::parse("/other/title").unwrap();
        assert!(matches!(
            relative_components(&root, &bad),
            Err(Error::InvalidPermissions(_))
        ));
    }

    #[test]
    fn test_resolve() {
        let root = StorePath::parse("/doc").unwrap();
        assert_eq!(root.resolve("notes").unwrap().as_str(), "/doc/notes");
        assert_eq!(root.resolve("/abs").unwrap().as_str(), "/abs");
    }
}
