use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Filename form of a domain or image reference: `.`, `/`, `:` and spaces
/// become underscores.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '.' | '/' | ':' | ' ' => '_',
            other => other,
        })
        .collect()
}

/// Repository names are lowercase alphanumerics plus `.`, `_`, `-`, with `/`
/// separating non-empty segments. `..` never passes.
pub fn valid_repository_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    name.split('/').all(|segment| {
        !segment.is_empty()
            && segment != "."
            && segment != ".."
            && segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
    })
}

/// Joins `relative` onto `root`, rejecting absolute paths and any component
/// that would escape the root.
pub fn join_within(root: &Path, relative: &str) -> Result<PathBuf> {
    let candidate = Path::new(relative);
    let mut joined = root.to_path_buf();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::invalid("path escapes storage root"));
            }
        }
    }
    if !joined.starts_with(root) {
        return Err(Error::invalid("path escapes storage root"));
    }
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_names() {
        assert_eq!(sanitize_name("app.example.com"), "app_example_com");
        assert_eq!(sanitize_name("team/app:v1"), "team_app_v1");
        assert_eq!(sanitize_name("a b"), "a_b");
    }

    #[test]
    fn repository_name_rules() {
        assert!(valid_repository_name("myapp"));
        assert!(valid_repository_name("team/app"));
        assert!(valid_repository_name("a/b/c-d.e_f"));
        assert!(!valid_repository_name(""));
        assert!(!valid_repository_name("MyApp"));
        assert!(!valid_repository_name("../etc/passwd"));
        assert!(!valid_repository_name("a//b"));
        assert!(!valid_repository_name("a/../b"));
    }

    #[test]
    fn join_stays_within_root() {
        let root = Path::new("/data/repositories");
        assert_eq!(
            join_within(root, "team/app").unwrap(),
            PathBuf::from("/data/repositories/team/app")
        );
        assert!(join_within(root, "../../x").is_err());
        assert!(join_within(root, "/etc/passwd").is_err());
    }
}
