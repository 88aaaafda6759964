//! Version tag comparison
//!
//! Version tags are `v{N}` strings. Comparison is numeric: `v10` beats
//! `v2`, which lexicographic ordering would get wrong.

/// Parse a `v{N}` tag into its numeric part
fn parse_version(tag: &str) -> Option<u64> {
    tag.strip_prefix('v').and_then(|n| n.parse().ok())
}

/// The highest version tag in a list, compared numerically
///
/// Tags that do not parse as `v{N}` are ignored.
pub fn current_version<'a, I>(versions: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    versions
        .into_iter()
        .filter_map(|tag| parse_version(tag).map(|n| (n, tag)))
        .max_by_key(|(n, _)| *n)
        .map(|(_, tag)| tag.to_string())
}

/// The tag following the current highest (`v1` when the list is empty)
pub fn next_version<'a, I>(versions: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let highest = versions.into_iter().filter_map(parse_version).max();
    format!("v{}", highest.map_or(1, |n| n + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_not_lexicographic() {
        assert_eq!(
            current_version(["v2", "v10"]),
            Some("v10".to_string())
        );
    }

    #[test]
    fn test_ignores_malformed_tags() {
        assert_eq!(
            current_version(["v3", "draft", "v1"]),
            Some("v3".to_string())
        );
        assert_eq!(current_version(["draft"]), None);
    }

    #[test]
    fn test_next_version() {
        assert_eq!(next_version(["v2", "v10"]), "v11");
        assert_eq!(next_version([]), "v1");
    }
}
