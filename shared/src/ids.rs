//! Helpers for validating names used in filesystem paths.

/// Returns true if a map name is safe to use as a single path component on all platforms.
///
/// Map names come from untrusted recordings, so anything that could escape the
/// target directory is rejected.
///
/// Rules:
/// - Must be non-empty and not "." or ".."
/// - Must not contain path separators ('/' or '\\')
/// - Must not contain control characters or NUL
/// - Must not contain Windows-reserved filename characters
/// - Must not end with '.' or space (Windows restriction)
pub fn is_safe_map_name(name: &str) -> bool {
    if name.is_empty() || name == "." || name == ".." {
        return false;
    }

    if name.ends_with('.') || name.ends_with(' ') {
        return false;
    }

    !name.chars().any(|c| {
        c == '/'
            || c == '\\'
            || c.is_control()
            || matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|')
    })
}

#[cfg(test)]
mod tests {
    use super::is_safe_map_name;

    #[test]
    fn accepts_common_names() {
        assert!(is_safe_map_name("dm1"));
        assert!(is_safe_map_name("ctf_5-final"));
        assert!(is_safe_map_name("Kobra 4"));
        assert!(is_safe_map_name("multeasy.v2"));
    }

    #[test]
    fn rejects_traversal() {
        assert!(!is_safe_map_name(""));
        assert!(!is_safe_map_name(".."));
        assert!(!is_safe_map_name("../maps/dm1"));
        assert!(!is_safe_map_name("maps\\dm1"));
        assert!(!is_safe_map_name("C:dm1"));
        assert!(!is_safe_map_name("dm1\0"));
    }

    #[test]
    fn rejects_trailing_dot_or_space() {
        assert!(!is_safe_map_name("dm1."));
        assert!(!is_safe_map_name("dm1 "));
    }
}
