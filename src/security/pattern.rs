//! Path patterns for exclusion lists.
//!
//! | Pattern          | Example match                |
//! |------------------|------------------------------|
//! | `/webhooks`      | `/webhooks`, `/webhooks/`    |
//! | `/webhooks/*`    | `/webhooks/github/push`      |
//! | `/api/*/upload`  | `/api/v2/upload`             |
//!
//! Trailing slashes are normalized on both patterns and incoming paths, so
//! `/users/` and `/users` are treated as equivalent. `*` matches any run of
//! characters, including `/`.

/// A compiled path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    // Matches one exact path string, e.g. `/users`.
    Exact(String),
    // Literal pieces between `*`s, e.g. `/api/*/upload` → ["/api/", "/upload"].
    Wildcard(Vec<String>),
}

impl PathPattern {
    /// Parse a pattern string.
    ///
    /// # Examples
    ///
    /// ```
    /// use tandem::security::PathPattern;
    ///
    /// assert!(PathPattern::parse("/files/*").matches("/files/docs/readme.txt"));
    /// assert!(PathPattern::parse("/users/").matches("/users"));
    /// assert!(!PathPattern::parse("/users").matches("/users/42"));
    /// ```
    pub fn parse(pattern: &str) -> Self {
        let pattern = trim_trailing_slash(pattern);
        if pattern.contains('*') {
            PathPattern::Wildcard(pattern.split('*').map(str::to_owned).collect())
        } else {
            PathPattern::Exact(pattern.to_owned())
        }
    }

    /// Returns `true` when `path` matches this pattern.
    pub fn matches(&self, path: &str) -> bool {
        let path = trim_trailing_slash(path);
        match self {
            PathPattern::Exact(p) => p == path,
            PathPattern::Wildcard(parts) => wildcard_match(parts, path),
        }
    }
}

fn trim_trailing_slash(path: &str) -> &str {
    if path != "/" && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

// `parts` always has at least two entries: the text before the first `*` and
// the text after the last one.
fn wildcard_match(parts: &[String], path: &str) -> bool {
    let (Some(first), Some(last)) = (parts.first(), parts.last()) else {
        return false;
    };
    let Some(mut rest) = path.strip_prefix(first.as_str()) else {
        return false;
    };
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle.as_str()) {
            Some(pos) => rest = &rest[pos + middle.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_exact() {
        assert_eq!(PathPattern::parse("/users"), PathPattern::Exact("/users".into()));
        assert_eq!(PathPattern::parse("/"), PathPattern::Exact("/".into()));
        assert_eq!(PathPattern::parse("/users/"), PathPattern::Exact("/users".into()));
    }

    #[test]
    fn parse_wildcard() {
        assert_eq!(
            PathPattern::parse("/api/*/upload"),
            PathPattern::Wildcard(vec!["/api/".into(), "/upload".into()])
        );
    }

    #[test]
    fn exact_matching() {
        let pat = PathPattern::parse("/users");
        assert!(pat.matches("/users"));
        assert!(pat.matches("/users/"));
        assert!(!pat.matches("/posts"));

        let root = PathPattern::parse("/");
        assert!(root.matches("/"));
        assert!(!root.matches("/other"));
    }

    #[test]
    fn trailing_wildcard() {
        let pat = PathPattern::parse("/files/*");
        assert!(pat.matches("/files/docs/readme.txt"));
        assert!(pat.matches("/files/a"));
        assert!(!pat.matches("/other/readme.txt"));
    }

    #[test]
    fn inner_and_multiple_wildcards() {
        let pat = PathPattern::parse("/api/*/upload");
        assert!(pat.matches("/api/v2/upload"));
        assert!(pat.matches("/api/v2/deep/upload"));
        assert!(!pat.matches("/api/v2/download"));

        let pat = PathPattern::parse("*/hooks/*");
        assert!(pat.matches("/tenant/hooks/github"));
        assert!(!pat.matches("/tenant/hook/github"));

        let everything = PathPattern::parse("*");
        assert!(everything.matches("/anything/at/all"));
    }

    #[test]
    fn overlapping_prefix_and_suffix_do_not_match() {
        // "/abc" would need the "b" to serve as both prefix and suffix
        let pat = PathPattern::parse("/ab*bc");
        assert!(!pat.matches("/abc"));
        assert!(pat.matches("/abbc"));
    }
}
