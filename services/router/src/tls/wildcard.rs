//! Hostname pattern matching for certificate selection.
//!
//! Patterns are dot-separated labels where one label may be `*`. Only the
//! labels on either side of the `*` are compared, against the head and tail
//! of the hostname, so the `*` spans any number of labels: `*.example.com`
//! matches `a.example.com`, `a.b.example.com` and `example.com` alike.
//! A `*` with no labels after it (`*`, `www.*`) matches nothing.
//! There is no specificity ranking; the table decides by order.
//!
//! Labels are compared exactly; callers normalize case beforehand.

/// Returns true if `hostname` is served by `pattern`.
pub fn matches(pattern: &str, hostname: &str) -> bool {
    if pattern.is_empty() || hostname.is_empty() {
        return false;
    }

    let pattern_labels: Vec<&str> = pattern.split('.').collect();
    let host_labels: Vec<&str> = hostname.split('.').collect();

    let Some(star) = pattern_labels.iter().position(|l| *l == "*") else {
        return pattern_labels == host_labels;
    };

    let pre = &pattern_labels[..star];
    let post = &pattern_labels[star + 1..];
    if post.is_empty() {
        return false;
    }

    labels_prefix(&host_labels, pre) && labels_suffix(&host_labels, post)
}

/// First `expected.len()` labels of `host` equal `expected`.
fn labels_prefix(host: &[&str], expected: &[&str]) -> bool {
    host.len() >= expected.len() && host[..expected.len()] == *expected
}

/// Last `expected.len()` labels of `host` equal `expected`.
fn labels_suffix(host: &[&str], expected: &[&str]) -> bool {
    if expected.len() > host.len() {
        return false;
    }
    host[host.len() - expected.len()..] == *expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_wildcard() {
        assert!(matches("*.example.com", "foo.example.com"));
        assert!(!matches("*.example.com", "foo.example.org"));
        assert!(!matches("*.example.com", "example.org"));
    }

    #[test]
    fn test_leading_wildcard_unbounded_depth() {
        assert!(matches("*.example.com", "a.b.example.com"));
        assert!(matches("*.com", "a.b.c.com"));
    }

    #[test]
    fn test_leading_wildcard_bare_apex() {
        // The labels after `*` are compared against the hostname's tail only.
        assert!(matches("*.example.com", "example.com"));
    }

    #[test]
    fn test_lone_star_matches_nothing() {
        assert!(!matches("*", "anything.at.all"));
        assert!(!matches("*", "localhost"));
    }

    #[test]
    fn test_interior_wildcard() {
        assert!(matches("a.*.com", "a.b.com"));
        assert!(!matches("a.*.com", "x.b.com"));
        assert!(!matches("a.*.com", "a.b.org"));
    }

    #[test]
    fn test_interior_wildcard_unbounded_middle() {
        assert!(matches("a.*.com", "a.b.c.d.com"));
        assert!(matches("api.*.example.com", "api.eu.west.example.com"));
        assert!(!matches("api.*.example.com", "www.eu.example.com"));
    }

    #[test]
    fn test_trailing_wildcard_matches_nothing() {
        assert!(!matches("www.*", "www.example.com"));
        assert!(!matches("www.*", "www"));
        assert!(!matches("www.*", "api.example.com"));
    }

    #[test]
    fn test_interior_wildcard_short_hostname() {
        assert!(!matches("a.b.*.com", "a.com"));
        // Prefix and suffix may overlap.
        assert!(matches("a.*.a", "a"));
    }

    #[test]
    fn test_exact_match() {
        assert!(matches("example.com", "example.com"));
        assert!(!matches("example.com", "www.example.com"));
        assert!(!matches("www.example.com", "example.com"));
    }

    #[test]
    fn test_empty_inputs_never_match() {
        assert!(!matches("", "x"));
        assert!(!matches("x", ""));
        assert!(!matches("", ""));
        assert!(!matches("*", ""));
    }
}
