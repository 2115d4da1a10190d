//! Colon-segmented wildcard pattern matching shared by the fact store, the
//! rule manager's fact-trigger index, and event-topic subscriptions.
//!
//! Grammar: segments separated by `:`. `*` matches exactly one segment.
//! `**` matches zero or more segments and is only meaningful in subscriber
//! patterns, not in query/trigger patterns (spec §4.1).

/// True if `pattern` has no `*`/`**` segments, i.e. it is an exact key.
pub fn is_exact(pattern: &str) -> bool {
    !pattern.split(':').any(|seg| seg == "*" || seg == "**")
}

pub fn segment_count(key: &str) -> usize {
    key.split(':').count()
}

/// Match `key` against `pattern` using `*` (one segment) and `**` (zero or
/// more segments) wildcards.
pub fn matches(pattern: &str, key: &str) -> bool {
    let pat: Vec<&str> = pattern.split(':').collect();
    let seg: Vec<&str> = key.split(':').collect();
    matches_segments(&pat, &seg)
}

fn matches_segments(pat: &[&str], seg: &[&str]) -> bool {
    match pat.first() {
        None => seg.is_empty(),
        Some(&"**") => {
            if pat.len() == 1 {
                return true;
            }
            // Try consuming 0..=seg.len() segments for "**".
            for i in 0..=seg.len() {
                if matches_segments(&pat[1..], &seg[i..]) {
                    return true;
                }
            }
            false
        }
        Some(&"*") => !seg.is_empty() && matches_segments(&pat[1..], &seg[1..]),
        Some(p) => seg.first() == Some(p) && matches_segments(&pat[1..], &seg[1..]),
    }
}

/// Match without `**` support — used for query/trigger patterns of a fixed
/// arity, per spec §4.1's "query of a pattern with arity n scans only the
/// n-bucket" design: a pattern and key must have equal segment count.
pub fn matches_fixed_arity(pattern: &str, key: &str) -> bool {
    let pat: Vec<&str> = pattern.split(':').collect();
    let seg: Vec<&str> = key.split(':').collect();
    if pat.len() != seg.len() {
        return false;
    }
    pat.iter().zip(seg.iter()).all(|(p, s)| *p == "*" || p == s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_key_has_no_wildcards() {
        assert!(is_exact("user:U1:profile"));
        assert!(!is_exact("user:*:profile"));
        assert!(!is_exact("user:**"));
    }

    #[test]
    fn fixed_arity_requires_equal_segments() {
        assert!(matches_fixed_arity("user:*", "user:U1"));
        assert!(!matches_fixed_arity("user:*", "user:U1:profile"));
        assert!(matches_fixed_arity("user:U1", "user:U1"));
        assert!(!matches_fixed_arity("user:U1", "user:U2"));
    }

    #[test]
    fn double_star_matches_zero_or_more() {
        assert!(matches("user:**", "user"));
        assert!(matches("user:**", "user:U1"));
        assert!(matches("user:**", "user:U1:profile"));
        assert!(!matches("user:**", "account:U1"));
    }

    #[test]
    fn single_star_matches_exactly_one_segment() {
        assert!(matches("user:*:profile", "user:U1:profile"));
        assert!(!matches("user:*:profile", "user:profile"));
        assert!(!matches("user:*:profile", "user:U1:U2:profile"));
    }
}
