//! Semantic version comparison following the SemVer 2.0 precedence rules.
//!
//! Used to decide whether a bundle's `ociVersion` is within the range this
//! runtime supports.

use std::cmp::Ordering;

/// Returns true if `s` consists solely of ASCII digits.
pub fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Compare two pre-release identifiers.
///
/// Numeric identifiers always have lower precedence than alphanumeric ones;
/// numeric identifiers compare numerically, alphanumeric ones lexically.
fn cmp_identifier(a: &str, b: &str) -> Ordering {
    match (is_numeric(a), is_numeric(b)) {
        (true, true) => {
            // Leading zeroes are formally invalid; tolerate them by
            // comparing the parsed values.
            let an: u64 = a.parse().unwrap_or(0);
            let bn: u64 = b.parse().unwrap_or(0);
            an.cmp(&bn)
        }
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.cmp(b),
    }
}

/// Compare the dot-separated pre-release parts of two versions.
///
/// A version without a pre-release part outranks one that has one. Between
/// two pre-releases, identifiers are compared pairwise and a shorter list
/// loses against a longer one with an equal prefix.
fn cmp_prerelease(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            let mut ai = a.split('.');
            let mut bi = b.split('.');
            loop {
                match (ai.next(), bi.next()) {
                    (None, None) => return Ordering::Equal,
                    (None, Some(_)) => return Ordering::Less,
                    (Some(_), None) => return Ordering::Greater,
                    (Some(x), Some(y)) => match cmp_identifier(x, y) {
                        Ordering::Equal => continue,
                        other => return other,
                    },
                }
            }
        }
    }
}

/// Compare two version strings, returning the sign of `a - b`.
///
/// The numeric core (`major.minor.patch`) compares field by field; missing
/// fields count as zero. Build metadata (after `+`) is ignored.
pub fn cmp(a: &str, b: &str) -> Ordering {
    let (a, b) = (strip_build(a), strip_build(b));

    let (a_core, a_pre) = split_prerelease(a);
    let (b_core, b_pre) = split_prerelease(b);

    let mut an = a_core.split('.').map(|f| f.parse::<u64>().unwrap_or(0));
    let mut bn = b_core.split('.').map(|f| f.parse::<u64>().unwrap_or(0));

    for _ in 0..3 {
        let x = an.next().unwrap_or(0);
        let y = bn.next().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    cmp_prerelease(a_pre, b_pre)
}

fn strip_build(v: &str) -> &str {
    v.split('+').next().unwrap_or(v)
}

fn split_prerelease(v: &str) -> (&str, Option<&str>) {
    match v.find('-') {
        Some(idx) => (&v[..idx], Some(&v[idx + 1..])),
        None => (v, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_fields() {
        assert_eq!(cmp("1.9.0", "1.10.0"), Ordering::Less);
        assert_eq!(cmp("1.9.0", "1.11.0"), Ordering::Less);
        assert_eq!(cmp("1.10.0", "1.11.0"), Ordering::Less);

        assert_eq!(cmp("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(cmp("1.11.0", "1.10.0"), Ordering::Greater);
        assert_eq!(cmp("1.11.0", "1.9.0"), Ordering::Greater);

        assert_eq!(cmp("1.0.0", "1.0.0"), Ordering::Equal);
    }

    #[test]
    fn prerelease_precedence() {
        assert_eq!(cmp("1.0.0-alpha", "1.0.0"), Ordering::Less);
        assert_eq!(cmp("0.0-alpha", "1.0.0-alpha.1"), Ordering::Less);
        assert_eq!(cmp("1.0.0-alpha.1", "1.0.0-alpha.beta"), Ordering::Less);
        assert_eq!(cmp("1.0.0-alpha.beta", "1.0.0-beta"), Ordering::Less);
        assert_eq!(cmp("1.0.0-beta", "1.0.0-beta.2"), Ordering::Less);
        assert_eq!(cmp("1.0.0-beta.2", "1.0.0-beta.11"), Ordering::Less);
        assert_eq!(cmp("1.0.0-beta.11", "1.0.0-rc.1"), Ordering::Less);
        assert_eq!(cmp("1.0.0-rc.1", "1.0.0"), Ordering::Less);
        assert_eq!(cmp("0.0-alpha", "1.0.0"), Ordering::Less);
    }

    #[test]
    fn short_versions() {
        assert_eq!(cmp("1.0", "1.0.0"), Ordering::Equal);
        assert_eq!(cmp("1", "1.0.1"), Ordering::Less);
    }

    #[test]
    fn build_metadata_ignored() {
        assert_eq!(cmp("1.0.0+build.5", "1.0.0"), Ordering::Equal);
        assert_eq!(cmp("1.0.0-rc.1+build.5", "1.0.0-rc.1"), Ordering::Equal);
    }

    #[test]
    fn numeric_detection() {
        assert!(!is_numeric(""));
        assert!(!is_numeric("abc"));
        assert!(!is_numeric("1e5"));
        assert!(!is_numeric("#@$!"));
        assert!(is_numeric("5289"));
    }
}
