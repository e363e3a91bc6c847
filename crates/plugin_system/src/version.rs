//! Version ordering for plugin manifests.
//!
//! Plugin authors rarely follow semver strictly (`1.0`, `v2.3`, `4.1.0-SNAPSHOT`,
//! `2.0.0-b37`), so comparison is two-tiered: strict semver when both sides
//! parse after normalization, otherwise a segment-wise comparison. Build
//! metadata (`+b37`) never affects the order.

use std::cmp::Ordering;

/// Compares two version strings.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    if let (Some(va), Some(vb)) = (to_semver(a), to_semver(b)) {
        return va.cmp_precedence(&vb);
    }
    compare_segments(a, b)
}

/// Normalizes `v1.2` / `1.2` into `1.2.0` and parses it.
fn to_semver(raw: &str) -> Option<semver::Version> {
    let trimmed = strip_prefix(raw);
    if let Ok(v) = semver::Version::parse(trimmed) {
        return Some(v);
    }

    let (core, rest) = match trimmed.find(['-', '+']) {
        Some(idx) => trimmed.split_at(idx),
        None => (trimmed, ""),
    };
    let parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.parse::<u64>().is_err()) {
        return None;
    }
    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    padded.push_str(rest);
    semver::Version::parse(&padded).ok()
}

fn strip_prefix(raw: &str) -> &str {
    let raw = raw.trim();
    raw.strip_prefix('v')
        .or_else(|| raw.strip_prefix('V'))
        .unwrap_or(raw)
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Num(u64),
    Text(&'a str),
}

fn segments(raw: &str) -> Vec<Segment<'_>> {
    strip_prefix(raw)
        .split(['.', '-', '+', '_', ' '])
        .filter(|s| !s.is_empty())
        .map(|s| match s.parse::<u64>() {
            Ok(n) => Segment::Num(n),
            Err(_) => Segment::Text(s),
        })
        .collect()
}

fn compare_segments(a: &str, b: &str) -> Ordering {
    let sa = segments(a);
    let sb = segments(b);

    for (x, y) in sa.iter().zip(sb.iter()) {
        let ord = match (x, y) {
            (Segment::Num(x), Segment::Num(y)) => x.cmp(y),
            (Segment::Text(x), Segment::Text(y)) => x.to_ascii_lowercase().cmp(&y.to_ascii_lowercase()),
            // a numeric segment outranks a qualifier: 1.0.1 > 1.0-beta
            (Segment::Num(_), Segment::Text(_)) => Ordering::Greater,
            (Segment::Text(_), Segment::Num(_)) => Ordering::Less,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    match sa.len().cmp(&sb.len()) {
        Ordering::Equal => Ordering::Equal,
        Ordering::Greater => tail_ordering(&sa[sb.len()..]),
        Ordering::Less => tail_ordering(&sb[sa.len()..]).reverse(),
    }
}

/// Ordering of the longer version relative to the shorter one, given the extra tail.
fn tail_ordering(tail: &[Segment<'_>]) -> Ordering {
    match tail.first() {
        Some(Segment::Text(_)) => Ordering::Less,
        _ if tail.iter().all(|s| *s == Segment::Num(0)) => Ordering::Equal,
        _ => Ordering::Greater,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_versions_are_padded() {
        assert_eq!(compare_versions("1.0", "1.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.0", "1.1"), Ordering::Less);
        assert_eq!(compare_versions("v2", "1.9.9"), Ordering::Greater);
    }

    #[test]
    fn test_numeric_not_lexicographic() {
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("2.0.10", "2.0.2"), Ordering::Greater);
    }

    #[test]
    fn test_prerelease_ranks_lower() {
        assert_eq!(compare_versions("4.1.0-SNAPSHOT", "4.1.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0-beta", "1.0"), Ordering::Less);
    }

    #[test]
    fn test_build_metadata_is_ignored() {
        assert_eq!(compare_versions("1.0.0+b1", "1.0.0+b2"), Ordering::Equal);
        assert_eq!(compare_versions("2.1.0+100-x", "2.1.0+60-x"), Ordering::Equal);
        assert_eq!(compare_versions("2.1.0+100", "2.1.1+1"), Ordering::Less);
    }

    #[test]
    fn test_non_semver_fallback() {
        assert_eq!(compare_versions("1.2.3.4", "1.2.3.5"), Ordering::Less);
        assert_eq!(compare_versions("build 57", "build 112"), Ordering::Less);
        assert_eq!(compare_versions("1.2.3.0", "1.2.3"), Ordering::Equal);
    }
}
