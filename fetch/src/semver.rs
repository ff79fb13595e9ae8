//! Semantic version comparison for `v`-prefixed module versions.
//!
//! Accepts `vMAJOR`, `vMAJOR.MINOR`, and `vMAJOR.MINOR.PATCH[-pre][+build]`.
//! The shorthand forms stand for `.0` in the missing positions and may not
//! carry a pre-release or build suffix. Build metadata is ignored when
//! comparing.

use std::cmp::Ordering;

#[derive(Debug, PartialEq, Eq)]
struct Parsed<'a> {
    major: &'a str,
    minor: &'a str,
    patch: &'a str,
    prerelease: &'a str,
}

/// Report whether `version` is a valid semantic version.
///
/// # Examples
///
/// ```
/// use modcache_fetch::semver;
///
/// assert!(semver::is_valid("v1.2.3-rc.1+meta"));
/// assert!(semver::is_valid("v2"));
/// assert!(!semver::is_valid("1.2.3"));
/// ```
#[must_use]
pub fn is_valid(version: &str) -> bool {
    parse(version).is_some()
}

/// Compare two versions. An invalid version is less than any valid one and
/// equal to any other invalid one.
#[must_use]
pub fn compare(left: &str, right: &str) -> Ordering {
    match (parse(left), parse(right)) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare_numeric(a.major, b.major)
            .then_with(|| compare_numeric(a.minor, b.minor))
            .then_with(|| compare_numeric(a.patch, b.patch))
            .then_with(|| compare_prerelease(a.prerelease, b.prerelease)),
    }
}

fn parse(version: &str) -> Option<Parsed<'_>> {
    let rest = version.strip_prefix('v')?;
    let (major, rest) = take_number(rest)?;
    if rest.is_empty() {
        return Some(Parsed {
            major,
            minor: "0",
            patch: "0",
            prerelease: "",
        });
    }
    let (minor, rest) = take_number(rest.strip_prefix('.')?)?;
    if rest.is_empty() {
        return Some(Parsed {
            major,
            minor,
            patch: "0",
            prerelease: "",
        });
    }
    let (patch, rest) = take_number(rest.strip_prefix('.')?)?;
    let (prerelease, rest) = match rest.strip_prefix('-') {
        Some(tail) => {
            let end = tail.find('+').unwrap_or(tail.len());
            let (pre, after) = tail.split_at(end);
            if !valid_identifiers(pre, true) {
                return None;
            }
            (pre, after)
        }
        None => ("", rest),
    };
    if let Some(build) = rest.strip_prefix('+') {
        if !valid_identifiers(build, false) {
            return None;
        }
    } else if !rest.is_empty() {
        return None;
    }
    Some(Parsed {
        major,
        minor,
        patch,
        prerelease,
    })
}

/// Split a leading decimal number without redundant leading zeros.
fn take_number(input: &str) -> Option<(&str, &str)> {
    let end = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, rest) = input.split_at(end);
    if digits.is_empty() || (digits.len() > 1 && digits.starts_with('0')) {
        return None;
    }
    Some((digits, rest))
}

fn valid_identifiers(list: &str, reject_leading_zero: bool) -> bool {
    !list.is_empty()
        && list.split('.').all(|ident| {
            !ident.is_empty()
                && ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && !(reject_leading_zero
                    && ident.len() > 1
                    && ident.starts_with('0')
                    && ident.chars().all(|c| c.is_ascii_digit()))
        })
}

fn compare_numeric(left: &str, right: &str) -> Ordering {
    left.len().cmp(&right.len()).then_with(|| left.cmp(right))
}

fn compare_prerelease(left: &str, right: &str) -> Ordering {
    match (left.is_empty(), right.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        (false, false) => {}
    }
    let mut lhs = left.split('.');
    let mut rhs = right.split('.');
    loop {
        match (lhs.next(), rhs.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(a), Some(b)) => {
                let ordering = compare_identifier(a, b);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

fn compare_identifier(left: &str, right: &str) -> Ordering {
    let numeric = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    match (numeric(left), numeric(right)) {
        (true, true) => compare_numeric(left, right),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.cmp(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::full("v1.2.3")]
    #[case::major_only("v1")]
    #[case::major_minor("v1.2")]
    #[case::prerelease("v1.2.3-pre.1")]
    #[case::build("v1.2.3+incompatible")]
    #[case::pseudo("v0.0.0-20191109021931-daa7c04131f5")]
    fn accepts_valid_versions(#[case] version: &str) {
        assert!(is_valid(version), "{version} should be valid");
    }

    #[rstest]
    #[case::missing_prefix("1.2.3")]
    #[case::leading_zero("v01.2.3")]
    #[case::short_with_prerelease("v1.2-pre")]
    #[case::empty_prerelease("v1.2.3-")]
    #[case::numeric_leading_zero_prerelease("v1.2.3-01")]
    #[case::trailing_garbage("v1.2.3.4")]
    #[case::empty("")]
    fn rejects_invalid_versions(#[case] version: &str) {
        assert!(!is_valid(version), "{version} should be invalid");
    }

    #[rstest]
    #[case::shorthand_equal("v1", "v1.0.0", Ordering::Equal)]
    #[case::numeric_not_lexical("v1.10.0", "v1.9.0", Ordering::Greater)]
    #[case::prerelease_first("v1.0.0-rc.1", "v1.0.0", Ordering::Less)]
    #[case::numeric_identifiers("v1.0.0-rc.2", "v1.0.0-rc.10", Ordering::Less)]
    #[case::alpha_after_numeric("v1.0.0-1", "v1.0.0-alpha", Ordering::Less)]
    #[case::longer_prerelease("v1.0.0-alpha.1", "v1.0.0-alpha", Ordering::Greater)]
    #[case::build_ignored("v1.0.0+a", "v1.0.0+b", Ordering::Equal)]
    #[case::invalid_first("bogus", "v0.0.1", Ordering::Less)]
    #[case::invalid_equal("bogus", "other", Ordering::Equal)]
    fn orders_versions(#[case] left: &str, #[case] right: &str, #[case] expected: Ordering) {
        assert_eq!(compare(left, right), expected);
        assert_eq!(compare(right, left), expected.reverse());
    }
}
