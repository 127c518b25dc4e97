//! Platform version constraints.
//!
//! Images and packages pin platforms with maps of SDC version → platform
//! timestamp. A server's platform is the pair (`SDC Version`,
//! `Live Image`); timestamps are `YYYYMMDDTHHMMSSZ` and compare as strings.

use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Compare dotted versions numerically, segment by segment. Missing
/// segments count as zero and non-numeric segments compare as strings.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (l, r) => {
                let l = l.unwrap_or("0");
                let r = r.unwrap_or("0");
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Check the server platform against a minimum.
///
/// The entry with the highest version not above the server's decides: an
/// older version always passes, the same version requires a timestamp no
/// older than the entry's. A server older than every entry fails.
pub fn check_min(
    min: &BTreeMap<String, String>,
    sdc_version: Option<&str>,
    live_image: Option<&str>,
) -> Result<(), String> {
    check(min, sdc_version, live_image, Bound::Min)
}

/// Mirror of [`check_min`] for maximums.
pub fn check_max(
    max: &BTreeMap<String, String>,
    sdc_version: Option<&str>,
    live_image: Option<&str>,
) -> Result<(), String> {
    check(max, sdc_version, live_image, Bound::Max)
}

#[derive(Clone, Copy)]
enum Bound {
    Min,
    Max,
}

fn check(
    requirements: &BTreeMap<String, String>,
    sdc_version: Option<&str>,
    live_image: Option<&str>,
    bound: Bound,
) -> Result<(), String> {
    if requirements.is_empty() {
        return Ok(());
    }
    let (Some(version), Some(image)) = (sdc_version, live_image) else {
        return Err("server does not report its platform version".to_string());
    };

    let entry = match bound {
        Bound::Min => requirements
            .iter()
            .filter(|(v, _)| compare_versions(v, version) != Ordering::Greater)
            .max_by(|(a, _), (b, _)| compare_versions(a, b)),
        Bound::Max => requirements
            .iter()
            .filter(|(v, _)| compare_versions(v, version) != Ordering::Less)
            .min_by(|(a, _), (b, _)| compare_versions(a, b)),
    };

    let Some((want_version, want_image)) = entry else {
        let word = match bound {
            Bound::Min => "older than every required minimum",
            Bound::Max => "newer than every allowed maximum",
        };
        return Err(format!("platform {version}/{image} is {word}"));
    };

    if compare_versions(want_version, version) != Ordering::Equal {
        return Ok(());
    }
    let ok = match bound {
        Bound::Min => image >= want_image.as_str(),
        Bound::Max => image <= want_image.as_str(),
    };
    if ok {
        Ok(())
    } else {
        let (word, rel) = match bound {
            Bound::Min => ("minimum", "older"),
            Bound::Max => ("maximum", "newer"),
        };
        Err(format!(
            "platform {version}/{image} is {rel} than {word} {want_version}/{want_image}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reqs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn versions_compare_numerically() {
        assert_eq!(compare_versions("7.0", "7.0"), Ordering::Equal);
        assert_eq!(compare_versions("7.10", "7.9"), Ordering::Greater);
        assert_eq!(compare_versions("6.5", "7"), Ordering::Less);
        assert_eq!(compare_versions("7", "7.0"), Ordering::Equal);
    }

    #[test]
    fn empty_requirements_pass() {
        assert!(check_min(&BTreeMap::new(), None, None).is_ok());
        assert!(check_max(&BTreeMap::new(), None, None).is_ok());
    }

    #[test]
    fn missing_platform_fails_when_constrained() {
        let min = reqs(&[("7.0", "20240101T000000Z")]);
        assert!(check_min(&min, None, Some("20240101T000000Z")).is_err());
    }

    #[test]
    fn min_same_version_compares_timestamp() {
        let min = reqs(&[("7.0", "20240101T000000Z")]);
        assert!(check_min(&min, Some("7.0"), Some("20240101T000000Z")).is_ok());
        assert!(check_min(&min, Some("7.0"), Some("20240301T000000Z")).is_ok());
        assert!(check_min(&min, Some("7.0"), Some("20231201T000000Z")).is_err());
    }

    #[test]
    fn min_newer_version_passes_older_fails() {
        let min = reqs(&[("7.0", "20240101T000000Z")]);
        assert!(check_min(&min, Some("7.1"), Some("20200101T000000Z")).is_ok());
        assert!(check_min(&min, Some("6.5"), Some("20300101T000000Z")).is_err());
    }

    #[test]
    fn min_picks_closest_lower_entry() {
        let min = reqs(&[("6.5", "20150101T000000Z"), ("7.0", "20240101T000000Z")]);
        assert!(check_min(&min, Some("6.5"), Some("20160101T000000Z")).is_ok());
        assert!(check_min(&min, Some("7.0"), Some("20160101T000000Z")).is_err());
    }

    #[test]
    fn max_mirrors_min() {
        let max = reqs(&[("7.0", "20240101T000000Z")]);
        assert!(check_max(&max, Some("7.0"), Some("20231201T000000Z")).is_ok());
        assert!(check_max(&max, Some("7.0"), Some("20240301T000000Z")).is_err());
        assert!(check_max(&max, Some("6.5"), Some("20300101T000000Z")).is_ok());
        assert!(check_max(&max, Some("7.1"), Some("20200101T000000Z")).is_err());
    }
}
