//! Score normalizers shared by every scoring algorithm.
//!
//! Each turns an ordering (or raw metric) into bounded per-server deltas,
//! adds them to the request's score accumulator, and records an
//! "increased score by X to Y" reason per server. Weights may be negative
//! to invert a preference.

use designate_core::Reasons;

use crate::algorithm::Scores;

fn bump(uuid: &str, delta: f64, scores: &mut Scores, reasons: &mut Reasons) {
    let score = scores.entry(uuid.to_string()).or_insert(0.0);
    *score += delta;
    reasons.insert(
        uuid.to_string(),
        format!("increased score by {delta:.2} to {score:.2}"),
    );
}

/// Evenly spaced deltas over a best-first ordering: the first server gets
/// `weight`, the last gets 0. A single server gets the full weight.
pub fn linear(ordered: &[&str], weight: f64, scores: &mut Scores, reasons: &mut Reasons) {
    let n = ordered.len();
    for (i, uuid) in ordered.iter().enumerate() {
        let delta = if n == 1 {
            weight
        } else {
            (n - 1 - i) as f64 / (n - 1) as f64 * weight
        };
        bump(uuid, delta, scores, reasons);
    }
}

/// Like [`linear`], over best-first buckets whose members share a delta.
pub fn linear_buckets(
    buckets: &[Vec<&str>],
    weight: f64,
    scores: &mut Scores,
    reasons: &mut Reasons,
) {
    let n = buckets.len();
    for (i, bucket) in buckets.iter().enumerate() {
        let delta = if n == 1 {
            weight
        } else {
            (n - 1 - i) as f64 / (n - 1) as f64 * weight
        };
        for uuid in bucket {
            bump(uuid, delta, scores, reasons);
        }
    }
}

/// Min-max scale raw values into `[0, |weight|]`.
///
/// A positive weight favours high values, a negative one low values. When
/// every value is equal each server gets the raw `weight`.
pub fn normalize(values: &[(&str, f64)], weight: f64, scores: &mut Scores, reasons: &mut Reasons) {
    let Some(min) = values.iter().map(|(_, v)| *v).reduce(f64::min) else {
        return;
    };
    let max = values.iter().map(|(_, v)| *v).fold(min, f64::max);
    let range = max - min;

    for (uuid, value) in values {
        let delta = if range == 0.0 {
            weight
        } else if weight >= 0.0 {
            (value - min) / range * weight
        } else {
            (max - value) / range * weight.abs()
        };
        bump(uuid, delta, scores, reasons);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_linear(ordered: &[&str], weight: f64) -> Scores {
        let mut scores = Scores::new();
        let mut reasons = Reasons::new();
        linear(ordered, weight, &mut scores, &mut reasons);
        scores
    }

    #[test]
    fn linear_single_gets_full_weight() {
        let scores = run_linear(&["s1"], 3.0);
        assert_eq!(scores["s1"], 3.0);
    }

    #[test]
    fn linear_spaces_evenly() {
        let scores = run_linear(&["s1", "s2", "s3", "s4", "s5"], 2.0);
        assert_eq!(scores["s1"], 2.0);
        assert_eq!(scores["s2"], 1.5);
        assert_eq!(scores["s3"], 1.0);
        assert_eq!(scores["s4"], 0.5);
        assert_eq!(scores["s5"], 0.0);
    }

    #[test]
    fn linear_negative_weight_inverts() {
        let scores = run_linear(&["s1", "s2", "s3"], -1.0);
        assert_eq!(scores["s1"], -1.0);
        assert_eq!(scores["s2"], -0.5);
        assert_eq!(scores["s3"], 0.0);
    }

    #[test]
    fn linear_accumulates_and_explains() {
        let mut scores = Scores::new();
        scores.insert("s1".into(), 1.0);
        let mut reasons = Reasons::new();
        linear(&["s1", "s2"], 2.0, &mut scores, &mut reasons);
        assert_eq!(scores["s1"], 3.0);
        assert_eq!(reasons["s1"], "increased score by 2.00 to 3.00");
        assert_eq!(reasons["s2"], "increased score by 0.00 to 0.00");
    }

    #[test]
    fn buckets_share_deltas() {
        let mut scores = Scores::new();
        let mut reasons = Reasons::new();
        let buckets = vec![vec!["s1", "s2"], vec!["s3"], vec!["s4", "s5"]];
        linear_buckets(&buckets, 4.0, &mut scores, &mut reasons);
        assert_eq!(scores["s1"], 4.0);
        assert_eq!(scores["s2"], 4.0);
        assert_eq!(scores["s3"], 2.0);
        assert_eq!(scores["s4"], 0.0);
        assert_eq!(scores["s5"], 0.0);
        assert_eq!(reasons.len(), 5);
    }

    #[test]
    fn single_bucket_gets_full_weight() {
        let mut scores = Scores::new();
        let mut reasons = Reasons::new();
        linear_buckets(&[vec!["s1", "s2"]], 1.5, &mut scores, &mut reasons);
        assert_eq!(scores["s1"], 1.5);
        assert_eq!(scores["s2"], 1.5);
    }

    #[test]
    fn normalize_scales_to_weight() {
        let mut scores = Scores::new();
        let mut reasons = Reasons::new();
        normalize(&[("s1", 100.0), ("s2", 300.0), ("s3", 200.0)], 2.0, &mut scores, &mut reasons);
        assert_eq!(scores["s1"], 0.0);
        assert_eq!(scores["s2"], 2.0);
        assert_eq!(scores["s3"], 1.0);
    }

    #[test]
    fn normalize_negative_weight_prefers_low() {
        let mut scores = Scores::new();
        let mut reasons = Reasons::new();
        normalize(&[("s1", 100.0), ("s2", 300.0), ("s3", 200.0)], -2.0, &mut scores, &mut reasons);
        assert_eq!(scores["s1"], 2.0);
        assert_eq!(scores["s2"], 0.0);
        assert_eq!(scores["s3"], 1.0);
    }

    #[test]
    fn normalize_equal_values_get_raw_weight() {
        let mut scores = Scores::new();
        let mut reasons = Reasons::new();
        normalize(&[("s1", 7.0), ("s2", 7.0)], -1.0, &mut scores, &mut reasons);
        assert_eq!(scores["s1"], -1.0);
        assert_eq!(scores["s2"], -1.0);
    }

    #[test]
    fn normalize_empty_is_noop() {
        let mut scores = Scores::new();
        let mut reasons = Reasons::new();
        normalize(&[], 1.0, &mut scores, &mut reasons);
        assert!(scores.is_empty());
        assert!(reasons.is_empty());
    }
}
