//! Similarity scoring between a presented biometric sample and a stored template.

use crate::models::biometric::BiometricType;

/// Scores a presented sample against a decrypted template on a 0-100 scale.
pub trait BiometricMatcher: Send + Sync {
    fn score(&self, kind: BiometricType, presented: &str, stored: &str) -> f64;
}

/// Normalized edit distance over the opaque template strings, scaled by a
/// per-modality multiplier.
///
/// This is a placeholder heuristic for development and tests. Production
/// deployments plug in a vendor matcher behind [`BiometricMatcher`].
#[derive(Debug, Default, Clone, Copy)]
pub struct EditDistanceMatcher;

impl EditDistanceMatcher {
    pub fn multiplier(kind: BiometricType) -> f64 {
        match kind {
            BiometricType::Fingerprint => 0.95,
            BiometricType::Face => 0.85,
            BiometricType::Voice => 0.80,
            BiometricType::Iris => 0.98,
        }
    }
}

impl BiometricMatcher for EditDistanceMatcher {
    fn score(&self, kind: BiometricType, presented: &str, stored: &str) -> f64 {
        let similarity = normalized_similarity(presented, stored);
        (similarity * Self::multiplier(kind) * 100.0).clamp(0.0, 100.0)
    }
}

/// `1 - levenshtein(a, b) / max(len(a), len(b))`; two empty strings are identical.
pub fn normalized_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / longest as f64
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levenshtein_known_values() {
        let d = |a: &str, b: &str| {
            levenshtein(
                &a.chars().collect::<Vec<_>>(),
                &b.chars().collect::<Vec<_>>(),
            )
        };
        assert_eq!(d("kitten", "sitting"), 3);
        assert_eq!(d("", "abc"), 3);
        assert_eq!(d("same", "same"), 0);
    }

    #[test]
    fn identical_templates_score_the_multiplier() {
        let matcher = EditDistanceMatcher;
        let sample = "a".repeat(120);
        let score = matcher.score(BiometricType::Iris, &sample, &sample);
        assert!((score - 98.0).abs() < 1e-9);
        let score = matcher.score(BiometricType::Voice, &sample, &sample);
        assert!((score - 80.0).abs() < 1e-9);
    }

    #[test]
    fn unrelated_templates_score_low() {
        let matcher = EditDistanceMatcher;
        let score = matcher.score(BiometricType::Face, &"a".repeat(100), &"b".repeat(100));
        assert_eq!(score, 0.0);
    }

    #[test]
    fn empty_strings_are_identical() {
        assert_eq!(normalized_similarity("", ""), 1.0);
    }
}
