//! Biometric templates, attempt logs and the per-modality threshold table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use validator::Validate;

use crate::types::{TemplateId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BiometricType {
    Fingerprint,
    Face,
    Voice,
    Iris,
}

impl BiometricType {
    pub fn as_str(self) -> &'static str {
        match self {
            BiometricType::Fingerprint => "fingerprint",
            BiometricType::Face => "face",
            BiometricType::Voice => "voice",
            BiometricType::Iris => "iris",
        }
    }

    pub fn thresholds(self) -> MatchThresholds {
        match self {
            BiometricType::Fingerprint => MatchThresholds::new(85.0, 92.0, 97.0),
            BiometricType::Face => MatchThresholds::new(75.0, 85.0, 92.0),
            BiometricType::Voice => MatchThresholds::new(70.0, 80.0, 88.0),
            BiometricType::Iris => MatchThresholds::new(90.0, 95.0, 99.0),
        }
    }
}

impl fmt::Display for BiometricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BiometricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fingerprint" => Ok(BiometricType::Fingerprint),
            "face" => Ok(BiometricType::Face),
            "voice" => Ok(BiometricType::Voice),
            "iris" => Ok(BiometricType::Iris),
            other => Err(format!("unsupported biometric type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchThresholds {
    pub min: f64,
    pub good: f64,
    pub excellent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Excellent,
    Good,
    Acceptable,
    Rejected,
}

impl MatchThresholds {
    pub const fn new(min: f64, good: f64, excellent: f64) -> Self {
        Self {
            min,
            good,
            excellent,
        }
    }

    pub fn tier(&self, score: f64) -> MatchTier {
        if score >= self.excellent {
            MatchTier::Excellent
        } else if score >= self.good {
            MatchTier::Good
        } else if score >= self.min {
            MatchTier::Acceptable
        } else {
            MatchTier::Rejected
        }
    }

    /// Maps a score onto `(success, confidence)`.
    pub fn classify(&self, score: f64) -> (bool, u8) {
        match self.tier(score) {
            MatchTier::Excellent => (true, 95),
            MatchTier::Good => (true, 85),
            MatchTier::Acceptable => (true, 70),
            MatchTier::Rejected => (false, score.floor().clamp(0.0, 100.0) as u8),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
/// Stored template. The raw template only ever exists encrypted at rest.
pub struct BiometricTemplate {
    pub id: TemplateId,
    pub user_id: UserId,
    pub biometric_type: BiometricType,
    pub encrypted_template: String,
    /// SHA-256 of the raw template, used for cross-account duplicate detection.
    pub template_hash: String,
    pub quality_score: i32,
    pub verification_count: i64,
    pub successful_verifications: i64,
    pub failed_verifications: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
}

impl BiometricTemplate {
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at > now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Template metadata safe to hand back to callers.
pub struct TemplateSummary {
    pub id: TemplateId,
    pub biometric_type: BiometricType,
    pub quality_score: i32,
    pub verification_count: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
}

impl From<&BiometricTemplate> for TemplateSummary {
    fn from(template: &BiometricTemplate) -> Self {
        Self {
            id: template.id,
            biometric_type: template.biometric_type,
            quality_score: template.quality_score,
            verification_count: template.verification_count,
            created_at: template.created_at,
            expires_at: template.expires_at,
            is_active: template.is_active,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EnrollBiometricRequest {
    pub user_id: UserId,
    pub biometric_type: BiometricType,
    #[validate(length(min = 100, max = 8192))]
    pub template: String,
    #[validate(range(min = 0, max = 100))]
    pub quality_score: i32,
    #[serde(default)]
    pub device_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct VerifyBiometricRequest {
    pub user_id: UserId,
    pub biometric_type: BiometricType,
    /// Bounded so that scoring against stored templates stays cheap.
    #[validate(length(min = 1, max = 8192))]
    pub template: String,
    #[serde(default)]
    pub device_fingerprint: Option<String>,
}

/// Result of a capped enrollment write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentOutcome {
    Inserted,
    CapReached,
    DuplicateTemplate,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BiometricVerification {
    pub success: bool,
    pub confidence: u8,
    pub score: f64,
    pub template_id: Option<TemplateId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
/// Append-only audit row for a verification attempt.
pub struct BiometricAttempt {
    pub user_id: UserId,
    pub biometric_type: BiometricType,
    pub template_id: Option<TemplateId>,
    pub score: f64,
    pub success: bool,
    pub device_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_parses_from_wire_names() {
        assert_eq!("iris".parse::<BiometricType>(), Ok(BiometricType::Iris));
        assert!("palm".parse::<BiometricType>().is_err());
    }

    #[test]
    fn classification_is_monotonic_at_boundaries() {
        for kind in [
            BiometricType::Fingerprint,
            BiometricType::Face,
            BiometricType::Voice,
            BiometricType::Iris,
        ] {
            let t = kind.thresholds();
            assert_eq!(t.classify(t.excellent), (true, 95), "{kind}");
            assert_eq!(t.classify(t.good), (true, 85), "{kind}");
            assert_eq!(t.classify(t.min), (true, 70), "{kind}");

            let below_good = t.classify(t.good - 1.0);
            if t.good - 1.0 >= t.min {
                assert_eq!(below_good, (true, 70), "{kind}");
            } else {
                assert!(!below_good.0, "{kind}");
            }

            let (success, confidence) = t.classify(t.min - 0.5);
            assert!(!success, "{kind}");
            assert_eq!(confidence as f64, (t.min - 0.5).floor());
        }
    }

    #[test]
    fn rejected_confidence_is_floored_score() {
        let t = BiometricType::Face.thresholds();
        assert_eq!(t.classify(42.9), (false, 42));
        assert_eq!(t.classify(-3.0), (false, 0));
    }

    #[test]
    fn enroll_request_enforces_template_length_and_quality_range() {
        let request = EnrollBiometricRequest {
            user_id: UserId::new(),
            biometric_type: BiometricType::Face,
            template: "x".repeat(99),
            quality_score: 101,
            device_fingerprint: None,
        };
        let errors = request.validate().expect_err("invalid");
        assert!(errors.field_errors().contains_key("template"));
        assert!(errors.field_errors().contains_key("quality_score"));
    }
}
