//! Sliding-window rate-limit records and the transitions applied to them.
//!
//! The transition functions are pure; stores call them while holding whatever
//! lock or transaction makes the read-modify-write atomic.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiTier {
    Free,
    Premium,
    Enterprise,
}

impl ApiTier {
    pub fn action(self) -> RateLimitAction {
        match self {
            ApiTier::Free => RateLimitAction::ApiFree,
            ApiTier::Premium => RateLimitAction::ApiPremium,
            ApiTier::Enterprise => RateLimitAction::ApiEnterprise,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAction {
    LoginEmail,
    LoginIp,
    RegistrationIp,
    RegistrationContact,
    OtpSend,
    BiometricVerification,
    TwoFactorVerification,
    ApiFree,
    ApiPremium,
    ApiEnterprise,
}

impl RateLimitAction {
    pub const ALL: [RateLimitAction; 10] = [
        RateLimitAction::LoginEmail,
        RateLimitAction::LoginIp,
        RateLimitAction::RegistrationIp,
        RateLimitAction::RegistrationContact,
        RateLimitAction::OtpSend,
        RateLimitAction::BiometricVerification,
        RateLimitAction::TwoFactorVerification,
        RateLimitAction::ApiFree,
        RateLimitAction::ApiPremium,
        RateLimitAction::ApiEnterprise,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitAction::LoginEmail => "login_email",
            RateLimitAction::LoginIp => "login_ip",
            RateLimitAction::RegistrationIp => "registration_ip",
            RateLimitAction::RegistrationContact => "registration_contact",
            RateLimitAction::OtpSend => "otp_send",
            RateLimitAction::BiometricVerification => "biometric_verification",
            RateLimitAction::TwoFactorVerification => "two_factor_verification",
            RateLimitAction::ApiFree => "api_free",
            RateLimitAction::ApiPremium => "api_premium",
            RateLimitAction::ApiEnterprise => "api_enterprise",
        }
    }

    pub fn env_key(self) -> String {
        self.as_str().to_ascii_uppercase()
    }

    pub fn default_policy(self) -> RateLimitPolicy {
        const MINUTE: i64 = 60;
        const HOUR: i64 = 60 * MINUTE;
        const DAY: i64 = 24 * HOUR;
        match self {
            RateLimitAction::LoginEmail => RateLimitPolicy::new(15 * MINUTE, 5, 30 * MINUTE),
            RateLimitAction::LoginIp => RateLimitPolicy::new(15 * MINUTE, 10, HOUR),
            RateLimitAction::RegistrationIp => RateLimitPolicy::new(HOUR, 3, DAY),
            RateLimitAction::RegistrationContact => RateLimitPolicy::new(DAY, 1, 7 * DAY),
            RateLimitAction::OtpSend => RateLimitPolicy::new(5 * MINUTE, 3, 15 * MINUTE),
            RateLimitAction::BiometricVerification => {
                RateLimitPolicy::new(5 * MINUTE, 5, 30 * MINUTE)
            }
            RateLimitAction::TwoFactorVerification => {
                RateLimitPolicy::new(5 * MINUTE, 5, 30 * MINUTE)
            }
            RateLimitAction::ApiFree => RateLimitPolicy::new(MINUTE, 100, 5 * MINUTE),
            RateLimitAction::ApiPremium => RateLimitPolicy::new(MINUTE, 500, 5 * MINUTE),
            RateLimitAction::ApiEnterprise => RateLimitPolicy::new(MINUTE, 2000, 5 * MINUTE),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub window_seconds: i64,
    pub max_attempts: i32,
    pub block_seconds: i64,
}

impl RateLimitPolicy {
    pub const fn new(window_seconds: i64, max_attempts: i32, block_seconds: i64) -> Self {
        Self {
            window_seconds,
            max_attempts,
            block_seconds,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_seconds)
    }

    pub fn block(&self) -> Duration {
        Duration::seconds(self.block_seconds)
    }
}

/// Everything a store needs to locate and evolve one counter.
#[derive(Debug, Clone)]
pub struct RateLimitSubject {
    pub key: String,
    pub identifier: String,
    pub action: RateLimitAction,
    pub policy: RateLimitPolicy,
}

impl RateLimitSubject {
    pub fn new(identifier: &str, action: RateLimitAction, policy: RateLimitPolicy) -> Self {
        Self {
            key: rate_limit_key(identifier, action),
            identifier: identifier.to_string(),
            action,
            policy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitStep {
    Check,
    Record { success: bool },
    /// Checks the window and counts the attempt in the same transition.
    Consume,
    /// Hands back one attempt taken by `Consume` for work that never ran.
    Release,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining_attempts: i32,
    pub reset_time: DateTime<Utc>,
    pub blocked_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
/// Persistent counter for a single `(identifier, action)` pair.
pub struct RateLimitRecord {
    pub key: String,
    pub identifier: String,
    pub action: String,
    pub attempts: i32,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub blocked_until: Option<DateTime<Utc>>,
    pub successful_attempts: i64,
    pub total_attempts: i64,
    /// Accumulated block time in seconds.
    pub total_blocked_duration: i64,
}

/// Result of applying one step: the record to persist (if it changed) and the decision.
#[derive(Debug, Clone)]
pub struct RateLimitTransition {
    pub record: Option<RateLimitRecord>,
    pub decision: RateLimitDecision,
}

pub fn rate_limit_key(identifier: &str, action: RateLimitAction) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identifier.as_bytes());
    hasher.update(b":");
    hasher.update(action.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

impl RateLimitRecord {
    pub fn fresh(subject: &RateLimitSubject, now: DateTime<Utc>) -> Self {
        Self {
            key: subject.key.clone(),
            identifier: subject.identifier.clone(),
            action: subject.action.as_str().to_string(),
            attempts: 0,
            first_attempt_at: now,
            last_attempt_at: now,
            blocked_until: None,
            successful_attempts: 0,
            total_attempts: 0,
            total_blocked_duration: 0,
        }
    }

    pub fn is_blocked_at(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }

    fn window_elapsed(&self, policy: &RateLimitPolicy, now: DateTime<Utc>) -> bool {
        now - self.first_attempt_at >= policy.window()
    }

    fn reset_window(&mut self, now: DateTime<Utc>) {
        self.attempts = 0;
        self.first_attempt_at = now;
        self.blocked_until = None;
    }

    fn snapshot(&self, policy: &RateLimitPolicy, now: DateTime<Utc>) -> RateLimitDecision {
        if let Some(until) = self.blocked_until.filter(|until| *until > now) {
            return RateLimitDecision {
                allowed: false,
                remaining_attempts: 0,
                reset_time: until,
                blocked_until: Some(until),
            };
        }
        RateLimitDecision {
            allowed: self.attempts < policy.max_attempts,
            remaining_attempts: (policy.max_attempts - self.attempts).max(0),
            reset_time: self.first_attempt_at + policy.window(),
            blocked_until: None,
        }
    }
}

/// Applies one step of the sliding-window algorithm.
pub fn apply_step(
    current: Option<RateLimitRecord>,
    subject: &RateLimitSubject,
    step: RateLimitStep,
    now: DateTime<Utc>,
) -> RateLimitTransition {
    let policy = subject.policy;
    match step {
        RateLimitStep::Check => {
            let Some(mut record) = current else {
                return RateLimitTransition {
                    record: None,
                    decision: RateLimitDecision {
                        allowed: true,
                        remaining_attempts: policy.max_attempts,
                        reset_time: now + policy.window(),
                        blocked_until: None,
                    },
                };
            };

            if record.is_blocked_at(now) {
                let decision = record.snapshot(&policy, now);
                return RateLimitTransition {
                    record: None,
                    decision,
                };
            }

            let mut changed = false;
            if record.window_elapsed(&policy, now) {
                record.reset_window(now);
                changed = true;
            }

            if record.attempts >= policy.max_attempts {
                let until = now + policy.block();
                record.blocked_until = Some(until);
                record.total_blocked_duration += policy.block_seconds;
                return RateLimitTransition {
                    record: Some(record),
                    decision: RateLimitDecision {
                        allowed: false,
                        remaining_attempts: 0,
                        reset_time: until,
                        blocked_until: Some(until),
                    },
                };
            }

            let decision = record.snapshot(&policy, now);
            RateLimitTransition {
                record: changed.then_some(record),
                decision,
            }
        }
        RateLimitStep::Consume => {
            let mut record = current.unwrap_or_else(|| RateLimitRecord::fresh(subject, now));
            if record.is_blocked_at(now) {
                let decision = record.snapshot(&policy, now);
                return RateLimitTransition {
                    record: None,
                    decision,
                };
            }
            if record.blocked_until.is_some() || record.window_elapsed(&policy, now) {
                record.reset_window(now);
            }

            if record.attempts >= policy.max_attempts {
                let until = now + policy.block();
                record.blocked_until = Some(until);
                record.total_blocked_duration += policy.block_seconds;
                return RateLimitTransition {
                    record: Some(record),
                    decision: RateLimitDecision {
                        allowed: false,
                        remaining_attempts: 0,
                        reset_time: until,
                        blocked_until: Some(until),
                    },
                };
            }

            record.attempts += 1;
            record.total_attempts += 1;
            record.last_attempt_at = now;
            let decision = RateLimitDecision {
                allowed: true,
                ..record.snapshot(&policy, now)
            };
            RateLimitTransition {
                record: Some(record),
                decision,
            }
        }
        RateLimitStep::Release => {
            let Some(mut record) = current else {
                return apply_step(None, subject, RateLimitStep::Check, now);
            };
            if !record.is_blocked_at(now) && record.attempts > 0 {
                record.attempts -= 1;
            }
            let decision = record.snapshot(&policy, now);
            RateLimitTransition {
                record: Some(record),
                decision,
            }
        }
        RateLimitStep::Record { success } => {
            let mut record = current.unwrap_or_else(|| RateLimitRecord::fresh(subject, now));
            if !record.is_blocked_at(now) && record.window_elapsed(&policy, now) {
                record.reset_window(now);
            }
            if success {
                record.attempts = 0;
                record.blocked_until = None;
                record.successful_attempts += 1;
            } else {
                record.attempts += 1;
                record.total_attempts += 1;
            }
            record.last_attempt_at = now;
            let decision = record.snapshot(&policy, now);
            RateLimitTransition {
                record: Some(record),
                decision,
            }
        }
    }
}
