//! Periodic removal of expired credential state.

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::error::AppError;
use crate::repositories::Stores;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub sessions: u64,
    pub otp_codes: u64,
    pub rate_limits: u64,
    pub refresh_claims: u64,
}

#[derive(Clone)]
pub struct CleanupService {
    stores: Stores,
    rate_limit_retention: Duration,
}

impl CleanupService {
    pub fn new(stores: Stores, rate_limit_retention_hours: i64) -> Self {
        Self {
            stores,
            rate_limit_retention: Duration::hours(rate_limit_retention_hours),
        }
    }

    /// Deletes expired sessions and OTPs, idle rate-limit counters that are
    /// not blocked, and refresh claims past their token expiry.
    pub async fn sweep(&self) -> Result<CleanupReport, AppError> {
        let now = Utc::now();
        let report = CleanupReport {
            sessions: self.stores.sessions.delete_expired(now).await?,
            otp_codes: self.stores.otps.delete_expired(now).await?,
            rate_limits: self
                .stores
                .rate_limits
                .delete_stale(now - self.rate_limit_retention, now)
                .await?,
            refresh_claims: self.stores.refresh_ledger.purge_expired(now).await?,
        };
        tracing::info!(
            sessions = report.sessions,
            otp_codes = report.otp_codes,
            rate_limits = report.rate_limits,
            refresh_claims = report.refresh_claims,
            "cleanup sweep finished"
        );
        Ok(report)
    }

    /// Runs [`sweep`](Self::sweep) on a fixed interval until the task is aborted.
    pub fn spawn(self, every: StdDuration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = self.sweep().await {
                    tracing::error!(error = %err, "cleanup sweep failed");
                }
            }
        })
    }
}
