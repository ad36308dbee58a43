use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::risk::RiskLevel;
use super::status::CanonicalStatus;
use super::wallet::WalletClass;
use crate::config::{duration_secs, opt_duration_secs};

/// Expected and maximum time windows for a transfer profile.
///
/// These are internal expectations used for staleness and escalation,
/// never a reason to fail a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaProfile {
    #[serde(rename = "expected_confirm_secs", with = "duration_secs")]
    pub expected_confirm_time: Duration,
    #[serde(rename = "max_wait_secs", with = "duration_secs")]
    pub max_wait_time: Duration,
    pub requires_approval: bool,
    #[serde(rename = "approval_sla_secs", with = "opt_duration_secs", default)]
    pub approval_sla: Option<Duration>,
}

const HOUR: u64 = 3600;

impl SlaProfile {
    const fn hours(expected: u64, max_wait: u64, approval: Option<u64>) -> Self {
        Self {
            expected_confirm_time: Duration::from_secs(expected * HOUR),
            max_wait_time: Duration::from_secs(max_wait * HOUR),
            requires_approval: approval.is_some(),
            approval_sla: match approval {
                Some(h) => Some(Duration::from_secs(h * HOUR)),
                None => None,
            },
        }
    }

    /// Point in time after which a live transfer counts as stale
    pub fn deadline(&self, started_at: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.max_wait_time)
            .ok()
            .and_then(|d| started_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// A transfer is stale once it has outlived `max_wait_time` without
    /// reaching a terminal state.
    pub fn is_stale(
        &self,
        started_at: DateTime<Utc>,
        status: CanonicalStatus,
        now: DateTime<Utc>,
    ) -> bool {
        !status.is_terminal() && now > self.deadline(started_at)
    }
}

/// Profiles for one wallet class, by risk level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaTier {
    pub low: SlaProfile,
    pub medium: SlaProfile,
    pub high: SlaProfile,
}

impl SlaTier {
    fn get(&self, risk: RiskLevel) -> SlaProfile {
        match risk {
            RiskLevel::Low => self.low,
            RiskLevel::Medium => self.medium,
            RiskLevel::High => self.high,
        }
    }

    fn longest_max_wait(&self) -> Duration {
        self.low
            .max_wait_time
            .max(self.medium.max_wait_time)
            .max(self.high.max_wait_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaPolicy {
    pub warm: SlaTier,
    pub cold: SlaTier,
}

impl Default for SlaPolicy {
    fn default() -> Self {
        Self {
            warm: SlaTier {
                low: SlaProfile {
                    expected_confirm_time: Duration::from_secs(30 * 60),
                    ..SlaProfile::hours(0, 4, None)
                },
                medium: SlaProfile::hours(1, 8, Some(2)),
                high: SlaProfile::hours(2, 24, Some(8)),
            },
            cold: SlaTier {
                // Cold is never low risk; the slot mirrors medium.
                low: SlaProfile::hours(24, 72, Some(24)),
                medium: SlaProfile::hours(24, 72, Some(24)),
                high: SlaProfile::hours(36, 72, Some(48)),
            },
        }
    }
}

impl SlaPolicy {
    pub fn get_sla(&self, class: WalletClass, risk: RiskLevel) -> SlaProfile {
        match class {
            WalletClass::Warm => self.warm.get(risk),
            WalletClass::Cold => self.cold.get(risk),
        }
    }

    pub fn longest_max_wait(&self) -> Duration {
        self.warm.longest_max_wait().max(self.cold.longest_max_wait())
    }
}
