//! Risk assessment for outgoing transfers.
//!
//! Value thresholds are business policy and are not assumed: with no
//! thresholds configured, only recipient count and wallet class count.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::wallet::WalletClass;
use crate::custodian::Recipient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate value cutoffs, in the asset's base units
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValueThresholds {
    pub medium: Option<Decimal>,
    pub high: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalCounts {
    pub low: u32,
    pub medium: u32,
    pub high: u32,
    /// Added on top for cold wallets
    pub cold_extra: u32,
}

impl Default for ApprovalCounts {
    fn default() -> Self {
        Self {
            low: 1,
            medium: 2,
            high: 3,
            cold_extra: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskPolicy {
    /// Applied when a coin has no override
    pub default_thresholds: ValueThresholds,
    /// Keyed by lowercase coin code
    pub coin_thresholds: HashMap<String, ValueThresholds>,
    /// Recipient count at which a transfer is at least medium risk
    pub multi_recipient_count: usize,
    /// Recipient count at which a transfer is high risk
    pub high_recipient_count: usize,
    pub approvals: ApprovalCounts,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            default_thresholds: ValueThresholds::default(),
            coin_thresholds: HashMap::new(),
            multi_recipient_count: 2,
            high_recipient_count: 10,
            approvals: ApprovalCounts::default(),
        }
    }
}

impl RiskPolicy {
    fn thresholds_for(&self, coin: &str) -> &ValueThresholds {
        self.coin_thresholds
            .get(&coin.to_ascii_lowercase())
            .unwrap_or(&self.default_thresholds)
    }

    /// Sum recipient amounts. `None` if any amount is unparsable or negative.
    fn total_value(recipients: &[Recipient]) -> Option<Decimal> {
        recipients.iter().try_fold(Decimal::ZERO, |acc, r| {
            let amount = Decimal::from_str(r.amount.trim()).ok()?;
            if amount.is_sign_negative() {
                return None;
            }
            acc.checked_add(amount)
        })
    }

    /// Assess the risk of sending to `recipients` from a wallet of `class`.
    ///
    /// Cold wallets are never `Low`. Amounts that cannot be read are treated
    /// as `High`.
    pub fn assess(&self, coin: &str, recipients: &[Recipient], class: WalletClass) -> RiskLevel {
        let Some(total) = Self::total_value(recipients) else {
            return RiskLevel::High;
        };

        let thresholds = self.thresholds_for(coin);
        let mut level = RiskLevel::Low;

        if thresholds.medium.is_some_and(|m| total >= m) {
            level = RiskLevel::Medium;
        }
        if thresholds.high.is_some_and(|h| total >= h) {
            level = RiskLevel::High;
        }

        let count = recipients.len();
        if count >= self.high_recipient_count {
            level = RiskLevel::High;
        } else if count >= self.multi_recipient_count {
            level = level.max(RiskLevel::Medium);
        }

        if class == WalletClass::Cold {
            level = level.max(RiskLevel::Medium);
        }
        level
    }

    /// Number of approvals a transfer at this risk level needs
    pub fn required_approvals(&self, risk: RiskLevel, class: WalletClass) -> u32 {
        let base = match risk {
            RiskLevel::Low => self.approvals.low,
            RiskLevel::Medium => self.approvals.medium,
            RiskLevel::High => self.approvals.high,
        };
        match class {
            WalletClass::Cold => base + self.approvals.cold_extra,
            WalletClass::Warm => base,
        }
    }
}
