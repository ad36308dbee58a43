use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical wallet class used for risk and SLA decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletClass {
    /// Online keys, minutes-to-hours turnaround
    Warm,
    /// Offline or custodial keys, tens of hours turnaround
    Cold,
}

impl WalletClass {
    /// Map a custodian wallet type onto a class.
    ///
    /// Unrecognized types are treated as cold so they get the stricter risk
    /// floor and the longer SLA.
    pub fn from_wallet_type(wallet_type: &str) -> Self {
        match wallet_type.trim().to_ascii_lowercase().as_str() {
            "hot" | "warm" => WalletClass::Warm,
            _ => WalletClass::Cold,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WalletClass::Warm => "warm",
            WalletClass::Cold => "cold",
        }
    }
}

impl fmt::Display for WalletClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
