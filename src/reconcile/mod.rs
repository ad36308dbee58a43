//! Reconciliation Worker
//!
//! Supervised background loop that re-polls the custodian for every
//! non-terminal transfer, persists status deltas and raises notifications.
//!
//! ```text
//! stopped → starting → running → stopping → stopped
//! ```

pub mod error;
pub mod worker;


pub use error::WorkerError;
pub use worker::{HealthSnapshot, ReconciliationWorker, TickSummary};

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
