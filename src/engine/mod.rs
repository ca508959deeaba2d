mod allocation;
mod analytics;
mod error;
mod ledger;
mod mutations;
mod queries;
mod rollback;

pub use allocation::allocate;
pub use analytics::compute_analytics;
pub use error::EngineError;
pub use ledger::{IdAllocator, RequestLedger};
pub use mutations::{Cancellation, Departure, RollbackSummary, Submission};
pub use rollback::RollbackLog;

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::topology::{FacilitySpec, Topology, TopologyError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Everything one facility mutates together: slot occupancy, request
/// lifecycle and the rollback history.
///
/// All methods are synchronous and take the clock as an argument; the
/// [`Engine`] wraps them in a single lock.
#[derive(Debug, Clone)]
pub struct ParkingState {
    pub(crate) topology: Topology,
    pub(crate) ledger: RequestLedger,
    pub(crate) history: RollbackLog,
}

impl ParkingState {
    pub fn new(topology: Topology, ledger: RequestLedger, history: RollbackLog) -> Self {
        Self {
            topology,
            ledger,
            history,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn ledger(&self) -> &RequestLedger {
        &self.ledger
    }

    pub fn history(&self) -> &RollbackLog {
        &self.history
    }
}

/// One facility behind one exclusive critical section.
///
/// Mutations hold the write lock for the whole request/cancel/leave/rollback
/// sequence; snapshots and analytics share the read lock, so they never
/// observe a half-applied mutation.
pub struct Engine {
    state: RwLock<ParkingState>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(state: ParkingState, notify: Arc<NotifyHub>) -> Self {
        Self {
            state: RwLock::new(state),
            notify,
        }
    }

    /// Build a fresh facility from a layout, with its own id allocator and history.
    pub fn from_spec(
        spec: &FacilitySpec,
        history_limit: Option<usize>,
        notify: Arc<NotifyHub>,
    ) -> Result<Self, TopologyError> {
        let topology = Topology::from_spec(spec)?;
        let state = ParkingState::new(
            topology,
            RequestLedger::new(IdAllocator::new()),
            RollbackLog::new(history_limit),
        );
        Ok(Self::new(state, notify))
    }

    fn publish(&self, event: &Event) {
        self.notify.send(event.zone_id(), event);
    }
}
