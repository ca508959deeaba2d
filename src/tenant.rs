use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::engine::{Engine, IdAllocator, ParkingState, RequestLedger, RollbackLog};
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::topology::{FacilitySpec, Topology, TopologyError};

/// Manages per-tenant facilities. Tenant = database name from the pgwire
/// connection; every tenant starts from the same layout with all slots free,
/// its own request ids, history and notification hub.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    layout: Topology,
    history_limit: Option<usize>,
}

impl TenantManager {
    /// Validates the layout once; tenants clone it on first use.
    pub fn new(spec: &FacilitySpec, history_limit: Option<usize>) -> Result<Self, TopologyError> {
        Ok(Self {
            engines: DashMap::new(),
            layout: Topology::from_spec(spec)?,
            history_limit,
        })
    }

    /// Get or lazily create the engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        let engine = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(v) => {
                let state = ParkingState::new(
                    self.layout.clone(),
                    RequestLedger::new(IdAllocator::new()),
                    RollbackLog::new(self.history_limit),
                );
                let engine = Arc::new(Engine::new(state, Arc::new(NotifyHub::new())));
                v.insert(engine.clone());
                engine
            }
        };

        info!("tenant {tenant:?} loaded");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}
