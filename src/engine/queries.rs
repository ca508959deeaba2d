use crate::model::*;

use super::analytics::compute_analytics;
use super::{Engine, ParkingState};

impl ParkingState {
    pub fn zone_infos(&self) -> Vec<ZoneInfo> {
        self.topology
            .zones()
            .iter()
            .map(|z| ZoneInfo {
                id: z.id,
                area_count: z.areas.len(),
                slot_count: self.topology.capacity(z),
                occupied: self.topology.occupied_in(z),
                neighbors: z.neighbors.clone(),
            })
            .collect()
    }

    /// Slots in facility order, optionally restricted to one zone.
    /// An unknown zone yields an empty list.
    pub fn slot_list(&self, zone_id: Option<ZoneId>) -> Vec<Slot> {
        match zone_id {
            Some(zid) => self
                .topology
                .zone(zid)
                .map(|z| {
                    z.slot_indices()
                        .map(|i| self.topology.slot_at(i).clone())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default(),
            None => self
                .topology
                .zones()
                .iter()
                .flat_map(|z| z.slot_indices())
                .map(|i| self.topology.slot_at(i).clone())
                .collect(),
        }
    }

    pub fn request_list(&self, filter: &RequestFilter) -> Vec<ParkingRequest> {
        self.ledger
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> FacilitySnapshot {
        let zones = self
            .topology
            .zones()
            .iter()
            .map(|z| ZoneSnapshot {
                id: z.id,
                neighbors: z.neighbors.clone(),
                areas: z
                    .areas
                    .iter()
                    .map(|a| AreaSnapshot {
                        id: a.id,
                        slots: a.slots.iter().map(|&i| self.topology.slot_at(i).clone()).collect(),
                    })
                    .collect(),
            })
            .collect();
        FacilitySnapshot {
            zones,
            requests: self.ledger.iter().cloned().collect(),
        }
    }
}

impl Engine {
    pub async fn zones(&self) -> Vec<ZoneInfo> {
        self.state.read().await.zone_infos()
    }

    pub async fn has_zone(&self, zone_id: ZoneId) -> bool {
        self.state.read().await.topology.zone(zone_id).is_some()
    }

    pub async fn slots(&self, zone_id: Option<ZoneId>) -> Vec<Slot> {
        self.state.read().await.slot_list(zone_id)
    }

    pub async fn requests(&self, filter: &RequestFilter) -> Vec<ParkingRequest> {
        self.state.read().await.request_list(filter)
    }

    pub async fn request(&self, id: RequestId) -> Option<ParkingRequest> {
        self.state.read().await.ledger.get(id).cloned()
    }

    /// Logged operations still available for rollback, most recent first.
    pub async fn history(&self) -> Vec<Operation> {
        self.state.read().await.history.iter_recent().copied().collect()
    }

    pub async fn snapshot(&self) -> FacilitySnapshot {
        self.state.read().await.snapshot()
    }

    pub async fn analytics(&self) -> Analytics {
        compute_analytics(&*self.state.read().await)
    }
}
