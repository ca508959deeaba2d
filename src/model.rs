use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub type ZoneId = i64;
pub type AreaId = i64;
pub type SlotId = i64;
pub type RequestId = u64;

/// A single parking space. Slots live in the topology's arena and are never destroyed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub zone_id: ZoneId,
    pub area_id: AreaId,
    pub occupied: bool,
}

impl Slot {
    pub fn new(id: SlotId, zone_id: ZoneId, area_id: AreaId) -> Self {
        Self {
            id,
            zone_id,
            area_id,
            occupied: false,
        }
    }

    pub fn occupy(&mut self) {
        self.occupied = true;
    }

    pub fn release(&mut self) {
        self.occupied = false;
    }
}

/// Ordered group of slots. `slots` holds arena indices, not slot ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParkingArea {
    pub id: AreaId,
    pub slots: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    pub id: ZoneId,
    pub areas: Vec<ParkingArea>,
    /// Overflow candidates, consulted in stored order. Ids need not resolve.
    pub neighbors: Vec<ZoneId>,
}

impl Zone {
    /// Arena indices of every slot in the zone, in area-then-slot order.
    pub fn slot_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.areas.iter().flat_map(|a| a.slots.iter().copied())
    }
}

// ── Request lifecycle ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Requested,
    Allocated,
    Occupied,
    Released,
    Cancelled,
}

impl RequestState {
    pub const ALL: [RequestState; 5] = [
        RequestState::Requested,
        RequestState::Allocated,
        RequestState::Occupied,
        RequestState::Released,
        RequestState::Cancelled,
    ];

    /// The legal edge table. Everything not listed here is rejected.
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Requested, Allocated)
                | (Requested, Cancelled)
                | (Allocated, Occupied)
                | (Allocated, Cancelled)
                | (Occupied, Released)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Released | RequestState::Cancelled)
    }

    /// States in which the request holds its assigned slot.
    pub fn holds_slot(self) -> bool {
        matches!(self, RequestState::Allocated | RequestState::Occupied)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestState::Requested => "REQUESTED",
            RequestState::Allocated => "ALLOCATED",
            RequestState::Occupied => "OCCUPIED",
            RequestState::Released => "RELEASED",
            RequestState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestState::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown request state: {s}"))
    }
}

/// Rejected edge in the request state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: RequestState,
    pub to: RequestState,
}

/// A parking request and its lifecycle. Owned by the request ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkingRequest {
    id: RequestId,
    vehicle_id: String,
    requested_zone: ZoneId,
    assigned_slot: Option<SlotId>,
    created_at: Ms,
    ended_at: Option<Ms>,
    state: RequestState,
}

impl ParkingRequest {
    pub fn new(id: RequestId, vehicle_id: String, requested_zone: ZoneId, created_at: Ms) -> Self {
        Self {
            id,
            vehicle_id,
            requested_zone,
            assigned_slot: None,
            created_at,
            ended_at: None,
            state: RequestState::Requested,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    pub fn requested_zone(&self) -> ZoneId {
        self.requested_zone
    }

    pub fn assigned_slot(&self) -> Option<SlotId> {
        self.assigned_slot
    }

    pub fn created_at(&self) -> Ms {
        self.created_at
    }

    pub fn ended_at(&self) -> Option<Ms> {
        self.ended_at
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Move along a legal edge. On rejection the request is left untouched.
    pub fn transition_to(&mut self, next: RequestState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Overwrite the state without consulting the edge table.
    ///
    /// Intentionally unchecked: only rollback inversion calls this, to put a
    /// request back where a logged operation found it. Normal request
    /// handling must go through [`ParkingRequest::transition_to`].
    pub fn force_state(&mut self, state: RequestState) {
        self.state = state;
    }

    pub fn assign_slot(&mut self, slot_id: SlotId) {
        self.assigned_slot = Some(slot_id);
    }

    pub fn clear_slot(&mut self) {
        self.assigned_slot = None;
    }

    pub fn set_ended_at(&mut self, at: Ms) {
        self.ended_at = Some(at);
    }

    pub fn clear_ended_at(&mut self) {
        self.ended_at = None;
    }

    /// Elapsed time between creation and release. Zero until the request is RELEASED.
    pub fn duration_ms(&self) -> Ms {
        match (self.state, self.ended_at) {
            (RequestState::Released, Some(end)) => (end - self.created_at).max(0),
            _ => 0,
        }
    }
}

// ── Rollback records ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Allocate,
    Cancel,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Allocate => "ALLOCATE",
            OperationKind::Cancel => "CANCEL",
        }
    }
}

/// Self-contained description of a logged mutation, enough to invert it
/// without looking anything else up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    pub request_id: RequestId,
    pub slot_id: SlotId,
    pub zone_id: ZoneId,
}

// ── Allocation results ───────────────────────────────────────────

/// Why an allocation did not produce a slot. Both collapse to the same
/// boolean failure at the request boundary; the split is kept for logs,
/// metrics and the submit result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationFailure {
    UnknownZone,
    NoCapacity,
}

impl AllocationFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            AllocationFailure::UnknownZone => "unknown_zone",
            AllocationFailure::NoCapacity => "no_capacity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationOutcome {
    /// The slot is already marked occupied when this is returned.
    Allocated {
        slot_id: SlotId,
        zone_id: ZoneId,
        cross_zone: bool,
    },
    Failed(AllocationFailure),
}

impl AllocationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AllocationOutcome::Allocated { .. })
    }

    pub fn slot_id(&self) -> Option<SlotId> {
        match self {
            AllocationOutcome::Allocated { slot_id, .. } => Some(*slot_id),
            AllocationOutcome::Failed(_) => None,
        }
    }
}

// ── Notifications ────────────────────────────────────────────────

/// Published on the zone channel the event touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    SlotAllocated {
        request_id: RequestId,
        vehicle_id: String,
        slot_id: SlotId,
        zone_id: ZoneId,
        cross_zone: bool,
    },
    AllocationFailed {
        request_id: RequestId,
        vehicle_id: String,
        zone_id: ZoneId,
        reason: AllocationFailure,
    },
    RequestCancelled {
        request_id: RequestId,
        slot_id: Option<SlotId>,
        zone_id: ZoneId,
    },
    VehicleLeft {
        request_id: RequestId,
        slot_id: Option<SlotId>,
        zone_id: ZoneId,
        duration_ms: Ms,
    },
    AllocationReverted {
        request_id: RequestId,
        slot_id: SlotId,
        zone_id: ZoneId,
    },
    CancellationReverted {
        request_id: RequestId,
        slot_id: SlotId,
        zone_id: ZoneId,
    },
}

impl Event {
    pub fn zone_id(&self) -> ZoneId {
        match self {
            Event::SlotAllocated { zone_id, .. }
            | Event::AllocationFailed { zone_id, .. }
            | Event::RequestCancelled { zone_id, .. }
            | Event::VehicleLeft { zone_id, .. }
            | Event::AllocationReverted { zone_id, .. }
            | Event::CancellationReverted { zone_id, .. } => *zone_id,
        }
    }

    /// Inverse-application event for a rolled back record.
    pub fn reverted(op: &Operation) -> Self {
        match op.kind {
            OperationKind::Allocate => Event::AllocationReverted {
                request_id: op.request_id,
                slot_id: op.slot_id,
                zone_id: op.zone_id,
            },
            OperationKind::Cancel => Event::CancellationReverted {
                request_id: op.request_id,
                slot_id: op.slot_id,
                zone_id: op.zone_id,
            },
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZoneInfo {
    pub id: ZoneId,
    pub area_count: usize,
    pub slot_count: usize,
    pub occupied: usize,
    pub neighbors: Vec<ZoneId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AreaSnapshot {
    pub id: AreaId,
    pub slots: Vec<Slot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZoneSnapshot {
    pub id: ZoneId,
    pub neighbors: Vec<ZoneId>,
    pub areas: Vec<AreaSnapshot>,
}

/// Point-in-time dump of the whole facility and ledger, taken under one read lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacilitySnapshot {
    pub zones: Vec<ZoneSnapshot>,
    pub requests: Vec<ParkingRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneUtilization {
    pub zone_id: ZoneId,
    pub occupied: usize,
    pub capacity: usize,
    /// Percentage in `[0, 100]`; zero for a zone without slots.
    pub utilization: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analytics {
    pub zones: Vec<ZoneUtilization>,
    pub total_requests: usize,
    pub cancelled: usize,
    pub completed: usize,
    pub average_duration_ms: f64,
    /// Zone with the most occupied slots; first in facility order wins ties.
    pub peak_zone: Option<ZoneId>,
}

/// Conjunctive filter for request listings. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFilter {
    pub id: Option<RequestId>,
    pub state: Option<RequestState>,
    pub vehicle_id: Option<String>,
    pub zone_id: Option<ZoneId>,
}

impl RequestFilter {
    pub fn matches(&self, req: &ParkingRequest) -> bool {
        self.id.is_none_or(|id| req.id() == id)
            && self.state.is_none_or(|st| req.state() == st)
            && self.vehicle_id.as_deref().is_none_or(|v| req.vehicle_id() == v)
            && self.zone_id.is_none_or(|z| req.requested_zone() == z)
    }
}
