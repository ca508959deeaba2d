use std::collections::HashMap;

use crate::model::*;

/// Hands out request ids. Owned by one ledger; ids are unique and strictly
/// increasing within it.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: RequestId,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: RequestId) -> Self {
        Self { next: first }
    }

    pub fn next_id(&mut self) -> RequestId {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Every request ever submitted, in submission order. Failed and terminal
/// requests are retained for inspection.
#[derive(Debug, Clone, Default)]
pub struct RequestLedger {
    ids: IdAllocator,
    requests: Vec<ParkingRequest>,
    index: HashMap<RequestId, usize>,
}

impl RequestLedger {
    pub fn new(ids: IdAllocator) -> Self {
        Self {
            ids,
            requests: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Create a request in REQUESTED under a fresh id.
    pub fn create(&mut self, vehicle_id: String, requested_zone: ZoneId, now: Ms) -> &mut ParkingRequest {
        let id = self.ids.next_id();
        let pos = self.requests.len();
        self.index.insert(id, pos);
        self.requests
            .push(ParkingRequest::new(id, vehicle_id, requested_zone, now));
        &mut self.requests[pos]
    }

    pub fn get(&self, id: RequestId) -> Option<&ParkingRequest> {
        self.index.get(&id).map(|&i| &self.requests[i])
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut ParkingRequest> {
        self.index.get(&id).map(|&i| &mut self.requests[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParkingRequest> {
        self.requests.iter()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
