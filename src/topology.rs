use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::limits::*;
use crate::model::*;

/// Facility layout as handed over by the loader: zones → areas → slot ids,
/// plus each zone's neighbor list. This is the JSON format of `PARKLINE_TOPOLOGY`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilitySpec {
    pub zones: Vec<ZoneSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneSpec {
    pub id: ZoneId,
    #[serde(default)]
    pub neighbors: Vec<ZoneId>,
    #[serde(default)]
    pub areas: Vec<AreaSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaSpec {
    pub id: AreaId,
    #[serde(default)]
    pub slots: Vec<SlotId>,
}

impl FacilitySpec {
    /// Three zones: Z1 (slots 1, 2) and Z2 (slot 3) are neighbors, Z3 (slot 4) is isolated.
    pub fn reference_city() -> Self {
        Self {
            zones: vec![
                ZoneSpec {
                    id: 1,
                    neighbors: vec![2],
                    areas: vec![AreaSpec { id: 101, slots: vec![1, 2] }],
                },
                ZoneSpec {
                    id: 2,
                    neighbors: vec![1],
                    areas: vec![AreaSpec { id: 201, slots: vec![3] }],
                },
                ZoneSpec {
                    id: 3,
                    neighbors: vec![],
                    areas: vec![AreaSpec { id: 301, slots: vec![4] }],
                },
            ],
        }
    }

    pub fn from_json(json: &str) -> Result<Self, TopologyError> {
        serde_json::from_str(json).map_err(|e| TopologyError::Parse(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, TopologyError> {
        let raw = fs::read_to_string(path).map_err(TopologyError::Io)?;
        Self::from_json(&raw)
    }
}

/// Zones, areas and the slot arena.
///
/// Every slot lives in `slots`; areas refer to slots by arena index, and
/// `slot_index` / `zone_index` give O(1) lookup by id. Slots are never
/// added or removed after construction, so indices stay valid for the life
/// of the topology.
#[derive(Debug, Clone)]
pub struct Topology {
    slots: Vec<Slot>,
    zones: Vec<Zone>,
    slot_index: HashMap<SlotId, usize>,
    zone_index: HashMap<ZoneId, usize>,
    occupied: usize,
}

impl Topology {
    pub fn from_spec(spec: &FacilitySpec) -> Result<Self, TopologyError> {
        if spec.zones.len() > MAX_ZONES {
            return Err(TopologyError::LimitExceeded("too many zones"));
        }

        let mut topo = Self {
            slots: Vec::new(),
            zones: Vec::with_capacity(spec.zones.len()),
            slot_index: HashMap::new(),
            zone_index: HashMap::new(),
            occupied: 0,
        };
        let mut area_ids = HashSet::new();

        for zs in &spec.zones {
            if topo.zone_index.contains_key(&zs.id) {
                return Err(TopologyError::DuplicateZone(zs.id));
            }
            let mut areas = Vec::with_capacity(zs.areas.len());
            for a in &zs.areas {
                if !area_ids.insert(a.id) {
                    return Err(TopologyError::DuplicateArea(a.id));
                }
                let mut members = Vec::with_capacity(a.slots.len());
                for &slot_id in &a.slots {
                    if topo.slot_index.contains_key(&slot_id) {
                        return Err(TopologyError::DuplicateSlot(slot_id));
                    }
                    if topo.slots.len() >= MAX_SLOTS {
                        return Err(TopologyError::LimitExceeded("too many slots"));
                    }
                    let idx = topo.slots.len();
                    topo.slots.push(Slot::new(slot_id, zs.id, a.id));
                    topo.slot_index.insert(slot_id, idx);
                    members.push(idx);
                }
                areas.push(ParkingArea { id: a.id, slots: members });
            }
            topo.zone_index.insert(zs.id, topo.zones.len());
            topo.zones.push(Zone {
                id: zs.id,
                areas,
                neighbors: zs.neighbors.clone(),
            });
        }

        Ok(topo)
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn zone(&self, id: ZoneId) -> Option<&Zone> {
        self.zone_index.get(&id).map(|&i| &self.zones[i])
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slot_index.get(&id).map(|&i| &self.slots[i])
    }

    pub fn slot_at(&self, idx: usize) -> &Slot {
        &self.slots[idx]
    }

    /// Arena index of the first unoccupied slot of `zone`, in stored order.
    pub fn first_free_slot(&self, zone: &Zone) -> Option<usize> {
        zone.slot_indices().find(|&i| !self.slots[i].occupied)
    }

    /// Mark a slot occupied by arena index.
    pub(crate) fn occupy_at(&mut self, idx: usize) -> &Slot {
        let slot = &mut self.slots[idx];
        if !slot.occupied {
            slot.occupy();
            self.occupied += 1;
        }
        slot
    }

    /// Mark a slot occupied. `None` if no slot has this id.
    pub fn occupy(&mut self, id: SlotId) -> Option<&Slot> {
        let idx = *self.slot_index.get(&id)?;
        Some(self.occupy_at(idx))
    }

    /// Mark a slot free. `None` if no slot has this id.
    pub fn release(&mut self, id: SlotId) -> Option<&Slot> {
        let idx = *self.slot_index.get(&id)?;
        let slot = &mut self.slots[idx];
        if slot.occupied {
            slot.release();
            self.occupied -= 1;
        }
        Some(slot)
    }

    pub fn capacity(&self, zone: &Zone) -> usize {
        zone.areas.iter().map(|a| a.slots.len()).sum()
    }

    pub fn occupied_in(&self, zone: &Zone) -> usize {
        zone.slot_indices().filter(|&i| self.slots[i].occupied).count()
    }

    pub fn occupied_total(&self) -> usize {
        self.occupied
    }
}

#[derive(Debug)]
pub enum TopologyError {
    Io(std::io::Error),
    Parse(String),
    DuplicateZone(ZoneId),
    DuplicateArea(AreaId),
    DuplicateSlot(SlotId),
    LimitExceeded(&'static str),
}

impl std::fmt::Display for TopologyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyError::Io(e) => write!(f, "topology read failed: {e}"),
            TopologyError::Parse(e) => write!(f, "topology parse error: {e}"),
            TopologyError::DuplicateZone(id) => write!(f, "duplicate zone id: {id}"),
            TopologyError::DuplicateArea(id) => write!(f, "duplicate area id: {id}"),
            TopologyError::DuplicateSlot(id) => write!(f, "duplicate slot id: {id}"),
            TopologyError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for TopologyError {}
