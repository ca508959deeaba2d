use crate::model::*;
use crate::topology::Topology;

/// Resolve a zone preference into a concrete slot.
///
/// First-fit over the requested zone's areas and slots in stored order,
/// then the same scan over each direct neighbor in stored order. Neighbors
/// of neighbors are never visited, and neighbor ids that do not resolve are
/// skipped. On success the chosen slot is already marked occupied.
pub fn allocate(requested_zone: ZoneId, topology: &mut Topology) -> AllocationOutcome {
    let Some(zone) = topology.zone(requested_zone) else {
        return AllocationOutcome::Failed(AllocationFailure::UnknownZone);
    };

    let candidate = topology
        .first_free_slot(zone)
        .map(|idx| (idx, false))
        .or_else(|| {
            zone.neighbors
                .iter()
                .filter_map(|&nid| topology.zone(nid))
                .find_map(|neighbor| topology.first_free_slot(neighbor))
                .map(|idx| (idx, true))
        });

    match candidate {
        Some((idx, cross_zone)) => {
            let slot = topology.occupy_at(idx);
            AllocationOutcome::Allocated {
                slot_id: slot.id,
                zone_id: slot.zone_id,
                cross_zone,
            }
        }
        None => AllocationOutcome::Failed(AllocationFailure::NoCapacity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{AreaSpec, FacilitySpec, ZoneSpec};

    fn zone(id: ZoneId, neighbors: Vec<ZoneId>, areas: Vec<(AreaId, Vec<SlotId>)>) -> ZoneSpec {
        ZoneSpec {
            id,
            neighbors,
            areas: areas
                .into_iter()
                .map(|(id, slots)| AreaSpec { id, slots })
                .collect(),
        }
    }

    fn topo(zones: Vec<ZoneSpec>) -> Topology {
        Topology::from_spec(&FacilitySpec { zones }).unwrap()
    }

    #[test]
    fn first_fit_in_stored_order() {
        let mut t = topo(vec![
            zone(1, vec![2], vec![(10, vec![7, 3]), (11, vec![5])]),
            zone(2, vec![], vec![(20, vec![100])]),
        ]);
        let order: Vec<_> = (0..4).map(|_| allocate(1, &mut t)).collect();
        assert_eq!(
            order,
            vec![
                AllocationOutcome::Allocated { slot_id: 7, zone_id: 1, cross_zone: false },
                AllocationOutcome::Allocated { slot_id: 3, zone_id: 1, cross_zone: false },
                AllocationOutcome::Allocated { slot_id: 5, zone_id: 1, cross_zone: false },
                AllocationOutcome::Allocated { slot_id: 100, zone_id: 2, cross_zone: true },
            ]
        );
    }

    #[test]
    fn takes_freed_slot_before_later_ones() {
        let mut t = topo(vec![zone(1, vec![], vec![(10, vec![1, 2, 3])])]);
        for _ in 0..3 {
            allocate(1, &mut t);
        }
        t.release(2).unwrap();
        assert_eq!(allocate(1, &mut t).slot_id(), Some(2));
    }

    #[test]
    fn unknown_zone_fails_distinctly() {
        let mut t = topo(vec![zone(1, vec![], vec![(10, vec![1])])]);
        assert_eq!(
            allocate(9, &mut t),
            AllocationOutcome::Failed(AllocationFailure::UnknownZone)
        );
        assert_eq!(t.occupied_total(), 0);
    }

    #[test]
    fn full_zone_without_neighbors_has_no_capacity() {
        let mut t = topo(vec![zone(1, vec![], vec![(10, vec![1])])]);
        assert!(allocate(1, &mut t).is_success());
        assert_eq!(
            allocate(1, &mut t),
            AllocationOutcome::Failed(AllocationFailure::NoCapacity)
        );
    }

    #[test]
    fn neighbors_in_stored_order() {
        let mut t = topo(vec![
            zone(1, vec![3, 2], vec![]),
            zone(2, vec![], vec![(20, vec![21])]),
            zone(3, vec![], vec![(30, vec![31])]),
        ]);
        assert_eq!(
            allocate(1, &mut t),
            AllocationOutcome::Allocated { slot_id: 31, zone_id: 3, cross_zone: true }
        );
        assert_eq!(allocate(1, &mut t).slot_id(), Some(21));
    }

    #[test]
    fn one_hop_only() {
        // 1 -> 2 -> 3, only zone 3 has room
        let mut t = topo(vec![
            zone(1, vec![2], vec![(10, vec![1])]),
            zone(2, vec![3], vec![(20, vec![2])]),
            zone(3, vec![], vec![(30, vec![3])]),
        ]);
        t.occupy(1).unwrap();
        t.occupy(2).unwrap();
        assert_eq!(
            allocate(1, &mut t),
            AllocationOutcome::Failed(AllocationFailure::NoCapacity)
        );
        assert!(!t.slot(3).unwrap().occupied);
    }

    #[test]
    fn dangling_neighbor_skipped() {
        let mut t = topo(vec![
            zone(1, vec![42, 2], vec![]),
            zone(2, vec![], vec![(20, vec![5])]),
        ]);
        assert_eq!(
            allocate(1, &mut t),
            AllocationOutcome::Allocated { slot_id: 5, zone_id: 2, cross_zone: true }
        );
    }

    #[test]
    fn empty_zone_yields_no_candidates() {
        let mut t = topo(vec![zone(1, vec![], vec![(10, vec![])])]);
        assert_eq!(
            allocate(1, &mut t),
            AllocationOutcome::Failed(AllocationFailure::NoCapacity)
        );
    }

    #[test]
    fn adjacency_is_directed_as_stored() {
        // 2 lists 1, but 1 does not list 2
        let mut t = topo(vec![
            zone(1, vec![], vec![(10, vec![1])]),
            zone(2, vec![1], vec![(20, vec![2])]),
        ]);
        t.occupy(1).unwrap();
        assert!(!allocate(1, &mut t).is_success());
    }
}
