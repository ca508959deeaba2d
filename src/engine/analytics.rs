use crate::model::*;

use super::ParkingState;

/// Read-only statistics over one consistent state.
pub fn compute_analytics(state: &ParkingState) -> Analytics {
    let topo = &state.topology;

    let zones: Vec<ZoneUtilization> = topo
        .zones()
        .iter()
        .map(|z| {
            let capacity = topo.capacity(z);
            let occupied = topo.occupied_in(z);
            let utilization = if capacity > 0 {
                occupied as f64 / capacity as f64 * 100.0
            } else {
                0.0
            };
            ZoneUtilization {
                zone_id: z.id,
                occupied,
                capacity,
                utilization,
            }
        })
        .collect();

    // strict > keeps the first zone on ties
    let mut peak: Option<&ZoneUtilization> = None;
    for z in &zones {
        if peak.is_none_or(|p| z.occupied > p.occupied) {
            peak = Some(z);
        }
    }
    let peak_zone = peak.map(|z| z.zone_id);

    let mut cancelled = 0;
    let mut completed = 0;
    let mut total_duration: Ms = 0;
    for req in state.ledger.iter() {
        match req.state() {
            RequestState::Cancelled => cancelled += 1,
            RequestState::Released => {
                completed += 1;
                total_duration += req.duration_ms();
            }
            _ => {}
        }
    }
    let average_duration_ms = if completed > 0 {
        total_duration as f64 / completed as f64
    } else {
        0.0
    };

    Analytics {
        zones,
        total_requests: state.ledger.len(),
        cancelled,
        completed,
        average_duration_ms,
        peak_zone,
    }
}
