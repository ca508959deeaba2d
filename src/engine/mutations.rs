use tracing::{info, warn};

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::allocation::allocate;
use super::{now_ms, Engine, EngineError, ParkingState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub request_id: RequestId,
    pub outcome: AllocationOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancellation {
    pub request_id: RequestId,
    /// Zone of the released slot, or the requested zone when nothing was held.
    pub zone_id: ZoneId,
    /// The CANCEL record that was logged, if a slot was released.
    pub released: Option<Operation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    pub request_id: RequestId,
    pub slot_id: Option<SlotId>,
    pub zone_id: ZoneId,
    pub duration_ms: Ms,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackSummary {
    /// Records whose inverse was applied, most recent first.
    pub reverted: Vec<Operation>,
    /// Records popped but skipped because their slot or request was gone.
    pub skipped: usize,
}

impl RollbackSummary {
    pub fn popped(&self) -> usize {
        self.reverted.len() + self.skipped
    }

    pub fn applied(&self) -> usize {
        self.reverted.len()
    }
}

impl ParkingState {
    /// Create a request and try to place it. The request is kept even when
    /// allocation fails; it then stays REQUESTED and is never retried.
    pub fn submit(
        &mut self,
        vehicle_id: &str,
        preferred_zone: ZoneId,
        now: Ms,
    ) -> Result<Submission, EngineError> {
        if vehicle_id.len() > MAX_VEHICLE_ID_LEN {
            return Err(EngineError::LimitExceeded("vehicle id too long"));
        }
        if self.ledger.len() >= MAX_REQUESTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many requests"));
        }

        let req = self.ledger.create(vehicle_id.to_string(), preferred_zone, now);
        let request_id = req.id();
        let outcome = allocate(preferred_zone, &mut self.topology);

        match outcome {
            AllocationOutcome::Allocated {
                slot_id,
                zone_id,
                cross_zone,
            } => {
                let moved = req.transition_to(RequestState::Allocated);
                debug_assert!(moved.is_ok(), "fresh request must be REQUESTED");
                req.assign_slot(slot_id);
                self.history.log(Operation {
                    kind: OperationKind::Allocate,
                    request_id,
                    slot_id,
                    zone_id,
                });
                if cross_zone {
                    info!(
                        "vehicle {vehicle_id} allocated slot {slot_id} in zone {zone_id} (cross-zone from {preferred_zone})"
                    );
                } else {
                    info!("vehicle {vehicle_id} allocated slot {slot_id} in zone {zone_id}");
                }
            }
            AllocationOutcome::Failed(reason) => {
                info!(
                    "no slot for vehicle {vehicle_id} in zone {preferred_zone}: {}",
                    reason.as_str()
                );
            }
        }

        Ok(Submission {
            request_id,
            outcome,
        })
    }

    /// Cancel a REQUESTED or ALLOCATED request. Releasing a held slot logs a
    /// CANCEL record; on any error nothing is changed.
    pub fn cancel(&mut self, request_id: RequestId) -> Result<Cancellation, EngineError> {
        let req = self
            .ledger
            .get_mut(request_id)
            .ok_or(EngineError::RequestNotFound(request_id))?;
        let from = req.state();
        if !from.can_transition_to(RequestState::Cancelled) {
            return Err(EngineError::InvalidTransition {
                request_id,
                from,
                to: RequestState::Cancelled,
            });
        }

        let held = req.assigned_slot().filter(|_| from.holds_slot());
        let released = match held {
            Some(slot_id) => {
                let slot = self
                    .topology
                    .release(slot_id)
                    .ok_or(EngineError::SlotNotFound(slot_id))?;
                Some(Operation {
                    kind: OperationKind::Cancel,
                    request_id,
                    slot_id,
                    zone_id: slot.zone_id,
                })
            }
            None => None,
        };

        req.transition_to(RequestState::Cancelled)
            .map_err(|e| EngineError::transition(request_id, e))?;
        let zone_id = released.map_or(req.requested_zone(), |op| op.zone_id);
        if let Some(op) = released {
            self.history.log(op);
        }
        info!("request {request_id} cancelled");

        Ok(Cancellation {
            request_id,
            zone_id,
            released,
        })
    }

    /// End a stay. An ALLOCATED request is first confirmed as OCCUPIED, then
    /// RELEASED. Not logged, so a departure cannot be rolled back.
    pub fn leave(&mut self, request_id: RequestId, now: Ms) -> Result<Departure, EngineError> {
        let req = self
            .ledger
            .get_mut(request_id)
            .ok_or(EngineError::RequestNotFound(request_id))?;
        let from = req.state();
        if !from.holds_slot() {
            return Err(EngineError::InvalidTransition {
                request_id,
                from,
                to: RequestState::Released,
            });
        }
        let slot_id = req.assigned_slot();
        if let Some(s) = slot_id
            && self.topology.slot(s).is_none()
        {
            return Err(EngineError::SlotNotFound(s));
        }

        if from == RequestState::Allocated {
            req.transition_to(RequestState::Occupied)
                .map_err(|e| EngineError::transition(request_id, e))?;
        }
        req.transition_to(RequestState::Released)
            .map_err(|e| EngineError::transition(request_id, e))?;
        req.set_ended_at(now);

        let zone_id = slot_id
            .and_then(|s| self.topology.release(s))
            .map_or(req.requested_zone(), |slot| slot.zone_id);
        let duration_ms = req.duration_ms();
        info!(
            "vehicle {} left parking after {duration_ms}ms",
            req.vehicle_id()
        );

        Ok(Departure {
            request_id,
            slot_id,
            zone_id,
            duration_ms,
        })
    }

    /// Pop up to `k` records and apply their inverses, most recent first.
    /// A record whose slot or request cannot be found is skipped; the rest
    /// of the batch still runs.
    pub fn rollback(&mut self, k: usize) -> RollbackSummary {
        let ops = self.history.rollback(k);
        info!("rolling back {} operations", ops.len());

        let mut summary = RollbackSummary::default();
        for op in ops {
            match self.invert(&op) {
                Ok(()) => summary.reverted.push(op),
                Err(e) => {
                    warn!(
                        "skipping {} record for request {}: {e}",
                        op.kind.as_str(),
                        op.request_id
                    );
                    summary.skipped += 1;
                }
            }
        }
        summary
    }

    fn invert(&mut self, op: &Operation) -> Result<(), EngineError> {
        if self.topology.slot(op.slot_id).is_none() {
            return Err(EngineError::SlotNotFound(op.slot_id));
        }
        let req = self
            .ledger
            .get_mut(op.request_id)
            .ok_or(EngineError::RequestNotFound(op.request_id))?;

        match op.kind {
            OperationKind::Allocate => {
                self.topology.release(op.slot_id);
                req.force_state(RequestState::Requested);
                req.clear_slot();
                req.clear_ended_at();
                info!(
                    "released slot {}, request {} back to REQUESTED",
                    op.slot_id, op.request_id
                );
            }
            OperationKind::Cancel => {
                self.topology.occupy(op.slot_id);
                req.force_state(RequestState::Allocated);
                req.assign_slot(op.slot_id);
                info!(
                    "re-occupied slot {}, request {} back to ALLOCATED",
                    op.slot_id, op.request_id
                );
            }
        }
        Ok(())
    }
}

impl Engine {
    pub async fn submit(
        &self,
        vehicle_id: &str,
        preferred_zone: ZoneId,
    ) -> Result<Submission, EngineError> {
        let mut state = self.state.write().await;
        let before = state.topology.occupied_total();
        let submission = state.submit(vehicle_id, preferred_zone, now_ms())?;
        track_occupancy(before, state.topology.occupied_total());

        let event = match submission.outcome {
            AllocationOutcome::Allocated {
                slot_id,
                zone_id,
                cross_zone,
            } => Event::SlotAllocated {
                request_id: submission.request_id,
                vehicle_id: vehicle_id.to_string(),
                slot_id,
                zone_id,
                cross_zone,
            },
            AllocationOutcome::Failed(reason) => Event::AllocationFailed {
                request_id: submission.request_id,
                vehicle_id: vehicle_id.to_string(),
                zone_id: preferred_zone,
                reason,
            },
        };
        metrics::counter!(
            observability::ALLOCATIONS_TOTAL,
            "outcome" => observability::outcome_label(&submission.outcome)
        )
        .increment(1);
        self.publish(&event);
        Ok(submission)
    }

    pub async fn cancel(&self, request_id: RequestId) -> Result<Cancellation, EngineError> {
        let mut state = self.state.write().await;
        let before = state.topology.occupied_total();
        let cancellation = state.cancel(request_id)?;
        track_occupancy(before, state.topology.occupied_total());
        metrics::counter!(observability::CANCELLATIONS_TOTAL).increment(1);
        self.publish(&Event::RequestCancelled {
            request_id,
            slot_id: cancellation.released.map(|op| op.slot_id),
            zone_id: cancellation.zone_id,
        });
        Ok(cancellation)
    }

    pub async fn leave(&self, request_id: RequestId) -> Result<Departure, EngineError> {
        let mut state = self.state.write().await;
        let before = state.topology.occupied_total();
        let departure = state.leave(request_id, now_ms())?;
        track_occupancy(before, state.topology.occupied_total());
        metrics::counter!(observability::DEPARTURES_TOTAL).increment(1);
        self.publish(&Event::VehicleLeft {
            request_id,
            slot_id: departure.slot_id,
            zone_id: departure.zone_id,
            duration_ms: departure.duration_ms,
        });
        Ok(departure)
    }

    /// Undo the last `k` logged operations. `k <= 0` does nothing; a `k`
    /// past the retained history undoes what there is.
    pub async fn rollback(&self, k: i64) -> Result<RollbackSummary, EngineError> {
        if k <= 0 {
            return Ok(RollbackSummary::default());
        }
        let k = usize::try_from(k).unwrap_or(usize::MAX);
        if k > MAX_ROLLBACK_BATCH {
            return Err(EngineError::LimitExceeded("rollback batch too large"));
        }
        let mut state = self.state.write().await;
        let before = state.topology.occupied_total();
        let summary = state.rollback(k);
        track_occupancy(before, state.topology.occupied_total());

        metrics::counter!(observability::ROLLBACK_RECORDS_TOTAL, "result" => "applied")
            .increment(summary.applied() as u64);
        metrics::counter!(observability::ROLLBACK_RECORDS_TOTAL, "result" => "skipped")
            .increment(summary.skipped as u64);
        for op in &summary.reverted {
            self.publish(&Event::reverted(op));
        }
        Ok(summary)
    }
}

/// Move the shared occupancy gauge by this facility's change.
fn track_occupancy(before: usize, after: usize) {
    let gauge = metrics::gauge!(observability::SLOTS_OCCUPIED);
    if after > before {
        gauge.increment((after - before) as f64);
    } else if before > after {
        gauge.decrement((before - after) as f64);
    }
}
