//! Resolution of a routing key against a snapshot of the pool.
//!
//! Resolution is a pure function: it never blocks and never mutates the pool.
//! Waiting for a busy worker and claiming the selected ones is the pool's job.

use crate::error::RouteError;
use crate::types::{PoolSnapshot, RoutingKey, WorkerId, WorkerState};

/// Select the target workers for `key`
///
/// - `Specific(id)` resolves to `id` whatever its current load, unless it does
///   not exist or has crashed for good.
/// - `Broadcast` resolves to every idle worker in ascending id order, possibly
///   none.
/// - `AnyIdle` resolves to the first idle worker at or after the snapshot's
///   cursor, wrapping around.
pub fn resolve(key: &RoutingKey, snapshot: &PoolSnapshot) -> Result<Vec<WorkerId>, RouteError> {
    match key {
        RoutingKey::Specific(id) => {
            let worker = snapshot.get(*id).ok_or(RouteError::UnknownWorker(*id))?;
            if worker.state == WorkerState::Crashed {
                return Err(RouteError::WorkerCrashed(*id));
            }
            Ok(vec![*id])
        }
        RoutingKey::Broadcast => {
            let mut ids: Vec<WorkerId> = snapshot
                .workers
                .iter()
                .filter(|w| w.state == WorkerState::Idle)
                .map(|w| w.id)
                .collect();
            ids.sort();
            Ok(ids)
        }
        RoutingKey::AnyIdle => {
            let len = snapshot.workers.len();
            if len == 0 {
                return Err(RouteError::NoIdleWorker);
            }
            let start = snapshot.cursor % len;
            (0..len)
                .map(|offset| &snapshot.workers[(start + offset) % len])
                .find(|w| w.state == WorkerState::Idle)
                .map(|w| vec![w.id])
                .ok_or(RouteError::NoIdleWorker)
        }
    }
}
