//! Periodic change detection.
//!
//! One task per group scans its active items once per revised update rate
//! and coalesces every reportable change into a single [`DataChange`].

use crate::group::GroupCore;
use crate::opc_da::callback::{DataChange, PERIODIC_TRANSACTION};
use crate::opc_da::errors::OpcResult;
use crate::opc_da::typedefs::ItemState;
use crate::opc_da::value::Vqt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub(crate) fn spawn(core: &Arc<GroupCore>, update_rate: u32) -> JoinHandle<()> {
    let group = Arc::downgrade(core);
    let handle = core.server_handle;
    let period = Duration::from_millis(u64::from(update_rate.max(1)));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(group = handle.0, update_rate, "scheduler started");
        loop {
            ticker.tick().await;
            let Some(core) = group.upgrade() else {
                break;
            };
            if core.is_removed() {
                break;
            }
            if let Err(e) = scan_group(&core) {
                tracing::error!(group = handle.0, error = %e, "scan failed, stopping scheduler");
                break;
            }
        }
        tracing::debug!(group = handle.0, "scheduler stopped");
    })
}

/// Run one scan. Returns the number of items delivered.
pub(crate) fn scan_group(core: &GroupCore) -> OpcResult<usize> {
    let Some(sinks) = core.sinks()? else {
        return Ok(0);
    };
    if sinks.data_changes.is_closed() {
        return Ok(0);
    }

    let body = core.body.read()?;
    if !body.active {
        return Ok(0);
    }

    let mut states = Vec::new();
    let mut committed = Vec::new();
    for item in body.items.values().filter(|item| item.active) {
        let current = item.slot.snapshot();
        if !is_reportable(&item.baseline(), &current, item.eu_range, body.percent_deadband) {
            continue;
        }
        let state = match item.present(current.clone()) {
            Ok(shown) => ItemState::from_vqt(item.client_handle, shown),
            Err(e) => ItemState::failed(item.client_handle, e),
        };
        states.push(state);
        committed.push((item, current));
    }
    if states.is_empty() {
        return Ok(0);
    }

    let count = states.len();
    let change = DataChange::new(PERIODIC_TRANSACTION, body.client_handle, states);
    match sinks.data_changes.try_send(change) {
        Ok(()) => {
            for (item, sample) in committed {
                item.commit_baseline(sample);
            }
            core.clock.touch();
            tracing::trace!(group = core.server_handle.0, count, "data change delivered");
            Ok(count)
        }
        Err(TrySendError::Full(_)) => {
            tracing::warn!(
                group = core.server_handle.0,
                count,
                "callback queue full, deferring changes to next scan"
            );
            Ok(0)
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!(group = core.server_handle.0, "subscriber went away");
            Ok(0)
        }
    }
}

/// Whether `current` must be reported given the last delivered sample.
///
/// Quality changes always count. Analog values must move by more than
/// `percent_deadband` percent of the EU span; moving to or from NaN always
/// counts.
pub(crate) fn is_reportable(
    last: &Vqt,
    current: &Vqt,
    eu_range: Option<(f64, f64)>,
    percent_deadband: f32,
) -> bool {
    if last.quality != current.quality {
        return true;
    }
    if last.value.same_as(&current.value) {
        return false;
    }
    match (eu_range, last.value.as_f64(), current.value.as_f64()) {
        (Some((low, high)), Some(old), Some(new)) => {
            if old.is_nan() || new.is_nan() {
                return true;
            }
            let span = high - low;
            if percent_deadband <= 0.0 || !span.is_finite() || span <= 0.0 {
                return true;
            }
            (new - old).abs() / span * 100.0 > f64::from(percent_deadband)
        }
        _ => true,
    }
}
