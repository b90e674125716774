//! Device collaborator.
//!
//! The engine reads and writes field values through the async [`Device`]
//! trait. [`SimulatedDevice`] keeps values in memory and can inject
//! communication faults; [`DevicePoller`] keeps the shared cache fresh.

use crate::cache::DataCache;
use crate::namespace::TagDef;
use crate::opc_da::errors::ItemError;
use crate::opc_da::quality::Quality;
use crate::opc_da::typedefs::{ItemOutcome, ItemRead};
use crate::opc_da::value::{Variant, Vqt};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[cfg(any(test, feature = "test-support"))]
use mockall::automock;

/// Field device access.
///
/// Both operations are batched and must return one result per input, in
/// input order.
#[cfg_attr(any(test, feature = "test-support"), automock)]
#[async_trait]
pub trait Device: Send + Sync {
    /// Read the current samples of `item_ids`.
    async fn read(&self, item_ids: Vec<String>) -> Vec<ItemRead>;

    /// Write already coerced values.
    async fn write(&self, writes: Vec<(String, Variant)>) -> Vec<ItemOutcome>;
}

/// Quality a cached sample takes when the device fails to deliver it.
pub(crate) const fn fault_quality(error: ItemError) -> Quality {
    match error {
        ItemError::CommunicationFailure | ItemError::Busy => Quality::BAD_COMM_FAILURE,
        ItemError::UnknownItemId | ItemError::InvalidItemId | ItemError::UnknownPath => {
            Quality::BAD_CONFIG_ERROR
        }
        _ => Quality::BAD_DEVICE_FAILURE,
    }
}

/// Force a device answer to exactly `expected` entries.
///
/// A device that returns too few results fails the missing items with
/// `CommunicationFailure`; surplus results are dropped.
pub(crate) fn align_results<T>(
    mut results: Vec<Result<T, ItemError>>,
    expected: usize,
    operation: &'static str,
) -> Vec<Result<T, ItemError>> {
    if results.len() != expected {
        tracing::warn!(
            operation,
            expected,
            returned = results.len(),
            "device returned a misaligned batch"
        );
        results.truncate(expected);
        results.resize_with(expected, || Err(ItemError::CommunicationFailure));
    }
    results
}

#[derive(Debug, Clone)]
struct SimPoint {
    current: Vqt,
    faulted: bool,
}

/// In-memory device with per-point fault injection.
#[derive(Debug, Default)]
pub struct SimulatedDevice {
    points: Mutex<HashMap<String, SimPoint>>,
    latency: Duration,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// One Good point per tag, holding the zero value of its canonical type.
    pub fn from_tags<'a>(tags: impl IntoIterator<Item = &'a TagDef>) -> Self {
        let device = Self::new();
        for tag in tags {
            device.set_value(&tag.item_id, Variant::default_for(&tag.canonical_type));
        }
        device
    }

    /// Delay applied to every read and write.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Store a Good sample stamped now, creating the point if needed.
    pub fn set_value(&self, item_id: &str, value: impl Into<Variant>) {
        self.set_sample(item_id, Vqt::good(value));
    }

    pub fn set_sample(&self, item_id: &str, sample: Vqt) {
        let mut points = self.points.lock().unwrap_or_else(PoisonError::into_inner);
        points
            .entry(item_id.to_string())
            .and_modify(|p| p.current = sample.clone())
            .or_insert(SimPoint {
                current: sample,
                faulted: false,
            });
    }

    /// Make every access to `item_id` fail with a communication failure.
    pub fn set_fault(&self, item_id: &str, faulted: bool) -> bool {
        let mut points = self.points.lock().unwrap_or_else(PoisonError::into_inner);
        match points.get_mut(item_id) {
            Some(point) => {
                if point.faulted != faulted {
                    tracing::info!(item = %item_id, faulted, "simulated fault changed");
                }
                point.faulted = faulted;
                true
            }
            None => false,
        }
    }

    pub fn value(&self, item_id: &str) -> Option<Vqt> {
        self.points
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(item_id)
            .map(|p| p.current.clone())
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl Device for SimulatedDevice {
    async fn read(&self, item_ids: Vec<String>) -> Vec<ItemRead> {
        self.simulate_latency().await;
        let points = self.points.lock().unwrap_or_else(PoisonError::into_inner);
        item_ids
            .iter()
            .map(|id| match points.get(id) {
                None => Err(ItemError::UnknownItemId),
                Some(point) if point.faulted => Err(ItemError::CommunicationFailure),
                Some(point) => Ok(point.current.clone()),
            })
            .collect()
    }

    async fn write(&self, writes: Vec<(String, Variant)>) -> Vec<ItemOutcome> {
        self.simulate_latency().await;
        let mut points = self.points.lock().unwrap_or_else(PoisonError::into_inner);
        writes
            .into_iter()
            .map(|(id, value)| match points.get_mut(&id) {
                None => Err(ItemError::UnknownItemId),
                Some(point) if point.faulted => Err(ItemError::CommunicationFailure),
                Some(point) => {
                    point.current = Vqt::good(value);
                    Ok(())
                }
            })
            .collect()
    }
}

/// Background task that refreshes every subscribed cache slot.
pub struct DevicePoller;

impl DevicePoller {
    pub fn spawn(cache: Arc<DataCache>, device: Arc<dyn Device>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!(period_ms = period.as_millis(), "device poller started");
            loop {
                ticker.tick().await;
                poll_once(&cache, device.as_ref()).await;
            }
        })
    }
}

/// Read every subscribed tag from the device into the cache.
pub(crate) async fn poll_once(cache: &DataCache, device: &dyn Device) {
    let ids = cache.subscribed_ids();
    if ids.is_empty() {
        return;
    }
    let results = align_results(device.read(ids.clone()).await, ids.len(), "poll");
    let mut faults = 0usize;
    for (id, result) in ids.iter().zip(results) {
        match result {
            Ok(sample) => {
                cache.update(id, sample);
            }
            Err(e) => {
                faults += 1;
                cache.mark_bad(id, fault_quality(e));
            }
        }
    }
    tracing::trace!(count = ids.len(), faults, "device poll completed");
}
