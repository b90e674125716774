//! Delivery types sent to a group's advised client.
//!
//! Periodic scans and refreshes arrive as [`DataChange`] on the data-change
//! channel. Asynchronous read, write and cancel completions arrive as
//! [`Completion`] on a separate channel.

use super::errors::ItemError;
use super::quality::Quality;
use super::typedefs::{CancelId, GroupHandle, ItemHandle, ItemState};
use tokio::sync::mpsc;

/// Transaction ID carried by periodic deliveries.
pub const PERIODIC_TRANSACTION: u32 = 0;

/// One batched data-change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChange {
    /// 0 for periodic scans, the caller's ID for refresh deliveries.
    pub transaction_id: u32,
    pub group_client_handle: GroupHandle,
    /// Good when every item is good, Bad otherwise.
    pub master_quality: Quality,
    pub items: Vec<ItemState>,
}

impl DataChange {
    pub(crate) fn new(
        transaction_id: u32,
        group_client_handle: GroupHandle,
        items: Vec<ItemState>,
    ) -> Self {
        let master_quality = if items
            .iter()
            .all(|item| item.error.is_none() && item.quality.is_good())
        {
            Quality::GOOD
        } else {
            Quality::BAD
        };
        Self {
            transaction_id,
            group_client_handle,
            master_quality,
            items,
        }
    }

    pub fn is_refresh(&self) -> bool {
        self.transaction_id != PERIODIC_TRANSACTION
    }
}

/// Completion of an asynchronous read.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadComplete {
    pub transaction_id: u32,
    pub cancel_id: CancelId,
    pub group_client_handle: GroupHandle,
    pub items: Vec<ItemState>,
}

/// Completion of an asynchronous write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteComplete {
    pub transaction_id: u32,
    pub cancel_id: CancelId,
    pub group_client_handle: GroupHandle,
    /// `(client handle, outcome)` per accepted item.
    pub results: Vec<(ItemHandle, Result<(), ItemError>)>,
}

/// Notification that a cancelled operation will not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelComplete {
    pub transaction_id: u32,
    pub cancel_id: CancelId,
    pub group_client_handle: GroupHandle,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Read(ReadComplete),
    Write(WriteComplete),
    Cancel(CancelComplete),
}

impl Completion {
    pub fn transaction_id(&self) -> u32 {
        match self {
            Self::Read(c) => c.transaction_id,
            Self::Write(c) => c.transaction_id,
            Self::Cancel(c) => c.transaction_id,
        }
    }
}

/// Receiving ends of an advised group.
#[derive(Debug)]
pub struct GroupSubscription {
    pub data_changes: mpsc::Receiver<DataChange>,
    pub completions: mpsc::Receiver<Completion>,
}

#[derive(Debug, Clone)]
pub(crate) struct GroupSinks {
    pub(crate) data_changes: mpsc::Sender<DataChange>,
    pub(crate) completions: mpsc::Sender<Completion>,
}

impl GroupSinks {
    pub(crate) fn is_closed(&self) -> bool {
        self.data_changes.is_closed() && self.completions.is_closed()
    }
}
