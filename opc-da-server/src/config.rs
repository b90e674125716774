use crate::opc_da::errors::{OpcError, OpcResult};
use serde::{Deserialize, Serialize};

/// `LOCALE_NEUTRAL`, `LOCALE_USER_DEFAULT`, `LOCALE_SYSTEM_DEFAULT`, en-US.
const DEFAULT_LOCALES: [u32; 4] = [0x0000, 0x0400, 0x0800, 0x0409];

/// Server tuning knobs.
///
/// Every field has a default, so a configuration file only needs to name
/// what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Fastest update rate the scheduler supports, in milliseconds.
    pub min_update_rate_ms: u32,
    pub max_groups: usize,
    pub max_items_per_group: usize,
    /// Device poll period in milliseconds; 0 disables the poller.
    pub device_poll_ms: u64,
    /// Capacity of each group's callback channels.
    pub callback_queue_depth: usize,
    /// Capacity of the asynchronous I/O queue.
    pub io_queue_depth: usize,
    pub locale_ids: Vec<u32>,
    pub major_version: u16,
    pub minor_version: u16,
    pub build_number: u16,
    pub vendor_info: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            min_update_rate_ms: 100,
            max_groups: 256,
            max_items_per_group: 10_000,
            device_poll_ms: 250,
            callback_queue_depth: 64,
            io_queue_depth: 32,
            locale_ids: DEFAULT_LOCALES.to_vec(),
            major_version: 3,
            minor_version: 0,
            build_number: 1,
            vendor_info: "opc-da-server simulation engine".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> OpcResult<()> {
        if self.min_update_rate_ms == 0 {
            return Err(OpcError::InvalidArgument(
                "min_update_rate_ms must be at least 1".into(),
            ));
        }
        if self.callback_queue_depth == 0 || self.io_queue_depth == 0 {
            return Err(OpcError::InvalidArgument(
                "queue depths must be at least 1".into(),
            ));
        }
        if self.max_groups == 0 || self.max_items_per_group == 0 {
            return Err(OpcError::InvalidArgument(
                "max_groups and max_items_per_group must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Rate the scheduler will actually use for a requested rate.
    ///
    /// Never below the minimum rate and always a multiple of it.
    ///
    /// # Examples
    ///
    /// ```
    /// use opc_da_server::ServerConfig;
    ///
    /// let config = ServerConfig::default();
    /// assert_eq!(config.revise_update_rate(0), 100);
    /// assert_eq!(config.revise_update_rate(1000), 1000);
    /// assert_eq!(config.revise_update_rate(1050), 1100);
    /// ```
    pub fn revise_update_rate(&self, requested: u32) -> u32 {
        let min = self.min_update_rate_ms.max(1);
        if requested <= min {
            return min;
        }
        match requested.div_ceil(min).checked_mul(min) {
            Some(rate) => rate,
            None => u32::MAX - u32::MAX % min,
        }
    }

    pub fn supports_locale(&self, locale_id: u32) -> bool {
        self.locale_ids.contains(&locale_id)
    }
}
