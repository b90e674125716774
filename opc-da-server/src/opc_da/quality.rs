/// OPC quality word.
///
/// The top two bits of the low byte select the major status (Good,
/// Uncertain, Bad); the remaining bits carry the sub-status and limit flags.
///
/// # Examples
///
/// ```
/// use opc_da_server::{Quality, QualityStatus};
///
/// assert_eq!(Quality::GOOD.status(), QualityStatus::Good);
/// assert_eq!(Quality::BAD_COMM_FAILURE.status(), QualityStatus::Bad);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quality(pub u16);

/// Major quality status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QualityStatus {
    Good,
    Uncertain,
    Bad,
    /// `0x80` is not assigned by the protocol.
    Unknown,
}

impl Quality {
    pub const GOOD: Self = Self(0xC0);
    pub const GOOD_LOCAL_OVERRIDE: Self = Self(0xD8);
    pub const UNCERTAIN: Self = Self(0x40);
    pub const UNCERTAIN_LAST_USABLE: Self = Self(0x44);
    pub const BAD: Self = Self(0x00);
    pub const BAD_CONFIG_ERROR: Self = Self(0x04);
    pub const BAD_NOT_CONNECTED: Self = Self(0x08);
    pub const BAD_DEVICE_FAILURE: Self = Self(0x0C);
    pub const BAD_COMM_FAILURE: Self = Self(0x18);
    pub const BAD_OUT_OF_SERVICE: Self = Self(0x1C);
    pub const BAD_WAITING_FOR_INITIAL_DATA: Self = Self(0x20);

    pub const fn status(self) -> QualityStatus {
        match self.0 & 0xC0 {
            0xC0 => QualityStatus::Good,
            0x40 => QualityStatus::Uncertain,
            0x00 => QualityStatus::Bad,
            _ => QualityStatus::Unknown,
        }
    }

    pub const fn is_good(self) -> bool {
        matches!(self.status(), QualityStatus::Good)
    }

    pub const fn is_bad(self) -> bool {
        matches!(self.status(), QualityStatus::Bad)
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self::BAD_WAITING_FOR_INITIAL_DATA
    }
}
