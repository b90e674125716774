//! Simulation setup: tag table, signal generators and fault windows.

use anyhow::{Context, Result, bail};
use opc_da_server::{
    AccessRights, ServerConfig, SimulatedDevice, StaticAddressSpace, TagDef, VarType, Variant,
    parse_value,
};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const fn default_tick_ms() -> u64 {
    500
}

/// Contents of an `opc-sim` TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct SimConfig {
    /// Period of the signal generator.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tags: Vec<TagConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagConfig {
    pub item_id: String,
    pub data_type: VarType,
    #[serde(default = "default_access")]
    pub access: AccessRights,
    #[serde(default)]
    pub eu_range: Option<(f64, f64)>,
    #[serde(default)]
    pub access_paths: Vec<String>,
    #[serde(default)]
    pub description: String,
    /// Starting value, parsed as `data_type`.
    #[serde(default)]
    pub initial: Option<String>,
    #[serde(default)]
    pub signal: Signal,
    #[serde(default)]
    pub fault: Option<FaultWindow>,
}

const fn default_access() -> AccessRights {
    AccessRights::ReadWrite
}

/// Value source driven into the device on every generator tick.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Signal {
    /// Keeps whatever was last written.
    #[default]
    Constant,
    /// Climbs by `step` per tick and wraps from `max` back to `min`.
    Ramp { min: f64, max: f64, step: f64 },
    Sine {
        amplitude: f64,
        #[serde(default)]
        offset: f64,
        period_ms: u64,
    },
    /// Flips every `every` ticks.
    Toggle { every: u64 },
    Counter {
        #[serde(default = "one")]
        step: i64,
    },
}

const fn one() -> i64 {
    1
}

impl Signal {
    /// Value for generator tick `tick`, or `None` when the signal leaves the
    /// point alone.
    pub fn value_at(&self, tick: u64, tick_ms: u64) -> Option<Variant> {
        match *self {
            Self::Constant => None,
            Self::Ramp { min, max, step } => {
                let span = max - min;
                if span <= 0.0 || !span.is_finite() {
                    return Some(Variant::R8(min));
                }
                #[allow(clippy::cast_precision_loss)]
                let travelled = tick as f64 * step;
                Some(Variant::R8(min + travelled.rem_euclid(span)))
            }
            Self::Sine {
                amplitude,
                offset,
                period_ms,
            } => {
                #[allow(clippy::cast_precision_loss)]
                let phase = (tick.saturating_mul(tick_ms) % period_ms.max(1)) as f64
                    / period_ms.max(1) as f64;
                Some(Variant::R8(
                    amplitude.mul_add((phase * std::f64::consts::TAU).sin(), offset),
                ))
            }
            Self::Toggle { every } => Some(Variant::Bool((tick / every.max(1)) % 2 == 1)),
            Self::Counter { step } => {
                let ticks = i64::try_from(tick).unwrap_or(i64::MAX);
                Some(Variant::I8(ticks.wrapping_mul(step)))
            }
        }
    }
}

/// Recurring window during which the point reports a communication failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FaultWindow {
    pub every_ms: u64,
    pub duration_ms: u64,
    /// Offset of the first window from start-up.
    #[serde(default)]
    pub start_ms: u64,
}

impl FaultWindow {
    pub fn is_active(&self, elapsed_ms: u64) -> bool {
        if elapsed_ms < self.start_ms || self.every_ms == 0 {
            return false;
        }
        (elapsed_ms - self.start_ms) % self.every_ms < self.duration_ms
    }
}

impl TagConfig {
    fn new(item_id: &str, data_type: VarType, access: AccessRights, signal: Signal) -> Self {
        Self {
            item_id: item_id.to_string(),
            data_type,
            access,
            eu_range: None,
            access_paths: Vec::new(),
            description: String::new(),
            initial: None,
            signal,
            fault: None,
        }
    }

    fn definition(&self) -> TagDef {
        let mut tag = TagDef::new(&self.item_id, self.data_type.clone(), self.access);
        tag.eu_range = self.eu_range;
        tag.access_paths.clone_from(&self.access_paths);
        tag.description.clone_from(&self.description);
        tag
    }
}

impl SimConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        tracing::info!(path = %path.display(), tags = config.tags.len(), "configuration loaded");
        Ok(config)
    }

    /// Small plant used when no configuration file is given.
    pub fn demo() -> Self {
        let mut level = TagConfig::new(
            "Plant.Tank1.Level",
            VarType::R8,
            AccessRights::Read,
            Signal::Sine {
                amplitude: 40.0,
                offset: 100.0,
                period_ms: 20_000,
            },
        );
        level.eu_range = Some((0.0, 200.0));
        level.description = "Tank 1 level in litres".into();

        let mut flow = TagConfig::new(
            "Plant.Tank1.Inflow",
            VarType::R4,
            AccessRights::Read,
            Signal::Ramp {
                min: 0.0,
                max: 50.0,
                step: 1.5,
            },
        );
        flow.eu_range = Some((0.0, 50.0));
        flow.fault = Some(FaultWindow {
            every_ms: 60_000,
            duration_ms: 5_000,
            start_ms: 30_000,
        });

        let mut setpoint = TagConfig::new(
            "Plant.Tank1.Setpoint",
            VarType::I2,
            AccessRights::ReadWrite,
            Signal::Constant,
        );
        setpoint.initial = Some("120".into());

        let mut status = TagConfig::new(
            "Plant.Status",
            VarType::Str,
            AccessRights::Read,
            Signal::Constant,
        );
        status.initial = Some("running".into());
        status.access_paths = vec!["Line1".into()];

        Self {
            tick_ms: default_tick_ms(),
            server: ServerConfig::default(),
            tags: vec![
                level,
                flow,
                setpoint,
                TagConfig::new(
                    "Plant.Pump1.Running",
                    VarType::Bool,
                    AccessRights::ReadWrite,
                    Signal::Toggle { every: 20 },
                ),
                TagConfig::new(
                    "Plant.Pump1.Starts",
                    VarType::UI4,
                    AccessRights::Read,
                    Signal::Counter { step: 1 },
                ),
                TagConfig::new(
                    "Plant.Alarm.Reset",
                    VarType::Bool,
                    AccessRights::Write,
                    Signal::Constant,
                ),
                status,
            ],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tags.is_empty() {
            bail!("configuration defines no tags");
        }
        if self.tick_ms == 0 {
            bail!("tick_ms must be at least 1");
        }
        self.server
            .validate()
            .context("Invalid [server] section")?;
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn address_space(&self) -> Result<StaticAddressSpace> {
        StaticAddressSpace::new(self.tags.iter().map(TagConfig::definition))
            .context("Invalid tag table")
    }

    /// Device holding every tag at its initial value.
    pub fn device(&self) -> Result<SimulatedDevice> {
        let device = SimulatedDevice::new();
        for tag in &self.tags {
            let value = match &tag.initial {
                Some(text) => parse_value(text, &tag.data_type).map_err(|e| {
                    anyhow::anyhow!("initial value '{text}' of {}: {e}", tag.item_id)
                })?,
                None => tag
                    .signal
                    .value_at(0, self.tick_ms)
                    .and_then(|v| v.coerce(&tag.data_type).ok())
                    .unwrap_or_else(|| Variant::default_for(&tag.data_type)),
            };
            device.set_value(&tag.item_id, value);
        }
        Ok(device)
    }
}

/// Apply one generator tick to the device.
pub fn apply_tick(tags: &[TagConfig], device: &SimulatedDevice, tick: u64, tick_ms: u64) {
    let elapsed_ms = tick.saturating_mul(tick_ms);
    for tag in tags {
        if let Some(fault) = tag.fault {
            device.set_fault(&tag.item_id, fault.is_active(elapsed_ms));
        }
        let Some(raw) = tag.signal.value_at(tick, tick_ms) else {
            continue;
        };
        match raw.coerce(&tag.data_type) {
            Ok(value) => device.set_value(&tag.item_id, value),
            Err(e) => {
                tracing::warn!(item = %tag.item_id, error = %e, "generated value does not fit tag type");
            }
        }
    }
}

pub fn spawn_generator(
    tags: Vec<TagConfig>,
    device: Arc<SimulatedDevice>,
    tick: Duration,
) -> JoinHandle<()> {
    let tick_ms = u64::try_from(tick.as_millis()).unwrap_or(u64::MAX);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::debug!(tags = tags.len(), tick_ms, "signal generator started");
        let mut count: u64 = 0;
        loop {
            ticker.tick().await;
            apply_tick(&tags, &device, count, tick_ms);
            count = count.wrapping_add(1);
        }
    })
}
