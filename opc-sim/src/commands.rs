//! Command implementations. Output goes to any [`Write`] so the commands can
//! be exercised without a terminal.

use crate::cli::Command;
use crate::sim::{self, SimConfig};
use anyhow::{Context, Result, anyhow, bail};
use opc_da_server::{
    BrowseFilter, BrowseType, DataChange, DataSource, Group, GroupDef, ItemDef, ItemHandle,
    ItemRead, NamespaceDirectory, Server, SimulatedDevice, StaticAddressSpace, format_code,
    parse_value, quality_to_string, timestamp_to_string, value_to_string,
};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Transaction ID of the refresh issued when a watch starts.
const INITIAL_REFRESH: u32 = 1;

/// Address space and device shared by every server the commands start.
pub struct Simulation {
    pub config: SimConfig,
    space: Arc<StaticAddressSpace>,
    device: Arc<SimulatedDevice>,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Result<Self> {
        let space = Arc::new(config.address_space()?);
        let device = Arc::new(config.device()?);
        Ok(Self {
            config,
            space,
            device,
        })
    }

    pub fn start_generator(&self) -> JoinHandle<()> {
        sim::spawn_generator(
            self.config.tags.clone(),
            Arc::clone(&self.device),
            self.config.tick(),
        )
    }

    pub fn start_server(&self) -> Result<Server> {
        Server::new(
            self.config.server.clone(),
            self.space.clone(),
            self.device.clone(),
        )
        .context("Failed to start the OPC server")
    }

    pub fn restore_server(&self, path: &Path) -> Result<Server> {
        let blob = std::fs::read(path)
            .with_context(|| format!("Failed to read saved groups from {}", path.display()))?;
        Server::restore(
            self.config.server.clone(),
            self.space.clone(),
            self.device.clone(),
            &blob,
        )
        .with_context(|| format!("Failed to restore groups from {}", path.display()))
    }
}

pub async fn run<W: Write>(command: Command, sim: &Simulation, out: &mut W) -> Result<()> {
    match command {
        Command::Browse {
            position,
            filter,
            all,
            max,
        } => {
            let server = sim.start_server()?;
            browse(server.namespace(), &position, &filter, all, max, out)
        }
        Command::Read { items, cache } => {
            let server = sim.start_server()?;
            let wait = cache.then(|| Duration::from_millis(sim.config.server.device_poll_ms + 50));
            read(&server, &items, wait, out).await
        }
        Command::Write { item, value } => {
            let server = sim.start_server()?;
            write(&server, &item, &value, out).await
        }
        Command::Watch {
            items,
            rate,
            deadband,
            duration,
            load,
            save,
        } => {
            let server = match &load {
                Some(path) => sim.restore_server(path)?,
                None => sim.start_server()?,
            };
            let groups = if load.is_some() {
                server.groups()?
            } else {
                vec![watch_group(&server, &items, rate, deadband)?]
            };
            let stop_after = (duration > 0).then(|| Duration::from_secs(duration));
            watch(&groups, stop_after, out).await?;
            if let Some(path) = save {
                std::fs::write(&path, server.serialize()?)
                    .with_context(|| format!("Failed to save groups to {}", path.display()))?;
                writeln!(out, "saved {} group(s) to {}", groups.len(), path.display())?;
            }
            Ok(())
        }
    }
}

fn browse<W: Write>(
    namespace: &NamespaceDirectory,
    position: &str,
    filter: &str,
    all: bool,
    max: usize,
    out: &mut W,
) -> Result<()> {
    if all {
        for id in namespace.browse_all(max)? {
            writeln!(out, "{id}")?;
        }
        return Ok(());
    }

    let branches =
        namespace.browse(position, &BrowseFilter::new(BrowseType::Branch).with_pattern(filter))?;
    let leaves =
        namespace.browse(position, &BrowseFilter::new(BrowseType::Leaf).with_pattern(filter))?;
    for branch in &branches {
        writeln!(out, "[+] {branch}")?;
    }
    for leaf in &leaves {
        match namespace.validate(leaf, None) {
            Ok(info) => writeln!(
                out,
                "    {leaf:<32} {:?} {:?}",
                info.canonical_type, info.access_rights
            )?,
            Err(e) => writeln!(out, "    {leaf:<32} {e}")?,
        }
    }
    Ok(())
}

/// Item definitions with client handles 1, 2, 3, ... in input order.
fn item_defs(items: &[String], active: bool) -> Vec<ItemDef> {
    items
        .iter()
        .zip(1u32..)
        .map(|(id, client)| ItemDef {
            active,
            ..ItemDef::new(id.clone(), ItemHandle(client))
        })
        .collect()
}

pub fn format_read(item_id: &str, result: &ItemRead) -> String {
    match result {
        Ok(sample) => format!(
            "{item_id:<32} {:<16} {:<28} {}",
            value_to_string(&sample.value),
            quality_to_string(sample.quality),
            timestamp_to_string(sample.timestamp)
        ),
        Err(e) => format!("{item_id:<32} ERROR {}", format_code(e.code())),
    }
}

async fn read<W: Write>(
    server: &Server,
    items: &[String],
    cache_wait: Option<Duration>,
    out: &mut W,
) -> Result<()> {
    let group = server.add_group(&GroupDef {
        name: Some("opc-sim.read".into()),
        ..GroupDef::default()
    })?;
    let added = group.add_items(&item_defs(items, true))?;
    let handles: Vec<ItemHandle> = added
        .iter()
        .filter_map(|r| r.as_ref().ok().map(|ok| ok.server_handle))
        .collect();

    let source = match cache_wait {
        Some(wait) => {
            if server.config().device_poll_ms == 0 {
                tracing::warn!("device poller disabled, cache reads only show initial quality");
            }
            tokio::time::sleep(wait).await;
            DataSource::Cache
        }
        None => DataSource::Device,
    };
    let mut values = if handles.is_empty() {
        Vec::new()
    } else {
        group.read(source, &handles).await?
    }
    .into_iter();

    for (id, add) in items.iter().zip(added) {
        let result = match add {
            Ok(_) => values.next().unwrap_or(Err(opc_da_server::ItemError::InvalidHandle)),
            Err(e) => Err(e),
        };
        writeln!(out, "{}", format_read(id, &result))?;
    }
    server.remove_group(group.server_handle(), true)?;
    Ok(())
}

async fn write<W: Write>(server: &Server, item: &str, text: &str, out: &mut W) -> Result<()> {
    let group = server.add_group(&GroupDef {
        name: Some("opc-sim.write".into()),
        active: false,
        ..GroupDef::default()
    })?;
    let added = group
        .add_items(&item_defs(&[item.to_string()], false))?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("server returned no result for {item}"))?
        .map_err(|e| anyhow!("{item}: {}", format_code(e.code())))?;

    let value = parse_value(text, &added.canonical_type)
        .map_err(|e| anyhow!("'{text}' is not a valid {:?}: {e}", added.canonical_type))?;
    let outcome = group
        .write(&[added.server_handle], std::slice::from_ref(&value))
        .await?
        .into_iter()
        .next()
        .unwrap_or(Err(opc_da_server::ItemError::CommunicationFailure));
    server.remove_group(group.server_handle(), true)?;

    match outcome {
        Ok(()) => {
            writeln!(out, "{item} <- {}", value_to_string(&value))?;
            Ok(())
        }
        Err(e) => bail!("write to {item} failed: {}", format_code(e.code())),
    }
}

fn watch_group(server: &Server, items: &[String], rate: u32, deadband: f32) -> Result<Group> {
    let items = if items.is_empty() {
        server.namespace().browse_all(10_000)?
    } else {
        items.to_vec()
    };
    let group = server.add_group(&GroupDef {
        name: Some("opc-sim.watch".into()),
        update_rate: rate,
        percent_deadband: deadband,
        ..GroupDef::default()
    })?;
    for (id, result) in items.iter().zip(group.add_items(&item_defs(&items, true))?) {
        if let Err(e) = result {
            tracing::warn!(item = %id, error = %e, "watch: item not added");
        }
    }
    Ok(group)
}

struct Labels {
    group: String,
    items: HashMap<ItemHandle, String>,
}

fn format_change(labels: &Labels, change: &DataChange) -> Vec<String> {
    let origin = if change.is_refresh() {
        format!("refresh {}", change.transaction_id)
    } else {
        "update".to_string()
    };
    change
        .items
        .iter()
        .map(|state| {
            let id = labels
                .items
                .get(&state.client_handle)
                .map_or("?", String::as_str);
            let line = match state.error {
                Some(e) => format!("{id:<32} ERROR {}", format_code(e.code())),
                None => format!(
                    "{id:<32} {:<16} {:<28} {}",
                    value_to_string(&state.value),
                    quality_to_string(state.quality),
                    timestamp_to_string(state.timestamp)
                ),
            };
            format!("[{} {origin}] {line}", labels.group)
        })
        .collect()
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn watch<W: Write>(groups: &[Group], stop_after: Option<Duration>, out: &mut W) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<(usize, DataChange)>(64);
    let mut labels = Vec::with_capacity(groups.len());
    for (index, group) in groups.iter().enumerate() {
        let items = group
            .items()?
            .into_iter()
            .map(|item| (item.client_handle, item.item_id))
            .collect();
        labels.push(Labels {
            group: group.state()?.name,
            items,
        });

        let mut subscription = group.advise()?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(change) = subscription.data_changes.recv().await {
                if tx.send((index, change)).await.is_err() {
                    break;
                }
            }
        });
        if let Err(e) = group.refresh(DataSource::Device, INITIAL_REFRESH) {
            tracing::warn!(group = group.server_handle().0, error = %e, "initial refresh skipped");
        }
    }
    drop(tx);

    let stop = wait_until(stop_after.map(|d| Instant::now() + d));
    tokio::pin!(stop);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some((index, change)) = received else {
                    break;
                };
                if let Some(labels) = labels.get(index) {
                    for line in format_change(labels, &change) {
                        writeln!(out, "{line}")?;
                    }
                    out.flush()?;
                }
            }
            () = &mut stop => break,
            _ = &mut ctrl_c => {
                tracing::info!("interrupted, stopping watch");
                break;
            }
        }
    }
    for group in groups {
        if let Err(e) = group.unadvise() {
            tracing::debug!(error = %e, "unadvise on exit");
        }
    }
    Ok(())
}
