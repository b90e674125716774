use super::*;
use crate::device::{MockDevice, SimulatedDevice};
use crate::namespace::{StaticAddressSpace, TagDef};
use crate::opc_da::callback::{Completion, DataChange, GroupSubscription};
use crate::opc_da::errors::ItemError;
use crate::opc_da::quality::Quality;
use crate::opc_da::typedefs::{
    AccessRights, CancelId, DataSource, GroupStateUpdate, ItemDef, ItemHandle,
};
use crate::opc_da::value::VarType;
use std::collections::HashSet;
use tokio::time::timeout;

const PUMP: &str = "Plant.Pump1.Running";
const LEVEL: &str = "Plant.Tank1.Level";
const SETPOINT: &str = "Plant.Tank1.Setpoint";
const RESET: &str = "Plant.Alarm.Reset";
const STATUS: &str = "Plant.Status.Text";

fn plant_tags() -> Vec<TagDef> {
    vec![
        TagDef::new(PUMP, VarType::Bool, AccessRights::ReadWrite),
        TagDef::new(LEVEL, VarType::R8, AccessRights::ReadWrite).with_eu_range(0.0, 200.0),
        TagDef::new(SETPOINT, VarType::I2, AccessRights::ReadWrite),
        TagDef::new(RESET, VarType::Bool, AccessRights::Write),
        TagDef::new(STATUS, VarType::Str, AccessRights::Read).with_access_path("Line1"),
    ]
}

fn plant_space() -> Arc<StaticAddressSpace> {
    Arc::new(StaticAddressSpace::new(plant_tags()).unwrap())
}

/// No device poller: the cache only changes when a test says so.
fn quiet_config() -> ServerConfig {
    ServerConfig {
        device_poll_ms: 0,
        ..ServerConfig::default()
    }
}

fn start(config: ServerConfig) -> (Server, Arc<SimulatedDevice>) {
    let device = Arc::new(SimulatedDevice::from_tags(&plant_tags()));
    let server = Server::new(config, plant_space(), device.clone()).unwrap();
    (server, device)
}

fn named(name: &str) -> GroupDef {
    GroupDef {
        name: Some(name.to_string()),
        ..GroupDef::default()
    }
}

/// Add items and return their server handles, failing the test on any error.
fn add(group: &Group, ids: &[&str]) -> Vec<ItemHandle> {
    let defs: Vec<ItemDef> = ids
        .iter()
        .zip(1u32..)
        .map(|(id, client)| ItemDef::new(*id, ItemHandle(client)))
        .collect();
    group
        .add_items(&defs)
        .unwrap()
        .into_iter()
        .map(|r| r.unwrap().server_handle)
        .collect()
}

/// Sleep `ms` of paused time, then take the data change waiting, if any.
async fn after(sub: &mut GroupSubscription, ms: u64) -> Option<DataChange> {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    sub.data_changes.try_recv().ok()
}

async fn next_completion(sub: &mut GroupSubscription) -> Completion {
    timeout(Duration::from_secs(1), sub.completions.recv())
        .await
        .expect("completion not delivered")
        .expect("completion channel closed")
}

#[tokio::test(start_paused = true)]
async fn test_single_change_delivered_on_next_scan() {
    let (server, _device) = start(quiet_config());
    server.update_value(PUMP, false).unwrap();

    let group = server
        .add_group(&GroupDef {
            client_handle: GroupHandle(77),
            ..named("Pumps")
        })
        .unwrap();
    assert_eq!(group.update_rate().unwrap(), 1000);
    let mut sub = group.advise().unwrap();
    add(&group, &[PUMP]);

    // The scan at 1000 ms finds nothing new.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(sub.data_changes.try_recv().is_err());

    server.update_value(PUMP, true).unwrap();
    assert!(after(&mut sub, 490).await.is_none());
    let change = after(&mut sub, 20)
        .await
        .expect("change delivered by the scan at 2000 ms");
    assert_eq!(change.transaction_id, 0);
    assert_eq!(change.group_client_handle, GroupHandle(77));
    assert_eq!(change.master_quality, Quality::GOOD);
    assert_eq!(change.items.len(), 1);
    assert_eq!(change.items[0].client_handle, ItemHandle(1));
    assert_eq!(change.items[0].value, Variant::Bool(true));
    assert_eq!(change.items[0].quality, Quality::GOOD);

    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert!(sub.data_changes.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_changes_of_one_scan_are_batched() {
    let (server, _device) = start(quiet_config());
    server.update_value(PUMP, false).unwrap();
    server.update_value(SETPOINT, 1).unwrap();
    let group = server.add_group(&named("Batch")).unwrap();
    let mut sub = group.advise().unwrap();
    add(&group, &[PUMP, SETPOINT]);

    server.update_value(PUMP, true).unwrap();
    server.update_value(SETPOINT, 2).unwrap();
    let change = timeout(Duration::from_millis(1100), sub.data_changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.items.len(), 2);
    assert_eq!(change.items[1].value, Variant::I2(2));
}

#[tokio::test(start_paused = true)]
async fn test_first_sample_reported_as_quality_change() {
    let (server, _device) = start(quiet_config());
    let group = server.add_group(&named("Fresh")).unwrap();
    let mut sub = group.advise().unwrap();
    add(&group, &[LEVEL]);

    server.update_value(LEVEL, 12.0).unwrap();
    let change = timeout(Duration::from_millis(1100), sub.data_changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.items[0].value, Variant::R8(12.0));
}

#[tokio::test(start_paused = true)]
async fn test_deadband_filters_small_analog_moves() {
    let (server, _device) = start(quiet_config());
    server.update_value(LEVEL, 50.0).unwrap();
    let group = server
        .add_group(&GroupDef {
            percent_deadband: 10.0,
            ..named("Tanks")
        })
        .unwrap();
    let mut sub = group.advise().unwrap();
    add(&group, &[LEVEL]);

    // 10 units of a 200 span is 5%.
    server.update_value(LEVEL, 60.0).unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(sub.data_changes.try_recv().is_err());

    // Measured from the last reported 50.0, not from 60.0.
    server.update_value(LEVEL, 75.0).unwrap();
    let change = timeout(Duration::from_millis(1000), sub.data_changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.items[0].value, Variant::R8(75.0));
}

#[tokio::test(start_paused = true)]
async fn test_inactive_group_reports_nothing() {
    let (server, _device) = start(quiet_config());
    server.update_value(PUMP, false).unwrap();
    let group = server
        .add_group(&GroupDef {
            active: false,
            ..named("Idle")
        })
        .unwrap();
    let mut sub = group.advise().unwrap();
    add(&group, &[PUMP]);

    server.update_value(PUMP, true).unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(sub.data_changes.try_recv().is_err());

    group
        .set_state(&GroupStateUpdate {
            active: Some(true),
            ..GroupStateUpdate::default()
        })
        .unwrap();
    let change = timeout(Duration::from_millis(1100), sub.data_changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.items[0].value, Variant::Bool(true));
}

#[tokio::test]
async fn test_remove_group_with_active_items() {
    let (server, _device) = start(quiet_config());
    let group = server.add_group(&named("Pumps")).unwrap();
    add(&group, &[PUMP]);
    let handle = group.server_handle();

    assert!(matches!(
        server.remove_group(handle, false),
        Err(OpcError::AccessDenied(_))
    ));
    assert_eq!(server.status().group_count, 1);

    server.remove_group(handle, true).unwrap();
    assert!(group.is_removed());
    assert_eq!(server.status().group_count, 0);
    assert!(matches!(
        group.add_items(&[ItemDef::new(LEVEL, ItemHandle(2))]),
        Err(OpcError::InvalidHandle(_))
    ));
    assert!(matches!(group.state(), Err(OpcError::InvalidHandle(_))));
    assert!(matches!(group.advise(), Err(OpcError::InvalidHandle(_))));
    assert!(matches!(server.group(handle), Err(OpcError::InvalidHandle(_))));
    assert!(matches!(
        server.remove_group(handle, true),
        Err(OpcError::InvalidHandle(_))
    ));
    // The name is free again.
    assert!(server.add_group(&named("Pumps")).is_ok());
}

#[tokio::test]
async fn test_remove_group_with_only_inactive_items() {
    let (server, _device) = start(quiet_config());
    let group = server.add_group(&named("Quiet")).unwrap();
    let handles = add(&group, &[PUMP, LEVEL]);
    group.set_active_state(&handles, false).unwrap();
    server.remove_group(group.server_handle(), false).unwrap();
    assert!(server.cache().is_empty());
}

#[tokio::test]
async fn test_add_items_mixed_results_stay_aligned() {
    let (server, _device) = start(quiet_config());
    let group = server.add_group(&named("Mixed")).unwrap();
    let defs = vec![
        ItemDef::new(PUMP, ItemHandle(1)),
        ItemDef::new("Plant.Pump9.Running", ItemHandle(2)),
        ItemDef::new("  ", ItemHandle(3)),
        ItemDef {
            access_path: Some("Line9".into()),
            ..ItemDef::new(STATUS, ItemHandle(4))
        },
        ItemDef::new(RESET, ItemHandle(5)),
        ItemDef {
            requested_type: Some(VarType::Array(Box::new(VarType::I4))),
            ..ItemDef::new(PUMP, ItemHandle(6))
        },
        ItemDef::new(LEVEL, ItemHandle(1)),
        ItemDef {
            access_path: Some("Line1".into()),
            ..ItemDef::new(STATUS, ItemHandle(8))
        },
        ItemDef {
            active: false,
            ..ItemDef::new(RESET, ItemHandle(9))
        },
    ];
    let results = group.add_items(&defs).unwrap();
    assert_eq!(results.len(), defs.len());

    let errors: Vec<Option<ItemError>> = results.iter().map(|r| r.as_ref().err().copied()).collect();
    assert_eq!(
        errors,
        vec![
            None,
            Some(ItemError::UnknownItemId),
            Some(ItemError::InvalidItemId),
            Some(ItemError::UnknownPath),
            Some(ItemError::AccessDenied),
            Some(ItemError::BadType),
            Some(ItemError::InvalidHandle),
            None,
            None,
        ]
    );

    let pump = results[0].as_ref().unwrap();
    assert_eq!(pump.canonical_type, VarType::Bool);
    assert_eq!(pump.access_rights, AccessRights::ReadWrite);

    let handles: HashSet<ItemHandle> = results
        .iter()
        .filter_map(|r| r.as_ref().ok().map(|ok| ok.server_handle))
        .collect();
    assert_eq!(handles.len(), 3);
    assert!(!handles.contains(&ItemHandle(0)));
    assert_eq!(group.items().unwrap().len(), 3);

    // Validation never creates anything.
    let checked = group.validate_items(&defs).unwrap();
    assert_eq!(checked.len(), defs.len());
    assert_eq!(group.items().unwrap().len(), 3);
    assert!(matches!(group.add_items(&[]), Err(OpcError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_group_item_limit() {
    let (server, _device) = start(ServerConfig {
        max_items_per_group: 2,
        ..quiet_config()
    });
    let group = server.add_group(&named("Small")).unwrap();
    let results = group
        .add_items(&[
            ItemDef::new(PUMP, ItemHandle(1)),
            ItemDef::new(LEVEL, ItemHandle(2)),
            ItemDef::new(SETPOINT, ItemHandle(3)),
        ])
        .unwrap();
    assert!(results[1].is_ok());
    assert_eq!(results[2], Err(ItemError::Busy));
}

#[tokio::test]
async fn test_set_active_state_is_idempotent() {
    let (server, _device) = start(quiet_config());
    let group = server.add_group(&named("Toggle")).unwrap();
    let handles = add(&group, &[PUMP, LEVEL]);

    for _ in 0..2 {
        let results = group.set_active_state(&handles, false).unwrap();
        assert_eq!(results, vec![Ok(()), Ok(())]);
        assert!(group.items().unwrap().iter().all(|item| !item.active));
    }
    let results = group
        .set_active_state(&[handles[0], ItemHandle(9999)], true)
        .unwrap();
    assert_eq!(results, vec![Ok(()), Err(ItemError::InvalidHandle)]);
    assert!(group.set_active_state(&[handles[0]], true).unwrap()[0].is_ok());
}

#[tokio::test]
async fn test_item_metadata_updates() {
    let (server, _device) = start(quiet_config());
    server.update_value(LEVEL, 41.6).unwrap();
    let group = server.add_group(&named("Meta")).unwrap();
    let handles = add(&group, &[LEVEL]);

    let results = group
        .set_data_types(&handles, &[Some(VarType::I4)])
        .unwrap();
    assert_eq!(results, vec![Ok(())]);
    let read = group.read(DataSource::Cache, &handles).await.unwrap();
    assert_eq!(read[0].as_ref().unwrap().value, Variant::I4(42));
    assert_eq!(
        group.set_data_types(&handles, &[Some(VarType::Date)]).unwrap(),
        vec![Err(ItemError::BadType)]
    );

    group.set_client_handles(&handles, &[ItemHandle(500)]).unwrap();
    assert_eq!(group.items().unwrap()[0].client_handle, ItemHandle(500));
    assert!(matches!(
        group.set_client_handles(&handles, &[]),
        Err(OpcError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_serialize_restore_round_trip() {
    let (server, device) = start(quiet_config());
    let pumps = server
        .add_group(&GroupDef {
            client_handle: GroupHandle(10),
            ..named("Pumps")
        })
        .unwrap();
    add(&pumps, &[PUMP, SETPOINT]);
    let tanks = server
        .add_group(&GroupDef {
            active: false,
            percent_deadband: 5.0,
            update_rate: 2500,
            ..named("Tanks")
        })
        .unwrap();
    tanks
        .add_items(&[ItemDef {
            requested_type: Some(VarType::R4),
            active: false,
            ..ItemDef::new(LEVEL, ItemHandle(3))
        }])
        .unwrap();

    let blob = server.serialize().unwrap();
    let restored = Server::restore(quiet_config(), plant_space(), device, &blob).unwrap();

    let before = server.groups().unwrap();
    let after = restored.groups().unwrap();
    assert_eq!(before.len(), after.len());
    let mut old_items = HashSet::new();
    for (old, new) in before.iter().zip(&after) {
        assert_eq!(old.state().unwrap(), new.state().unwrap());
        assert_eq!(old.items().unwrap(), new.items().unwrap());
        old_items.extend(old.items().unwrap().into_iter().map(|i| i.server_handle));
    }

    let extra = restored.add_group(&named("Extra")).unwrap();
    assert!(before.iter().all(|g| g.server_handle() != extra.server_handle()));
    let new_item = add(&extra, &[PUMP])[0];
    assert!(!old_items.contains(&new_item));
}

#[tokio::test]
async fn test_restore_rejects_unknown_items() {
    let (server, device) = start(quiet_config());
    let group = server.add_group(&named("Pumps")).unwrap();
    add(&group, &[PUMP]);
    let blob = server.serialize().unwrap();

    let smaller = Arc::new(
        StaticAddressSpace::new([TagDef::new(LEVEL, VarType::R8, AccessRights::Read)]).unwrap(),
    );
    assert!(matches!(
        Server::restore(quiet_config(), smaller, device.clone(), &blob),
        Err(OpcError::InvalidArgument(_))
    ));
    assert!(matches!(
        Server::restore(quiet_config(), plant_space(), device, b"not json"),
        Err(OpcError::Serialization { .. })
    ));
}

#[tokio::test]
async fn test_refresh_bypasses_deadband() {
    let (server, _device) = start(quiet_config());
    server.update_value(LEVEL, 10.0).unwrap();
    let group = server
        .add_group(&GroupDef {
            percent_deadband: 50.0,
            ..named("Tanks")
        })
        .unwrap();
    add(&group, &[LEVEL]);

    assert!(matches!(
        group.refresh(DataSource::Cache, 42),
        Err(OpcError::InvalidState(_))
    ));
    let mut sub = group.advise().unwrap();
    server.update_value(LEVEL, 11.0).unwrap();

    assert!(matches!(
        group.refresh(DataSource::Cache, 0),
        Err(OpcError::InvalidArgument(_))
    ));
    let cancel_id = group.refresh(DataSource::Cache, 42).unwrap();
    assert_ne!(cancel_id, CancelId(0));

    let change = timeout(Duration::from_secs(1), sub.data_changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(change.is_refresh());
    assert_eq!(change.transaction_id, 42);
    assert_eq!(change.items[0].value, Variant::R8(11.0));

    group
        .set_state(&GroupStateUpdate {
            active: Some(false),
            ..GroupStateUpdate::default()
        })
        .unwrap();
    assert!(matches!(
        group.refresh(DataSource::Cache, 43),
        Err(OpcError::InvalidState(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_refresh_baseline_is_the_delivered_sample() {
    let (server, _device) = start(ServerConfig {
        callback_queue_depth: 1,
        ..quiet_config()
    });
    server.update_value(LEVEL, 10.0).unwrap();
    let group = server.add_group(&named("Tanks")).unwrap();
    let mut sub = group.advise().unwrap();
    add(&group, &[LEVEL]);

    // The scan at 1000 ms fills the queue, so the refresh waits to be delivered.
    server.update_value(LEVEL, 20.0).unwrap();
    tokio::time::sleep(Duration::from_millis(1010)).await;
    group.refresh(DataSource::Cache, 9).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    server.update_value(LEVEL, 30.0).unwrap();

    let periodic = sub.data_changes.try_recv().unwrap();
    assert_eq!(periodic.items[0].value, Variant::R8(20.0));
    let refresh = timeout(Duration::from_millis(100), sub.data_changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refresh.transaction_id, 9);
    assert_eq!(refresh.items[0].value, Variant::R8(20.0));

    // 30.0 was never delivered, so the next scan still reports it.
    let change = timeout(Duration::from_millis(1000), sub.data_changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.transaction_id, 0);
    assert_eq!(change.items[0].value, Variant::R8(30.0));
}

#[tokio::test(start_paused = true)]
async fn test_refresh_skipped_when_group_goes_inactive() {
    let (server, _device) = start(quiet_config());
    server.update_value(LEVEL, 10.0).unwrap();
    let group = server.add_group(&named("Tanks")).unwrap();
    add(&group, &[LEVEL]);
    let mut sub = group.advise().unwrap();

    // Accepted while active, executed after the group went inactive.
    group.refresh(DataSource::Cache, 7).unwrap();
    group
        .set_state(&GroupStateUpdate {
            active: Some(false),
            ..GroupStateUpdate::default()
        })
        .unwrap();

    assert!(after(&mut sub, 100).await.is_none());
    assert_eq!(server.ctx.transactions.len(), 0);
}

#[tokio::test]
async fn test_async_write_then_read() {
    let (server, device) = start(quiet_config());
    let group = server
        .add_group(&GroupDef {
            client_handle: GroupHandle(5),
            ..named("Io")
        })
        .unwrap();
    let handles = add(&group, &[SETPOINT, PUMP]);

    assert!(matches!(
        group.async_read(&handles, 1),
        Err(OpcError::InvalidState(_))
    ));
    let mut sub = group.advise().unwrap();

    let request = group
        .async_write(&handles, &[Variant::from("12"), Variant::from("maybe")], 5)
        .unwrap();
    assert_ne!(request.cancel_id, CancelId(0));
    assert_eq!(request.errors, vec![Ok(()), Err(ItemError::BadType)]);

    match next_completion(&mut sub).await {
        Completion::Write(done) => {
            assert_eq!(done.transaction_id, 5);
            assert_eq!(done.cancel_id, request.cancel_id);
            assert_eq!(done.group_client_handle, GroupHandle(5));
            assert_eq!(done.results, vec![(ItemHandle(1), Ok(()))]);
        }
        other => panic!("expected write completion, got {other:?}"),
    }
    assert_eq!(device.value(SETPOINT).unwrap().value, Variant::I2(12));
    assert_eq!(server.cache().get(SETPOINT).unwrap().value, Variant::I2(12));

    let request = group.async_read(&[handles[0]], 6).unwrap();
    match next_completion(&mut sub).await {
        Completion::Read(done) => {
            assert_eq!(done.transaction_id, 6);
            assert_eq!(done.cancel_id, request.cancel_id);
            assert_eq!(done.items[0].client_handle, ItemHandle(1));
            assert_eq!(done.items[0].value, Variant::I2(12));
        }
        other => panic!("expected read completion, got {other:?}"),
    }
}

#[tokio::test]
async fn test_force_remove_fails_pending_items() {
    let (server, device) = start(quiet_config());
    let group = server.add_group(&named("Io")).unwrap();
    let handles = add(&group, &[LEVEL, PUMP, SETPOINT]);
    let mut sub = group.advise().unwrap();

    // The worker has not run yet, so both items are still pending.
    let read = group.async_read(&handles[..2], 11).unwrap();
    assert_eq!(
        group.remove_items(&[handles[0]], true).unwrap(),
        vec![Ok(())]
    );
    assert_eq!(group.items().unwrap().len(), 2);

    match next_completion(&mut sub).await {
        Completion::Read(done) => {
            assert_eq!(done.cancel_id, read.cancel_id);
            assert_eq!(done.items.len(), 2);
            assert_eq!(done.items[0].client_handle, ItemHandle(1));
            assert_eq!(done.items[0].error, Some(ItemError::InvalidHandle));
            assert_eq!(done.items[1].client_handle, ItemHandle(2));
            assert_eq!(done.items[1].error, None);
        }
        other => panic!("expected read completion, got {other:?}"),
    }

    let write = group
        .async_write(&handles[1..], &[Variant::from(true), Variant::from(5)], 12)
        .unwrap();
    assert_eq!(write.errors, vec![Ok(()), Ok(())]);
    assert_eq!(
        group.remove_items(&[handles[2]], true).unwrap(),
        vec![Ok(())]
    );

    match next_completion(&mut sub).await {
        Completion::Write(done) => {
            assert_eq!(done.cancel_id, write.cancel_id);
            assert_eq!(
                done.results,
                vec![
                    (ItemHandle(2), Ok(())),
                    (ItemHandle(3), Err(ItemError::InvalidHandle)),
                ]
            );
        }
        other => panic!("expected write completion, got {other:?}"),
    }
    assert_eq!(device.value(PUMP).unwrap().value, Variant::Bool(true));
    assert_eq!(device.value(SETPOINT).unwrap().value, Variant::I2(0));

    // Nothing is left pending on the surviving item.
    assert_eq!(
        group.remove_items(&[handles[1]], false).unwrap(),
        vec![Ok(())]
    );
}

#[tokio::test]
async fn test_async_request_with_no_valid_items() {
    let (server, _device) = start(quiet_config());
    let group = server.add_group(&named("Io")).unwrap();
    let _sub = group.advise().unwrap();
    let request = group.async_read(&[ItemHandle(4242)], 1).unwrap();
    assert_eq!(request.cancel_id, CancelId(0));
    assert_eq!(request.errors, vec![Err(ItemError::InvalidHandle)]);
}

#[tokio::test]
async fn test_cancel_before_execution_skips_device() {
    let mut device = MockDevice::new();
    device.expect_read().times(0);
    let server = Server::new(quiet_config(), plant_space(), Arc::new(device)).unwrap();
    let group = server.add_group(&named("Io")).unwrap();
    let handles = add(&group, &[LEVEL]);
    let mut sub = group.advise().unwrap();

    let request = group.async_read(&handles, 9).unwrap();
    group.cancel(request.cancel_id).unwrap();

    match next_completion(&mut sub).await {
        Completion::Cancel(done) => {
            assert_eq!(done.cancel_id, request.cancel_id);
            assert_eq!(done.transaction_id, 9);
        }
        other => panic!("expected cancel completion, got {other:?}"),
    }
    // Unknown and already completed IDs are accepted.
    group.cancel(request.cancel_id).unwrap();
    group.cancel(CancelId(31337)).unwrap();
}

#[tokio::test]
async fn test_io_queue_full_is_busy() {
    let (server, _device) = start(ServerConfig {
        io_queue_depth: 1,
        ..quiet_config()
    });
    let group = server.add_group(&named("Io")).unwrap();
    let handles = add(&group, &[LEVEL]);
    let mut sub = group.advise().unwrap();

    // The worker has not run yet, so the first request still occupies the queue.
    let first = group.async_read(&handles, 1).unwrap();
    assert_eq!(server.status().band_width, 100);
    assert!(matches!(
        group.async_read(&handles, 2),
        Err(OpcError::Busy(_))
    ));

    assert_eq!(
        group.remove_items(&handles, false).unwrap(),
        vec![Err(ItemError::AccessDenied)]
    );

    match next_completion(&mut sub).await {
        Completion::Read(done) => assert_eq!(done.cancel_id, first.cancel_id),
        other => panic!("expected read completion, got {other:?}"),
    }
    assert_eq!(group.remove_items(&handles, false).unwrap(), vec![Ok(())]);
}

#[tokio::test(start_paused = true)]
async fn test_poller_fault_reported_by_next_scan() {
    let (server, device) = start(ServerConfig {
        device_poll_ms: 100,
        ..ServerConfig::default()
    });
    device.set_value(PUMP, false);
    device.set_value(LEVEL, 12.5);
    let group = server.add_group(&named("Plant")).unwrap();
    let mut sub = group.advise().unwrap();
    add(&group, &[PUMP, LEVEL]);

    let first = after(&mut sub, 1010)
        .await
        .expect("initial samples delivered by the scan at 1000 ms");
    assert_eq!(first.master_quality, Quality::GOOD);
    assert_eq!(first.items.len(), 2);

    assert!(device.set_fault(LEVEL, true));
    device.set_value(PUMP, true);
    assert!(after(&mut sub, 980).await.is_none());
    let change = after(&mut sub, 20)
        .await
        .expect("fault delivered by the scan at 2000 ms");
    assert_eq!(change.transaction_id, 0);
    assert_eq!(change.master_quality, Quality::BAD);
    assert_eq!(change.items.len(), 2);

    let pump = &change.items[0];
    assert_eq!(pump.client_handle, ItemHandle(1));
    assert_eq!(pump.quality, Quality::GOOD);
    assert_eq!(pump.value, Variant::Bool(true));

    let level = &change.items[1];
    assert_eq!(level.client_handle, ItemHandle(2));
    assert_eq!(level.quality, Quality::BAD_COMM_FAILURE);
    assert_eq!(level.value, Variant::R8(12.5));
    assert_eq!(level.error, None);
}

#[tokio::test(start_paused = true)]
async fn test_full_callback_queue_defers_to_next_scan() {
    let (server, _device) = start(ServerConfig {
        callback_queue_depth: 1,
        ..quiet_config()
    });
    server.update_value(PUMP, false).unwrap();
    let group = server.add_group(&named("Slow")).unwrap();
    let mut sub = group.advise().unwrap();
    add(&group, &[PUMP]);

    // The scan at 1000 ms fills the queue, the one at 2000 ms finds it full.
    server.update_value(PUMP, true).unwrap();
    tokio::time::sleep(Duration::from_millis(1010)).await;
    server.update_value(PUMP, false).unwrap();
    tokio::time::sleep(Duration::from_millis(1000)).await;

    let queued = sub.data_changes.try_recv().unwrap();
    assert_eq!(queued.items[0].value, Variant::Bool(true));
    assert!(sub.data_changes.try_recv().is_err());

    assert!(after(&mut sub, 980).await.is_none());
    let deferred = after(&mut sub, 20)
        .await
        .expect("deferred change delivered by the scan at 3000 ms");
    assert_eq!(deferred.items.len(), 1);
    assert_eq!(deferred.items[0].value, Variant::Bool(false));
}

#[tokio::test]
async fn test_device_comm_failure_marks_quality() {
    let (server, device) = start(quiet_config());
    server.update_value(LEVEL, 12.5).unwrap();
    let group = server.add_group(&named("Faults")).unwrap();
    let handles = add(&group, &[LEVEL]);

    assert!(device.set_fault(LEVEL, true));
    let read = group.read(DataSource::Device, &handles).await.unwrap();
    let sample = read[0].as_ref().unwrap();
    assert_eq!(sample.quality, Quality::BAD_COMM_FAILURE);
    assert_eq!(sample.value, Variant::R8(12.5));
    assert_eq!(
        server.cache().get(LEVEL).unwrap().quality,
        Quality::BAD_COMM_FAILURE
    );

    device.set_fault(LEVEL, false);
    let read = group.read(DataSource::Device, &handles).await.unwrap();
    assert_eq!(read[0].as_ref().unwrap().quality, Quality::GOOD);
}

#[tokio::test]
async fn test_device_item_error_is_returned() {
    let mut device = MockDevice::new();
    device
        .expect_read()
        .returning(|ids| ids.iter().map(|_| Err(ItemError::UnknownItemId)).collect());
    let server = Server::new(quiet_config(), plant_space(), Arc::new(device)).unwrap();
    let group = server.add_group(&named("Faults")).unwrap();
    let handles = add(&group, &[LEVEL]);

    let read = group.read(DataSource::Device, &handles).await.unwrap();
    assert_eq!(read, vec![Err(ItemError::UnknownItemId)]);
    assert_eq!(
        server.cache().get(LEVEL).unwrap().quality,
        Quality::BAD_CONFIG_ERROR
    );
}

#[tokio::test]
async fn test_cache_read_of_inactive_item_is_out_of_service() {
    let (server, _device) = start(quiet_config());
    server.update_value(PUMP, true).unwrap();
    let group = server.add_group(&named("Cache")).unwrap();
    let handles = add(&group, &[PUMP]);

    let read = group.read(DataSource::Cache, &handles).await.unwrap();
    let live = read[0].as_ref().unwrap().clone();
    assert_eq!(live.quality, Quality::GOOD);

    group.set_active_state(&handles, false).unwrap();
    let read = group.read(DataSource::Cache, &handles).await.unwrap();
    let idle = read[0].as_ref().unwrap();
    assert_eq!(idle.quality, Quality::BAD_OUT_OF_SERVICE);
    assert_eq!(idle.value, Variant::Bool(true));
    assert_eq!(idle.timestamp, live.timestamp);
}

#[tokio::test]
async fn test_sync_write_reports_per_item_errors() {
    let (server, device) = start(quiet_config());
    let group = server.add_group(&named("Writes")).unwrap();
    let defs = [
        ItemDef::new(SETPOINT, ItemHandle(1)),
        ItemDef::new(STATUS, ItemHandle(2)),
        ItemDef {
            active: false,
            ..ItemDef::new(RESET, ItemHandle(3))
        },
    ];
    let handles: Vec<ItemHandle> = group
        .add_items(&defs)
        .unwrap()
        .into_iter()
        .map(|r| r.unwrap().server_handle)
        .collect();

    let results = group
        .write(
            &[handles[0], handles[1], handles[2], ItemHandle(777)],
            &[
                Variant::I4(70_000),
                Variant::from("text"),
                Variant::from(true),
                Variant::from(1),
            ],
        )
        .await
        .unwrap();
    assert_eq!(
        results,
        vec![
            Err(ItemError::RangeError),
            Err(ItemError::AccessDenied),
            Ok(()),
            Err(ItemError::InvalidHandle),
        ]
    );
    assert_eq!(device.value(SETPOINT).unwrap().value, Variant::I2(0));
    assert_eq!(device.value(RESET).unwrap().value, Variant::Bool(true));

    assert!(matches!(
        group.write(&handles, &[Variant::from(1)]).await,
        Err(OpcError::InvalidArgument(_))
    ));
    assert!(matches!(
        group.read(DataSource::Cache, &[]).await,
        Err(OpcError::InvalidArgument(_))
    ));
    assert_eq!(
        group.read(DataSource::Cache, &[handles[2]]).await.unwrap(),
        vec![Err(ItemError::AccessDenied)]
    );
}

#[tokio::test]
async fn test_update_rate_revision() {
    let (server, _device) = start(quiet_config());
    let fastest = server
        .add_group(&GroupDef {
            update_rate: 0,
            ..named("Fast")
        })
        .unwrap();
    assert_eq!(fastest.update_rate().unwrap(), 100);

    let odd = server
        .add_group(&GroupDef {
            update_rate: 1050,
            ..named("Odd")
        })
        .unwrap();
    assert_eq!(odd.update_rate().unwrap(), 1100);

    let revised = odd
        .set_state(&GroupStateUpdate {
            update_rate: Some(250),
            ..GroupStateUpdate::default()
        })
        .unwrap();
    assert_eq!(revised, 300);
    let state = odd.state().unwrap();
    assert_eq!(state.requested_update_rate, 250);
    assert_eq!(state.update_rate, 300);
}

#[tokio::test(start_paused = true)]
async fn test_scans_follow_revised_rate() {
    let (server, _device) = start(quiet_config());
    server.update_value(PUMP, false).unwrap();
    let group = server
        .add_group(&GroupDef {
            update_rate: 1050,
            ..named("Odd")
        })
        .unwrap();
    let mut sub = group.advise().unwrap();
    add(&group, &[PUMP]);

    // Scans at 1100 and 2200 ms.
    server.update_value(PUMP, true).unwrap();
    assert!(after(&mut sub, 1090).await.is_none());
    assert!(after(&mut sub, 20).await.is_some());
    server.update_value(PUMP, false).unwrap();
    assert!(after(&mut sub, 1080).await.is_none());
    assert!(after(&mut sub, 20).await.is_some());

    // 250 is revised to 300 and the period restarts at 2210 ms.
    group
        .set_state(&GroupStateUpdate {
            update_rate: Some(250),
            ..GroupStateUpdate::default()
        })
        .unwrap();
    server.update_value(PUMP, true).unwrap();
    assert!(after(&mut sub, 290).await.is_none());
    assert!(after(&mut sub, 20).await.is_some());
    server.update_value(PUMP, false).unwrap();
    assert!(after(&mut sub, 280).await.is_none());
    assert!(after(&mut sub, 20).await.is_some());
}

#[tokio::test]
async fn test_set_state_validation_changes_nothing() {
    let (server, _device) = start(quiet_config());
    let group = server.add_group(&named("Strict")).unwrap();
    let before = group.state().unwrap();
    assert!(matches!(
        group.set_state(&GroupStateUpdate {
            active: Some(false),
            percent_deadband: Some(150.0),
            ..GroupStateUpdate::default()
        }),
        Err(OpcError::InvalidArgument(_))
    ));
    assert!(matches!(
        group.set_state(&GroupStateUpdate {
            locale_id: Some(0x0407),
            ..GroupStateUpdate::default()
        }),
        Err(OpcError::InvalidArgument(_))
    ));
    assert_eq!(group.state().unwrap(), before);
}

#[tokio::test]
async fn test_clone_group_is_inactive_copy() {
    let (server, _device) = start(quiet_config());
    let source = server
        .add_group(&GroupDef {
            percent_deadband: 2.5,
            ..named("Source")
        })
        .unwrap();
    add(&source, &[PUMP, LEVEL]);

    let clone = source.clone_group(None).unwrap();
    let state = clone.state().unwrap();
    assert!(!state.active);
    assert_ne!(clone.server_handle(), source.server_handle());
    assert_eq!(state.name, format!("Group{}", clone.server_handle().0));
    assert!((state.percent_deadband - 2.5).abs() < f32::EPSILON);

    let original = source.items().unwrap();
    let copied = clone.items().unwrap();
    assert_eq!(copied.len(), original.len());
    for (a, b) in original.iter().zip(&copied) {
        assert_eq!(a.item_id, b.item_id);
        assert_eq!(a.client_handle, b.client_handle);
        assert_ne!(a.server_handle, b.server_handle);
    }

    assert!(matches!(
        source.clone_group(Some("Source")),
        Err(OpcError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn test_group_names() {
    let (server, _device) = start(quiet_config());
    let a = server.add_group(&named("A")).unwrap();
    let b = server.add_group(&named("B")).unwrap();
    assert!(matches!(
        server.add_group(&named("A")),
        Err(OpcError::AlreadyExists(_))
    ));
    assert!(matches!(b.set_name("A"), Err(OpcError::AlreadyExists(_))));

    a.set_name("Renamed").unwrap();
    assert_eq!(server.group_by_name("Renamed").unwrap().server_handle(), a.server_handle());
    assert!(matches!(
        server.group_by_name("A"),
        Err(OpcError::InvalidArgument(_))
    ));

    let unnamed = server.add_group(&GroupDef::default()).unwrap();
    assert_eq!(
        unnamed.state().unwrap().name,
        format!("Group{}", unnamed.server_handle().0)
    );
}

#[tokio::test]
async fn test_group_limits_and_arguments() {
    let (server, _device) = start(ServerConfig {
        max_groups: 1,
        ..quiet_config()
    });
    assert!(matches!(
        server.add_group(&GroupDef {
            percent_deadband: -1.0,
            ..GroupDef::default()
        }),
        Err(OpcError::InvalidArgument(_))
    ));
    assert!(matches!(
        server.add_group(&GroupDef {
            locale_id: 0x0407,
            ..GroupDef::default()
        }),
        Err(OpcError::InvalidArgument(_))
    ));
    server.add_group(&GroupDef::default()).unwrap();
    assert!(matches!(
        server.add_group(&GroupDef::default()),
        Err(OpcError::Busy(_))
    ));
}

#[tokio::test]
async fn test_advise_lifecycle() {
    let (server, _device) = start(quiet_config());
    let group = server.add_group(&named("Sub")).unwrap();
    assert!(matches!(group.unadvise(), Err(OpcError::InvalidState(_))));

    let sub = group.advise().unwrap();
    assert!(matches!(group.advise(), Err(OpcError::AlreadyExists(_))));
    group.unadvise().unwrap();
    drop(sub);

    // A subscriber that dropped both receivers can be replaced.
    let sub = group.advise().unwrap();
    drop(sub);
    assert!(group.advise().is_ok());
}

#[tokio::test]
async fn test_handle_space_exhaustion_is_busy() {
    let (server, _device) = start(quiet_config());
    server.ctx.next_group_handle.store(u32::MAX - 1, Ordering::Relaxed);
    server.ctx.next_item_handle.store(u32::MAX - 1, Ordering::Relaxed);

    let group = server.add_group(&named("Last")).unwrap();
    assert_eq!(group.server_handle(), GroupHandle(u32::MAX - 1));
    assert!(matches!(
        server.add_group(&named("Over")),
        Err(OpcError::Busy(_))
    ));

    let results = group
        .add_items(&[
            ItemDef::new(PUMP, ItemHandle(1)),
            ItemDef::new(LEVEL, ItemHandle(2)),
        ])
        .unwrap();
    assert_eq!(
        results[0].as_ref().unwrap().server_handle,
        ItemHandle(u32::MAX - 1)
    );
    assert_eq!(results[1], Err(ItemError::Busy));
    assert_eq!(group.items().unwrap().len(), 1);
}

#[tokio::test]
async fn test_update_value_requires_known_item() {
    let (server, _device) = start(quiet_config());
    assert!(matches!(
        server.update_value("Plant.Nowhere", 1),
        Err(OpcError::InvalidArgument(_))
    ));
    server.update_value(PUMP, true).unwrap();
    assert_eq!(server.cache().get(PUMP).unwrap().value, Variant::Bool(true));
}

#[tokio::test]
async fn test_status_and_shutdown() {
    let (server, _device) = start(quiet_config());
    server.add_group(&named("One")).unwrap();
    let status = server.status();
    assert_eq!(status.server_state, ServerState::Running);
    assert_eq!(status.group_count, 1);
    assert_eq!(status.major_version, 3);
    assert!(status.current_time >= status.start_time);

    server.shutdown();
    server.shutdown();
    let status = server.status();
    assert_eq!(status.server_state, ServerState::Suspended);
    assert_eq!(status.group_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_device_poller_feeds_cache() {
    let (server, device) = start(ServerConfig {
        device_poll_ms: 100,
        ..ServerConfig::default()
    });
    let group = server.add_group(&named("Polled")).unwrap();
    let handles = add(&group, &[SETPOINT]);

    device.set_value(SETPOINT, Variant::I2(7));
    tokio::time::sleep(Duration::from_millis(250)).await;
    let read = group.read(DataSource::Cache, &handles).await.unwrap();
    assert_eq!(read[0].as_ref().unwrap().value, Variant::I2(7));
}

#[test]
fn test_new_requires_runtime() {
    let device = Arc::new(SimulatedDevice::new());
    assert!(matches!(
        Server::new(quiet_config(), plant_space(), device),
        Err(OpcError::Internal(_))
    ));
}
