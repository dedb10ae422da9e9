//! Scenario: capability routing — a vehicle never sees orders whose type
//! it does not serve.
//!
//! An order with `order_type_code = 601` is dispatched while the only
//! running vehicle serves 701: its candidate cache stays empty and the
//! order stays pending.

use std::time::Duration;

use uvd_kv::Kv;
use uvd_schemas::{Order, UVehicle};
use uvd_testkit::Orchestrator;

#[tokio::test]
async fn non_matching_capability_never_receives_the_order() -> anyhow::Result<()> {
    let orch = Orchestrator::new("s2");

    orch.store.seed_vehicle(UVehicle {
        id: Some(40),
        uv_code: Some("UV-TEST-40".into()),
        status: Some(0),
        supported_types: Some("701".into()),
        version: Some(1),
        is_delete: Some(0),
        ..UVehicle::default()
    });
    orch.store.seed_order(Order {
        id: Some(1002),
        order_no: Some("ORD-S2-1002".into()),
        status: Some(0),
        version: Some(1),
        order_type_code: Some(601),
        created_at: Some(chrono::Utc::now()),
        is_delete: Some(0),
        ..Order::default()
    });

    let client = orch.start_vehicle(40).await?;
    let published = orch.dispatcher.run_cycle().await?;
    assert_eq!(published, 1, "dispatch itself is non-blocking and publishes");

    // Give delivery every chance to happen, then assert it did not.
    tokio::time::sleep(Duration::from_millis(700)).await;

    let cached = orch.kv.hget_all("vehicle_orders:40").await?;
    assert!(cached.is_empty(), "filtered-out order reached the cache: {cached:?}");

    let row = orch.store.order(1002).unwrap();
    assert_eq!(row.status, Some(0), "order must remain pending");
    assert_eq!(row.uv_id, None);
    assert_eq!(client.stats().claims_won, 0);

    orch.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn comma_list_capability_matches_any_element() -> anyhow::Result<()> {
    let orch = Orchestrator::new("s2b");

    // A multi-type vehicle: the 701 order must reach it even though 701
    // is not the first element of the list.
    orch.store.seed_vehicle(UVehicle {
        id: Some(41),
        uv_code: Some("UV-TEST-41".into()),
        status: Some(0),
        supported_types: Some("101,301,701".into()),
        version: Some(1),
        is_delete: Some(0),
        ..UVehicle::default()
    });
    orch.store.seed_order(Order {
        id: Some(1005),
        order_no: Some("ORD-S2-1005".into()),
        status: Some(0),
        version: Some(1),
        order_type_code: Some(701),
        created_at: Some(chrono::Utc::now()),
        is_delete: Some(0),
        ..Order::default()
    });

    orch.start_vehicle(41).await?;
    orch.dispatcher.run_cycle().await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if orch.store.order(1005).unwrap().status == Some(1) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "multi-type vehicle never claimed the matching order"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    orch.shutdown().await;
    Ok(())
}
