//! Scenario: finalization failure compensates and re-queues the order.
//!
//! The delivery-task insert is made to fail after a successful grab-log
//! insert. The claimed order must come back as `status = 0, version = 0,
//! uv_id = NULL`, with no surviving grab-log or delivery-task row, and
//! exactly one `order_retry` message carrying the order id.
//!
//! The claiming vehicle is kept off the retry channel (it serves a
//! different type code) so the test observes a single compensation cycle
//! rather than a retry loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use uvd_bus::{handler_fn, Message};
use uvd_db::DispatchStore;
use uvd_schemas::{FinalizePayload, Order, UVehicle};
use uvd_testkit::Orchestrator;

#[tokio::test]
async fn failed_delivery_insert_rolls_back_and_requeues() -> anyhow::Result<()> {
    let orch = Orchestrator::new("s3");

    orch.store.seed_vehicle(UVehicle {
        id: Some(50),
        uv_code: Some("UV-TEST-50".into()),
        status: Some(0),
        supported_types: Some("601".into()),
        version: Some(1),
        is_delete: Some(0),
        ..UVehicle::default()
    });
    orch.store.seed_order(Order {
        id: Some(1003),
        order_no: Some("ORD-S3-1003".into()),
        reward: Some(30.0),
        status: Some(0),
        version: Some(5),
        order_type_code: Some(101),
        created_at: Some(chrono::Utc::now()),
        is_delete: Some(0),
        ..Order::default()
    });

    // Collect order_retry traffic on E2.
    let retries: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&retries);
    let retry_sub = orch.router.subscriber(&orch.endpoints.e2);
    retry_sub.subscribe_headers(
        [
            ("type".to_string(), "101".to_string()),
            ("channel".to_string(), "retry_orders".to_string()),
        ]
        .into_iter()
        .collect(),
        handler_fn(move |delivery| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(delivery.body_str().into_owned());
            }
        }),
        Some("order_retry".to_string()),
    );

    let client = orch.start_vehicle(50).await?;
    orch.store.set_fail_delivery_insert(true);

    // The claim has happened (simulated winner = vehicle 50); publish the
    // finalization task that the winner would have emitted.
    orch.store
        .claim_order(1003, 50, 5, chrono::Utc::now())
        .await?;
    let payload = FinalizePayload {
        order_id: "1003".into(),
        uv_id: 50,
        response_time_ms: 12,
        order_type_code: 101,
        order_reward: 30.0,
    };
    orch.router
        .publisher(&orch.endpoints.e3)
        .publish(Message::direct("order_log_task", payload.encode()?.into_bytes()))?;

    // One compensation cycle.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while client.stats().compensated == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "compensation never ran"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    // Let the retry publish drain.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let row = orch.store.order(1003).unwrap();
    assert_eq!(row.status, Some(0), "order must return to pending");
    assert_eq!(row.version, Some(0), "rollback must poison the version");
    assert_eq!(row.uv_id, None);

    assert!(
        orch.store.grab_logs_for(1003).is_empty(),
        "orphan grab log survived compensation"
    );
    assert!(
        orch.store.delivery_tasks_for(1003).is_empty(),
        "delivery task must not exist"
    );

    let seen = retries.lock().unwrap().clone();
    assert_eq!(seen, vec!["1003".to_string()], "exactly one retry message");

    orch.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn grab_log_failure_also_compensates() -> anyhow::Result<()> {
    let orch = Orchestrator::new("s3b");

    orch.store.seed_vehicle(UVehicle {
        id: Some(51),
        uv_code: Some("UV-TEST-51".into()),
        status: Some(0),
        supported_types: Some("601".into()),
        version: Some(1),
        is_delete: Some(0),
        ..UVehicle::default()
    });
    orch.store.seed_order(Order {
        id: Some(1004),
        order_no: Some("ORD-S3-1004".into()),
        status: Some(0),
        version: Some(1),
        order_type_code: Some(101),
        created_at: Some(chrono::Utc::now()),
        is_delete: Some(0),
        ..Order::default()
    });

    let client = orch.start_vehicle(51).await?;
    orch.store.set_fail_grab_log_insert(true);

    orch.store
        .claim_order(1004, 51, 1, chrono::Utc::now())
        .await?;
    let payload = FinalizePayload {
        order_id: "1004".into(),
        uv_id: 51,
        response_time_ms: 5,
        order_type_code: 101,
        order_reward: 10.0,
    };
    orch.router
        .publisher(&orch.endpoints.e3)
        .publish(Message::direct("order_log_task", payload.encode()?.into_bytes()))?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while client.stats().compensated == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "compensation never ran"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let row = orch.store.order(1004).unwrap();
    assert_eq!((row.status, row.version, row.uv_id), (Some(0), Some(0), None));
    // The delivery task inserted after the failed grab log is cleaned up.
    assert!(orch.store.delivery_tasks_for(1004).is_empty());
    assert!(orch.store.grab_logs_for(1004).is_empty());

    orch.shutdown().await;
    Ok(())
}
