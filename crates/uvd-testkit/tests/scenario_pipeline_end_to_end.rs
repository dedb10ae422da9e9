//! Scenario: the whole pipeline green — producers insert, dispatch
//! sweeps, a mixed fleet claims, finalization closes every order.

use std::sync::Arc;
use std::time::Duration;

use uvd_db::DispatchStore;
use uvd_kv::Kv;
use uvd_producer::Producer;
use uvd_schemas::catalog::{codes_for_model, VehicleModel};
use uvd_schemas::UVehicle;
use uvd_testkit::Orchestrator;

fn fleet_vehicle(id: i64, model: VehicleModel) -> UVehicle {
    UVehicle {
        id: Some(id),
        uv_code: Some(format!("UV-FLEET-{id}")),
        model_type: Some(model.code()),
        status: Some(0),
        supported_types: Some(
            codes_for_model(model)
                .iter()
                .map(i64::to_string)
                .collect::<Vec<_>>()
                .join(","),
        ),
        version: Some(1),
        is_delete: Some(0),
        ..UVehicle::default()
    }
}

#[tokio::test]
async fn every_produced_order_is_claimed_and_closed() -> anyhow::Result<()> {
    let orch = Orchestrator::new("e2e");

    // One vehicle per hardware class covers the whole type catalog.
    orch.store.seed_vehicle(fleet_vehicle(1, VehicleModel::Ground));
    orch.store.seed_vehicle(fleet_vehicle(2, VehicleModel::Drone));
    orch.store.seed_vehicle(fleet_vehicle(3, VehicleModel::Robot));
    for id in [1, 2, 3] {
        orch.start_vehicle(id).await?;
    }

    let producer = Producer::new(
        Arc::clone(&orch.store) as Arc<dyn uvd_db::DispatchStore>,
        Arc::clone(&orch.kv) as Arc<dyn Kv>,
        None,
    );
    let order_ids = producer.create_orders(10).await?;
    assert_eq!(order_ids.len(), 10);

    // Sweep until everything is claimed and finalized.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(8);
    loop {
        orch.dispatcher.run_cycle().await?;

        let closed = order_ids.iter().all(|id| {
            orch.store.order(*id).map(|o| o.status) == Some(Some(1))
                && orch.store.grab_logs_for(*id).len() == 1
                && orch.store.delivery_tasks_for(*id).len() == 1
        });
        if closed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "pipeline did not close every order; states: {:?}",
            order_ids
                .iter()
                .map(|id| orch.store.order(*id).map(|o| (o.status, o.uv_id)))
                .collect::<Vec<_>>()
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Each claim is attributed to a vehicle of the right class.
    for id in &order_ids {
        let order = orch.store.order(*id).unwrap();
        let winner = order.uv_id.expect("closed order carries uv_id");
        let code = order.order_type_code.unwrap();
        let winner_row = orch
            .store
            .vehicle_by_id(winner)
            .await?
            .expect("winner exists");
        assert!(
            winner_row
                .supported_types
                .unwrap()
                .split(',')
                .any(|c| c == code.to_string()),
            "order {id} claimed by a vehicle that does not serve type {code}"
        );
    }

    orch.shutdown().await;
    Ok(())
}
