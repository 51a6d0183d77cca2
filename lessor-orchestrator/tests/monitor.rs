// job-monitor: invalidation, delayed deletion, timer control.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::{fast_settings, request, web, Fixture};
use lessor_common::{Instance, InstanceState, Network};
use lessor_orchestrator::monitor::TickReport;
use lessor_orchestrator::registry::InstanceKey;
use lessor_orchestrator::Settings;
use lessor_providers::inventory::{ActivityState, AllocationInfo};

const NET: Network = Network::Polygon;

async fn active_instance(fx: &Fixture) -> Instance {
    fx.state
        .controller
        .create_instance(request("tmp-1", NET, vec![web()]))
        .await
        .unwrap()
}

fn terminated_record(agreement_id: &str) -> Instance {
    let mut instance = Instance::creating(&request(agreement_id, NET, vec![]));
    instance.state = InstanceState::Terminated;
    instance
}

#[tokio::test]
async fn test_healthy_instance_stays_active() {
    let fx = Fixture::with_settings(fast_settings());
    let instance = active_instance(&fx).await;

    let report = fx.state.monitor.run_tick().await;
    assert_eq!(
        report,
        TickReport {
            checked: 1,
            ..Default::default()
        }
    );
    let record = fx.state.records.get_instance(&instance.agreement_id, NET).await.unwrap().unwrap();
    assert_eq!(record.state, InstanceState::Active);
}

#[tokio::test]
async fn test_expiring_allocation_tears_instance_down() {
    let fx = Fixture::with_settings(fast_settings());
    let instance = active_instance(&fx).await;
    fx.market(NET).set_allocation(AllocationInfo {
        id: "alloc-1".to_string(),
        timeout: Some(Utc::now() + chrono::Duration::seconds(30)),
        remaining_amount: 100.0,
    });

    let report = fx.state.monitor.run_tick().await;
    assert_eq!(report.invalidated, 1);

    let record = fx.state.records.get_instance(&instance.agreement_id, NET).await.unwrap().unwrap();
    assert_eq!(record.state, InstanceState::Terminated);
    let rental = fx.market(NET).rental(&instance.agreement_id).unwrap();
    assert_eq!(rental.stop_calls(), 1);
    assert!(fx.routes.routes().is_empty());
    assert!(
        fx.state
            .controller
            .deletion_queue()
            .contains(&InstanceKey::new(instance.agreement_id.clone(), NET))
            .await
    );
}

#[tokio::test]
async fn test_spent_allocation_invalidates() {
    let fx = Fixture::with_settings(fast_settings());
    active_instance(&fx).await;
    fx.market(NET).set_allocation(AllocationInfo {
        id: "alloc-1".to_string(),
        timeout: None,
        remaining_amount: 0.0,
    });

    assert_eq!(fx.state.monitor.run_tick().await.invalidated, 1);
}

#[tokio::test]
async fn test_terminated_activity_invalidates() {
    let fx = Fixture::with_settings(fast_settings());
    let instance = active_instance(&fx).await;
    let activity_id = instance.activity_id.clone().unwrap();
    fx.market(NET).set_activity_state(&activity_id, ActivityState::Terminated);

    assert_eq!(fx.state.monitor.run_tick().await.invalidated, 1);
}

#[tokio::test]
async fn test_unreachable_activity_invalidates() {
    let fx = Fixture::with_settings(fast_settings());
    active_instance(&fx).await;
    fx.market(NET).fail_activity_lookups("activity api down");

    assert_eq!(fx.state.monitor.run_tick().await.invalidated, 1);
}

#[tokio::test]
async fn test_allocation_lookup_error_is_reported_not_fatal() {
    let fx = Fixture::with_settings(fast_settings());
    let instance = active_instance(&fx).await;
    fx.market(NET).fail_allocation_lookups("payment api down");
    let mut events = fx.state.events.subscribe();

    let report = fx.state.monitor.run_tick().await;
    assert_eq!(report.errors, 1);
    assert_eq!(report.invalidated, 0);

    let record = fx.state.records.get_instance(&instance.agreement_id, NET).await.unwrap().unwrap();
    assert_eq!(record.state, InstanceState::Active);
    let evt = events.recv().await.unwrap();
    assert_eq!(evt.payload["agreement_id"], instance.agreement_id.as_str());
}

#[tokio::test]
async fn test_queued_instance_is_not_reprocessed() {
    let fx = Fixture::with_settings(fast_settings());
    let instance = active_instance(&fx).await;
    fx.market(NET).set_allocation(AllocationInfo {
        id: "alloc-1".to_string(),
        timeout: None,
        remaining_amount: 0.0,
    });

    assert_eq!(fx.state.monitor.run_tick().await.invalidated, 1);
    let second = fx.state.monitor.run_tick().await;
    assert_eq!(second, TickReport::default());

    let rental = fx.market(NET).rental(&instance.agreement_id).unwrap();
    assert_eq!(rental.stop_calls(), 1);
}

#[tokio::test]
async fn test_unqueued_terminal_record_gets_queued() {
    let fx = Fixture::new();
    fx.state
        .records
        .insert_instance(&terminated_record("old-1"))
        .await
        .unwrap();

    let report = fx.state.monitor.run_tick().await;
    assert_eq!(report.queued, 1);
    assert!(
        fx.state
            .controller
            .deletion_queue()
            .contains(&InstanceKey::new("old-1", NET))
            .await
    );
    assert_eq!(fx.state.monitor.run_tick().await.queued, 0);
}

#[tokio::test(start_paused = true)]
async fn test_deletion_waits_for_delay_and_retries_failures() {
    let fx = Fixture::with_settings(Settings {
        deletion_delay: Duration::from_secs(300),
        ..Settings::default()
    });
    fx.state
        .records
        .insert_instance(&terminated_record("old-1"))
        .await
        .unwrap();

    assert_eq!(fx.state.monitor.run_tick().await.queued, 1);

    tokio::time::advance(Duration::from_secs(299)).await;
    assert_eq!(fx.state.monitor.sweep_deletions().await, 0);
    assert!(fx.state.records.get_instance("old-1", NET).await.unwrap().is_some());

    tokio::time::advance(Duration::from_secs(2)).await;
    fx.store.fail_next_deletes(1);
    assert_eq!(fx.state.monitor.sweep_deletions().await, 0);
    assert!(fx.state.records.get_instance("old-1", NET).await.unwrap().is_some());
    assert_eq!(fx.state.controller.deletion_queue().len().await, 1);

    assert_eq!(fx.state.monitor.sweep_deletions().await, 1);
    assert!(fx.state.records.get_instance("old-1", NET).await.unwrap().is_none());
    assert!(fx.state.controller.deletion_queue().is_empty().await);
}

#[tokio::test]
async fn test_marketplace_outage_skips_tick() {
    let fx = Fixture::with_settings(fast_settings());
    let instance = active_instance(&fx).await;
    fx.connector.set_unavailable(Network::Holesky);

    // Polygon is already connected, Holesky never was.
    assert_eq!(fx.state.monitor.run_tick().await, TickReport::default());
    let record = fx.state.records.get_instance(&instance.agreement_id, NET).await.unwrap().unwrap();
    assert_eq!(record.state, InstanceState::Active);
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let fx = Fixture::new();
    let monitor = &fx.state.monitor;

    assert!(!monitor.stop().await);
    assert!(monitor.start().await);
    assert!(!monitor.start().await);
    assert!(monitor.is_running().await);
    assert!(monitor.stop().await);
    assert!(!monitor.stop().await);
    assert!(!monitor.is_running().await);
}

#[tokio::test(start_paused = true)]
async fn test_timer_runs_ticks() {
    let fx = Fixture::with_settings(Settings {
        check_interval: Duration::from_secs(60),
        ..fast_settings()
    });
    let instance = active_instance(&fx).await;
    fx.market(NET).set_allocation(AllocationInfo {
        id: "alloc-1".to_string(),
        timeout: None,
        remaining_amount: 0.0,
    });

    fx.state.monitor.start().await;
    let mut state = InstanceState::Active;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_secs(10)).await;
        state = fx
            .state
            .records
            .get_instance(&instance.agreement_id, NET)
            .await
            .unwrap()
            .unwrap()
            .state;
        if state == InstanceState::Terminated {
            break;
        }
    }
    assert_eq!(state, InstanceState::Terminated);
    fx.state.monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_lets_teardown_in_progress_finish() {
    let fx = Fixture::with_settings(Settings {
        check_interval: Duration::from_secs(60),
        ..fast_settings()
    });
    fx.market(NET).set_stop_delay(Duration::from_secs(10));
    let instance = active_instance(&fx).await;
    fx.market(NET).set_allocation(AllocationInfo {
        id: "alloc-1".to_string(),
        timeout: None,
        remaining_amount: 0.0,
    });
    let rental = fx.market(NET).rental(&instance.agreement_id).unwrap();

    fx.state.monitor.start().await;
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(rental.stop_calls(), 1);
    assert_eq!(rental.stops_finished(), 0);

    assert!(fx.state.monitor.stop().await);
    assert_eq!(rental.stops_finished(), 1);
    let record = fx.state.records.get_instance(&instance.agreement_id, NET).await.unwrap().unwrap();
    assert_eq!(record.state, InstanceState::Terminated);
    assert!(
        fx.state
            .controller
            .deletion_queue()
            .contains(&InstanceKey::new(instance.agreement_id.clone(), NET))
            .await
    );
    assert!(!fx.state.monitor.is_running().await);
}
