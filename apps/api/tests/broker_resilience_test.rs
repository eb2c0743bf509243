//! Integration tests for broker disconnects
//!
//! Covers how in-flight and new calls behave under each disconnect policy
//! and that tracked lights keep flowing once the connection is back.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use prysmalight_api::models::PowerState;
use prysmalight_api::{Broker, ConnectionState, DeviceError, DisconnectPolicy, LightPatch, Topics};
use rstest::rstest;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use common::*;

/// Answer every command for `id` after `delay` with a power-on report
async fn spawn_slow_light(broker: &Broker, topics: &Topics, id: &str, delay: Duration) {
    let (sink, mut commands) = mpsc::unbounded_channel();
    broker.subscribe(&topics.command(id), sink).await.unwrap();

    let broker = broker.clone();
    let id = id.to_string();
    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            let body: Value = serde_json::from_slice(&command.payload).unwrap();
            let reply_to = body["replyTo"].as_str().unwrap().to_string();
            let broker = broker.clone();
            let reply = json!({ "id": id, "state": "ON" });
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = broker.publish(&reply_to, reply.to_string()).await;
            });
        }
    });
}

/// Drop the connection after `down_at` and restore it after `up_at`
fn schedule_outage(bed: &TestBed, down_at: Duration, up_at: Duration) {
    let broker = bed.broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(down_at).await;
        if let Some(controls) = broker.in_memory_controls() {
            controls.simulate_disconnect();
        }
        tokio::time::sleep(up_at - down_at).await;
        if let Some(controls) = broker.in_memory_controls() {
            controls.simulate_reconnect();
        }
    });
}

#[rstest]
#[case::fail_fast(DisconnectPolicy::FailFast, false)]
#[case::wait(DisconnectPolicy::Wait, true)]
#[tokio::test]
async fn test_outage_during_call(#[case] policy: DisconnectPolicy, #[case] succeeds: bool) {
    let bed = TestBed::with_settings(test_settings(Duration::from_secs(1), policy));
    bed.service.add_light("L1").await.unwrap();
    spawn_slow_light(&bed.broker, &bed.topics(), "L1", Duration::from_millis(150)).await;
    let baseline = bed.broker.active_subscriptions();

    schedule_outage(&bed, Duration::from_millis(20), Duration::from_millis(60));
    let result = bed
        .service
        .set_light("L1", LightPatch::power(PowerState::On))
        .await;

    if succeeds {
        assert_eq!(result.unwrap().state, PowerState::On);
    } else {
        assert_matches!(result, Err(DeviceError::BrokerUnavailable(_)));
    }
    assert_eq!(bed.broker.active_subscriptions(), baseline);
}

#[tokio::test]
async fn test_fail_fast_while_disconnected() {
    let bed = TestBed::new();
    bed.service.add_light("L1").await.unwrap();
    bed.controls().simulate_disconnect();
    let published = bed.controls().published_count();
    let baseline = bed.broker.active_subscriptions();

    let result = bed.service.get_light("L1").await;

    assert_matches!(result, Err(DeviceError::BrokerUnavailable(_)));
    assert_eq!(bed.controls().published_count(), published);
    assert_eq!(bed.broker.active_subscriptions(), baseline);
}

#[tokio::test]
async fn test_wait_policy_publishes_after_reconnect() {
    let bed = TestBed::with_settings(test_settings(
        Duration::from_secs(1),
        DisconnectPolicy::Wait,
    ));
    bed.service.add_light("L1").await.unwrap();
    spawn_slow_light(&bed.broker, &bed.topics(), "L1", Duration::ZERO).await;

    bed.controls().simulate_disconnect();
    let broker = bed.broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Some(controls) = broker.in_memory_controls() {
            controls.simulate_reconnect();
        }
    });

    let light = bed
        .service
        .set_light("L1", LightPatch::power(PowerState::On))
        .await
        .unwrap();
    assert_eq!(light.state, PowerState::On);
}

#[tokio::test]
async fn test_wait_policy_times_out_when_connection_stays_down() {
    let bed = TestBed::with_settings(test_settings(
        Duration::from_millis(100),
        DisconnectPolicy::Wait,
    ));
    bed.service.add_light("L1").await.unwrap();
    bed.controls().simulate_disconnect();
    let baseline = bed.broker.active_subscriptions();

    let started = tokio::time::Instant::now();
    let result = bed.service.get_light("L1").await;

    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_matches!(result, Err(DeviceError::Timeout { .. }));
    assert_eq!(bed.broker.active_subscriptions(), baseline);
}

#[tokio::test]
async fn test_events_resume_after_reconnect() {
    let bed = TestBed::new();
    let light = bed.register_light("L1").await;
    let mut stream = bed.service.subscribe_to_light("L1").await.unwrap();
    let mut status = bed.service.watch_broker_status();

    bed.controls().simulate_disconnect();
    assert_eq!(*status.borrow_and_update(), ConnectionState::Disconnected);
    bed.controls().simulate_reconnect();
    assert_eq!(bed.service.broker_status(), ConnectionState::Connected);

    light
        .publish_state(LightPatch::power(PowerState::On))
        .await
        .unwrap();
    assert_eq!(next_event(&mut stream).await.id(), "L1");
    assert_eq!(
        bed.broker
            .subscription_count(&bed.topics().light_pattern("L1")),
        1
    );
}

#[tokio::test]
async fn test_closed_broker_refuses_calls() {
    let bed = TestBed::new();
    bed.service.add_light("L1").await.unwrap();
    bed.service.shutdown().await;

    assert_eq!(bed.service.broker_status(), ConnectionState::Closed);
    assert_matches!(
        bed.service
            .set_light("L1", LightPatch::power(PowerState::On))
            .await,
        Err(DeviceError::BrokerUnavailable(_))
    );

    // Closing twice is harmless
    bed.service.shutdown().await;
    assert_eq!(bed.service.broker_status(), ConnectionState::Closed);
}
