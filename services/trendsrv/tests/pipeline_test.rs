//! End-to-end polling cycles against the virtual device and on-disk SQLite

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod fixtures;

use std::sync::Arc;

use chrono::Duration;
use trendsrv::{
    ChannelSubscriber, CycleOutcome, PointConfig, PointKind, Quality, ReadingValue,
};

#[tokio::test]
async fn analog_value_reaches_cache_history_and_subscribers() {
    let env = fixtures::test_env().await.unwrap();
    env.load_seed_values();
    let (live, mut rx) = ChannelSubscriber::new("live", 4);
    env.service.hub.subscribe(Arc::new(live)).await;

    let outcome = env.service.polling.run_cycle().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Completed { readings: 3, bad: 0 });

    let latest = env.service.repository.latest_values().await.unwrap();
    assert_eq!(
        latest["Temperature_Reactor1"].value,
        ReadingValue::Analog {
            value: 42.5,
            unit: Some("°C".to_string())
        }
    );

    let now = fixtures::fixed_now();
    let history = env
        .service
        .repository
        .history("Temperature_Reactor1", PointKind::Analog, now, now)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].quality, Quality::Good);

    let live_values = rx.recv().await.unwrap();
    let tags: Vec<_> = live_values.iter().map(|v| v.tag_name.as_str()).collect();
    assert_eq!(tags, vec!["Pressure_Line1", "Pump_Running", "Temperature_Reactor1"]);
}

#[tokio::test]
async fn failing_digital_point_degrades_to_bad_quality() {
    let env = fixtures::test_env().await.unwrap();
    env.load_seed_values();
    env.service.device.inject_fault(2, 0);

    let outcome = env.service.polling.run_cycle().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Completed { readings: 3, bad: 1 });

    let latest = env.service.repository.latest_values().await.unwrap();
    let pump = &latest["Pump_Running"];
    assert_eq!(pump.quality, Quality::Bad);
    assert_eq!(
        pump.value,
        ReadingValue::Digital {
            value: false,
            bit: 0
        }
    );
    assert_eq!(latest["Pressure_Line1"].quality, Quality::Good);
}

#[tokio::test]
async fn string_points_are_stored() {
    let env = fixtures::test_env().await.unwrap();
    env.load_seed_values();
    env.service
        .repository
        .save_point(&PointConfig::string("Batch_Name", 3, 0))
        .await
        .unwrap();
    env.service.device.write_string(3, 0, 254, "LOT-0042");

    env.service.polling.run_cycle().await.unwrap();

    let now = fixtures::fixed_now();
    let history = env
        .service
        .repository
        .history("Batch_Name", PointKind::String, now, now)
        .await
        .unwrap();
    assert_eq!(
        history[0].value,
        ReadingValue::String {
            value: "LOT-0042".to_string(),
            max_length: 254
        }
    );
}

#[tokio::test]
async fn cache_is_rebuilt_after_restart() {
    let env = fixtures::test_env().await.unwrap();
    env.load_seed_values();
    env.service.polling.run_cycle().await.unwrap();

    env.clock.advance(Duration::seconds(5));
    env.service.device.write_f32(1, 0, 43.0);
    env.service.polling.run_cycle().await.unwrap();

    let env = env.restart().await.unwrap();
    assert_eq!(env.service.repository.all_points().await.unwrap().len(), 3);

    let latest = env.service.repository.latest_values().await.unwrap();
    assert_eq!(latest.len(), 3);
    assert_eq!(
        latest["Temperature_Reactor1"].value,
        ReadingValue::Analog {
            value: 43.0,
            unit: Some("°C".to_string())
        }
    );
}

#[tokio::test]
async fn unreachable_device_skips_cycles() {
    let env = fixtures::test_env().await.unwrap();
    env.service.device.set_reachable(false);

    assert_eq!(
        env.service.polling.run_cycle().await.unwrap(),
        CycleOutcome::NotConnected
    );
    // Inside the backoff window the device is not contacted again
    env.service.polling.run_cycle().await.unwrap();
    assert_eq!(env.service.device.open_calls(), 1);
}
