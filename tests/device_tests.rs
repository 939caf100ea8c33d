use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use hoiax_myuplink::mock::{ManualClock, MockFailure, MockPointApi, RecordingHost, TokioClock};
use hoiax_myuplink::registry::*;
use hoiax_myuplink::{
    Availability, CapabilityValue, Clock, Config, DeviceHandle, DeviceType, Error, HeaterDevice, Host,
    KEY_LEAKAGE, LeakageCheckpoint, MemoryStore, PointValues, PowerLevel, SettingValue, Trigger,
    load,
};

const POLL: Duration = Duration::from_secs(300);

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap()
}

/// A Connected 200 at 65 °C, on at high power, already in external mode.
fn seeded_api() -> Arc<MockPointApi> {
    let api = MockPointApi::new();
    api.set_display(TANK_VOLUME, 178.0, "178 l", false);
    api.set_display(SERIAL_NUMBER, 1234.0, "HX-200-1234", false);
    api.set_display(HEATER_EFFICIENCY, 97.0, "97 %", false);
    api.set_display(HEATER_NOM_POWER, 2000.0, "2000 W", false);
    api.set_display(HEATER_NOM_POWER2, 700.0, "700 W", false);
    api.set_point(AMBIENT_TEMPERATURE, 20.0);
    api.set_point(INLET_TEMPERATURE, 8.0);
    api.set_point(LEGIONELLA_FREQUENCY, 7.0);
    api.set_point(MAX_WATER_FLOW, 12.0);
    api.set_point(REGULATION_DIFF, 5.0);
    api.set_point(HEATER_MODE, 8.0);
    api.set_enum_values(HEATER_MODE, &[(2, "Schedule"), (8, "External")]);

    api.set_point(ENERGY_STORED, 5.0);
    api.set_point(ENERGY_TOTAL, 1000.0);
    api.set_point(ESTIMATED_POWER, 0.0);
    api.set_point(FILL_LEVEL, 80.0);
    api.set_point(REQUESTED_POWER, 3.0);
    api.set_point(TARGET_TEMPERATURE, 70.0);
    api.set_point(MEASURED_TEMPERATURE, 65.0);
    api.set_firmware("1.2.7");
    Arc::new(api)
}

struct Rig {
    api: Arc<MockPointApi>,
    host: Arc<RecordingHost>,
    store: Arc<MemoryStore>,
    handle: DeviceHandle,
}

async fn wait_available(handle: &DeviceHandle) {
    handle
        .subscribe()
        .wait_for(|s| s.availability == Availability::Available)
        .await
        .expect("device task ended before becoming available");
}

async fn start_with_clock(clock: Arc<dyn Clock>) -> Rig {
    let api = seeded_api();
    let host = Arc::new(RecordingHost::new());
    let store = Arc::new(MemoryStore::new());
    let handle = HeaterDevice::new("dev-1", api.clone(), host.clone(), store.clone())
        .with_clock(clock)
        .spawn();
    wait_available(&handle).await;
    Rig {
        api,
        host,
        store,
        handle,
    }
}

async fn start() -> Rig {
    start_with_clock(Arc::new(ManualClock::new(t0()))).await
}

fn number(value: Option<CapabilityValue>) -> f64 {
    match value {
        Some(CapabilityValue::Number(n)) => n,
        other => panic!("expected a number, got {other:?}"),
    }
}

/// Seconds between consecutive reads.
fn read_gaps(api: &MockPointApi) -> Vec<u64> {
    api.read_times()
        .windows(2)
        .map(|w| (w[1] - w[0]).as_secs())
        .collect()
}

fn text(s: &str) -> Option<CapabilityValue> {
    Some(CapabilityValue::Text(s.to_string()))
}

#[tokio::test(start_paused = true)]
async fn bootstrap_publishes_state_and_settings() {
    let rig = start().await;

    let caps = rig.host.capabilities();
    assert!(caps.contains(&"onoff".to_string()));
    assert!(caps.contains(&"max_power".to_string()));
    assert!(!caps.contains(&"max_power_3000".to_string()));

    assert_eq!(rig.host.value("onoff"), Some(CapabilityValue::Bool(true)));
    assert_eq!(rig.host.value("max_power"), text("high_power"));
    assert_eq!(number(rig.host.value("measure_temperature")), 65.0);
    assert_eq!(number(rig.host.value("meter_power.accumulated")), 1000.0);
    assert_eq!(number(rig.host.value("measure_humidity.fill_level")), 80.0);

    let settings = rig.host.settings().expect("settings pushed");
    assert_eq!(
        settings.get("serial_number"),
        Some(&SettingValue::Text("HX-200-1234".to_string()))
    );
    assert_eq!(settings.get("regulation_diff"), Some(&SettingValue::Number(5.0)));
    assert_eq!(
        settings.get("firmware_version"),
        Some(&SettingValue::Text("1.2.7".to_string()))
    );

    let status = rig.handle.status();
    assert_eq!(status.profile.map(|p| p.device_type), Some(DeviceType::Connected200));
    assert_eq!(status.state.power_level, Some(PowerLevel::High));
    assert_eq!(status.firmware.as_deref(), Some("1.2.7"));
}

#[tokio::test(start_paused = true)]
async fn identical_polls_change_nothing() {
    let rig = start().await;
    rig.api.clear_log();
    let updates = rig.host.value_updates();

    tokio::time::sleep(POLL * 3 + Duration::from_secs(1)).await;

    assert_eq!(rig.api.reads().len(), 3);
    assert!(rig.api.writes().is_empty());
    assert_eq!(rig.host.value_updates(), updates);
    assert!(rig.host.triggers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn device_side_change_fires_one_trigger() {
    let rig = start().await;

    rig.api.set_point(REQUESTED_POWER, 1.0);
    tokio::time::sleep(POLL + Duration::from_secs(1)).await;
    assert_eq!(rig.host.value("max_power"), text("low_power"));
    assert_eq!(
        rig.host.triggers(),
        vec![Trigger::MaxPowerChanged { watts: 700 }]
    );

    tokio::time::sleep(POLL).await;
    assert_eq!(rig.host.triggers().len(), 1);

    rig.api.set_point(REQUESTED_POWER, 0.0);
    tokio::time::sleep(POLL).await;
    assert_eq!(rig.host.value("onoff"), Some(CapabilityValue::Bool(false)));
    assert_eq!(rig.host.value("max_power"), text("low_power"));
    assert_eq!(
        rig.host.triggers()[1..],
        [Trigger::OnOffChanged { on: false }]
    );
}

#[tokio::test(start_paused = true)]
async fn redundant_command_makes_no_request() {
    let rig = start().await;
    rig.api.clear_log();

    rig.handle.set_max_power(PowerLevel::High).await.unwrap();
    rig.handle.set_on_off(true).await.unwrap();
    rig.handle.set_target_temperature(70.0).await.unwrap();

    assert!(rig.api.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn command_is_shown_at_once_and_confirmed_by_poll() {
    let rig = start().await;
    rig.api.clear_log();

    rig.handle.set_target_temperature(60.0).await.unwrap();
    assert_eq!(rig.api.writes(), vec![PointValues::from([(TARGET_TEMPERATURE, 60.0)])]);
    assert_eq!(number(rig.host.value("target_temperature")), 60.0);

    tokio::time::sleep(POLL + Duration::from_secs(1)).await;
    assert_eq!(rig.api.writes().len(), 1);
    assert_eq!(number(rig.host.value("target_temperature")), 60.0);
    assert_eq!(rig.handle.status().state.target_temperature, Some(60.0));
}

#[tokio::test(start_paused = true)]
async fn lagging_device_does_not_overwrite_pending_value() {
    let rig = start().await;
    rig.api.clear_log();
    rig.api.hold_writes(true);

    rig.handle.set_max_power(PowerLevel::Medium).await.unwrap();
    assert_eq!(rig.host.value("max_power"), text("medium_power"));

    // The device still reports high power; the write is re-sent.
    tokio::time::sleep(POLL + Duration::from_secs(1)).await;
    assert_eq!(rig.host.value("max_power"), text("medium_power"));
    assert_eq!(rig.api.writes().len(), 2);
    assert!(rig.host.triggers().is_empty());

    rig.api.hold_writes(false);
    tokio::time::sleep(POLL * 2).await;
    assert_eq!(rig.api.value(REQUESTED_POWER), Some(2.0));
    assert_eq!(rig.host.value("max_power"), text("medium_power"));
    assert_eq!(
        rig.host.triggers(),
        vec![Trigger::MaxPowerChanged { watts: 1300 }]
    );
}

#[tokio::test(start_paused = true)]
async fn switching_on_uses_last_selected_level() {
    let rig = start().await;
    rig.handle.set_on_off(false).await.unwrap();
    tokio::time::sleep(POLL + Duration::from_secs(1)).await;

    // While off, choosing a level changes nothing on the device.
    rig.api.clear_log();
    rig.handle.set_max_power(PowerLevel::Low).await.unwrap();
    assert!(rig.api.writes().is_empty());
    assert_eq!(rig.host.value("max_power"), text("low_power"));

    rig.handle.set_on_off(true).await.unwrap();
    assert_eq!(rig.api.writes(), vec![PointValues::from([(REQUESTED_POWER, 1.0)])]);
}

#[tokio::test(start_paused = true)]
async fn pending_settings_join_the_poll() {
    let rig = start().await;
    rig.api.hold_writes(true);

    let changes = BTreeMap::from([("regulation_diff".to_string(), 4.0)]);
    rig.handle.set_settings(changes).await.unwrap();
    let settings = rig.host.settings().unwrap();
    assert_eq!(settings.get("regulation_diff"), Some(&SettingValue::Number(4.0)));

    rig.api.clear_log();
    tokio::time::sleep(POLL + Duration::from_secs(1)).await;
    let reads = rig.api.reads();
    assert!(reads[0].contains(&REGULATION_DIFF));
    assert!(reads[0].contains(&MEASURED_TEMPERATURE));

    rig.api.hold_writes(false);
    tokio::time::sleep(POLL * 2).await;
    rig.api.clear_log();
    tokio::time::sleep(POLL).await;
    assert!(!rig.api.reads()[0].contains(&REGULATION_DIFF));
}

#[tokio::test(start_paused = true)]
async fn settings_reject_read_only_and_unsupported_names() {
    let rig = start().await;
    rig.api.clear_log();

    let read_only = BTreeMap::from([("serial_number".to_string(), 1.0)]);
    assert!(matches!(
        rig.handle.set_settings(read_only).await,
        Err(Error::UnknownSetting(_))
    ));

    let unknown = BTreeMap::from([("turbo".to_string(), 1.0)]);
    assert!(rig.handle.set_settings(unknown).await.is_err());

    let price = BTreeMap::from([("price_region".to_string(), 3.0)]);
    assert!(rig.handle.set_settings(price).await.is_err());

    assert!(rig.api.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn poll_failures_back_off_linearly_then_recover() {
    let rig = start().await;
    rig.api.clear_log();
    rig.api.fail_reads(2, MockFailure::Network);

    tokio::time::sleep(POLL + Duration::from_secs(1)).await;
    assert!(matches!(
        rig.handle.status().availability,
        Availability::Unavailable(ref reason) if reason.contains("503")
    ));

    tokio::time::sleep(Duration::from_secs(1500)).await;
    wait_available(&rig.handle).await;

    assert_eq!(read_gaps(&rig.api), vec![600, 900]);

    // back to the base interval after a success
    tokio::time::sleep(POLL).await;
    assert_eq!(read_gaps(&rig.api), vec![600, 900, 300]);

    let history = rig.host.availability();
    assert_eq!(history.last(), Some(&Availability::Available));
}

#[tokio::test(start_paused = true)]
async fn failed_write_marks_unavailable_until_next_success() {
    let rig = start().await;
    rig.api.clear_log();
    rig.api.fail_writes(1, MockFailure::Conflict);

    let err = rig.handle.set_on_off(false).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert_eq!(rig.host.value("onoff"), Some(CapabilityValue::Bool(true)));
    assert!(matches!(
        rig.handle.status().availability,
        Availability::Unavailable(reason) if reason.contains("409")
    ));
    assert!(matches!(
        rig.host.availability().last(),
        Some(Availability::Unavailable(reason)) if reason.contains("tank has power")
    ));

    rig.handle.set_on_off(false).await.unwrap();
    assert_eq!(rig.handle.status().availability, Availability::Available);
    assert_eq!(rig.host.availability().last(), Some(&Availability::Available));
    assert_eq!(rig.api.writes().len(), 2);

    // The failed attempt is not retried in the background.
    tokio::time::sleep(POLL + Duration::from_secs(1)).await;
    assert_eq!(rig.api.writes().len(), 2);
    assert_eq!(rig.api.value(REQUESTED_POWER), Some(0.0));
}

#[tokio::test(start_paused = true)]
async fn failed_resend_marks_unavailable() {
    let rig = start().await;
    rig.api.clear_log();
    rig.api.hold_writes(true);
    rig.handle.set_target_temperature(60.0).await.unwrap();
    rig.api.fail_writes(1, MockFailure::Network);

    tokio::time::sleep(POLL + Duration::from_secs(1)).await;
    assert_eq!(rig.api.writes().len(), 2);
    assert!(matches!(
        rig.handle.status().availability,
        Availability::Unavailable(reason) if reason.contains("503")
    ));

    tokio::time::sleep(POLL).await;
    assert_eq!(rig.api.writes().len(), 3);
    assert_eq!(rig.handle.status().availability, Availability::Available);
}

#[tokio::test(start_paused = true)]
async fn non_finite_values_are_refused() {
    let rig = start().await;
    rig.api.clear_log();

    assert!(matches!(
        rig.handle.set_target_temperature(f64::NAN).await,
        Err(Error::InvalidValue(_))
    ));
    let change = BTreeMap::from([("regulation_diff".to_string(), f64::INFINITY)]);
    assert!(matches!(
        rig.handle.set_settings(change).await,
        Err(Error::InvalidValue(_))
    ));

    tokio::time::sleep(POLL * 2 + Duration::from_secs(1)).await;
    assert!(rig.api.writes().is_empty());
    assert_eq!(number(rig.host.value("target_temperature")), 70.0);
    assert_eq!(rig.handle.status().availability, Availability::Available);
}

#[test]
fn invalid_config_is_refused() {
    let device = || {
        HeaterDevice::new(
            "dev-1",
            seeded_api(),
            Arc::new(RecordingHost::new()),
            Arc::new(MemoryStore::new()),
        )
    };
    let inverted = Config {
        ambient_min_c: 30.0,
        ambient_max_c: 10.0,
        ..Config::default()
    };
    assert!(matches!(device().with_config(inverted), Err(Error::Config(_))));

    let no_interval = Config {
        poll_interval_secs: 0,
        ..Config::default()
    };
    assert!(matches!(device().with_config(no_interval), Err(Error::Config(_))));
    assert!(device().with_config(Config::default()).is_ok());
}

#[tokio::test(start_paused = true)]
async fn leakage_follows_wall_clock_and_ambient() {
    let rig = start_with_clock(Arc::new(TokioClock::new(t0()))).await;

    // 1.58 W/K * (65 - 20) K
    let expected_w = 1.58 * 45.0;
    assert!((number(rig.host.value("measure_power.leak")) - expected_w).abs() < 1e-9);
    let saved: LeakageCheckpoint =
        load(rig.store.as_ref(), KEY_LEAKAGE).expect("first sample is saved");
    assert_eq!(saved.accumulated_kwh, 0.0);

    tokio::time::sleep(Duration::from_secs(3600) + Duration::from_millis(10)).await;
    let kwh = number(rig.host.value("meter_power.leak"));
    assert!((kwh - expected_w / 1000.0).abs() < 1e-9, "kwh {kwh}");

    rig.handle.set_ambient_temperature(95.0).await.unwrap();
    tokio::time::sleep(POLL).await;
    // clamped to 40 °C
    let leak_w = number(rig.host.value("measure_power.leak"));
    assert!((leak_w - 1.58 * 25.0).abs() < 1e-9, "leak {leak_w}");
}

#[tokio::test(start_paused = true)]
async fn reset_leakage_zeroes_and_persists() {
    let rig = start_with_clock(Arc::new(TokioClock::new(t0()))).await;
    tokio::time::sleep(Duration::from_secs(7200)).await;
    assert!(number(rig.host.value("meter_power.leak")) > 0.0);

    rig.handle.reset_leakage().await.unwrap();
    assert_eq!(number(rig.host.value("meter_power.leak")), 0.0);
    let saved: LeakageCheckpoint = load(rig.store.as_ref(), KEY_LEAKAGE).unwrap();
    assert_eq!(saved.accumulated_kwh, 0.0);
}

#[tokio::test(start_paused = true)]
async fn delete_stops_the_device() {
    let rig = start().await;
    rig.handle.delete();
    rig.handle
        .subscribe()
        .wait_for(|s| s.availability == Availability::Deleted)
        .await
        .ok();
    rig.api.clear_log();

    tokio::time::sleep(POLL * 10).await;
    assert!(rig.api.reads().is_empty());
    assert!(rig.handle.is_deleted());
    assert!(matches!(
        rig.handle.set_on_off(false).await,
        Err(Error::Deleted)
    ));
    rig.handle.join().await;
}
