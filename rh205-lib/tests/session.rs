//! Command exchanges against the simulated sensor.

mod common;

use common::*;
use rh205_lib::link::{DeviceId, DiscoveredDevice, Link};
use std::sync::Arc;

#[tokio::test(start_paused = true)]
async fn test_commands_refused_while_disconnected() {
    let (session, sensor, _events) = sim_session(SimConfig::default().disconnected());

    assert!(matches!(session.self_check().await, Err(SensorError::NotConnected)));
    assert!(matches!(session.system_params().await, Err(SensorError::NotConnected)));
    assert!(matches!(
        session.sample(SampleParams::new(1, 5, Axis::Z)).await,
        Err(SensorError::NotConnected)
    ));
    assert!(sensor.written().is_empty(), "nothing may be written without a connection");
    assert_eq!(sensor.subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_self_check_report() {
    let (session, sensor, _events) = sim_session(SimConfig::default());

    let report = session.self_check().await.unwrap();
    assert_eq!(report.serial, 20_240_042);
    assert!(report.all_normal());
    assert_eq!(report.lora_signal, -72);

    assert_eq!(sensor.written(), vec![hex_to_bytes("aa0700054a")]);
    assert!(!sensor.is_subscribed(), "subscription must end with the exchange");
}

#[tokio::test(start_paused = true)]
async fn test_system_params_round_trip_through_device() {
    let (session, sensor, _events) = sim_session(SimConfig::default());

    let mut params = session.system_params().await.unwrap();
    assert_eq!(params.ble_name, "RH205-0042");
    assert!((params.lora_rx_mhz - 470.3).abs() < 1e-6);
    assert_eq!(params.firmware_version(), "2.1");

    params.ble_name = "PUMP-7".to_string();
    params.tx_power = 17;
    session.set_system_params(&params).await.unwrap();

    let stored = sensor.system_params();
    assert_eq!(stored.ble_name, "PUMP-7");
    assert_eq!(stored.tx_power, 17);
    assert_eq!(session.system_params().await.unwrap().ble_name, "PUMP-7");
}

#[tokio::test(start_paused = true)]
async fn test_invalid_params_rejected_before_writing() {
    let (session, sensor, _events) = sim_session(SimConfig::default());
    let mut params = sensor.system_params();
    params.ble_name = "a-name-well-over-twenty-bytes".to_string();

    assert!(matches!(
        session.set_system_params(&params).await,
        Err(SensorError::InvalidParameter(_))
    ));
    assert!(sensor.written().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_sampling() {
    let (session, sensor, _events) = sim_session(SimConfig::default());
    session.stop_sampling().await.unwrap();
    assert_eq!(sensor.written_frames(Command::StopSampling).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_muted_command_times_out_after_retries() {
    let (session, sensor, _events) = sim_session(SimConfig::default().mute(Command::GetSystemParams));

    let started = tokio::time::Instant::now();
    match session.system_params().await {
        Err(SensorError::ResponseTimeout { command, .. }) => assert_eq!(command, Command::GetSystemParams),
        other => panic!("Expected ResponseTimeout, got {other:?}"),
    }
    // 200 ms lead-in, 200 ms settle, three 500 ms windows
    assert!(started.elapsed() >= Duration::from_millis(1900));
    assert_eq!(sensor.written_frames(Command::GetSystemParams).len(), 3);
    assert!(!sensor.is_subscribed());
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_reply_fails_strict_command() {
    let (session, sensor, _events) = sim_session(SimConfig::default().corrupt_once(Command::SelfCheck));

    match session.self_check().await {
        Err(SensorError::FrameChecksumMismatch { .. }) => {}
        other => panic!("Expected FrameChecksumMismatch, got {other:?}"),
    }
    assert_eq!(sensor.written_frames(Command::SelfCheck).len(), 1, "no retry after a terminal failure");

    // The corruption was one-off; the next attempt is clean.
    assert!(session.self_check().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_reply_is_waited_past_for_data_list() {
    use chrono::{TimeZone, Utc};

    let (session, sensor, mut events) = sim_session(SimConfig::default().corrupt_once(Command::DataList));
    let query = DataListQuery {
        from: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        to: Utc.with_ymd_and_hms(2024, 12, 31, 0, 0, 0).unwrap(),
    };

    let summary = session.data_list(query).await.unwrap();
    assert_eq!(summary.count, 0);
    assert_eq!(summary.oldest, None);
    assert_eq!(sensor.written_frames(Command::DataList).len(), 2, "watchdog resent the query");

    let reported = drain(&mut events).into_iter().any(|event| {
        matches!(event, SessionEvent::MalformedResponse { command: Command::DataList, .. })
    });
    assert!(reported, "the corrupt reply should surface as an event");
}

#[tokio::test(start_paused = true)]
async fn test_temperature_reading() {
    let (session, sensor, _events) = sim_session(SimConfig::default());

    let reading = session.sample_temperature(0.95).await.unwrap();
    assert_eq!(reading.celsius, 36.5);

    let sent = sensor.written_frames(Command::SamplingParams);
    assert_eq!(sent.len(), 1);
    let params = SampleParams::from_payload(&sent[0].payload).unwrap();
    assert_eq!(params.axis, Axis::Temperature);
    assert_eq!(params.emissivity, 0.95);
}

#[tokio::test(start_paused = true)]
async fn test_calibration() {
    let (session, sensor, _events) = sim_session(SimConfig::default());
    let params = CalibrationParams {
        len_k: 1,
        freq: 5,
        axis: Axis::X,
        reference_g: 1.0,
    };

    let result = session.calibrate(params).await.unwrap();
    assert!((result.coefficient - 0.0374).abs() < 1e-6);
    let sent = sensor.written_frames(Command::CalibrateVibration);
    assert_eq!(CalibrationParams::from_payload(&sent[0].payload).unwrap(), params);
}

#[tokio::test(start_paused = true)]
async fn test_new_command_supersedes_pending_one() {
    let (session, sensor, _events) = sim_session(SimConfig::default().mute(Command::SelfCheck));
    let session = Arc::new(session);

    let pending = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.self_check().await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    let params = session.system_params().await.unwrap();
    assert_eq!(params.serial, 20_240_042);

    assert!(matches!(pending.await.unwrap(), Err(SensorError::Superseded)));

    // The superseded watchdog never fires again
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(sensor.written_frames(Command::SelfCheck).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_release_unsubscribes() {
    let (session, sensor, _events) = sim_session(SimConfig::default().mute(Command::SelfCheck));
    let session = Arc::new(session);

    let pending = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.self_check().await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(sensor.is_subscribed());

    session.release().await;
    assert!(!sensor.is_subscribed());
    assert!(matches!(pending.await.unwrap(), Err(SensorError::Superseded)));
}

#[tokio::test(start_paused = true)]
async fn test_scan_lists_named_devices_once() {
    let mut config = SimConfig::default().disconnected();
    config.neighbours = vec![
        DiscoveredDevice {
            id: DeviceId::from("11:22:33:44:55:66"),
            name: None,
            rssi: -80,
        },
        DiscoveredDevice {
            id: DeviceId::from("C4:7F:51:00:20:05"),
            name: Some("RH205-0042".to_string()),
            rssi: -49,
        },
        DiscoveredDevice {
            id: DeviceId::from("C4:7F:51:00:20:09"),
            name: Some("RH205-0077".to_string()),
            rssi: -66,
        },
    ];
    let (session, _sensor, mut events) = sim_session(config);

    let devices = session.scan(Duration::from_secs(2)).await.unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].id, DeviceId::from("C4:7F:51:00:20:05"));
    assert_eq!(devices[0].rssi, -49, "repeat advertisement refreshes the signal strength");
    assert_eq!(devices[1].name.as_deref(), Some("RH205-0077"));
    assert!(!session.connection().scanning);

    let events = drain(&mut events);
    assert_eq!(events.first(), Some(&SessionEvent::ScanStarted));
    assert_eq!(events.last(), Some(&SessionEvent::ScanFinished { devices: 2 }));
    let found = events
        .iter()
        .filter(|event| matches!(event, SessionEvent::DeviceFound(_)))
        .count();
    assert_eq!(found, 2);
}

#[tokio::test(start_paused = true)]
async fn test_connect_and_disconnect() {
    let (session, sensor, mut events) = sim_session(SimConfig::default().disconnected());
    let id = DeviceId::from("C4:7F:51:00:20:05");

    session.connect(&id).await.unwrap();
    assert!(session.is_connected());
    assert!(session.connection().is_current(&id));
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::Connected {
            device: id.clone(),
            mtu: Some(250)
        }]
    );

    // Same device again is a no-op
    session.connect(&id).await.unwrap();
    assert!(drain(&mut events).is_empty());

    assert!(session.self_check().await.is_ok());

    session.disconnect().await.unwrap();
    assert!(!sensor.is_connected());
    assert_eq!(session.connection().current, None);
    assert_eq!(drain(&mut events), vec![SessionEvent::Disconnected]);
    assert!(matches!(session.self_check().await, Err(SensorError::NotConnected)));
}

#[tokio::test(start_paused = true)]
async fn test_connect_to_unknown_device_fails() {
    let (session, _sensor, _events) = sim_session(SimConfig::default().disconnected());
    match session.connect(&DeviceId::from("00:00:00:00:00:00")).await {
        Err(SensorError::Link(LinkError::Connect { device, .. })) => assert_eq!(device, "00:00:00:00:00:00"),
        other => panic!("Expected connect failure, got {other:?}"),
    }
    assert!(!session.is_connected());
    assert_eq!(session.connection().current, None);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_mid_exchange_ends_operation() {
    let (session, sensor, _events) = sim_session(SimConfig::default().mute(Command::SelfCheck));
    let session = Arc::new(session);

    let pending = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.self_check().await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    sensor.set_connected(false);

    assert!(matches!(
        pending.await.unwrap(),
        Err(SensorError::Link(LinkError::StreamClosed))
    ));
}
