mod common;

use std::time::Duration;

use brainstim_controller_lib::config::scan_config::ScanConfig;
use brainstim_controller_lib::core::bluetooth::{
    BluetoothManager, CharacteristicInfo, CommandDispatcher, ConnectError, ConnectionManager,
    ConnectionState, DispatchError, ManagerEvent, SendError, StimParams,
    TransportError, WriteMode,
};
use brainstim_controller_lib::core::packet::{ChannelMask, CommandFrame, Waveform, verify_checksum};
use common::{COMMAND_CHAR, MockTransport, settle, wait_for_event};
use uuid::Uuid;

const ADDRESS: &str = "AA:BB:CC:DD:EE:01";
const WAIT: Duration = Duration::from_secs(2);

type Dispatcher = CommandDispatcher<ConnectionManager<MockTransport>>;

/// Manager with one stimulator already in the roster
async fn discovered() -> (BluetoothManager<MockTransport>, MockTransport, Dispatcher) {
    let radio = MockTransport::new();
    let manager = BluetoothManager::new(radio.clone(), ScanConfig::default());
    let mut events = manager.subscribe_events();

    manager.toggle_scan().await.unwrap();
    radio.advertise("dev-1", Some(ADDRESS), Some("Stim-A"), -60);
    wait_for_event(&mut events, |e| matches!(e, ManagerEvent::DeviceFound(_))).await;

    let dispatcher = CommandDispatcher::new(manager.connection().clone());
    (manager, radio, dispatcher)
}

fn channels(list: &[u8]) -> ChannelMask {
    ChannelMask::from_channels(list).unwrap()
}

#[tokio::test]
async fn send_before_connecting_never_reaches_the_radio() {
    let (manager, radio, dispatcher) = discovered().await;
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);

    let result = dispatcher.enable(channels(&[1])).await;

    assert_eq!(result, Err(DispatchError::Send(SendError::NotConnected)));
    assert!(radio.writes().is_empty());
}

#[tokio::test]
async fn configure_reaches_the_radio_as_one_frame() {
    let (manager, radio, dispatcher) = discovered().await;

    let link = manager.connect_device(ADDRESS).await.unwrap();
    assert!(manager.connection().wait_until_writable(WAIT).await);
    assert_eq!(manager.connection_state(), ConnectionState::Ready);
    assert_eq!(manager.connection().peer_address().as_deref(), Some(ADDRESS));

    let params = StimParams {
        phase: 30,
        current_ma: 2.0,
        frequency_hz: 0,
        waveform: Waveform::Triangle,
    };
    let frame = dispatcher.configure(channels(&[1, 2]), params).await.unwrap();

    let writes = radio.writes();
    assert_eq!(writes.len(), 1);
    let write = &writes[0];
    assert_eq!(write.link, link);
    assert_eq!(write.characteristic, COMMAND_CHAR);
    assert_eq!(write.mode, WriteMode::WithResponse);
    assert_eq!(write.data.len(), 12);
    assert_eq!(write.data, frame.to_bytes().to_vec());
    assert!(verify_checksum(&write.data));

    let parsed = CommandFrame::parse(&write.data).unwrap();
    assert_eq!(parsed.header(), 0x13);
    let fields = parsed.fields();
    assert_eq!(fields.phase, 30);
    assert_eq!(fields.waveform, 1);
    assert_eq!(fields.frequency, 0);
    assert_eq!(fields.current_tenths, 20);
}

#[tokio::test]
async fn unacknowledged_characteristic_uses_write_without_response() {
    let (manager, radio, dispatcher) = discovered().await;
    radio.state().characteristics = vec![
        CharacteristicInfo {
            uuid: Uuid::from_u128(1),
            write: false,
            write_without_response: false,
        },
        CharacteristicInfo {
            uuid: Uuid::from_u128(2),
            write: false,
            write_without_response: true,
        },
    ];

    manager.connect_device(ADDRESS).await.unwrap();
    assert!(manager.connection().wait_until_writable(WAIT).await);
    dispatcher.disable(ChannelMask::ALL).await.unwrap();

    let writes = radio.writes();
    assert_eq!(writes[0].characteristic, Uuid::from_u128(2));
    assert_eq!(writes[0].mode, WriteMode::WithoutResponse);
}

#[tokio::test]
async fn read_only_device_cannot_be_commanded() {
    let (manager, radio, dispatcher) = discovered().await;
    radio.state().characteristics.clear();

    manager.connect_device(ADDRESS).await.unwrap();
    assert!(!manager.connection().wait_until_writable(WAIT).await);
    assert_eq!(manager.connection_state(), ConnectionState::Ready);

    let result = dispatcher.enable(channels(&[1])).await;
    assert_eq!(result, Err(DispatchError::Send(SendError::NoWritableCharacteristic)));
    assert!(radio.writes().is_empty());
}

#[tokio::test]
async fn second_connect_is_rejected_while_busy() {
    let (manager, radio, _dispatcher) = discovered().await;
    radio.state().auto_connect = false;

    manager.connect_device(ADDRESS).await.unwrap();
    assert_eq!(manager.connection_state(), ConnectionState::Connecting);

    let err = manager.connect_device(ADDRESS).await.unwrap_err();
    assert_eq!(err, ConnectError::Busy(ConnectionState::Connecting));
    assert_eq!(radio.state().connects.len(), 1);
}

#[tokio::test]
async fn unknown_device_is_not_connected() {
    let (manager, radio, _dispatcher) = discovered().await;

    let err = manager.connect_device("11:22:33:44:55:66").await.unwrap_err();

    assert!(matches!(err, ConnectError::UnknownPeripheral(_)));
    assert!(radio.state().connects.is_empty());
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn failed_connect_returns_to_disconnected() {
    let (manager, radio, _dispatcher) = discovered().await;
    radio.state().connect_error = Some(TransportError::Timeout);

    let err = manager.connect_device(ADDRESS).await.unwrap_err();

    assert_eq!(err, ConnectError::Transport(TransportError::Timeout));
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    assert_eq!(manager.connection().peer_address(), None);
}

#[tokio::test]
async fn lost_link_resets_the_connection() {
    let (manager, radio, dispatcher) = discovered().await;
    let mut events = manager.subscribe_events();
    let link = manager.connect_device(ADDRESS).await.unwrap();
    assert!(manager.connection().wait_until_writable(WAIT).await);

    radio.drop_link(link);

    let lost = wait_for_event(&mut events, |e| {
        matches!(e, ManagerEvent::DeviceLostConnection { .. })
    })
    .await;
    assert!(matches!(
        lost,
        ManagerEvent::DeviceLostConnection { peer_address: Some(ref a) } if a == ADDRESS
    ));
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);

    let result = dispatcher.enable(channels(&[1])).await;
    assert_eq!(result, Err(DispatchError::Send(SendError::NotConnected)));

    settle().await;
    let state = radio.state();
    assert_eq!(state.disconnects, vec![link]);
    assert!(state.open_links.is_empty());
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_a_slow_connect_releases_the_link() {
    let (manager, radio, _dispatcher) = discovered().await;
    radio.state().connect_delay = Some(Duration::from_millis(200));

    let (connected, disconnected) = tokio::join!(manager.connect_device(ADDRESS), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.disconnect().await
    });

    assert_eq!(connected, Err(ConnectError::Cancelled));
    assert_eq!(disconnected, Ok(()));
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    assert!(radio.state().open_links.is_empty());

    radio.state().connect_delay = None;
    let link = manager.connect_device(ADDRESS).await.unwrap();
    assert!(manager.connection().wait_until_writable(WAIT).await);
    assert_eq!(radio.state().open_links, vec![link]);
}

#[tokio::test]
async fn events_for_an_old_link_are_ignored() {
    let (manager, radio, _dispatcher) = discovered().await;
    let first = manager.connect_device(ADDRESS).await.unwrap();
    assert!(manager.connection().wait_until_writable(WAIT).await);
    manager.disconnect().await.unwrap();

    let second = manager.connect_device(ADDRESS).await.unwrap();
    assert_ne!(first, second);
    assert!(manager.connection().wait_until_writable(WAIT).await);

    radio.drop_link(first);
    settle().await;

    assert_eq!(manager.connection_state(), ConnectionState::Ready);
    assert!(manager.connection().is_writable());
}

#[tokio::test]
async fn disconnect_closes_the_link_once() {
    let (manager, radio, _dispatcher) = discovered().await;
    let mut state_rx = manager.subscribe_state();
    let link = manager.connect_device(ADDRESS).await.unwrap();
    assert!(
        manager
            .connection()
            .wait_for_state(ConnectionState::Ready, WAIT)
            .await
    );

    manager.disconnect().await.unwrap();
    manager.disconnect().await.unwrap();

    assert_eq!(radio.state().disconnects, vec![link]);
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    assert_eq!(*state_rx.borrow_and_update(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn write_failure_is_reported_without_retry() {
    let (manager, radio, dispatcher) = discovered().await;
    manager.connect_device(ADDRESS).await.unwrap();
    assert!(manager.connection().wait_until_writable(WAIT).await);
    radio.state().write_error = Some(TransportError::Other("GATT error".to_string()));

    let result = dispatcher.set_frequency(channels(&[1]), 1000).await;

    assert!(matches!(result, Err(DispatchError::Send(SendError::WriteFailed(_)))));
    assert_eq!(radio.writes().len(), 1);
    assert_eq!(manager.connection_state(), ConnectionState::Ready);
}

#[tokio::test]
async fn wait_for_state_times_out() {
    let (manager, radio, _dispatcher) = discovered().await;
    radio.state().auto_connect = false;
    manager.connect_device(ADDRESS).await.unwrap();

    let reached = manager
        .connection()
        .wait_for_state(ConnectionState::Ready, Duration::from_millis(50))
        .await;

    assert!(!reached);
    assert_eq!(manager.connection_state(), ConnectionState::Connecting);
}
