//! End-to-end `Z21Client` tests against a fake command-station peer on a
//! loopback UDP socket: connect handshake, CV read/write, and unsolicited
//! broadcast/detector traffic arriving interleaved with a request's reply.

use lmrs::z21::{framing, message};
use lmrs::z21::{ConnectionState, EngineError, Event, TrackPower, Z21Client, Z21Config};
use tokio::net::UdpSocket;

async fn spawn_fake_device() -> (UdpSocket, std::net::SocketAddr) {
    let device = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = device.local_addr().unwrap();
    (device, addr)
}

fn status_response_frame() -> Vec<u8> {
    framing::encode_frame(
        message::lan_id::LAN_X,
        &framing::xbus_with_checksum(vec![message::xbus_op::STATUS_CHANGED, 0x00, 0x00]),
    )
}

#[tokio::test]
async fn test_connect_succeeds_on_status_reply() {
    let (device, device_addr) = spawn_fake_device().await;
    let device_task = tokio::spawn(async move {
        let mut buf = [0u8; 1472];
        let (_n, from) = device.recv_from(&mut buf).await.unwrap();
        device
            .send_to(&status_response_frame(), from)
            .await
            .unwrap();
    });

    let mut client = Z21Client::new(Z21Config::default());
    client.connect(device_addr).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    device_task.await.unwrap();
}

#[tokio::test]
async fn test_connect_times_out_with_no_reply() {
    // bind a socket nobody answers on, with a short connect timeout.
    let (device, device_addr) = spawn_fake_device().await;
    drop(device); // nothing listens; datagrams vanish into the ether.

    let mut config = Z21Config::default();
    config.connect_timeout = std::time::Duration::from_millis(50);
    let mut client = Z21Client::new(config);
    let err = client.connect(device_addr).await.unwrap_err();
    assert!(matches!(err, EngineError::Timeout));
    assert_eq!(client.state(), ConnectionState::Error);
}

#[tokio::test]
async fn test_read_cv_direct_mode_happy_path_with_interleaved_broadcast() {
    let (device, device_addr) = spawn_fake_device().await;

    let device_task = tokio::spawn(async move {
        let mut buf = [0u8; 1472];

        // handshake
        let (_n, from) = device.recv_from(&mut buf).await.unwrap();
        device
            .send_to(&status_response_frame(), from)
            .await
            .unwrap();

        // read CV 1 request arrives; reply with an unrelated track-power
        // broadcast first, then the actual config result, both in the same
        // datagram, exercising multi-frame-per-datagram reassembly (§4.5).
        let (_n2, from2) = device.recv_from(&mut buf).await.unwrap();
        let broadcast = framing::encode_frame(message::lan_id::LAN_X, &[0x61, 0x01]);
        let result = framing::encode_frame(
            message::lan_id::LAN_X,
            &framing::xbus_with_checksum(vec![
                message::xbus_op::CV_RESULT,
                0x14,
                0x00,
                0x00,
                0x03,
            ]),
        );
        let mut datagram = broadcast;
        datagram.extend(result);
        device.send_to(&datagram, from2).await.unwrap();

        // absorb the auto re-enable-track-power frame the client sends
        // after a successful read.
        let _ = device.recv_from(&mut buf).await.unwrap();
    });

    let mut client = Z21Client::new(Z21Config::default());
    client.connect(device_addr).await.unwrap();

    let value = client.read_cv(1).await.unwrap();
    assert_eq!(value, 3);
    assert_eq!(client.track_power(), TrackPower::PowerOn);

    let events = client.drain_events();
    assert!(
        events.iter().any(|e| matches!(e, Event::TrackPower(TrackPower::PowerOn))),
        "expected the interleaved broadcast to have been observed: {events:?}"
    );

    device_task.await.unwrap();
}

#[tokio::test]
async fn test_read_cv_out_of_range_sends_no_frame() {
    let (device, device_addr) = spawn_fake_device().await;
    let device_task = tokio::spawn(async move {
        let mut buf = [0u8; 1472];
        let (_n, from) = device.recv_from(&mut buf).await.unwrap();
        device
            .send_to(&status_response_frame(), from)
            .await
            .unwrap();
        // nothing else should ever arrive.
        let result = tokio::time::timeout(std::time::Duration::from_millis(100), device.recv_from(&mut buf)).await;
        assert!(result.is_err(), "no frame should have been sent for an out-of-range CV");
    });

    let mut client = Z21Client::new(Z21Config::default());
    client.connect(device_addr).await.unwrap();

    let err = client.read_cv(0).await.unwrap_err();
    assert!(matches!(err, EngineError::CvOutOfRange(0)));
    let err = client.read_cv(1025).await.unwrap_err();
    assert!(matches!(err, EngineError::CvOutOfRange(1025)));

    device_task.await.unwrap();
}

#[tokio::test]
async fn test_disconnect_drops_detector_state_and_events() {
    let (device, device_addr) = spawn_fake_device().await;
    let device_task = tokio::spawn(async move {
        let mut buf = [0u8; 1472];
        let (_n, from) = device.recv_from(&mut buf).await.unwrap();
        device
            .send_to(&status_response_frame(), from)
            .await
            .unwrap();
    });

    let mut client = Z21Client::new(Z21Config::default());
    client.connect(device_addr).await.unwrap();
    device_task.await.unwrap();

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.drain_events().is_empty());
}
