//! Tests for the in-process connection.

use super::*;

/// Verify that flow frames reach the client.
#[test]
fn test_flow_forwarded() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let connection = LocalConnection::new(None, true, tx);

    connection.output().write_flow(ChannelId::new(2), false);

    match rx.try_recv() {
        Ok(ClientEvent::Flow { channel, active }) => {
            assert_eq!(channel, ChannelId::new(2));
            assert!(!active);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

/// Verify that output survives a closed client.
#[test]
fn test_closed_receiver() {
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = LocalConnection::new(None, true, tx);
    drop(rx);

    connection.output().write_flow(ChannelId::new(1), true);
}

/// Verify that the first close wins.
#[test]
fn test_close_once() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let connection = LocalConnection::new(Some("soak".to_string()), false, tx);

    assert_eq!(connection.authorized_principal().as_deref(), Some("soak"));
    assert!(!connection.close_when_no_route());
    assert!(!connection.is_closing());

    connection.close(ReplyCode::ResourceError, "Idle transaction timed out");
    connection.close(ReplyCode::InternalError, "later");

    assert!(connection.is_closing());
    assert_eq!(
        connection.close_reason(),
        Some((ReplyCode::ResourceError, "Idle transaction timed out".to_string()))
    );
}

/// Verify that activity moves the last received time forward.
#[test]
fn test_touch() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let connection = LocalConnection::new(None, true, tx);
    let before = connection.last_received_time();

    std::thread::sleep(std::time::Duration::from_millis(5));
    connection.touch();

    assert!(connection.last_received_time() > before);
}
