//! Tests for the boot / resync handshake and device resets

mod common;

use common::*;
use pretty_assertions::assert_eq;
use steplink_core::protocol::{
    Boot, Connection, ConnectionState, HandshakeState, Notification, TransportError,
};

/// Peer that cold-boots on the first probe, acknowledges every frame, and
/// answers later probes with pongs echoing the nonce
fn warm_peer(first_flag: bool, nonce_xor: u8) -> ScriptedDevice {
    let mut booted = false;
    let mut flag = first_flag;
    ScriptedDevice::new().with_responder(move |written| {
        if written[0] != ID {
            return vec![ACK];
        }
        if !booted {
            booted = true;
            return vec![STARTUP];
        }
        let pong = frame(flag, PONG, &[written[1] ^ nonce_xor]);
        flag = !flag;
        pong
    })
}

fn probes(device: &ScriptedDevice) -> Vec<Vec<u8>> {
    device
        .writes
        .iter()
        .filter(|w| w.len() == 2 && w[0] == ID)
        .cloned()
        .collect()
}

#[test]
fn test_cold_boot() {
    let peer = ScriptedDevice::new().respond(&[STARTUP]);
    let mut conn = Connection::with_device(peer, test_config()).unwrap();

    assert_eq!(conn.handshake().unwrap(), Boot::Cold);

    assert_eq!(conn.state(), ConnectionState::Synchronized);
    assert_eq!(conn.handshake_state(), HandshakeState::Synchronized);
    assert!(!conn.link().out_flag);
    assert!(!conn.link().in_flag);
    let writes = &device(&conn).writes;
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0][0], ID);
    assert!(writes[0][1] < 0x80);
}

#[test]
fn test_debug_text_before_startup() {
    let peer = ScriptedDevice::new().respond(&[DEBUG, b'b', b'o', b'o', b't', 0, STARTUP]);
    let mut conn = Connection::with_device(peer, test_config()).unwrap();

    assert_eq!(conn.handshake().unwrap(), Boot::Cold);
    assert_eq!(conn.stats().debug_lines, 1);
}

#[test]
fn test_leftover_notification_ignored_while_probing() {
    let mut response = frame(false, MOVE_COMPLETE, &[5]);
    response.push(STARTUP);
    let peer = ScriptedDevice::new().respond(&response);
    let mut conn = Connection::with_device(peer, test_config()).unwrap();

    assert_eq!(conn.handshake().unwrap(), Boot::Cold);

    assert_eq!(conn.outstanding_moves(), 0);
    assert_eq!(device(&conn).control_writes(ACK), 1);
}

#[test]
fn test_warm_reconnect_keeps_flags() {
    let mut conn = Connection::with_device(warm_peer(false, 0), test_config()).unwrap();
    assert_eq!(conn.handshake().unwrap(), Boot::Cold);
    conn.send(0x05, &[0x01]).unwrap();
    assert!(conn.link().out_flag);
    device_mut(&mut conn).clear_writes();

    assert_eq!(conn.handshake().unwrap(), Boot::Warm);

    assert_eq!(conn.state(), ConnectionState::Synchronized);
    assert_eq!(conn.handshake_state(), HandshakeState::Synchronized);
    assert!(conn.link().out_flag);
    // Three pongs accepted, flags false, true, false
    assert!(conn.link().in_flag);
    assert_eq!(probes(device(&conn)).len(), 3);
    assert_eq!(device(&conn).control_writes(ACK), 3);
}

#[test]
fn test_stale_pong_flag_recovers() {
    let mut conn = Connection::with_device(warm_peer(true, 0), test_config()).unwrap();
    assert_eq!(conn.handshake().unwrap(), Boot::Cold);
    device_mut(&mut conn).clear_writes();

    // First pong carries the wrong flag: acknowledged as a duplicate, not counted
    assert_eq!(conn.handshake().unwrap(), Boot::Warm);

    assert_eq!(probes(device(&conn)).len(), 4);
    assert_eq!(conn.stats().duplicates, 1);
}

#[test]
fn test_wrong_nonce_never_syncs() {
    let mut conn = Connection::with_device(warm_peer(false, 0x01), test_config()).unwrap();
    assert_eq!(conn.handshake().unwrap(), Boot::Cold);
    let mut pending = conn.wait_for(|_| true);

    let err = conn.handshake().unwrap_err();

    assert!(matches!(err, TransportError::HandshakeFailed { attempts: 4 }));
    assert_eq!(conn.state(), ConnectionState::Error);
    assert!(matches!(
        pending.try_recv().unwrap(),
        Err(TransportError::LinkClosed)
    ));
    assert!(matches!(
        conn.send(0x05, &[]),
        Err(TransportError::LinkClosed)
    ));
}

#[test]
fn test_silent_device_fails_handshake() {
    let mut conn = Connection::with_device(ScriptedDevice::new(), test_config()).unwrap();

    assert!(matches!(
        conn.handshake(),
        Err(TransportError::HandshakeFailed { attempts: 4 })
    ));
    assert_eq!(probes(device(&conn)).len(), 4);
}

#[test]
fn test_hard_reset_pulses_dtr() {
    let mut conn = connected(ScriptedDevice::new().respond(&[ACK]).respond(&[STARTUP]));
    conn.call_queued(0x20, &[]).unwrap();
    conn.arm_temp_alarm(2);
    let mut pending = conn.wait_for(Notification::is_move_complete);

    assert_eq!(conn.hard_reset().unwrap(), Boot::Cold);

    assert_eq!(device(&conn).dtr, vec![false, true]);
    assert_eq!(conn.outstanding_moves(), 0);
    assert!(conn.link().pending_alarm_channels.is_empty());
    assert!(!conn.link().out_flag);
    assert!(matches!(
        pending.try_recv().unwrap(),
        Err(TransportError::DeviceReset)
    ));
}

#[test]
fn test_soft_reset() {
    let mut conn = connected(
        ScriptedDevice::new()
            .respond(&[ACK])
            .respond(&[ACK_RESET])
            .respond(&[STARTUP]),
    );
    conn.send(0x05, &[]).unwrap();
    device_mut(&mut conn).clear_writes();

    assert_eq!(conn.soft_reset().unwrap(), Boot::Cold);

    let writes = &device(&conn).writes;
    assert_eq!(writes[0], vec![RESET]);
    assert_eq!(writes[1][0], ID);
    assert!(!conn.link().out_flag);
    assert_eq!(conn.state(), ConnectionState::Synchronized);
}

#[test]
fn test_soft_reset_unanswered() {
    let mut conn = connected(ScriptedDevice::new());

    assert!(matches!(
        conn.soft_reset(),
        Err(TransportError::LinkDead { attempts: 4 })
    ));
    assert_eq!(conn.state(), ConnectionState::Error);
}

#[test]
fn test_handshake_after_disconnect() {
    let mut conn = connected(ScriptedDevice::new());
    assert!(conn.disconnect().is_some());

    assert!(matches!(conn.handshake(), Err(TransportError::NotConnected)));
    assert!(matches!(conn.hard_reset(), Err(TransportError::NotConnected)));
    assert!(matches!(conn.soft_reset(), Err(TransportError::NotConnected)));
}

#[test]
fn test_stale_reply_ahead_of_first_pong() {
    let mut booted = false;
    let mut first = true;
    let mut flag = false;
    let peer = ScriptedDevice::new().with_responder(move |written| {
        if written[0] != ID {
            return vec![ACK];
        }
        if !booted {
            booted = true;
            return vec![STARTUP];
        }
        if first {
            // Reply left over from before the host restarted
            first = false;
            let mut bytes = frame(false, 0x50, &[1]);
            bytes.extend(frame(true, PONG, &[written[1]]));
            return bytes;
        }
        let pong = frame(flag, PONG, &[written[1]]);
        flag = !flag;
        pong
    });
    let mut conn = Connection::with_device(peer, test_config()).unwrap();
    assert_eq!(conn.handshake().unwrap(), Boot::Cold);
    device_mut(&mut conn).clear_writes();

    assert_eq!(conn.handshake().unwrap(), Boot::Warm);

    assert_eq!(probes(device(&conn)).len(), 3);
    assert_eq!(device(&conn).control_writes(ACK), 4);
    assert_eq!(conn.state(), ConnectionState::Synchronized);
}
