use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use astrolink_core::protocol::ascii::{format_dms, format_hms, parse_dms, parse_hms, scan_fixed_field};
use astrolink_core::protocol::binary::{decode_digits, encode_digits};
use astrolink_core::protocol::{
    open_tcp_transport, AsciiCommand, BinaryCommand, MockTransport, ProtocolError, QueryEngine,
    ReplyShape, Transport,
};
use pretty_assertions::assert_eq;

#[test]
fn test_ascii_command_framing() {
    let cmd = AsciiCommand::new("X16").digits(501000, 6).unwrap();
    assert_eq!(cmd.to_string(), ":X16501000#");

    let cmd = AsciiCommand::new("X1C")
        .digits(750, 4)
        .unwrap()
        .text("*")
        .digits(10, 2)
        .unwrap();
    assert_eq!(cmd.to_bytes(), b":X1C0750*10#".to_vec());

    assert!(AsciiCommand::new("X16").digits(1_000_000, 6).is_err());
    assert!(AsciiCommand::new("X16").digits(-1, 6).is_err());
}

#[test]
fn test_fixed_field_scan() {
    assert_eq!(scan_fixed_field(b"AX1=0500123", 4, 7).unwrap(), 500123);
    assert!(matches!(
        scan_fixed_field(b"AX1=05", 4, 7),
        Err(ProtocolError::Malformed(_))
    ));
}

#[test]
fn test_sexagesimal_values() {
    assert!((parse_hms(b"05:30:00").unwrap() - 5.5).abs() < 1e-9);
    assert!((parse_dms(b"-10*15:00").unwrap() + 10.25).abs() < 1e-9);
    assert!(parse_hms(b"25:00:00").is_err());
    assert_eq!(format_hms(5.5), "05:30:00");
    assert_eq!(format_dms(-10.25), "-10*15:00");
    assert_eq!(format_dms(0.0), "+00*00:00");
}

#[test]
fn test_digit_payload_layout() {
    assert_eq!(encode_digits(5000).unwrap(), [0, 0, 0, 5]);
    assert_eq!(encode_digits(12345).unwrap(), [5, 4, 3, 12]);
    assert_eq!(decode_digits(&[5, 4, 3, 12]).unwrap(), 12345);
    assert!(encode_digits(256_000).is_err());
    assert!(decode_digits(&[10, 0, 0, 0]).is_err());
    assert!(decode_digits(&[1, 2, 3]).is_err());
}

#[test]
fn test_binary_reply_checks_opcode_echo() {
    let mock = MockTransport::new();
    mock.expect(vec![0x8d], vec![0x8d, 0x88, 0x13])
        .expect(vec![0x8d], vec![0x84, 0x88, 0x13]);
    let mut engine = QueryEngine::new(mock);
    let cmd = BinaryCommand::new(0x8d);

    let reply = engine.request_binary(&cmd, 3).unwrap();
    assert_eq!(reply.u16_le(1).unwrap(), 5000);

    let err = engine.request_binary(&cmd, 3).unwrap_err();
    assert!(err.is_protocol_fault());
}

#[test]
fn test_short_reply_is_a_timeout() {
    let mock = MockTransport::new();
    mock.expect(":X0BAUX1AS#", "AX1=05");
    let mut engine = QueryEngine::with_timeout(mock, Duration::from_millis(20));

    let err = engine
        .query_ascii(&AsciiCommand::new("X0BAUX1AS"), ReplyShape::HASH)
        .unwrap_err();
    match err {
        ProtocolError::Timeout {
            received,
            waited_ms,
            ..
        } => {
            assert_eq!(received, 6);
            assert_eq!(waited_ms, 20);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[test]
fn test_stale_bytes_do_not_leak_into_the_next_reply() {
    let mock = MockTransport::new();
    mock.expect(":GR#", "05:30:00#");
    mock.inject("12:00:00#");
    let mut engine = QueryEngine::new(mock);

    let reply = engine
        .query_ascii(&AsciiCommand::new("GR"), ReplyShape::HASH)
        .unwrap();
    assert_eq!(reply, b"05:30:00".to_vec());
}

#[test]
fn test_tcp_bridge_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let bridge = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut request = [0u8; 5];
        stream.read_exact(&mut request).unwrap();
        assert_eq!(&request, b":GVP#");
        stream.write_all(b"Avalon StarGo#").unwrap();
    });

    let mut transport = open_tcp_transport(&addr).unwrap();
    transport.write_all(b":GVP#").unwrap();
    let reply = transport
        .read_until(b'#', Duration::from_secs(2))
        .unwrap();
    assert_eq!(reply, b"Avalon StarGo".to_vec());
    bridge.join().unwrap();
}
