use std::io::BufReader;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use autox_debug::{
    ClientOptions, ConfirmationOutcome, DebugClient, DebugError, DebugPointRegistry, DebugServer,
};
use autox_debug_proto::codec::{read_frame, write_frame, write_raw_frame};
use autox_debug_proto::{
    ClientFrame, ClientMessage, Confirmation, Handshake, MessageEnvelope, ServerFrame,
    ServerMessage, WireFormat, PROTOCOL_VERSION,
};
use pretty_assertions::assert_eq;

use crate::harness::{loc, point, server_config, ScriptHost, TIMEOUT};

#[test]
fn rejected_handshake_can_be_retried_on_the_same_connection() {
    let registry = DebugPointRegistry::new(Arc::new(ScriptHost));
    let config = server_config(WireFormat::Json);
    let server = DebugServer::bind_addr("127.0.0.1:0", config.clone(), registry.clone()).unwrap();
    let addr = server.local_addr().unwrap();
    let server = thread::spawn(move || server.start());

    let client = DebugClient::connect(addr, &ClientOptions::from_config(&config)).unwrap();

    let rejected = client
        .request(ClientMessage::Handshake(Handshake {
            protocol_version: PROTOCOL_VERSION + 1,
            debug_points: vec![point(8)],
        }))
        .unwrap()
        .recv_timeout(TIMEOUT)
        .unwrap();
    let confirmation = match rejected {
        ConfirmationOutcome::Confirmed(confirmation) => confirmation,
        other => panic!("expected a confirmation, got {other:?}"),
    };
    assert!(!confirmation.success);
    assert!(!registry.is_point(&loc(8)));
    assert!(!server.is_finished());

    let accepted = client
        .request(ClientMessage::Handshake(Handshake::new(vec![point(8)])))
        .unwrap()
        .recv_timeout(TIMEOUT)
        .unwrap();
    assert!(matches!(
        accepted,
        ConfirmationOutcome::Confirmed(ref confirmation) if confirmation.success
    ));

    let connection = server.join().unwrap().unwrap();
    assert!(registry.is_point(&loc(8)));
    assert!(connection.is_connected());
}

#[test]
fn undecodable_frame_is_skipped_and_the_next_frame_is_handled() {
    let registry = DebugPointRegistry::new(Arc::new(ScriptHost));
    let config = server_config(WireFormat::Json);
    let server = DebugServer::bind_addr("127.0.0.1:0", config, registry.clone()).unwrap();
    let addr = server.local_addr().unwrap();
    let server = thread::spawn(move || server.start());

    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut writer = stream.try_clone().unwrap();

    // Well-framed, but the body is not a client message.
    write_raw_frame(&mut writer, WireFormat::Json, br#"{"handshake": 17"#).unwrap();
    let handshake = ClientFrame::Envelope(MessageEnvelope::new(
        "h-1",
        true,
        ClientMessage::Handshake(Handshake::new(vec![point(8)])),
    ));
    write_frame(&mut writer, WireFormat::Json, &handshake).unwrap();

    let connection = server.join().unwrap().unwrap();
    assert!(registry.is_point(&loc(8)));
    assert!(connection.is_connected());

    let mut reader = BufReader::new(stream);
    let frame: ServerFrame = read_frame(&mut reader, WireFormat::Json).unwrap().unwrap();
    assert_eq!(
        frame,
        ServerFrame::Batch(vec![ServerMessage::Confirmation(Confirmation::success(
            "h-1"
        ))])
    );
}

#[test]
fn start_fails_when_the_client_leaves_before_handshaking() {
    let registry = DebugPointRegistry::new(Arc::new(ScriptHost));
    let config = server_config(WireFormat::Json);
    let server = DebugServer::bind_addr("127.0.0.1:0", config.clone(), registry).unwrap();
    let addr = server.local_addr().unwrap();
    let server = thread::spawn(move || server.start());

    let client = DebugClient::connect(addr, &ClientOptions::from_config(&config)).unwrap();
    thread::sleep(Duration::from_millis(50));
    client.close();

    let result = server.join().unwrap();
    assert!(matches!(result, Err(DebugError::HandshakeAborted)));
}

#[test]
fn connect_gives_up_after_the_timeout() {
    // Grab a free port, then release it so nothing is listening there.
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let options = ClientOptions {
        format: WireFormat::Json,
        connect_timeout: Duration::from_millis(100),
        connect_retry: Duration::from_millis(20),
    };
    let result = DebugClient::connect(addr, &options);
    assert!(matches!(result, Err(DebugError::ConnectTimeout(_))));
}
