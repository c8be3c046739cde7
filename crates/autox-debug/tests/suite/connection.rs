use autox_debug::{ClientEvent, ConfirmationOutcome, PausePhase};
use autox_debug_proto::{ClientMessage, Confirmation, DebugOp, ServerMessage, WireFormat};
use crossbeam_channel::RecvTimeoutError;

use crate::harness::{
    nested_flow, point, spawn_script, start_session, wait_for, wait_for_pause, TIMEOUT,
};

#[test]
fn enveloped_op_is_confirmed_twice() {
    let session = start_session(vec![point(8)], WireFormat::Json);
    let worker = spawn_script(&session.registry, "worker", nested_flow());
    let (point_id, _) = wait_for_pause(&session.client);

    let outcome = session
        .client
        .request(ClientMessage::DebugOp {
            point_id,
            correlation_id: "op-1".to_owned(),
            op: DebugOp::StepReturn,
        })
        .unwrap()
        .recv_timeout(TIMEOUT)
        .unwrap();
    assert!(matches!(
        outcome,
        ConfirmationOutcome::Confirmed(Confirmation { success: true, .. })
    ));

    // The point's own confirmation uses the message's correlation id.
    let confirmation = wait_for(&session.client, |message| match message {
        ServerMessage::Confirmation(confirmation) if confirmation.correlation_id == "op-1" => {
            Some(confirmation.clone())
        }
        _ => None,
    });
    assert!(confirmation.success);
    worker.join().unwrap().unwrap();
}

#[test]
fn unknown_point_requests_are_answered_with_failures() {
    let session = start_session(vec![point(8)], WireFormat::Json);

    session
        .client
        .send(ClientMessage::DebugOp {
            point_id: "lp-missing".to_owned(),
            correlation_id: "op-x".to_owned(),
            op: DebugOp::StepInto,
        })
        .unwrap();
    let confirmation = wait_for(&session.client, |message| match message {
        ServerMessage::Confirmation(confirmation) => Some(confirmation.clone()),
        _ => None,
    });
    assert_eq!(confirmation.correlation_id, "op-x");
    assert!(!confirmation.success);
}

#[test]
fn client_disconnect_releases_parked_threads() {
    let session = start_session(vec![point(8)], WireFormat::Json);
    let worker = spawn_script(&session.registry, "worker", nested_flow());
    let (point_id, _) = wait_for_pause(&session.client);
    let live = session.registry.live_point(&point_id).unwrap();
    assert_eq!(live.phase(), PausePhase::Paused);

    session.client.close();
    worker.join().unwrap().unwrap();

    assert_eq!(live.phase(), PausePhase::Released);
    assert!(session.registry.live_points().is_empty());
    assert!(session.registry.outbox().is_closed());

    // With no debugger attached the point no longer pauses.
    spawn_script(&session.registry, "after", nested_flow())
        .join()
        .unwrap()
        .unwrap();
}

#[test]
fn shutdown_releases_parked_threads_and_closes_the_client() {
    let session = start_session(vec![point(8)], WireFormat::Bincode);
    let worker = spawn_script(&session.registry, "worker", nested_flow());
    let (point_id, _) = wait_for_pause(&session.client);

    let registry = session.registry.clone();
    let client = session.client;
    session.connection.shutdown();
    worker.join().unwrap().unwrap();
    assert!(registry.live_point(&point_id).is_none());

    let released = wait_for(&client, |message| match message {
        ServerMessage::ExecutionReleased { point_id: id, op } if *id == point_id => Some(*op),
        _ => None,
    });
    assert_eq!(released, None);

    // The client eventually observes the disconnect.
    loop {
        match client.events().recv_timeout(TIMEOUT) {
            Ok(ClientEvent::Disconnected) => break,
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => panic!("client never saw the disconnect"),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
