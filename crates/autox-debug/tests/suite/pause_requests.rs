use autox_debug::PausePhase;
use autox_debug_proto::{
    ClientMessage, DebugOp, ServerMessage, WireFormat, NOT_SERIALIZABLE_VALUE,
};
use pretty_assertions::assert_eq;

use crate::harness::{
    nested_flow, point, send_op, spawn_script, start_session, wait_for, wait_for_pause,
};

#[test]
fn evaluation_keeps_the_thread_paused_and_other_threads_still_pause() {
    let session = start_session(vec![point(8)], WireFormat::Json);
    let first = spawn_script(&session.registry, "worker-a", nested_flow());
    let (first_id, line) = wait_for_pause(&session.client);
    assert_eq!(line, 8);

    session
        .client
        .send(ClientMessage::EvaluateExpression {
            point_id: first_id.clone(),
            correlation_id: "corr1".to_owned(),
            expression: "1+1".to_owned(),
        })
        .unwrap();
    let value = wait_for(&session.client, |message| match message {
        ServerMessage::EvaluationResult {
            correlation_id,
            success: true,
            value,
            ..
        } if correlation_id == "corr1" => value.clone(),
        _ => None,
    });
    assert_eq!(value, "2");

    let live = session.registry.live_point(&first_id).unwrap();
    assert_eq!(live.phase(), PausePhase::Paused);

    // A second interpreter thread hits the same point while the first is still parked.
    let second = spawn_script(&session.registry, "worker-b", nested_flow());
    let (second_id, line) = wait_for_pause(&session.client);
    assert_eq!(line, 8);
    assert_ne!(first_id, second_id);
    assert_eq!(session.registry.live_points().len(), 2);

    send_op(&session.client, &first_id, DebugOp::StepReturn);
    first.join().unwrap().unwrap();
    assert_eq!(
        session.registry.live_point(&second_id).unwrap().phase(),
        PausePhase::Paused
    );

    send_op(&session.client, &second_id, DebugOp::StepReturn);
    second.join().unwrap().unwrap();
    assert!(session.registry.live_points().is_empty());
}

#[test]
fn another_thread_pauses_at_a_point_already_stepped_out_of() {
    let session = start_session(vec![point(8)], WireFormat::Json);
    let first = spawn_script(&session.registry, "worker-a", nested_flow());
    let (first_id, line) = wait_for_pause(&session.client);
    assert_eq!(line, 8);

    send_op(&session.client, &first_id, DebugOp::StepReturn);
    let released = wait_for(&session.client, |message| match message {
        ServerMessage::ExecutionReleased { point_id, op } if *point_id == first_id => Some(*op),
        _ => None,
    });
    assert_eq!(released, Some(DebugOp::StepReturn));
    first.join().unwrap().unwrap();
    assert!(session.registry.live_points().is_empty());

    let second = spawn_script(&session.registry, "worker-b", nested_flow());
    let (second_id, line) = wait_for_pause(&session.client);
    assert_eq!(line, 8);
    assert_ne!(first_id, second_id);
    assert_eq!(
        session.registry.live_point(&second_id).unwrap().phase(),
        PausePhase::Paused
    );

    send_op(&session.client, &second_id, DebugOp::StepReturn);
    second.join().unwrap().unwrap();
}

#[test]
fn pause_notification_carries_stack_and_context() {
    let session = start_session(vec![point(20)], WireFormat::Json);
    let worker = spawn_script(&session.registry, "worker", nested_flow());

    let (point_id, call_stack, context) = wait_for(&session.client, |message| match message {
        ServerMessage::ExecutionPaused {
            point_id,
            call_stack,
            context,
            ..
        } => Some((point_id.clone(), call_stack.clone(), context.clone())),
        _ => None,
    });
    assert_eq!(call_stack.len(), 1);
    assert_eq!(call_stack[0].line, 10);
    assert_eq!(context["user"], r#"{"name":"autox"}"#);
    assert_eq!(context["connection"], NOT_SERIALIZABLE_VALUE);

    send_op(&session.client, &point_id, DebugOp::StepReturn);
    worker.join().unwrap().unwrap();
}

#[test]
fn ad_hoc_steps_report_success_and_failure() {
    let session = start_session(vec![point(8)], WireFormat::Json);
    let worker = spawn_script(&session.registry, "worker", nested_flow());
    let (point_id, _) = wait_for_pause(&session.client);

    for (correlation_id, steps) in [("ok", "<log message=\"hi\"/>"), ("bad", "<fail/>")] {
        session
            .client
            .send(ClientMessage::ExecuteSteps {
                point_id: point_id.clone(),
                correlation_id: correlation_id.to_owned(),
                steps: steps.to_owned(),
            })
            .unwrap();
    }

    let ok = wait_for(&session.client, |message| match message {
        ServerMessage::StepExecuted {
            correlation_id,
            success,
            context,
            ..
        } if correlation_id == "ok" => Some((*success, context.is_some())),
        _ => None,
    });
    assert_eq!(ok, (true, true));

    let bad = wait_for(&session.client, |message| match message {
        ServerMessage::StepExecuted {
            correlation_id,
            success,
            error,
            ..
        } if correlation_id == "bad" => Some((*success, error.clone().unwrap_or_default())),
        _ => None,
    });
    assert!(!bad.0);
    assert!(bad.1.contains("failed"), "{}", bad.1);

    send_op(&session.client, &point_id, DebugOp::StepReturn);
    worker.join().unwrap().unwrap();
}

#[test]
fn requests_after_step_return_are_refused() {
    let session = start_session(vec![point(8)], WireFormat::Json);
    let worker = spawn_script(&session.registry, "worker", nested_flow());
    let (point_id, _) = wait_for_pause(&session.client);

    send_op(&session.client, &point_id, DebugOp::StepReturn);
    worker.join().unwrap().unwrap();

    session
        .client
        .send(ClientMessage::EvaluateExpression {
            point_id: point_id.clone(),
            correlation_id: "late".to_owned(),
            expression: "1+1".to_owned(),
        })
        .unwrap();
    let result = wait_for(&session.client, |message| match message {
        ServerMessage::EvaluationResult {
            correlation_id,
            success,
            error,
            ..
        } if correlation_id == "late" => Some((*success, error.clone())),
        _ => None,
    });
    assert!(!result.0);
    assert!(result.1.is_some());
}
