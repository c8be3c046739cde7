use autox_debug_proto::{DebugOp, WireFormat};
use pretty_assertions::assert_eq;

use crate::harness::{drive_flow, nested_flow, point, start_session};

#[test]
fn step_over_skips_nested_locations() {
    let session = start_session(vec![point(8)], WireFormat::Json);
    let lines = drive_flow(&session, nested_flow(), DebugOp::StepOver);
    assert_eq!(lines, vec![8, 9, 10, 11]);
    assert!(session.registry.live_points().is_empty());
}

#[test]
fn step_into_pauses_at_every_location() {
    let session = start_session(vec![point(8)], WireFormat::Json);
    let lines = drive_flow(&session, nested_flow(), DebugOp::StepInto);
    assert_eq!(lines, vec![8, 9, 10, 20, 21, 11]);
}

#[test]
fn step_return_runs_to_the_next_debug_point() {
    let session = start_session(vec![point(8), point(20)], WireFormat::Json);
    let lines = drive_flow(&session, nested_flow(), DebugOp::StepReturn);
    assert_eq!(lines, vec![8, 20]);
}

#[test]
fn step_over_from_a_call_pauses_after_it_returns() {
    let session = start_session(vec![point(10)], WireFormat::Bincode);
    let lines = drive_flow(&session, nested_flow(), DebugOp::StepOver);
    assert_eq!(lines, vec![10, 11]);
}
