mod common;

use common::{at_line, engine, expect_stop, hooked_engine, WAIT};
use gdbridge_core::gdb::mock::MockGdb;
use gdbridge_core::{
    BoundBreakpoint, BoundState, BreakpointLocation, BreakpointRequest, Condition, Engine, EngineError, EngineEvent,
    PassCount, PendingState,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn launched() -> (Engine, Arc<MockGdb>) {
    let (engine, gdb) = engine();
    engine.launch_suspended("exe=/tmp/app").expect("Launch failed");
    (engine, gdb)
}

#[test]
fn test_only_source_and_function_locations_bind() {
    let (engine, gdb) = engine();
    let early = engine.create_pending_breakpoint(at_line(10)).unwrap();
    assert!(!early.can_bind());
    assert!(matches!(engine.bind_breakpoint(&early), Err(EngineError::NotBound)));

    engine.launch_suspended("exe=/tmp/app").unwrap();
    for location in [
        BreakpointLocation::Address(0x4000),
        BreakpointLocation::Context("ctx".to_string()),
        BreakpointLocation::Data { expression: "x".to_string() },
    ] {
        let pending = engine.create_pending_breakpoint(BreakpointRequest::new(location)).unwrap();
        assert!(matches!(engine.bind_breakpoint(&pending), Err(EngineError::NotBound)));
        assert!(!engine.breakpoint_state(&pending).bound);
    }
    assert_eq!(gdb.count_commands("-break-insert"), 0);
    assert!(engine.bind_breakpoint(&early).is_ok());
}

#[test]
fn test_function_breakpoint_resolution() {
    let (engine, gdb) = launched();
    gdb.define_function("worker", "worker.c", 40);
    let pending = engine
        .create_pending_breakpoint(BreakpointRequest::new(BreakpointLocation::function("worker", 2)))
        .unwrap();
    let bound = engine.bind_breakpoint(&pending).expect("Bind failed");
    let resolution = bound.resolution().expect("No resolution");
    assert_eq!(resolution.file, "worker.c");
    assert_eq!(resolution.line, 42);
    assert_eq!(resolution.address, 0x40_0000 + 42 * 4);

    let missing = engine
        .create_pending_breakpoint(BreakpointRequest::new(BreakpointLocation::function("nowhere", 0)))
        .unwrap();
    assert!(matches!(engine.bind_breakpoint(&missing), Err(EngineError::NotBound)));
}

#[test]
fn test_binding_twice_returns_same_breakpoint() {
    let (engine, gdb) = launched();
    let pending = engine.create_pending_breakpoint(at_line(10)).unwrap();
    let first = engine.bind_breakpoint(&pending).unwrap();
    let second = engine.bind_breakpoint(&pending).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(gdb.breakpoint_count(), 1);
    assert!(Arc::ptr_eq(&first.pending_breakpoint().unwrap(), &pending));
}

#[test]
fn test_disabled_request_binds_disabled() {
    let (engine, gdb) = launched();
    let pending = engine.create_pending_breakpoint(at_line(10).disabled()).unwrap();
    let bound = engine.bind_breakpoint(&pending).unwrap();
    assert_eq!(bound.state(), BoundState::Disabled);
    assert!(!gdb.breakpoint(1).unwrap().enabled);

    engine.enable_breakpoint(&pending, true).unwrap();
    assert_eq!(bound.state(), BoundState::Active);
    assert_eq!(engine.breakpoint_state(&pending).state, PendingState::Enabled);
    assert!(gdb.breakpoint(1).unwrap().enabled);
}

#[test]
fn test_delete_cascades_to_bound() {
    let (engine, gdb) = launched();
    let first = engine.create_pending_breakpoint(at_line(10)).unwrap();
    let second = engine.create_pending_breakpoint(at_line(20)).unwrap();
    let first_bound = engine.bind_breakpoint(&first).unwrap();
    let second_bound = engine.bind_breakpoint(&second).unwrap();
    assert_eq!(engine.registry().len(), 2);

    engine.delete_breakpoint(&first).unwrap();
    assert_eq!(first_bound.state(), BoundState::Deleted);
    assert_eq!(engine.breakpoint_state(&first).state, PendingState::Deleted);
    assert!(first.enum_bound_breakpoints().is_empty());
    assert!(matches!(engine.enable_breakpoint(&first, false), Err(EngineError::Deleted)));
    assert!(matches!(engine.hit_count(&first_bound), Err(EngineError::Deleted)));

    // The other breakpoint is untouched
    assert_eq!(second_bound.state(), BoundState::Active);
    assert_eq!(engine.registry().len(), 1);
    assert_eq!(gdb.breakpoint_count(), 1);
    assert!(gdb.breakpoint(2).is_some());
    assert!(engine.registry().find_by_gdb_id(1).is_none());
}

#[test]
fn test_registry_reuses_lowest_free_index() {
    let (engine, _gdb) = launched();
    let pendings: Vec<_> = (0..3).map(|i| engine.create_pending_breakpoint(at_line(10 + i)).unwrap()).collect();
    let ids: Vec<i32> = pendings.iter().map(|p| engine.bind_breakpoint(p).unwrap().remote_id()).collect();
    assert_eq!(ids, vec![0, 1, 2]);

    engine.delete_breakpoint(&pendings[1]).unwrap();
    assert!(engine.registry().find_by_remote_id(1).is_none());

    let replacement = engine.create_pending_breakpoint(at_line(30)).unwrap();
    let bound = engine.bind_breakpoint(&replacement).unwrap();
    assert_eq!(bound.remote_id(), 1);
    assert_eq!(bound.gdb_id(), Some(4));
    assert!(Arc::ptr_eq(&engine.registry().find_by_remote_id(1).unwrap(), &bound));
}

#[test]
fn test_delete_survives_gdb_failure() {
    let (engine, gdb) = launched();
    let pending = engine.create_pending_breakpoint(at_line(10)).unwrap();
    let bound = engine.bind_breakpoint(&pending).unwrap();

    gdb.fail_on("-break-delete");
    engine.delete_breakpoint(&pending).expect("Local delete must succeed");
    assert!(bound.is_deleted());
    assert!(engine.registry().is_empty());
}

#[test]
fn test_set_hit_count_rearms_ignore() {
    let (engine, gdb) = launched();
    let pending = engine.create_pending_breakpoint(at_line(10).with_pass_count(PassCount::Modulo(4))).unwrap();
    let bound = engine.bind_breakpoint(&pending).unwrap();
    assert_eq!(gdb.breakpoint(1).unwrap().ignore, 3);

    engine.set_hit_count(&bound, 6).unwrap();
    assert_eq!(engine.hit_count(&bound).unwrap(), 6);
    assert_eq!(bound.ignore_count(), 2);
    assert_eq!(gdb.breakpoint(1).unwrap().ignore, 1);
}

fn watching_with_pass_count(engine: &Engine, pass_count: PassCount) -> Arc<BoundBreakpoint> {
    let request = at_line(10).with_pass_count(pass_count).with_condition(Condition::WhenChanged("x".to_string()));
    let pending = engine.create_pending_breakpoint(request).unwrap();
    engine.bind_breakpoint(&pending).expect("Bind failed")
}

#[test]
fn test_leaving_when_changed_restores_pass_count() {
    let (engine, gdb) = launched();
    let bound = watching_with_pass_count(&engine, PassCount::Equal(3));
    // Watching stops on every crossing
    assert_eq!(gdb.breakpoint(1).unwrap().ignore, 0);
    assert_eq!(gdb.breakpoint(1).unwrap().condition, None);

    engine.set_condition(&bound, Condition::None).unwrap();
    assert_eq!(bound.condition(), Condition::None);
    assert_eq!(bound.ignore_count(), 3);
    assert_eq!(gdb.breakpoint(1).unwrap().ignore, 2);
}

#[test]
fn test_pass_count_deferred_while_watching_for_changes() {
    let (engine, gdb) = launched();
    let bound = watching_with_pass_count(&engine, PassCount::None);
    let armed = gdb.count_commands("-break-after");

    engine.set_pass_count(&bound, PassCount::Equal(5)).unwrap();
    assert_eq!(bound.pass_count(), PassCount::Equal(5));
    assert_eq!(gdb.count_commands("-break-after"), armed);
    assert_eq!(gdb.breakpoint(1).unwrap().ignore, 0);

    // Applied once the breakpoint stops watching
    engine.set_condition(&bound, Condition::WhenTrue("x > 3".to_string())).unwrap();
    assert_eq!(gdb.breakpoint(1).unwrap().ignore, 4);
    assert_eq!(gdb.breakpoint(1).unwrap().condition.as_deref(), Some("x > 3"));
}

#[tokio::test]
async fn test_hit_waits_for_edit_in_progress() {
    let slow = Arc::new(AtomicBool::new(false));
    let (engine, gdb) = {
        let slow = Arc::clone(&slow);
        // Delays `-break-after` while `slow` is set, so an edit stays in flight
        hooked_engine(move |command, _| {
            if command.starts_with("-break-after") && slow.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(300));
            }
            None
        })
    };
    let engine = Arc::new(engine);
    let mut rx = engine.subscribe();

    // 1. Stop at the breakpoint once
    engine.launch_suspended("exe=/tmp/app").unwrap();
    let pending = engine.create_pending_breakpoint(at_line(10)).unwrap();
    engine.resume_process().unwrap();
    let bound = pending.enum_bound_breakpoints().pop().unwrap();
    assert!(gdb.hit_breakpoint(1, 1));
    assert_eq!(
        expect_stop(&mut rx).await,
        EngineEvent::BreakpointHit { gdb_id: 1, thread_id: Some(1), hit_count: 1 }
    );

    // 2. Start a slow pass-count edit
    slow.store(true, Ordering::SeqCst);
    let editor = {
        let engine = Arc::clone(&engine);
        let bound = Arc::clone(&bound);
        thread::spawn(move || engine.set_pass_count(&bound, PassCount::Equal(5)))
    };
    assert!(common::eventually(|| bound.edit_in_progress().0));

    // 3. A crossing reported mid-edit is not counted until the edit finishes
    assert!(gdb.hit_breakpoint(1, 1));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(bound.hit_count(), 1);

    editor.join().expect("Editor panicked").expect("Edit failed");
    assert!(gdb.wait_for_running(true, WAIT));
    assert!(common::eventually(|| bound.hit_count() == 2));
    assert_eq!(bound.pass_count(), PassCount::Equal(5));
    assert_eq!(bound.edit_in_progress(), (false, false));
    // Re-armed after the counted hit: 5 - 2 = 3, so skip two crossings
    assert_eq!(gdb.breakpoint(1).unwrap().ignore, 2);
}
