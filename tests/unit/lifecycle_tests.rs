//! Critical-section deferral of client control requests.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gridvisor::runtime::{ExitReason, LifecycleState, RuntimeOptions};
use gridvisor::wire::ControlMessage;

use super::test_helpers::{attached, fast_config, owner_options, tick};

fn send(client: &gridvisor::channel::ClientChannels, request: ControlMessage) {
    assert!(client.process_control.send(request.as_wire()));
}

#[test]
fn suspend_outside_critical_section_applies_on_next_tick() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, client) = attached(fast_config(dir.path()), owner_options());

    send(&client, ControlMessage::Suspend);
    tick(&ctx, 1);
    assert!(ctx.status().suspended);
    assert_eq!(ctx.lifecycle_state(), LifecycleState::Suspended);

    send(&client, ControlMessage::Resume);
    tick(&ctx, 1);
    assert!(!ctx.status().suspended);
    assert_eq!(ctx.lifecycle_state(), LifecycleState::Running);
}

#[test]
fn suspend_inside_critical_section_waits_for_leave() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, client) = attached(fast_config(dir.path()), owner_options());

    ctx.enter_critical_section();
    send(&client, ControlMessage::Suspend);
    tick(&ctx, 1);
    assert!(!ctx.status().suspended);
    assert_eq!(ctx.lifecycle_state(), LifecycleState::CheckpointPending);

    ctx.leave_critical_section();
    assert!(ctx.status().suspended);
    assert_eq!(ctx.critical_section_depth(), 0);
}

#[test]
fn nested_sections_defer_until_outermost_leave() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, client) = attached(fast_config(dir.path()), owner_options());

    ctx.enter_critical_section();
    ctx.enter_critical_section();
    send(&client, ControlMessage::Quit);
    tick(&ctx, 1);

    ctx.leave_critical_section();
    assert_eq!(ctx.exit_reason(), None);
    ctx.leave_critical_section();
    assert_eq!(ctx.exit_reason(), Some(ExitReason::Quit));
    assert!(ctx.status().quit_requested);
    assert_eq!(ctx.lifecycle_state(), LifecycleState::Quitting);
}

#[test]
fn duplicate_deferred_quit_runs_exit_hook_once() {
    let dir = tempfile::tempdir().unwrap();
    let options = RuntimeOptions {
        direct_process_action: true,
        ..owner_options()
    };
    let (ctx, client) = attached(fast_config(dir.path()), options);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    ctx.set_exit_hook(Arc::new(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    }));

    ctx.enter_critical_section();
    for _ in 0..3 {
        send(&client, ControlMessage::Quit);
        tick(&ctx, 1);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    ctx.leave_critical_section();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    ctx.enter_critical_section();
    ctx.leave_critical_section();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn deferred_abort_wins_over_deferred_quit() {
    let dir = tempfile::tempdir().unwrap();
    let options = RuntimeOptions {
        direct_process_action: true,
        ..owner_options()
    };
    let (ctx, client) = attached(fast_config(dir.path()), options);
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&reasons);
    ctx.set_exit_hook(Arc::new(move |reason| seen.lock().unwrap().push(reason)));

    ctx.enter_critical_section();
    send(&client, ControlMessage::Quit);
    tick(&ctx, 1);
    send(&client, ControlMessage::Abort);
    tick(&ctx, 1);
    ctx.leave_critical_section();

    assert_eq!(*reasons.lock().unwrap(), vec![ExitReason::Abort]);
    assert_eq!(ctx.exit_reason(), Some(ExitReason::Abort));
    assert_eq!(ctx.lifecycle_state(), LifecycleState::Aborting);
}

#[test]
fn abort_after_applied_quit_upgrades_once() {
    let dir = tempfile::tempdir().unwrap();
    let options = RuntimeOptions {
        direct_process_action: true,
        ..owner_options()
    };
    let (ctx, client) = attached(fast_config(dir.path()), options);
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&reasons);
    ctx.set_exit_hook(Arc::new(move |reason| seen.lock().unwrap().push(reason)));

    send(&client, ControlMessage::Quit);
    tick(&ctx, 1);
    send(&client, ControlMessage::Abort);
    tick(&ctx, 1);
    send(&client, ControlMessage::Abort);
    tick(&ctx, 1);

    assert_eq!(
        *reasons.lock().unwrap(),
        vec![ExitReason::Quit, ExitReason::Abort]
    );
    assert!(ctx.status().abort_requested);
}

#[test]
fn abort_hook_runs_before_exit_hook() {
    let dir = tempfile::tempdir().unwrap();
    let options = RuntimeOptions {
        direct_process_action: true,
        ..owner_options()
    };
    let (ctx, client) = attached(fast_config(dir.path()), options);
    let order = Arc::new(Mutex::new(Vec::new()));
    let abort_seen = Arc::clone(&order);
    let exit_seen = Arc::clone(&order);
    ctx.set_abort_hook(Arc::new(move || abort_seen.lock().unwrap().push("abort")));
    ctx.set_exit_hook(Arc::new(move |_| exit_seen.lock().unwrap().push("exit")));

    send(&client, ControlMessage::Abort);
    tick(&ctx, 1);
    assert_eq!(*order.lock().unwrap(), vec!["abort", "exit"]);
}

#[test]
fn resume_is_never_deferred_and_cancels_latched_suspend() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, client) = attached(fast_config(dir.path()), owner_options());

    send(&client, ControlMessage::Suspend);
    tick(&ctx, 1);
    assert!(ctx.status().suspended);

    ctx.enter_critical_section();
    send(&client, ControlMessage::Resume);
    tick(&ctx, 1);
    assert!(!ctx.status().suspended, "resume must apply inside a section");

    send(&client, ControlMessage::Suspend);
    tick(&ctx, 1);
    send(&client, ControlMessage::Resume);
    tick(&ctx, 1);
    ctx.leave_critical_section();
    assert!(!ctx.status().suspended, "latched suspend was cancelled");
}

#[test]
fn control_messages_ignored_when_not_handled() {
    let dir = tempfile::tempdir().unwrap();
    let options = RuntimeOptions {
        handle_process_control: false,
        ..owner_options()
    };
    let (ctx, client) = attached(fast_config(dir.path()), options);

    send(&client, ControlMessage::Quit);
    tick(&ctx, 3);
    assert_eq!(ctx.exit_reason(), None);
    assert!(client.process_control.has_pending());
}

#[test]
fn wait_while_suspended_breaks_on_quit() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, client) = attached(fast_config(dir.path()), owner_options());

    assert!(ctx.wait_while_suspended().is_continue());
    send(&client, ControlMessage::Quit);
    tick(&ctx, 1);
    assert!(matches!(
        ctx.wait_while_suspended(),
        ControlFlow::Break(ExitReason::Quit)
    ));
}
