//! End-to-end scheduler behavior: ordering, cancellation, reentrancy, forced
//! termination, and the fork pump.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use javelin_debugger::{
    CommandOutcome, DebuggerCommand, ManagerThread, SuspendContextId, SuspendPolicy,
};
use javelin_jdwp::{MockTransport, ThreadId};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn spawn_manager() -> (ManagerThread, MockTransport) {
    init_tracing();
    let mock = MockTransport::new();
    let manager = ManagerThread::spawn(Box::new(mock.clone()));
    (manager, mock)
}

fn record(order: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> DebuggerCommand {
    let order = Arc::clone(order);
    DebuggerCommand::new(move |_ctx| {
        order.lock().unwrap().push(label);
        Ok(())
    })
}

/// Schedules a command that parks the worker until the returned sender is
/// signalled, and waits for it to start.
fn park_worker(manager: &ManagerThread) -> mpsc::Sender<()> {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    manager.schedule(DebuggerCommand::new(move |_ctx| {
        started_tx.send(()).ok();
        release_rx.recv().ok();
        Ok(())
    }));
    started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("worker did not pick up the parking command");
    release_tx
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "timed out waiting for {what}"
        );
        thread::sleep(Duration::from_millis(10));
    }
}

fn push_context(
    manager: &ManagerThread,
    policy: SuspendPolicy,
    thread: Option<ThreadId>,
) -> SuspendContextId {
    let (tx, rx) = mpsc::channel();
    let outcome = manager.invoke_and_wait(DebuggerCommand::new(move |ctx| {
        let (vm, suspend) = ctx.vm_and_suspend();
        let id = suspend.push_paused_context(vm, policy, thread)?;
        tx.send(id).ok();
        Ok(())
    }));
    assert_eq!(outcome, CommandOutcome::Executed);
    rx.recv().expect("context id")
}

#[test]
fn push_back_runs_ahead_of_queued_work() {
    let (manager, _mock) = spawn_manager();
    let order = Arc::new(Mutex::new(Vec::new()));

    let release = park_worker(&manager);
    assert!(manager.schedule(record(&order, "a")));
    assert!(manager.schedule(record(&order, "b")));
    assert!(manager.push_back(record(&order, "c")));
    release.send(()).unwrap();

    let outcome = manager.invoke_and_wait(record(&order, "end"));
    assert_eq!(outcome, CommandOutcome::Executed);
    assert_eq!(*order.lock().unwrap(), vec!["c", "a", "b", "end"]);
}

#[test]
fn commands_never_overlap() {
    let (manager, _mock) = spawn_manager();
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..16 {
                    let active = Arc::clone(&active);
                    let max_active = Arc::clone(&max_active);
                    manager.schedule(DebuggerCommand::new(move |_ctx| {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_active.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_micros(200));
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }));
                }
            });
        }
    });

    let outcome = manager.invoke_and_wait(DebuggerCommand::new(|_ctx| Ok(())));
    assert_eq!(outcome, CommandOutcome::Executed);
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
}

#[test]
fn close_cancels_queued_commands_exactly_once() {
    let (manager, _mock) = spawn_manager();

    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let running_completed = Arc::new(AtomicUsize::new(0));
    let completed = Arc::clone(&running_completed);
    manager.schedule(DebuggerCommand::new(move |_ctx| {
        started_tx.send(()).ok();
        release_rx.recv().ok();
        completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let cancels: Vec<Arc<AtomicUsize>> =
        (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    for cancel in &cancels {
        let runs = Arc::clone(&runs);
        let cancel = Arc::clone(cancel);
        manager.schedule(
            DebuggerCommand::new(move |_ctx| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on_cancelled(move || {
                cancel.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }

    manager.close();
    release_tx.send(()).unwrap();

    // The running command completes normally; the queued ones are each
    // cancelled exactly once and never run.
    wait_until("running command to complete", || {
        running_completed.load(Ordering::SeqCst) == 1
    });
    for cancel in &cancels {
        assert_eq!(cancel.load(Ordering::SeqCst), 1);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    // Scheduling fails (with a single cancellation) until the manager is
    // restarted.
    let late_cancel = Arc::new(AtomicUsize::new(0));
    let late = Arc::clone(&late_cancel);
    let accepted = manager.schedule(DebuggerCommand::new(|_ctx| Ok(())).on_cancelled(move || {
        late.fetch_add(1, Ordering::SeqCst);
    }));
    assert!(!accepted);
    assert_eq!(late_cancel.load(Ordering::SeqCst), 1);

    manager.restart_if_needed();
    let outcome = manager.invoke_and_wait(DebuggerCommand::new(|_ctx| Ok(())));
    assert_eq!(outcome, CommandOutcome::Executed);
}

#[test]
fn invoke_and_wait_reports_cancellation_on_a_closed_queue() {
    let (manager, _mock) = spawn_manager();
    manager.close();
    let outcome = manager.invoke_and_wait(DebuggerCommand::new(|_ctx| Ok(())));
    assert_eq!(outcome, CommandOutcome::Cancelled);
}

#[test]
fn reentrant_invoke_runs_inline() {
    let (manager, _mock) = spawn_manager();
    let order = Arc::new(Mutex::new(Vec::new()));

    // Work queued behind the outer command must still run after the nested
    // invoke.
    let release = park_worker(&manager);
    let order_outer = Arc::clone(&order);
    manager.schedule(DebuggerCommand::new(move |ctx| {
        order_outer.lock().unwrap().push("outer-start");
        let order_inner = Arc::clone(&order_outer);
        ctx.invoke(DebuggerCommand::new(move |_ctx| {
            order_inner.lock().unwrap().push("inner");
            Ok(())
        }))?;
        order_outer.lock().unwrap().push("outer-end");
        Ok(())
    }));
    manager.schedule(record(&order, "queued"));
    release.send(()).unwrap();

    let outcome = manager.invoke_and_wait(record(&order, "end"));
    assert_eq!(outcome, CommandOutcome::Executed);
    assert_eq!(
        *order.lock().unwrap(),
        vec!["outer-start", "inner", "outer-end", "queued", "end"]
    );
}

#[test]
fn a_running_command_can_schedule_follow_up_work() {
    let (manager, _mock) = spawn_manager();
    let order = Arc::new(Mutex::new(Vec::new()));

    let order_outer = Arc::clone(&order);
    let (done_tx, done_rx) = mpsc::channel();
    let accepted = manager.invoke(DebuggerCommand::new(move |ctx| {
        let order_follow = Arc::clone(&order_outer);
        ctx.schedule(DebuggerCommand::new(move |_ctx| {
            order_follow.lock().unwrap().push("follow-up");
            Ok(())
        }));
        order_outer.lock().unwrap().push("outer");
        done_tx.send(()).ok();
        Ok(())
    }));
    assert!(accepted);
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let outcome = manager.invoke_and_wait(record(&order, "end"));
    assert_eq!(outcome, CommandOutcome::Executed);
    assert_eq!(*order.lock().unwrap(), vec!["outer", "follow-up", "end"]);
}

#[test]
fn terminate_timer_is_a_no_op_when_the_command_finishes_naturally() {
    let (manager, _mock) = spawn_manager();

    let release = park_worker(&manager);
    let probe_ran = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&probe_ran);
    let accepted = manager.terminate_and_invoke_after(
        DebuggerCommand::new(move |_ctx| {
            probe.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        Duration::from_millis(200),
    );
    assert!(accepted);

    // Finish well before the timeout.
    release.send(()).unwrap();
    wait_until("probe to run", || probe_ran.load(Ordering::SeqCst) == 1);

    thread::sleep(Duration::from_millis(300));
    assert_eq!(manager.generation(), 0, "worker must not have been replaced");
    let outcome = manager.invoke_and_wait(DebuggerCommand::new(|_ctx| Ok(())));
    assert_eq!(outcome, CommandOutcome::Executed);
}

#[test]
fn terminate_and_invoke_replaces_a_stuck_worker() {
    let (manager, _mock) = spawn_manager();

    let (started_tx, started_rx) = mpsc::channel();
    let stuck_exited = Arc::new(AtomicUsize::new(0));
    let exited = Arc::clone(&stuck_exited);
    manager.schedule(DebuggerCommand::new(move |ctx| {
        started_tx.send(()).ok();
        while !ctx.is_interrupted() {
            thread::sleep(Duration::from_millis(5));
        }
        exited.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let probe_ran = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&probe_ran);
    let accepted = manager.terminate_and_invoke_after(
        DebuggerCommand::new(move |_ctx| {
            probe.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        Duration::from_millis(50),
    );
    assert!(accepted);

    wait_until("replacement worker to run the probe", || {
        probe_ran.load(Ordering::SeqCst) == 1
    });
    assert!(manager.generation() >= 1);
    wait_until("stuck command to observe the interrupt", || {
        stuck_exited.load(Ordering::SeqCst) == 1
    });

    let outcome = manager.invoke_and_wait(DebuggerCommand::new(|_ctx| Ok(())));
    assert_eq!(outcome, CommandOutcome::Executed);
}

#[test]
fn fork_keeps_servicing_the_queue_during_a_long_foreign_call() {
    let (manager, _mock) = spawn_manager();
    let order = Arc::new(Mutex::new(Vec::new()));

    let (fork_started_tx, fork_started_rx) = mpsc::channel();
    let (finish_tx, finish_rx) = mpsc::channel::<()>();
    let fork_result = Arc::new(AtomicUsize::new(0));

    let order_cmd = Arc::clone(&order);
    let result_cmd = Arc::clone(&fork_result);
    manager.schedule(DebuggerCommand::new(move |ctx| {
        order_cmd.lock().unwrap().push("fork-start");
        let value = ctx.start_long_process_and_fork(move || {
            fork_started_tx.send(()).ok();
            finish_rx.recv().ok();
            42_usize
        });
        result_cmd.store(value, Ordering::SeqCst);
        order_cmd.lock().unwrap().push("fork-end");
        Ok(())
    }));
    fork_started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Queue work while the foreign call is still blocking; the pump must
    // execute it before the fork command completes.
    let outcome = manager.invoke_and_wait(record(&order, "pumped"));
    assert_eq!(outcome, CommandOutcome::Executed);
    assert_eq!(*order.lock().unwrap(), vec!["fork-start", "pumped"]);

    finish_tx.send(()).unwrap();
    let outcome = manager.invoke_and_wait(record(&order, "after"));
    assert_eq!(outcome, CommandOutcome::Executed);
    assert_eq!(fork_result.load(Ordering::SeqCst), 42);
    assert_eq!(
        *order.lock().unwrap(),
        vec!["fork-start", "pumped", "fork-end", "after"]
    );
}

#[test]
fn context_bound_command_is_cancelled_after_resume() {
    let (manager, mock) = spawn_manager();
    mock.add_thread(1, "main");

    let id = push_context(&manager, SuspendPolicy::EventThread, Some(1));
    let outcome = manager.invoke_and_wait(DebuggerCommand::new(move |ctx| {
        let (vm, suspend) = ctx.vm_and_suspend();
        suspend.resume_context(vm, id)
    }));
    assert_eq!(outcome, CommandOutcome::Executed);

    let ran = Arc::new(AtomicUsize::new(0));
    let cancelled = Arc::new(AtomicUsize::new(0));
    let ran_cmd = Arc::clone(&ran);
    let cancelled_cmd = Arc::clone(&cancelled);
    let outcome = manager.invoke_and_wait(
        DebuggerCommand::for_context(id, move |_ctx| {
            ran_cmd.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .on_cancelled(move || {
            cancelled_cmd.fetch_add(1, Ordering::SeqCst);
        }),
    );
    assert_eq!(outcome, CommandOutcome::Cancelled);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
}

#[test]
fn bound_command_submitted_during_evaluation_is_deferred() {
    let (manager, mock) = spawn_manager();
    mock.add_thread(1, "main");

    let id = push_context(&manager, SuspendPolicy::EventThread, Some(1));
    let order = Arc::new(Mutex::new(Vec::new()));

    let order_outer = Arc::clone(&order);
    let outcome = manager.invoke_and_wait(DebuggerCommand::new(move |ctx| {
        let order_eval = Arc::clone(&order_outer);
        ctx.evaluate_in_context(id, |ctx| {
            order_eval.lock().unwrap().push("eval");
            let order_bound = Arc::clone(&order_eval);
            ctx.invoke(DebuggerCommand::for_context(id, move |_ctx| {
                order_bound.lock().unwrap().push("bound");
                Ok(())
            }))?;
            order_eval.lock().unwrap().push("eval-after-invoke");
            Ok(())
        })?;
        order_outer.lock().unwrap().push("outer-end");
        Ok(())
    }));
    assert_eq!(outcome, CommandOutcome::Executed);

    let outcome = manager.invoke_and_wait(record(&order, "end"));
    assert_eq!(outcome, CommandOutcome::Executed);
    // The bound command was pushed back, not run inside the evaluation, and
    // ran ahead of newly-arriving work once the context stopped evaluating.
    assert_eq!(
        *order.lock().unwrap(),
        vec!["eval", "eval-after-invoke", "outer-end", "bound", "end"]
    );
}
