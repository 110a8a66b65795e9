//! Periodic watchdog that reports watched threads blocked on a monitor owned
//! by an explicitly-paused thread.
//!
//! The check itself runs as an ordinary low-priority command, so it is
//! serialized with all other scheduler activity and cannot race with an
//! evaluation or a resume.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use javelin_jdwp::{JdwpTransport, ThreadId};

use crate::command::{CommandPriority, DebuggerCommand};
use crate::error::{CommandError, CommandResult};
use crate::manager::{CommandContext, ManagerHandle, ManagerThread};
use crate::suspend::SuspendManager;

/// Receives "thread X is blocked by thread Y" notifications. The expected
/// user affordance is to submit [`resume_thread_command`] for the blocking
/// thread.
pub trait BlockedListener: Send + Sync {
    fn on_thread_blocked(&self, blocked: ThreadId, blocking: ThreadId);
}

impl<F> BlockedListener for F
where
    F: Fn(ThreadId, ThreadId) + Send + Sync,
{
    fn on_thread_blocked(&self, blocked: ThreadId, blocking: ThreadId) {
        self(blocked, blocking)
    }
}

struct MonitorInner {
    manager: ManagerHandle,
    listener: Arc<dyn BlockedListener>,
    watched: Mutex<HashSet<ThreadId>>,
    interval: Duration,
    timer_running: AtomicBool,
}

pub struct ThreadBlockedMonitor {
    inner: Arc<MonitorInner>,
}

impl ThreadBlockedMonitor {
    /// The check interval comes from the manager's
    /// [`crate::manager::DebuggerConfig::blocked_check_interval`].
    pub fn new(manager: &ManagerThread, listener: Arc<dyn BlockedListener>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                manager: manager.handle(),
                listener,
                watched: Mutex::new(HashSet::new()),
                interval: manager.config().blocked_check_interval,
                timer_running: AtomicBool::new(false),
            }),
        }
    }

    /// Starts watching `thread`; the periodic check runs while at least one
    /// thread is watched.
    pub fn watch(&self, thread: ThreadId) {
        self.inner.watched.lock().insert(thread);
        self.ensure_timer();
    }

    pub fn unwatch(&self, thread: ThreadId) {
        self.inner.watched.lock().remove(&thread);
    }

    fn ensure_timer(&self) {
        if self.inner.timer_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("javelin-blocked-monitor".to_string())
            .spawn(move || timer_loop(inner));
        if let Err(err) = spawned {
            self.inner.timer_running.store(false, Ordering::SeqCst);
            tracing::error!(
                target: "javelin.monitor",
                error = %err,
                "failed to spawn blocked-thread monitor timer"
            );
        }
    }
}

fn timer_loop(inner: Arc<MonitorInner>) {
    loop {
        thread::sleep(inner.interval);
        if !inner.manager.is_alive() {
            inner.timer_running.store(false, Ordering::SeqCst);
            return;
        }
        if inner.watched.lock().is_empty() {
            inner.timer_running.store(false, Ordering::SeqCst);
            // watch() may have raced the store above; only keep ticking if
            // we win the flag back.
            if inner.watched.lock().is_empty()
                || inner.timer_running.swap(true, Ordering::SeqCst)
            {
                return;
            }
            continue;
        }
        let command = check_command(Arc::clone(&inner));
        inner.manager.schedule(command);
    }
}

fn check_command(inner: Arc<MonitorInner>) -> DebuggerCommand {
    DebuggerCommand::new(move |ctx| run_check(&inner, ctx)).with_priority(CommandPriority::Low)
}

fn run_check(inner: &MonitorInner, ctx: &mut CommandContext<'_>) -> CommandResult {
    let watched: Vec<ThreadId> = inner.watched.lock().iter().copied().collect();
    if watched.is_empty() {
        return Ok(());
    }

    let (vm, suspend) = ctx.vm_and_suspend();
    vm.suspend_all()?;
    let scanned = scan_blocked(&mut *vm, suspend, &watched);
    // Always undo the sweep vote, even when the scan failed mid-way.
    let resumed = vm.resume_all();
    let pairs = scanned?;
    resumed?;

    for (blocked, blocking) in pairs {
        tracing::info!(
            target: "javelin.monitor",
            blocked,
            blocking,
            "watched thread is blocked by a suspended thread"
        );
        inner.listener.on_thread_blocked(blocked, blocking);
    }
    Ok(())
}

fn scan_blocked(
    vm: &mut dyn JdwpTransport,
    suspend: &SuspendManager,
    watched: &[ThreadId],
) -> Result<Vec<(ThreadId, ThreadId)>, CommandError> {
    let mut pairs = Vec::new();
    for &thread in watched {
        // A thread busy evaluating will unblock on its own.
        if suspend.is_evaluating(thread) {
            continue;
        }
        let monitor = match vm.current_contended_monitor(thread) {
            Ok(Some(monitor)) => monitor,
            Ok(None) => continue,
            // The target VM cannot report monitors; soft failure.
            Err(err) if err.is_unsupported() => break,
            Err(err) => return Err(err.into()),
        };
        let owner = match vm.owning_thread(monitor) {
            Ok(Some(owner)) if owner != thread => owner,
            Ok(_) => continue,
            Err(err) if err.is_unsupported() => break,
            Err(err) => return Err(err.into()),
        };
        // Every thread holds our own sweep vote right now; an owner with
        // more than that baseline is explicitly paused, not merely blocked.
        if vm.suspend_count(owner)? > 1 {
            pairs.push((thread, owner));
        }
    }
    Ok(pairs)
}

/// Builds the command behind the notification's "resume the blocking
/// thread" action: releases every context vote on `thread` and thaws it.
pub fn resume_thread_command(thread: ThreadId) -> DebuggerCommand {
    DebuggerCommand::new(move |ctx| {
        let (vm, suspend) = ctx.vm_and_suspend();
        for id in suspend.suspending_contexts(thread) {
            suspend.resume_thread(vm, id, thread)?;
        }
        if suspend.is_frozen(thread) {
            suspend.thaw(vm, thread)?;
        }
        Ok(())
    })
}
