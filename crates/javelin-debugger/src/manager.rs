//! The debugger manager thread.
//!
//! One dedicated worker thread pulls commands off the [`EventQueue`] and
//! executes them strictly one at a time. Everything that touches the debuggee
//! or the suspend bookkeeping runs as a command on this thread; the
//! [`CommandContext`] handed to each command is the only reachable `&mut`
//! route to the [`SuspendManager`] and the transport, so confinement is
//! enforced by construction rather than by runtime thread assertions.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use javelin_jdwp::{JdwpTransport, ThreadId};

use crate::command::{CommandKind, CommandOutcome, DebuggerCommand};
use crate::error::{panic_payload_to_str, CommandError, CommandResult};
use crate::queue::EventQueue;
use crate::suspend::{SuspendContextId, SuspendManager};

/// How long the fork pump waits for new work between liveness checks on the
/// forked call.
const FORK_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct DebuggerConfig {
    /// Default timeout for [`ManagerThread::terminate_and_invoke`].
    pub terminate_timeout: Duration,
    /// Fixed delay between blocked-thread watchdog checks.
    pub blocked_check_interval: Duration,
    /// Worker thread name prefix; the generation number is appended.
    pub worker_name: String,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            terminate_timeout: Duration::from_secs(2),
            blocked_check_interval: Duration::from_secs(5),
            worker_name: "javelin-debugger".to_string(),
        }
    }
}

/// Session state confined to the worker thread. Commands reach it through
/// [`CommandContext`]; nothing else can.
struct SessionState {
    vm: Box<dyn JdwpTransport>,
    suspend: SuspendManager,
}

struct CurrentCommand {
    seq: u64,
    interrupt: Arc<AtomicBool>,
}

struct Shared {
    queue: EventQueue,
    state: Mutex<SessionState>,
    current: Mutex<Option<CurrentCommand>>,
    /// Bumped on forced worker replacement and on restart; a worker whose
    /// generation is stale exits without pulling further work.
    generation: AtomicU64,
    worker: Mutex<Option<(u64, thread::ThreadId)>>,
    next_seq: AtomicU64,
    config: DebuggerConfig,
}

/// Owner of the debugger worker thread and the sanctioned entry points for
/// touching debuggee state: [`ManagerThread::schedule`],
/// [`ManagerThread::invoke`] and [`ManagerThread::invoke_and_wait`].
///
/// Dropping the manager closes the queue: still-queued commands are
/// cancelled and the worker exits.
pub struct ManagerThread {
    shared: Arc<Shared>,
}

impl ManagerThread {
    pub fn spawn(vm: Box<dyn JdwpTransport>) -> Self {
        Self::spawn_with_config(vm, DebuggerConfig::default())
    }

    pub fn spawn_with_config(vm: Box<dyn JdwpTransport>, config: DebuggerConfig) -> Self {
        let shared = Arc::new(Shared {
            queue: EventQueue::new(),
            state: Mutex::new(SessionState {
                vm,
                suspend: SuspendManager::new(),
            }),
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
            worker: Mutex::new(None),
            next_seq: AtomicU64::new(1),
            config,
        });
        start_worker(&shared, 0);
        Self { shared }
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.shared.config
    }

    /// The current worker generation; bumps on forced replacement and on
    /// [`ManagerThread::restart_if_needed`].
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Appends `command` to the queue. Returns `false` (after delivering the
    /// command's single cancellation callback) if the queue is closed.
    /// Callable from any thread.
    pub fn schedule(&self, command: DebuggerCommand) -> bool {
        self.shared.queue.put(command)
    }

    /// Re-inserts `command` at the front of its priority bucket so it is
    /// re-attempted without losing its place relative to newly-arriving
    /// work. Same closed-queue behavior as [`ManagerThread::schedule`].
    pub fn push_back(&self, command: DebuggerCommand) -> bool {
        self.shared.queue.put_front(command)
    }

    /// Submits `command` from outside the worker thread. Worker-side code
    /// holds a [`CommandContext`] and uses [`CommandContext::invoke`] for
    /// reentrant inline execution instead.
    pub fn invoke(&self, command: DebuggerCommand) -> bool {
        debug_assert!(
            !self.is_worker_thread(),
            "worker-side code must use CommandContext::invoke"
        );
        self.schedule(command)
    }

    /// Schedules `command` and blocks the calling thread until it has run or
    /// been cancelled. Must not be called from the worker thread (asserted);
    /// that would deadlock.
    pub fn invoke_and_wait(&self, command: DebuggerCommand) -> CommandOutcome {
        assert!(
            !self.is_worker_thread(),
            "invoke_and_wait must not be called from the debugger worker thread"
        );

        let latch = Arc::new(WaitLatch::new());
        let DebuggerCommand {
            priority,
            kind,
            run,
            on_cancel,
        } = command;

        let run_latch = Arc::clone(&latch);
        let cancel_latch = Arc::clone(&latch);
        let wrapped = DebuggerCommand {
            priority,
            kind,
            run: Box::new(move |ctx| {
                // Signals through Drop so the waiter is released even if the
                // command panics.
                let _signal = SignalExecutedOnDrop(run_latch);
                run(ctx)
            }),
            on_cancel: Some(Box::new(move || {
                if let Some(on_cancel) = on_cancel {
                    on_cancel();
                }
                cancel_latch.signal(CommandOutcome::Cancelled);
            })),
        };

        // On a closed queue `put` cancels the wrapper, which signals the
        // latch, so the wait below returns immediately.
        self.shared.queue.put(wrapped);
        latch.wait()
    }

    /// Schedules `command`; if the command that was executing at the moment
    /// of scheduling is still executing after the configured
    /// `terminate_timeout`, replaces the worker thread so a hung remote call
    /// cannot wedge the scheduler. See
    /// [`ManagerThread::terminate_and_invoke_after`].
    pub fn terminate_and_invoke(&self, command: DebuggerCommand) -> bool {
        self.terminate_and_invoke_after(command, self.shared.config.terminate_timeout)
    }

    /// Like [`ManagerThread::terminate_and_invoke`] with an explicit
    /// timeout.
    ///
    /// Best-effort escape valve: the stuck command is signalled for
    /// cooperative interruption (see [`CommandContext::is_interrupted`]) and
    /// the worker generation is bumped so a replacement worker takes over
    /// the queue. The stuck command's remote-side effects are not
    /// compensated. If the watched command finishes before the timeout the
    /// sequence comparison makes the timer a no-op.
    pub fn terminate_and_invoke_after(
        &self,
        command: DebuggerCommand,
        timeout: Duration,
    ) -> bool {
        let watched = self
            .shared
            .current
            .lock()
            .as_ref()
            .map(|current| (current.seq, Arc::clone(&current.interrupt)));
        let accepted = self.schedule(command);

        if let Some((seq, interrupt)) = watched {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name("javelin-debugger-terminator".to_string())
                .spawn(move || {
                    thread::sleep(timeout);
                    let still_running = shared
                        .current
                        .lock()
                        .as_ref()
                        .is_some_and(|current| current.seq == seq);
                    if !still_running {
                        return;
                    }
                    interrupt.store(true, Ordering::SeqCst);
                    tracing::warn!(
                        target: "javelin.debugger",
                        ?timeout,
                        "debugger command did not finish in time; replacing the worker thread"
                    );
                    let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    start_worker(&shared, generation);
                });
            if let Err(err) = spawned {
                tracing::error!(
                    target: "javelin.debugger",
                    error = %err,
                    "failed to spawn termination timer thread"
                );
            }
        }
        accepted
    }

    /// Reopens the queue after a close (disconnect) and starts a fresh
    /// worker generation. No-op while the queue is open.
    pub fn restart_if_needed(&self) {
        if !self.shared.queue.is_closed() {
            return;
        }
        self.shared.queue.reopen();
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        start_worker(&self.shared, generation);
    }

    /// Closes the queue: every still-queued command is cancelled exactly
    /// once, new submissions fail, and the worker exits after finishing the
    /// command it is currently running.
    pub fn close(&self) {
        self.shared.queue.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.queue.is_closed()
    }

    pub fn is_worker_thread(&self) -> bool {
        self.shared
            .worker
            .lock()
            .is_some_and(|(_, id)| id == thread::current().id())
    }

    /// A weak, cloneable handle for background submitters (e.g. the
    /// blocked-thread watchdog) that must not keep the session alive.
    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl Drop for ManagerThread {
    fn drop(&mut self) {
        self.shared.queue.close();
    }
}

/// Weak handle to a [`ManagerThread`]; submissions fail once the manager is
/// dropped.
#[derive(Clone)]
pub struct ManagerHandle {
    shared: Weak<Shared>,
}

impl ManagerHandle {
    pub fn schedule(&self, command: DebuggerCommand) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.queue.put(command),
            None => {
                command.notify_cancelled();
                false
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.shared.strong_count() > 0
    }
}

/// Execution context handed to every running command; the only reachable
/// `&mut` route to the suspend bookkeeping and the transport.
pub struct CommandContext<'a> {
    shared: &'a Arc<Shared>,
    state: &'a mut SessionState,
    interrupt: &'a Arc<AtomicBool>,
    generation: u64,
    evaluation_depth: u32,
}

impl CommandContext<'_> {
    pub fn vm(&mut self) -> &mut dyn JdwpTransport {
        &mut *self.state.vm
    }

    pub fn suspend_manager(&mut self) -> &mut SuspendManager {
        &mut self.state.suspend
    }

    /// Split borrow for operations that pass the transport into the suspend
    /// manager.
    pub fn vm_and_suspend(&mut self) -> (&mut dyn JdwpTransport, &mut SuspendManager) {
        (&mut *self.state.vm, &mut self.state.suspend)
    }

    /// True once [`ManagerThread::terminate_and_invoke`] has given up on
    /// this command. Long-running commands should check this between remote
    /// calls and bail out.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Fire-and-forget submission from within a running command.
    pub fn schedule(&self, command: DebuggerCommand) -> bool {
        self.shared.queue.put(command)
    }

    pub fn push_back(&self, command: DebuggerCommand) -> bool {
        self.shared.queue.put_front(command)
    }

    /// Executes `command` synchronously, before control returns to the
    /// calling command — strictly nested, ahead of anything queued. This is
    /// the reentrant path that lets a running command submit and immediately
    /// run follow-up work without deadlocking on itself.
    pub fn invoke(&mut self, command: DebuggerCommand) -> CommandResult {
        execute(command, self)
    }

    /// Runs `f` as a nested evaluation inside the paused context `id`.
    ///
    /// Marks the context evaluating, runs the prepare half of the
    /// resume/restore protocol, transiently releases every suspend vote on
    /// the context's thread (the way a JDWP method invocation resumes it),
    /// and restores everything afterwards — including on `f`'s error path.
    /// Once this returns, the observable suspend state of every thread the
    /// context touches is exactly what it was before the call, and no new
    /// suspend context has been created.
    pub fn evaluate_in_context<T, F>(
        &mut self,
        id: SuspendContextId,
        f: F,
    ) -> Result<T, CommandError>
    where
        F: FnOnce(&mut CommandContext<'_>) -> Result<T, CommandError>,
    {
        let thread = self
            .state
            .suspend
            .context(id)
            .ok_or(CommandError::UnknownContext(id))?
            .thread();

        self.state.suspend.set_evaluating(id, true);
        self.evaluation_depth += 1;
        let result = self.run_evaluation(id, thread, f);
        self.evaluation_depth -= 1;
        self.state.suspend.set_evaluating(id, false);
        result
    }

    fn run_evaluation<T, F>(
        &mut self,
        id: SuspendContextId,
        thread: Option<ThreadId>,
        f: F,
    ) -> Result<T, CommandError>
    where
        F: FnOnce(&mut CommandContext<'_>) -> Result<T, CommandError>,
    {
        let data = {
            let (vm, suspend) = self.vm_and_suspend();
            suspend.prepare_for_resume(vm, id)?
        };
        let released = match thread {
            Some(thread) => {
                let (vm, suspend) = self.vm_and_suspend();
                suspend.release_thread_for_evaluation(vm, thread)?
            }
            None => 0,
        };

        let result = f(&mut *self);

        let restored = (|| -> Result<(), CommandError> {
            if let Some(thread) = thread {
                let (vm, suspend) = self.vm_and_suspend();
                suspend.reacquire_thread_after_evaluation(vm, thread, released)?;
            }
            let (vm, suspend) = self.vm_and_suspend();
            suspend.restore_after_resume(vm, id, data)
        })();

        match (result, restored) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), restored) => {
                if let Err(restore_err) = restored {
                    tracing::warn!(
                        target: "javelin.debugger",
                        context = id,
                        error = %restore_err,
                        "failed to restore suspend state after evaluation"
                    );
                }
                Err(err)
            }
        }
    }

    /// Runs `proc` — a long blocking foreign call — on a forked thread while
    /// this worker keeps servicing the queue, then switches back and returns
    /// `proc`'s result. Commands pumped in the meantime still execute one at
    /// a time, on this thread.
    pub fn start_long_process_and_fork<T, F>(&mut self, proc: F) -> T
    where
        T: Send,
        F: FnOnce() -> T + Send,
    {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let outcome = thread::scope(|scope| {
            let handle = scope.spawn(move || {
                let value = proc();
                let _ = done_tx.send(());
                value
            });

            loop {
                match done_rx.recv_timeout(FORK_POLL_INTERVAL) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                }
                if self.shared.generation.load(Ordering::SeqCst) != self.generation {
                    // Replaced while forked: a new worker owns the queue now.
                    // Just wait for the foreign call.
                    let _ = done_rx.recv();
                    break;
                }
                // Bounded drain: a command pushed back during the pump (e.g.
                // one bound to a context that is mid-evaluation) is not
                // re-pulled until the next poll.
                let mut budget = self.shared.queue.len();
                while budget > 0 {
                    let Some(command) = self.shared.queue.try_get() else {
                        break;
                    };
                    budget -= 1;
                    let result =
                        panic::catch_unwind(AssertUnwindSafe(|| execute(command, &mut *self)));
                    log_command_result(result);
                }
            }

            handle.join()
        });

        match outcome {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

struct WaitLatch {
    outcome: Mutex<Option<CommandOutcome>>,
    signalled: Condvar,
}

impl WaitLatch {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            signalled: Condvar::new(),
        }
    }

    fn signal(&self, outcome: CommandOutcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.signalled.notify_all();
        }
    }

    fn wait(&self) -> CommandOutcome {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = *slot {
                return outcome;
            }
            self.signalled.wait(&mut slot);
        }
    }
}

struct SignalExecutedOnDrop(Arc<WaitLatch>);

impl Drop for SignalExecutedOnDrop {
    fn drop(&mut self) {
        self.0.signal(CommandOutcome::Executed);
    }
}

fn start_worker(shared: &Arc<Shared>, generation: u64) {
    let name = format!("{}-{}", shared.config.worker_name, generation);
    let shared = Arc::clone(shared);
    thread::Builder::new()
        .name(name)
        .spawn(move || worker_loop(shared, generation))
        .map(drop)
        .unwrap_or_else(|err| panic!("failed to spawn debugger worker thread: {err}"));
}

fn worker_loop(shared: Arc<Shared>, generation: u64) {
    {
        let mut worker = shared.worker.lock();
        if shared.generation.load(Ordering::SeqCst) == generation {
            *worker = Some((generation, thread::current().id()));
        }
    }

    loop {
        if shared.generation.load(Ordering::SeqCst) != generation {
            break;
        }
        let Some(command) = shared.queue.get() else {
            break;
        };
        if shared.generation.load(Ordering::SeqCst) != generation {
            // Replaced while waiting; hand the command to the new worker.
            shared.queue.put_front(command);
            break;
        }
        process_command(&shared, generation, command);
    }

    let mut worker = shared.worker.lock();
    if worker.is_some_and(|(owner, _)| owner == generation) {
        *worker = None;
    }
    tracing::debug!(target: "javelin.debugger", generation, "debugger worker exiting");
}

fn process_command(shared: &Arc<Shared>, generation: u64, command: DebuggerCommand) {
    // The queue may have closed between dequeue and execution.
    if shared.queue.is_closed() {
        command.notify_cancelled();
        return;
    }

    let seq = shared.next_seq.fetch_add(1, Ordering::SeqCst);
    let interrupt = Arc::new(AtomicBool::new(false));
    *shared.current.lock() = Some(CurrentCommand {
        seq,
        interrupt: Arc::clone(&interrupt),
    });

    let result = {
        let mut state = shared.state.lock();
        let mut ctx = CommandContext {
            shared,
            state: &mut *state,
            interrupt: &interrupt,
            generation,
            evaluation_depth: 0,
        };
        panic::catch_unwind(AssertUnwindSafe(move || execute(command, &mut ctx)))
    };

    {
        let mut current = shared.current.lock();
        if current.as_ref().is_some_and(|c| c.seq == seq) {
            *current = None;
        }
    }

    log_command_result(result);
}

/// Single dispatch point for every command, top-level or reentrant.
fn execute(command: DebuggerCommand, ctx: &mut CommandContext<'_>) -> CommandResult {
    match command.kind {
        CommandKind::Plain => (command.run)(ctx),
        CommandKind::SuspendContextBound(id) => {
            let Some(context) = ctx.state.suspend.context(id) else {
                // The context was resumed (or never existed); the work is
                // moot. This is the defined cancelled outcome, not an error.
                tracing::debug!(
                    target: "javelin.debugger",
                    context = id,
                    "cancelling command bound to a resumed suspend context"
                );
                command.notify_cancelled();
                return Ok(());
            };
            if context.is_evaluating() {
                if ctx.evaluation_depth > 0 {
                    // Submitted reentrantly while the context evaluates:
                    // retry once the evaluation completes, ahead of newly
                    // arriving work.
                    ctx.push_back(command);
                    return Ok(());
                }
                tracing::warn!(
                    target: "javelin.debugger",
                    context = id,
                    "suspend context left marked evaluating outside an evaluation; clearing"
                );
                ctx.state.suspend.set_evaluating(id, false);
            }
            ctx.state.suspend.set_in_progress(id, true);
            let run = command.run;
            let result = {
                let reborrow = &mut *ctx;
                panic::catch_unwind(AssertUnwindSafe(move || run(reborrow)))
            };
            ctx.state.suspend.set_in_progress(id, false);
            match result {
                Ok(result) => result,
                Err(payload) => panic::resume_unwind(payload),
            }
        }
    }
}

fn log_command_result(result: thread::Result<CommandResult>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) if err.is_disconnect() => {
            // The target is gone; expected during teardown, not a bug.
            tracing::debug!(
                target: "javelin.debugger",
                error = %err,
                "debuggee disconnected during command"
            );
        }
        Ok(Err(err)) => {
            tracing::error!(
                target: "javelin.debugger",
                error = %err,
                "debugger command failed"
            );
        }
        Err(payload) => {
            tracing::error!(
                target: "javelin.debugger",
                panic = %panic_payload_to_str(payload.as_ref()),
                "debugger command panicked"
            );
        }
    }
}
