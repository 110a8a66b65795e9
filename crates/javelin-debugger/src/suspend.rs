//! Suspend-state bookkeeping for the debuggee VM.
//!
//! Every thread's protocol-level suspension is vote-counted: each paused
//! [`SuspendContext`] holds one vote per thread it suspends, a user freeze
//! holds one more, and a thread only runs again once every vote is released.
//! All mutation happens through a [`crate::manager::CommandContext`], i.e. on
//! the debugger worker thread; the types here have no other reachable `&mut`
//! surface, which substitutes for locking.

use std::collections::{HashMap, HashSet};

use javelin_jdwp::{JdwpTransport, ThreadId};

use crate::error::CommandError;

pub type SuspendContextId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendPolicy {
    /// The whole VM paused.
    All,
    /// Only the triggering thread paused.
    EventThread,
}

/// One "the debuggee (or one thread of it) is paused" episode.
///
/// Two-state lifecycle: paused while registered in the [`SuspendManager`],
/// resumed (and destroyed) once [`SuspendManager::resume_context`] runs. A
/// later pause creates a fresh context; instances are never revived.
pub struct SuspendContext {
    id: SuspendContextId,
    thread: Option<ThreadId>,
    policy: SuspendPolicy,
    /// Threads this context currently holds one suspend vote on. For an
    /// `All`-policy context this is the thread set snapshotted at creation.
    votes: HashSet<ThreadId>,
    /// Threads explicitly resumed while this context stayed paused. `None`
    /// and `Some(empty)` are distinct states: the resume/restore protocol
    /// clears this to `None` and re-installs the old set on restore.
    resumed_threads: Option<HashSet<ThreadId>>,
    evaluating: bool,
    in_progress: bool,
}

impl SuspendContext {
    pub fn id(&self) -> SuspendContextId {
        self.id
    }

    /// The remote thread that triggered the pause; `None` when the whole VM
    /// paused without a specific triggering thread.
    pub fn thread(&self) -> Option<ThreadId> {
        self.thread
    }

    pub fn policy(&self) -> SuspendPolicy {
        self.policy
    }

    pub fn is_evaluating(&self) -> bool {
        self.evaluating
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn explicitly_resumed(&self, thread: ThreadId) -> bool {
        self.resumed_threads
            .as_ref()
            .is_some_and(|set| set.contains(&thread))
    }

    /// Whether this context currently claims to suspend `thread`.
    pub fn suspends(&self, thread: ThreadId) -> bool {
        (self.policy == SuspendPolicy::All && !self.explicitly_resumed(thread))
            || self.thread == Some(thread)
    }
}

/// Opaque snapshot returned by [`SuspendManager::prepare_for_resume`] and
/// consumed, unchanged, by [`SuspendManager::restore_after_resume`].
#[derive(Debug)]
pub struct ResumeData {
    was_frozen: bool,
    previously_resumed: Option<HashSet<ThreadId>>,
}

/// Registry of live suspend contexts and per-thread suspend votes.
///
/// Contexts are kept newest first, so queries prefer the most recent pause.
/// The counts map mirrors the votes this manager holds at the protocol
/// level; outside the nested-evaluation window, `suspend_count(t) > 0` holds
/// for every thread any registered context claims to suspend.
pub struct SuspendManager {
    contexts: Vec<SuspendContext>,
    suspend_counts: HashMap<ThreadId, u32>,
    frozen: HashSet<ThreadId>,
    next_context_id: SuspendContextId,
}

impl SuspendManager {
    pub(crate) fn new() -> Self {
        Self {
            contexts: Vec::new(),
            suspend_counts: HashMap::new(),
            frozen: HashSet::new(),
            next_context_id: 1,
        }
    }

    /// Registers a new paused context and applies its suspend votes through
    /// the transport. `thread` is required for [`SuspendPolicy::EventThread`].
    pub fn push_paused_context(
        &mut self,
        vm: &mut dyn JdwpTransport,
        policy: SuspendPolicy,
        thread: Option<ThreadId>,
    ) -> Result<SuspendContextId, CommandError> {
        let id = self.next_context_id;
        self.next_context_id += 1;

        let mut votes = HashSet::new();
        match policy {
            SuspendPolicy::All => {
                vm.suspend_all()?;
                for info in vm.threads()? {
                    *self.suspend_counts.entry(info.id).or_insert(0) += 1;
                    votes.insert(info.id);
                }
            }
            SuspendPolicy::EventThread => {
                let thread = thread.ok_or_else(|| {
                    CommandError::Other(
                        "an event-thread suspend context requires a triggering thread".to_string(),
                    )
                })?;
                self.take_vote(vm, thread)?;
                votes.insert(thread);
            }
        }

        self.contexts.insert(
            0,
            SuspendContext {
                id,
                thread,
                policy,
                votes,
                resumed_threads: None,
                evaluating: false,
                in_progress: false,
            },
        );
        tracing::debug!(
            target: "javelin.debugger",
            context = id,
            ?policy,
            ?thread,
            "pushed paused context"
        );
        Ok(id)
    }

    /// Resumes the context: releases every vote it still holds and removes
    /// it from the registry. Threads the context had explicitly resumed are
    /// not resumed again, and frozen threads keep their freeze vote.
    pub fn resume_context(
        &mut self,
        vm: &mut dyn JdwpTransport,
        id: SuspendContextId,
    ) -> Result<(), CommandError> {
        let idx = self.index_of(id).ok_or(CommandError::UnknownContext(id))?;
        if self.contexts[idx].evaluating {
            tracing::warn!(
                target: "javelin.debugger",
                context = id,
                "resuming a context that is still evaluating"
            );
        }
        let context = self.contexts.remove(idx);
        for thread in context.votes {
            self.release_vote(vm, thread)?;
        }
        tracing::debug!(target: "javelin.debugger", context = id, "resumed context");
        Ok(())
    }

    /// Explicitly resumes one thread while `id` stays paused. The thread is
    /// recorded so the context can undo exactly this resume later.
    pub fn resume_thread(
        &mut self,
        vm: &mut dyn JdwpTransport,
        id: SuspendContextId,
        thread: ThreadId,
    ) -> Result<(), CommandError> {
        let idx = self.index_of(id).ok_or(CommandError::UnknownContext(id))?;
        if !self.contexts[idx].votes.remove(&thread) {
            tracing::warn!(
                target: "javelin.debugger",
                context = id,
                thread,
                "explicit resume for a thread the context holds no vote on"
            );
            return Ok(());
        }
        self.contexts[idx]
            .resumed_threads
            .get_or_insert_with(HashSet::new)
            .insert(thread);
        self.release_vote(vm, thread)
    }

    /// Undoes an explicit [`SuspendManager::resume_thread`].
    pub fn suspend_thread(
        &mut self,
        vm: &mut dyn JdwpTransport,
        id: SuspendContextId,
        thread: ThreadId,
    ) -> Result<(), CommandError> {
        let idx = self.index_of(id).ok_or(CommandError::UnknownContext(id))?;
        let removed = self.contexts[idx]
            .resumed_threads
            .as_mut()
            .is_some_and(|set| set.remove(&thread));
        if !removed {
            tracing::warn!(
                target: "javelin.debugger",
                context = id,
                thread,
                "re-suspend for a thread the context did not explicitly resume"
            );
            return Ok(());
        }
        self.take_vote(vm, thread)?;
        self.contexts[idx].votes.insert(thread);
        Ok(())
    }

    /// User-initiated freeze: one suspend vote outside the context protocol.
    /// Idempotent; a frozen thread stays suspended even after every context
    /// that suspends it has been resumed.
    pub fn freeze(
        &mut self,
        vm: &mut dyn JdwpTransport,
        thread: ThreadId,
    ) -> Result<(), CommandError> {
        if self.frozen.contains(&thread) {
            return Ok(());
        }
        self.take_vote(vm, thread)?;
        self.frozen.insert(thread);
        Ok(())
    }

    /// Releases a user freeze. Idempotent.
    pub fn thaw(
        &mut self,
        vm: &mut dyn JdwpTransport,
        thread: ThreadId,
    ) -> Result<(), CommandError> {
        if !self.frozen.remove(&thread) {
            return Ok(());
        }
        self.release_vote(vm, thread)
    }

    /// First half of the nested-evaluation protocol. Snapshots the context's
    /// frozen state and explicitly-resumed set, thaws the context thread if
    /// frozen, and pushes the suspend votes of previously-resumed threads
    /// back up so the evaluation starts from a clean slate.
    ///
    /// The returned [`ResumeData`] must be passed unchanged to
    /// [`SuspendManager::restore_after_resume`]; the pair is observably
    /// identity on suspend counts and frozen state for every thread.
    pub fn prepare_for_resume(
        &mut self,
        vm: &mut dyn JdwpTransport,
        id: SuspendContextId,
    ) -> Result<ResumeData, CommandError> {
        let idx = self.index_of(id).ok_or(CommandError::UnknownContext(id))?;
        let thread = self.contexts[idx].thread;
        let was_frozen = thread.is_some_and(|t| self.frozen.contains(&t));
        let previously_resumed = self.contexts[idx].resumed_threads.take();

        if was_frozen {
            if let Some(thread) = thread {
                self.thaw(vm, thread)?;
            }
        }
        if let Some(set) = &previously_resumed {
            for &thread in set {
                self.take_vote(vm, thread)?;
                self.contexts[idx].votes.insert(thread);
            }
        }
        Ok(ResumeData {
            was_frozen,
            previously_resumed,
        })
    }

    /// Exact inverse of [`SuspendManager::prepare_for_resume`]. A second
    /// restore for the same prepare is a protocol violation: it asserts in
    /// debug builds and no-ops in release builds rather than corrupting the
    /// vote counts further.
    pub fn restore_after_resume(
        &mut self,
        vm: &mut dyn JdwpTransport,
        id: SuspendContextId,
        data: ResumeData,
    ) -> Result<(), CommandError> {
        let idx = self.index_of(id).ok_or(CommandError::UnknownContext(id))?;
        let thread = self.contexts[idx].thread;

        if data.was_frozen {
            if let Some(thread) = thread {
                if !self.frozen.contains(&thread) {
                    self.freeze(vm, thread)?;
                }
            }
        }

        if self.contexts[idx].resumed_threads.is_some() {
            debug_assert!(
                false,
                "restore_after_resume called without a matching prepare_for_resume"
            );
            tracing::warn!(
                target: "javelin.debugger",
                context = id,
                "restore_after_resume called without a matching prepare_for_resume"
            );
            return Ok(());
        }

        if let Some(set) = data.previously_resumed {
            if !set.is_empty() {
                for &thread in &set {
                    self.contexts[idx].votes.remove(&thread);
                    self.release_vote(vm, thread)?;
                }
                self.contexts[idx].resumed_threads = Some(set);
            }
        }
        Ok(())
    }

    /// Releases every vote held on `thread` so a nested evaluation can run
    /// on it, returning how many were released. The context bookkeeping is
    /// left untouched; [`Self::reacquire_thread_after_evaluation`] puts the
    /// votes back.
    pub(crate) fn release_thread_for_evaluation(
        &mut self,
        vm: &mut dyn JdwpTransport,
        thread: ThreadId,
    ) -> Result<u32, CommandError> {
        let mut released = 0;
        while self.suspend_counts.get(&thread).copied().unwrap_or(0) > 0 {
            self.release_vote(vm, thread)?;
            released += 1;
        }
        Ok(released)
    }

    pub(crate) fn reacquire_thread_after_evaluation(
        &mut self,
        vm: &mut dyn JdwpTransport,
        thread: ThreadId,
        released: u32,
    ) -> Result<(), CommandError> {
        for _ in 0..released {
            self.take_vote(vm, thread)?;
        }
        Ok(())
    }

    pub(crate) fn set_evaluating(&mut self, id: SuspendContextId, evaluating: bool) {
        if let Some(idx) = self.index_of(id) {
            self.contexts[idx].evaluating = evaluating;
        }
    }

    pub(crate) fn set_in_progress(&mut self, id: SuspendContextId, in_progress: bool) {
        if let Some(idx) = self.index_of(id) {
            self.contexts[idx].in_progress = in_progress;
        }
    }

    /// True iff some live context is evaluating on `thread`.
    pub fn is_evaluating(&self, thread: ThreadId) -> bool {
        self.contexts
            .iter()
            .any(|c| c.evaluating && c.thread == Some(thread))
    }

    /// The context that currently suspends `thread`: a context whose own
    /// thread it is wins over an `All`-policy context that has not
    /// explicitly resumed it. Newest pause first.
    pub fn find_context_by_thread(&self, thread: ThreadId) -> Option<SuspendContextId> {
        self.contexts
            .iter()
            .find(|c| c.thread == Some(thread))
            .or_else(|| {
                self.contexts
                    .iter()
                    .find(|c| c.policy == SuspendPolicy::All && !c.explicitly_resumed(thread))
            })
            .map(|c| c.id)
    }

    /// All live contexts whose [`SuspendContext::suspends`] predicate holds
    /// for `thread`, newest first.
    pub fn suspending_contexts(&self, thread: ThreadId) -> Vec<SuspendContextId> {
        self.contexts
            .iter()
            .filter(|c| c.suspends(thread))
            .map(|c| c.id)
            .collect()
    }

    pub fn suspending_context(&self, thread: ThreadId) -> Option<SuspendContextId> {
        self.contexts
            .iter()
            .find(|c| c.suspends(thread))
            .map(|c| c.id)
    }

    /// The context mid-evaluation on `thread`, used to route reentrant
    /// evaluation requests instead of creating a duplicate pause.
    pub fn evaluating_context(&self, thread: ThreadId) -> Option<SuspendContextId> {
        self.contexts
            .iter()
            .find(|c| c.evaluating && c.thread == Some(thread))
            .map(|c| c.id)
    }

    /// The context a command acting on `thread` should use: `thread`'s own
    /// context if it is not itself mid-execution, else the caller-supplied
    /// fallback.
    pub fn suspend_context_for_thread(
        &self,
        fallback: SuspendContextId,
        thread: ThreadId,
    ) -> SuspendContextId {
        match self.find_context_by_thread(thread) {
            Some(id) if self.context(id).is_some_and(|c| !c.in_progress) => id,
            _ => fallback,
        }
    }

    pub fn context(&self, id: SuspendContextId) -> Option<&SuspendContext> {
        self.contexts.iter().find(|c| c.id == id)
    }

    /// Live contexts, newest pause first.
    pub fn paused_contexts(&self) -> impl Iterator<Item = &SuspendContext> {
        self.contexts.iter()
    }

    pub fn suspend_count(&self, thread: ThreadId) -> u32 {
        self.suspend_counts.get(&thread).copied().unwrap_or(0)
    }

    pub fn is_suspended(&self, thread: ThreadId) -> bool {
        self.suspend_count(thread) > 0
    }

    pub fn is_frozen(&self, thread: ThreadId) -> bool {
        self.frozen.contains(&thread)
    }

    fn index_of(&self, id: SuspendContextId) -> Option<usize> {
        self.contexts.iter().position(|c| c.id == id)
    }

    fn take_vote(
        &mut self,
        vm: &mut dyn JdwpTransport,
        thread: ThreadId,
    ) -> Result<(), CommandError> {
        vm.suspend_thread(thread)?;
        *self.suspend_counts.entry(thread).or_insert(0) += 1;
        Ok(())
    }

    fn release_vote(
        &mut self,
        vm: &mut dyn JdwpTransport,
        thread: ThreadId,
    ) -> Result<(), CommandError> {
        match self.suspend_counts.get_mut(&thread) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    self.suspend_counts.remove(&thread);
                }
                vm.resume_thread(thread)?;
                Ok(())
            }
            _ => {
                // Never drive the count negative; a resume without a
                // matching vote is a protocol violation, not a crash.
                tracing::warn!(
                    target: "javelin.debugger",
                    thread,
                    "resume without a matching suspend vote"
                );
                Ok(())
            }
        }
    }
}
