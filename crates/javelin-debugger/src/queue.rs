use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::command::{CommandPriority, DebuggerCommand};

struct QueueState {
    closed: bool,
    buckets: [VecDeque<DebuggerCommand>; CommandPriority::COUNT],
}

/// Closable, reopenable FIFO of debugger commands.
///
/// Strictly FIFO within a priority bucket; [`EventQueue::put_front`] is the
/// only way to jump ahead of already-queued work. Closing cancels every
/// still-queued command exactly once and makes subsequent `put` calls fail
/// until [`EventQueue::reopen`].
pub struct EventQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                closed: false,
                buckets: Default::default(),
            }),
            available: Condvar::new(),
        }
    }

    /// Appends `command` to its priority bucket. Returns `false` (after
    /// delivering the command's cancellation callback) if the queue is
    /// closed.
    pub fn put(&self, command: DebuggerCommand) -> bool {
        self.insert(command, false)
    }

    /// Re-inserts `command` at the front of its priority bucket, ahead of
    /// newly-arriving work. Same closed-queue behavior as [`EventQueue::put`].
    pub fn put_front(&self, command: DebuggerCommand) -> bool {
        self.insert(command, true)
    }

    fn insert(&self, command: DebuggerCommand, front: bool) -> bool {
        let rejected = {
            let mut state = self.state.lock();
            if state.closed {
                Some(command)
            } else {
                let bucket = &mut state.buckets[command.priority.bucket()];
                if front {
                    bucket.push_front(command);
                } else {
                    bucket.push_back(command);
                }
                None
            }
        };

        match rejected {
            // Cancellation callbacks run outside the queue lock; they are
            // allowed to schedule follow-up work.
            Some(command) => {
                command.notify_cancelled();
                false
            }
            None => {
                self.available.notify_one();
                true
            }
        }
    }

    /// Blocks until a command is available or the queue closes. Returns
    /// `None` on close. Called only by the worker loop.
    pub(crate) fn get(&self) -> Option<DebuggerCommand> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(command) = pop_highest(&mut state) {
                return Some(command);
            }
            self.available.wait(&mut state);
        }
    }

    /// Non-blocking variant used by the fork pump. Returns `None` when the
    /// queue is empty or closed.
    pub(crate) fn try_get(&self) -> Option<DebuggerCommand> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        pop_highest(&mut state)
    }

    /// Closes the queue: every still-queued command receives its single
    /// cancellation callback, waiters wake up, and new `put` calls fail. The
    /// command currently executing (already dequeued) is unaffected.
    pub fn close(&self) {
        let drained = {
            let mut state = self.state.lock();
            state.closed = true;
            let mut drained = Vec::new();
            for bucket in &mut state.buckets {
                drained.extend(bucket.drain(..));
            }
            drained
        };
        self.available.notify_all();
        for command in drained {
            command.notify_cancelled();
        }
    }

    pub fn reopen(&self) {
        self.state.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().buckets.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn pop_highest(state: &mut QueueState) -> Option<DebuggerCommand> {
    state
        .buckets
        .iter_mut()
        .find_map(|bucket| bucket.pop_front())
}
