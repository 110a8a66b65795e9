use std::fmt;

use crate::error::CommandResult;
use crate::manager::CommandContext;
use crate::suspend::SuspendContextId;

/// Queue insertion order among pending commands. A running command is never
/// preempted; priority only decides which pending command is pulled next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CommandPriority {
    High,
    Normal,
    Low,
}

impl CommandPriority {
    pub(crate) const COUNT: usize = 3;

    pub(crate) fn bucket(self) -> usize {
        match self {
            CommandPriority::High => 0,
            CommandPriority::Normal => 1,
            CommandPriority::Low => 2,
        }
    }
}

/// Dispatch tag resolved once by the scheduler before a command runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Plain,
    /// Bound to one suspend-context episode: cancelled if the context has
    /// already been resumed, pushed back while the context is mid-evaluation.
    SuspendContextBound(SuspendContextId),
}

/// What happened to a submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Executed,
    Cancelled,
}

type RunFn = Box<dyn FnOnce(&mut CommandContext<'_>) -> CommandResult + Send>;
type CancelFn = Box<dyn FnOnce() + Send>;

/// A unit of work executed exclusively on the debugger worker thread.
///
/// Consumed exactly once: either the scheduler runs it, or it receives a
/// single cancellation callback (queue closed, or its bound suspend context
/// already resumed) — never both, never neither.
pub struct DebuggerCommand {
    pub(crate) priority: CommandPriority,
    pub(crate) kind: CommandKind,
    pub(crate) run: RunFn,
    pub(crate) on_cancel: Option<CancelFn>,
}

impl DebuggerCommand {
    pub fn new<F>(run: F) -> Self
    where
        F: FnOnce(&mut CommandContext<'_>) -> CommandResult + Send + 'static,
    {
        Self {
            priority: CommandPriority::Normal,
            kind: CommandKind::Plain,
            run: Box::new(run),
            on_cancel: None,
        }
    }

    /// A command bound to `context`; see [`CommandKind::SuspendContextBound`].
    pub fn for_context<F>(context: SuspendContextId, run: F) -> Self
    where
        F: FnOnce(&mut CommandContext<'_>) -> CommandResult + Send + 'static,
    {
        Self {
            priority: CommandPriority::Normal,
            kind: CommandKind::SuspendContextBound(context),
            run: Box::new(run),
            on_cancel: None,
        }
    }

    pub fn with_priority(mut self, priority: CommandPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Invoked instead of `run` when the command is dropped without
    /// executing. Callers use this to release UI-held state; it is normal
    /// control flow, not an error.
    pub fn on_cancelled<F>(mut self, on_cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_cancel = Some(Box::new(on_cancel));
        self
    }

    pub fn priority(&self) -> CommandPriority {
        self.priority
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub(crate) fn notify_cancelled(self) {
        if let Some(on_cancel) = self.on_cancel {
            on_cancel();
        }
    }
}

impl fmt::Debug for DebuggerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebuggerCommand")
            .field("priority", &self.priority)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
