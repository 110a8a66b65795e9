//! Java Debug Wire Protocol (JDWP) transport façade for Javelin.
//!
//! `javelin-debugger` consumes this crate to drive the debuggee JVM: suspend
//! and resume threads, read protocol-level suspend counts, and inspect
//! contended monitors for the blocked-thread watchdog.
//!
//! The crate deliberately exposes only the capability surface the scheduler
//! and suspend-state coordinator need. Wire-level concerns (handshake,
//! framing, event loops) live in the transport implementations behind
//! [`JdwpTransport`]; the in-memory [`MockTransport`] included here is the
//! deterministic double used by the debugger test suites.

mod mock;

use std::io;

use thiserror::Error;

pub use mock::MockTransport;

pub type ThreadId = u64;
pub type MonitorId = u64;

/// A thread known to the debuggee VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
}

#[derive(Debug, Error)]
pub enum JdwpError {
    #[error("JDWP transport is not connected")]
    NotConnected,
    #[error("debuggee VM disconnected")]
    Disconnected,
    #[error("JDWP operation not supported by the target VM")]
    NotImplemented,
    #[error("JDWP protocol error: {0}")]
    Protocol(String),
    #[error("JDWP command failed with error code {error_code}")]
    CommandFailed { error_code: u16 },
    #[error("unknown thread id {0}")]
    InvalidThreadId(ThreadId),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl JdwpError {
    /// True when the error means "the target is gone" rather than "the
    /// request was bad". The scheduler uses this to log disconnects quietly
    /// instead of reporting a command bug.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            JdwpError::Disconnected | JdwpError::NotConnected | JdwpError::Io(_)
        )
    }

    /// True for capabilities the target VM does not implement. Callers treat
    /// this as a soft failure (skip the feature), not an error.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, JdwpError::NotImplemented)
    }
}

/// Minimal, mock-friendly interface to the debuggee VM.
///
/// Suspension follows JDWP vote semantics: `suspend_thread` stacks (each call
/// increments the thread's suspend count), `resume_thread` decrements, and a
/// thread only runs again once its count reaches zero. Resuming a running
/// thread is a no-op. `suspend_all`/`resume_all` apply one vote to every
/// thread the VM knows about.
pub trait JdwpTransport: Send {
    fn threads(&mut self) -> Result<Vec<ThreadInfo>, JdwpError>;

    fn suspend_thread(&mut self, thread: ThreadId) -> Result<(), JdwpError>;
    fn resume_thread(&mut self, thread: ThreadId) -> Result<(), JdwpError>;
    fn suspend_all(&mut self) -> Result<(), JdwpError>;
    fn resume_all(&mut self) -> Result<(), JdwpError>;

    fn suspend_count(&mut self, thread: ThreadId) -> Result<u32, JdwpError>;

    fn is_suspended(&mut self, thread: ThreadId) -> Result<bool, JdwpError> {
        Ok(self.suspend_count(thread)? > 0)
    }

    /// The monitor `thread` is currently blocked on, if any.
    ///
    /// Optional JDWP capability (`canGetCurrentContendedMonitor`); returns
    /// [`JdwpError::NotImplemented`] when the target VM lacks it.
    fn current_contended_monitor(
        &mut self,
        _thread: ThreadId,
    ) -> Result<Option<MonitorId>, JdwpError> {
        Err(JdwpError::NotImplemented)
    }

    /// The thread that owns `monitor`, if any.
    ///
    /// Optional JDWP capability (`canGetMonitorInfo`); returns
    /// [`JdwpError::NotImplemented`] when the target VM lacks it.
    fn owning_thread(&mut self, _monitor: MonitorId) -> Result<Option<ThreadId>, JdwpError> {
        Err(JdwpError::NotImplemented)
    }
}
