use std::any::Any;

use thiserror::Error;

use crate::suspend::SuspendContextId;

pub type CommandResult = Result<(), CommandError>;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("jdwp: {0}")]
    Jdwp(#[from] javelin_jdwp::JdwpError),
    #[error("unknown suspend context {0}")]
    UnknownContext(SuspendContextId),
    #[error("{0}")]
    Other(String),
}

impl CommandError {
    /// True when the underlying failure means the debuggee is gone. The
    /// worker loop logs these at debug level instead of reporting a command
    /// bug.
    pub fn is_disconnect(&self) -> bool {
        match self {
            CommandError::Jdwp(err) => err.is_disconnect(),
            _ => false,
        }
    }
}

pub(crate) fn panic_payload_to_str(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    payload
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}
