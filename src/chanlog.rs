//! Channel log handles.
//!
//! The actual daily-rotating writer is an external collaborator; the core
//! only holds a handle per channel and closes it at shutdown. The no-op
//! provider is used when no `log_dir` is configured.

use std::rc::Rc;

pub trait ChannelLog {
    fn write(&self, _line: &str) {}
    fn close(&self) {}
}

/// Discards everything.
pub struct NoopLog;

impl ChannelLog for NoopLog {}

/// Build a log handle for a channel according to configuration.
pub fn open_channel_log(log_dir: Option<&str>, _channel: &str) -> Rc<dyn ChannelLog> {
    // The rotating file writer lives outside the core; until it is wired
    // in, a configured log_dir still gets the no-op handle.
    let _ = log_dir;
    Rc::new(NoopLog)
}
