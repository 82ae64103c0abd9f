//! Project streams: append envelopes and replay them.

pub mod appender;
pub mod reader;

pub use appender::Appender;
pub use reader::{Page, Reader};

/// Default stream-name prefix.
pub const DEFAULT_STREAM_PREFIX: &str = "project-";

/// Maps a project id to its stream name, one-to-one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamNaming {
    prefix: String,
}

impl StreamNaming {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Use the project id itself as the stream name.
    pub fn raw() -> Self {
        Self::new("")
    }

    pub fn stream_for(&self, project_id: &str) -> String {
        format!("{}{project_id}", self.prefix)
    }
}

impl Default for StreamNaming {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_PREFIX)
    }
}
