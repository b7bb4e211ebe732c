//! Live feed adapters. Each normalizes its wire protocol into
//! `UnifiedEvent`s, forwards them over one mpsc channel, and exposes a stop
//! handle. Decoding failures are logged and dropped at this boundary.

pub mod catalog;
pub mod polymarket;
pub mod spot;

/// Stop handle for a running feed task. Aborting drops the websocket,
/// which closes the connection; events already handed to the pipeline run
/// to completion.
pub struct FeedHandle {
    task: tokio::task::JoinHandle<()>,
}

impl FeedHandle {
    pub(crate) fn new(task: tokio::task::JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}
