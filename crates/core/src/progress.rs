use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::runner::{RunState, StageStatus};
use crate::stage::StageId;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        run_id: String,
    },
    StateChanged {
        state: RunState,
    },
    StageStarted {
        stage: StageId,
        chapter: Option<u32>,
    },
    /// Streamed text as it arrives from the provider.
    Chunk {
        stage: StageId,
        chapter: Option<u32>,
        text: String,
    },
    StageRetry {
        stage: StageId,
        chapter: Option<u32>,
        attempt: usize,
        reason: String,
    },
    StageFinished {
        stage: StageId,
        chapter: Option<u32>,
        status: StageStatus,
        retries: u32,
    },
    /// Progress of the compiled book's own sections (introduction, final thoughts, review).
    SectionChunk {
        section: String,
        text: String,
    },
    RunFinished {
        run_id: String,
        state: RunState,
    },
}

/// Observer of a run. Called from whichever task made progress, so it must not block.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn publish(&self, event: ProgressEvent) {
        self(event)
    }
}

#[derive(Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn publish(&self, _event: ProgressEvent) {}
}

/// Forwards events into an unbounded tokio channel, dropping them once the receiver is gone.
#[derive(Clone)]
pub struct ChannelProgress {
    sender: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ProgressSink for ChannelProgress {
    fn publish(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }
}

/// Keeps every event; used by tests and for post-run inspection.
#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl ProgressSink for RecordingProgress {
    fn publish(&self, event: ProgressEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_progress_delivers_in_order() {
        let (progress, mut receiver) = ChannelProgress::new();
        progress.publish(ProgressEvent::RunStarted {
            run_id: "r1".into(),
        });
        progress.publish(ProgressEvent::StageStarted {
            stage: StageId::SeoQueries,
            chapter: None,
        });
        drop(progress);

        let mut received = Vec::new();
        while let Some(event) = receiver.recv().await {
            received.push(event);
        }
        assert_eq!(received.len(), 2);
        assert!(matches!(received[0], ProgressEvent::RunStarted { .. }));
    }

    #[test]
    fn closures_are_sinks() {
        let seen = Mutex::new(0);
        let sink = |_event: ProgressEvent| *seen.lock().unwrap() += 1;
        sink.publish(ProgressEvent::StateChanged {
            state: RunState::Idle,
        });
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
