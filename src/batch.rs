//! Ephemeral-event batching.
//!
//! High-frequency ephemeral events (tool updates, thoughts, status lines)
//! would otherwise turn into one remote call each. The batcher accumulates
//! them per task and flushes on a short single-shot debounce timer, or
//! immediately when a task is about to complete — bounding call volume
//! without reordering events within a task.

use crate::event::StreamEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Default debounce window.
pub const DEBOUNCE: Duration = Duration::from_millis(100);

/// One flushed batch, ready to broadcast.
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub task_id: String,
    pub events: Vec<StreamEvent>,
}

/// Per-task debounce buffer feeding a broadcast channel.
#[derive(Clone)]
pub struct EventBatcher {
    task_id: String,
    debounce: Duration,
    buffer: Arc<Mutex<Vec<StreamEvent>>>,
    timer_armed: Arc<AtomicBool>,
    flush_tx: mpsc::Sender<EventBatch>,
}

impl EventBatcher {
    #[must_use]
    pub fn new(task_id: impl Into<String>, flush_tx: mpsc::Sender<EventBatch>) -> Self {
        Self::with_debounce(task_id, flush_tx, DEBOUNCE)
    }

    #[must_use]
    pub fn with_debounce(
        task_id: impl Into<String>,
        flush_tx: mpsc::Sender<EventBatch>,
        debounce: Duration,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            debounce,
            buffer: Arc::new(Mutex::new(Vec::new())),
            timer_armed: Arc::new(AtomicBool::new(false)),
            flush_tx,
        }
    }

    /// Buffer one event and arm the debounce timer if it isn't running.
    pub fn push(&self, event: StreamEvent) {
        {
            let mut buffer = self.buffer.lock().expect("lock poisoned");
            buffer.push(event);
        }

        if !self.timer_armed.swap(true, Ordering::SeqCst) {
            let batcher = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(batcher.debounce).await;
                batcher.timer_armed.store(false, Ordering::SeqCst);
                batcher.flush().await;
            });
        }
    }

    /// Drain the buffer and send it downstream now. Called by the timer and
    /// forced immediately before a task is marked complete.
    pub async fn flush(&self) {
        let events = {
            let mut buffer = self.buffer.lock().expect("lock poisoned");
            std::mem::take(&mut *buffer)
        };
        if events.is_empty() {
            return;
        }
        debug!(task_id = %self.task_id, count = events.len(), "flushing event batch");
        let _ = self
            .flush_tx
            .send(EventBatch {
                task_id: self.task_id.clone(),
                events,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;

    fn status(n: usize) -> StreamEvent {
        StreamEvent::new(EventPayload::Status {
            message: format!("step {n}"),
        })
    }

    #[tokio::test]
    async fn test_debounce_coalesces_pushes() {
        let (tx, mut rx) = mpsc::channel(8);
        let batcher = EventBatcher::with_debounce("t1", tx, Duration::from_millis(20));

        batcher.push(status(1));
        batcher.push(status(2));
        batcher.push(status(3));

        let batch = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timeout")
            .expect("batch");
        assert_eq!(batch.task_id, "t1");
        assert_eq!(batch.events.len(), 3);
    }

    #[tokio::test]
    async fn test_forced_flush_preempts_timer() {
        let (tx, mut rx) = mpsc::channel(8);
        let batcher = EventBatcher::with_debounce("t1", tx, Duration::from_secs(60));

        batcher.push(status(1));
        batcher.flush().await;

        let batch = rx.try_recv().expect("batch available immediately");
        assert_eq!(batch.events.len(), 1);
    }

    #[tokio::test]
    async fn test_flush_with_empty_buffer_sends_nothing() {
        let (tx, mut rx) = mpsc::channel(8);
        let batcher = EventBatcher::with_debounce("t1", tx, Duration::from_millis(10));

        batcher.flush().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_order_preserved_across_batches() {
        let (tx, mut rx) = mpsc::channel(8);
        let batcher = EventBatcher::with_debounce("t1", tx, Duration::from_millis(10));

        batcher.push(status(1));
        batcher.flush().await;
        batcher.push(status(2));
        batcher.flush().await;

        let first = rx.recv().await.expect("first");
        let second = rx.recv().await.expect("second");
        let text = |batch: &EventBatch| match &batch.events[0].payload {
            EventPayload::Status { message } => message.clone(),
            _ => String::new(),
        };
        assert_eq!(text(&first), "step 1");
        assert_eq!(text(&second), "step 2");
    }
}
