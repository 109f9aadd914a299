use std::collections::HashSet;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::{executor, Engine};
use crate::types::{BatchKey, RequestLine};
use crate::utils::task::spawn_supervised;

/// The accumulating batch a lane worker owns. Count, byte length, and the
/// owned correlation-id set move together; the start time resets whenever
/// the buffer empties.
pub(crate) struct BatchBuffer {
    payload: Vec<u8>,
    count: usize,
    ids: HashSet<String>,
    started_at: Instant,
}

impl BatchBuffer {
    pub(crate) fn new() -> Self {
        Self {
            payload: Vec::new(),
            count: 0,
            ids: HashSet::new(),
            started_at: Instant::now(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    pub(crate) fn byte_len(&self) -> usize {
        self.payload.len()
    }

    pub(crate) fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub(crate) fn push(&mut self, custom_id: String, line: &[u8]) {
        if self.count == 0 {
            self.started_at = Instant::now();
        }
        self.payload.extend_from_slice(line);
        self.ids.insert(custom_id);
        self.count += 1;
    }

    pub(crate) fn take(&mut self) -> (Vec<u8>, HashSet<String>) {
        self.count = 0;
        self.started_at = Instant::now();
        (mem::take(&mut self.payload), mem::take(&mut self.ids))
    }
}

/// An incoming line forces a flush of the current buffer when appending it
/// would cross the byte budget or the buffer already holds a full batch.
/// An oversized line on an empty buffer is accepted as a singleton.
fn needs_flush_before_append(
    buffer: &BatchBuffer,
    line_len: usize,
    max_bytes: usize,
    max_count: usize,
) -> bool {
    !buffer.is_empty()
        && (buffer.byte_len() + line_len > max_bytes || buffer.count() >= max_count)
}

pub(crate) async fn run_lane(
    engine: Arc<Engine>,
    key: BatchKey,
    mut ingest: mpsc::Receiver<RequestLine>,
) {
    debug!(endpoint = %key.endpoint, "batching worker started");
    let mut buffer = BatchBuffer::new();
    let mut tick = tokio::time::interval(engine.config.tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = ingest.recv() => {
                match received {
                    Some(line) => enqueue(&engine, &key, &mut buffer, line),
                    None => break,
                }
            }
            _ = tick.tick() => {
                if !buffer.is_empty()
                    && (buffer.age() >= engine.config.max_hold
                        || buffer.count() >= engine.config.max_batch_size)
                {
                    info!(
                        requests = buffer.count(),
                        held_ms = buffer.age().as_millis() as u64,
                        "processing batch due to age or size limit"
                    );
                    flush(&engine, &key, &mut buffer);
                }
            }
            _ = engine.shutdown.cancelled() => {
                debug!(endpoint = %key.endpoint, "batching worker received shutdown signal");
                break;
            }
        }
    }

    // A handler may hold a clone of the ingest sender from just before the
    // shutdown broadcast. Closing the channel fails those sends, and the
    // drain below picks up whatever was already queued.
    ingest.close();
    while let Ok(line) = ingest.try_recv() {
        enqueue(&engine, &key, &mut buffer, line);
    }
    if !buffer.is_empty() {
        info!(requests = buffer.count(), "processing final batch before shutdown");
        flush(&engine, &key, &mut buffer);
    }
    engine.remove_lane(&key);
    debug!(endpoint = %key.endpoint, "batching worker stopped");
}

fn enqueue(engine: &Arc<Engine>, key: &BatchKey, buffer: &mut BatchBuffer, line: RequestLine) {
    let custom_id = line.custom_id.clone();
    let mut encoded = match serde_json::to_vec(&line) {
        Ok(encoded) => encoded,
        Err(err) => {
            engine.synthesize_error(&custom_id, &format!("Failed to serialize request: {err}"));
            return;
        }
    };
    encoded.push(b'\n');

    if needs_flush_before_append(
        buffer,
        encoded.len(),
        engine.config.max_batch_bytes,
        engine.config.max_batch_size,
    ) {
        info!(requests = buffer.count(), "processing full batch");
        flush(engine, key, buffer);
    }

    buffer.push(custom_id, &encoded);
    debug!(
        requests = buffer.count(),
        bytes = buffer.byte_len(),
        "request added to batch"
    );
}

fn flush(engine: &Arc<Engine>, key: &BatchKey, buffer: &mut BatchBuffer) {
    let (payload, ids) = buffer.take();
    let engine = engine.clone();
    let key = key.clone();
    spawn_supervised("batch-executor", async move {
        executor::run(engine, key, payload, ids).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(n: usize) -> Vec<u8> {
        let mut bytes = vec![b'x'; n - 1];
        bytes.push(b'\n');
        bytes
    }

    #[test]
    fn buffer_tracks_count_bytes_and_ids_together() {
        let mut buffer = BatchBuffer::new();
        assert!(buffer.is_empty());

        buffer.push("req_1".to_string(), &line(10));
        buffer.push("req_2".to_string(), &line(20));
        assert_eq!(buffer.count(), 2);
        assert_eq!(buffer.byte_len(), 30);

        let (payload, ids) = buffer.take();
        assert_eq!(payload.len(), 30);
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("req_1"));
        assert!(buffer.is_empty());
        assert_eq!(buffer.byte_len(), 0);
    }

    #[test]
    fn age_resets_when_buffer_refills_after_take() {
        let mut buffer = BatchBuffer::new();
        buffer.push("req_1".to_string(), &line(5));
        std::thread::sleep(Duration::from_millis(20));
        buffer.take();
        buffer.push("req_2".to_string(), &line(5));
        assert!(buffer.age() < Duration::from_millis(20));
    }

    #[test]
    fn oversized_line_on_empty_buffer_is_admitted() {
        let buffer = BatchBuffer::new();
        assert!(!needs_flush_before_append(&buffer, 1_000_000, 100, 10));
    }

    #[test]
    fn byte_budget_forces_flush_of_nonempty_buffer() {
        let mut buffer = BatchBuffer::new();
        buffer.push("req_1".to_string(), &line(60));
        assert!(needs_flush_before_append(&buffer, 50, 100, 10));
        assert!(!needs_flush_before_append(&buffer, 40, 100, 10));
    }

    #[test]
    fn full_count_forces_flush_of_nonempty_buffer() {
        let mut buffer = BatchBuffer::new();
        buffer.push("req_1".to_string(), &line(5));
        buffer.push("req_2".to_string(), &line(5));
        assert!(needs_flush_before_append(&buffer, 5, 1000, 2));
        assert!(!needs_flush_before_append(&buffer, 5, 1000, 3));
    }
}
