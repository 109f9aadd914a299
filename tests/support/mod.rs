#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use batchgate::types::{BatchObject, BatchStatus, RequestLine, ResultBody, ResultLine};
use batchgate::{BatchgateError, Engine, EngineConfig, ProxyStats, Result, Upstream};

/// In-process stand-in for the upstream batch API. Uploaded payloads are
/// parsed back and echoed into result lines, so a completed batch answers
/// each request with `{"echo": <original body>}`.
#[derive(Debug, Default)]
pub struct FakeUpstream {
    pub fail_uploads: bool,
    pub fail_create_batch: bool,
    pub fail_batch_status: bool,
    pub hold_until_cancelled: bool,
    pub drop_ids: Mutex<HashSet<String>>,
    pub uploads: Mutex<Vec<Vec<u8>>>,
    pub batches: Mutex<HashMap<String, String>>,
    pub cancelled: Mutex<HashSet<String>>,
    pub deleted: Mutex<Vec<String>>,
}

impl FakeUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_uploads() -> Arc<Self> {
        Arc::new(Self {
            fail_uploads: true,
            ..Self::default()
        })
    }

    /// Uploads succeed, creating the batch fails.
    pub fn failing_create_batch() -> Arc<Self> {
        Arc::new(Self {
            fail_create_batch: true,
            ..Self::default()
        })
    }

    /// Uploads and creation succeed, every status poll fails.
    pub fn failing_batch_status() -> Arc<Self> {
        Arc::new(Self {
            fail_batch_status: true,
            ..Self::default()
        })
    }

    /// Batches stay in progress until `cancel_batch` is observed for them.
    pub fn holding_until_cancelled() -> Arc<Self> {
        Arc::new(Self {
            hold_until_cancelled: true,
            ..Self::default()
        })
    }

    /// Omits the given correlation id from every produced output file.
    pub fn drop_id(&self, custom_id: &str) {
        self.drop_ids.lock().unwrap().insert(custom_id.to_string());
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    pub fn cancelled_count(&self) -> usize {
        self.cancelled.lock().unwrap().len()
    }

    pub fn deleted_files(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    /// Request lines parsed back out of one uploaded payload.
    pub fn uploaded_lines(&self, index: usize) -> Vec<RequestLine> {
        let payload = self.uploads.lock().unwrap()[index].clone();
        payload
            .split(|byte| *byte == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_slice(line).unwrap())
            .collect()
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn upload_file(&self, _credential: &str, payload: Vec<u8>) -> Result<String> {
        if self.fail_uploads {
            return Err(BatchgateError::Upstream("simulated upload outage".to_string()));
        }
        let mut uploads = self.uploads.lock().unwrap();
        uploads.push(payload);
        Ok(format!("file_{}", uploads.len() - 1))
    }

    async fn create_batch(
        &self,
        _credential: &str,
        input_file_id: &str,
        _endpoint: &str,
    ) -> Result<String> {
        if self.fail_create_batch {
            return Err(BatchgateError::Upstream("simulated create outage".to_string()));
        }
        let mut batches = self.batches.lock().unwrap();
        let batch_id = format!("batch_{}", batches.len());
        batches.insert(batch_id.clone(), input_file_id.to_string());
        Ok(batch_id)
    }

    async fn batch_status(&self, _credential: &str, batch_id: &str) -> Result<BatchObject> {
        if self.fail_batch_status {
            return Err(BatchgateError::Upstream("simulated poll outage".to_string()));
        }
        if self.hold_until_cancelled && !self.cancelled.lock().unwrap().contains(batch_id) {
            return Ok(BatchObject {
                id: batch_id.to_string(),
                status: BatchStatus::InProgress,
                output_file_id: None,
                error_file_id: None,
                error: None,
            });
        }
        if self.hold_until_cancelled {
            return Ok(BatchObject {
                id: batch_id.to_string(),
                status: BatchStatus::Cancelled,
                output_file_id: None,
                error_file_id: None,
                error: None,
            });
        }
        Ok(BatchObject {
            id: batch_id.to_string(),
            status: BatchStatus::Completed,
            output_file_id: Some(format!("{batch_id}_output")),
            error_file_id: None,
            error: None,
        })
    }

    async fn cancel_batch(&self, _credential: &str, batch_id: &str) -> Result<()> {
        self.cancelled.lock().unwrap().insert(batch_id.to_string());
        Ok(())
    }

    async fn file_content(&self, _credential: &str, file_id: &str) -> Result<Bytes> {
        let batch_id = file_id
            .strip_suffix("_output")
            .ok_or_else(|| BatchgateError::Upstream(format!("unknown file {file_id}")))?;
        let input_file_id = self
            .batches
            .lock()
            .unwrap()
            .get(batch_id)
            .cloned()
            .ok_or_else(|| BatchgateError::Upstream(format!("unknown batch {batch_id}")))?;
        let index: usize = input_file_id
            .strip_prefix("file_")
            .and_then(|suffix| suffix.parse().ok())
            .ok_or_else(|| BatchgateError::Upstream(format!("unknown file {input_file_id}")))?;

        let payload = self.uploads.lock().unwrap()[index].clone();
        let drop_ids = self.drop_ids.lock().unwrap().clone();
        let mut content = Vec::new();
        for line in payload.split(|byte| *byte == b'\n') {
            if line.is_empty() {
                continue;
            }
            let request: RequestLine = serde_json::from_slice(line).unwrap();
            if drop_ids.contains(&request.custom_id) {
                continue;
            }
            let result = ResultLine {
                custom_id: request.custom_id,
                response: Some(ResultBody {
                    status_code: 200,
                    request_id: "fake-upstream".to_string(),
                    body: json!({"echo": request.body}),
                }),
                error: None,
            };
            content.extend_from_slice(&serde_json::to_vec(&result).unwrap());
            content.push(b'\n');
        }
        Ok(Bytes::from(content))
    }

    async fn delete_file(&self, _credential: &str, file_id: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(file_id.to_string());
        Ok(())
    }
}

/// Engine tuned for test latencies: short hold, fast tick, fast poll.
pub fn quick_config() -> EngineConfig {
    EngineConfig {
        max_hold: Duration::from_millis(50),
        tick_interval: Duration::from_millis(10),
        poll_interval: Duration::from_millis(10),
        ..EngineConfig::default()
    }
}

pub fn new_engine(upstream: Arc<FakeUpstream>, config: EngineConfig) -> Arc<Engine> {
    Arc::new(Engine::new(
        upstream,
        config,
        Arc::new(ProxyStats::default()),
    ))
}

pub async fn wait_for<F: Fn() -> bool>(condition: F, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
