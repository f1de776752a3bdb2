//! テスト用モックバックエンド

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{BackendError, GenerationBackend, SubmitRequest, TaskRecord};

#[derive(Debug, Clone)]
pub(crate) enum SubmitBehavior {
    Accept(String),
    MissingTaskId,
    Reject(u16, String),
}

pub(crate) struct MockBackend {
    /// None の場合はネットワークエラー
    pub health: Mutex<Option<bool>>,
    pub health_delay: Duration,
    pub health_calls: AtomicUsize,
    pub submit: Mutex<SubmitBehavior>,
    pub submit_calls: AtomicUsize,
    pub last_request: Mutex<Option<SubmitRequest>>,
    /// 先頭から順に返し、最後の1件は繰り返す
    pub query_script: Mutex<VecDeque<Result<TaskRecord, String>>>,
    pub query_calls: AtomicUsize,
    pub audio: Mutex<HashMap<String, Vec<u8>>>,
}

impl MockBackend {
    pub fn new(healthy: bool) -> Self {
        Self {
            health: Mutex::new(Some(healthy)),
            health_delay: Duration::ZERO,
            health_calls: AtomicUsize::new(0),
            submit: Mutex::new(SubmitBehavior::Accept("task-1".into())),
            submit_calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
            query_script: Mutex::new(VecDeque::new()),
            query_calls: AtomicUsize::new(0),
            audio: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_queries(self, script: Vec<Result<TaskRecord, String>>) -> Self {
        *self.query_script.lock() = script.into();
        self
    }

    pub fn with_submit(self, behavior: SubmitBehavior) -> Self {
        *self.submit.lock() = behavior;
        self
    }

    pub fn with_audio(self, reference: &str, bytes: &[u8]) -> Self {
        self.audio.lock().insert(reference.to_string(), bytes.to_vec());
        self
    }
}

pub(crate) fn record(status_code: i64) -> TaskRecord {
    TaskRecord {
        status_code,
        result: None,
        error: None,
        message: None,
        status_text: None,
        progress: None,
        stage: None,
        raw: serde_json::json!({ "status": status_code }),
    }
}

pub(crate) fn running(progress: Option<f32>, stage: Option<&str>) -> TaskRecord {
    TaskRecord {
        progress,
        stage: stage.map(str::to_string),
        ..record(0)
    }
}

pub(crate) fn succeeded(result: serde_json::Value) -> TaskRecord {
    TaskRecord {
        result: Some(result.to_string()),
        ..record(1)
    }
}

pub(crate) fn failed(error: &str) -> TaskRecord {
    TaskRecord {
        error: Some(error.to_string()),
        ..record(2)
    }
}

#[async_trait]
impl GenerationBackend for MockBackend {
    async fn health(&self) -> Result<bool, BackendError> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        if !self.health_delay.is_zero() {
            tokio::time::sleep(self.health_delay).await;
        }
        let health = *self.health.lock();
        health.ok_or_else(|| BackendError::Http("connection refused".into()))
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<String, BackendError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some(request.clone());
        let behavior = self.submit.lock().clone();
        match behavior {
            SubmitBehavior::Accept(id) => Ok(id),
            SubmitBehavior::MissingTaskId => Err(BackendError::MissingTaskId),
            SubmitBehavior::Reject(status, body) => Err(BackendError::Rejected { status, body }),
        }
    }

    async fn query(&self, _task_id: &str) -> Result<TaskRecord, BackendError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.query_script.lock();
        let next = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        match next {
            Some(Ok(rec)) => Ok(rec),
            Some(Err(msg)) => Err(BackendError::Http(msg)),
            None => Ok(running(None, None)),
        }
    }

    async fn fetch_audio(&self, reference: &str) -> Result<Vec<u8>, BackendError> {
        self.audio
            .lock()
            .get(reference)
            .cloned()
            .ok_or_else(|| BackendError::Rejected {
                status: 404,
                body: format!("no such audio: {reference}"),
            })
    }

    fn name(&self) -> &str {
        "mock"
    }
}
