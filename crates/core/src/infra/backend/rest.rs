use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::{BackendError, GenerationBackend, SubmitRequest, TaskRecord};
use crate::domain::settings::OrchestratorSettings;

/// 生成バックエンドの REST API クライアント
pub struct GenerationApiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    health_timeout: Duration,
}

impl GenerationApiClient {
    pub fn new(settings: &OrchestratorSettings) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| BackendError::Http(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: settings.api_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            health_timeout: settings.health_timeout(),
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.post(format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => req.header("x-api-key", key),
            None => req,
        }
    }

    /// バックエンドの音声参照をダウンロードURLに変換する。
    pub fn audio_url(&self, reference: &str) -> Result<reqwest::Url, BackendError> {
        build_audio_url(&self.base_url, reference)
    }
}

async fn rejected(response: reqwest::Response) -> BackendError {
    let status = response.status().as_u16();
    let raw = response.text().await.unwrap_or_default();
    BackendError::Rejected {
        status,
        body: error_text_from_body(&raw),
    }
}

#[async_trait]
impl GenerationBackend for GenerationApiClient {
    async fn health(&self) -> Result<bool, BackendError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(self.health_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Ok(false);
        }
        let body = response.text().await.unwrap_or_default();
        Ok(parse_health_body(&body))
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<String, BackendError> {
        let response = self.post("/release_task").json(request).send().await?;

        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(format!("Response parse error: {e}")))?;
        parse_submit_response(&body)
    }

    async fn query(&self, task_id: &str) -> Result<TaskRecord, BackendError> {
        let response = self
            .post("/query_result")
            .json(&serde_json::json!({ "task_id_list": [task_id] }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(format!("Response parse error: {e}")))?;
        parse_query_response(&body, task_id)
    }

    async fn fetch_audio(&self, reference: &str) -> Result<Vec<u8>, BackendError> {
        let url = self.audio_url(reference)?;
        log::debug!("音声を取得: {url}");
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }

    fn name(&self) -> &str {
        "rest"
    }
}

// ─── レスポンス解析（境界で一度だけ） ─────────────────────────────

/// `/v1/audio...` はベースURLに連結、素のパスは `?path=` 付きに変換、絶対URLはそのまま。
pub(crate) fn build_audio_url(base_url: &str, reference: &str) -> Result<reqwest::Url, BackendError> {
    let invalid = |e: String| {
        BackendError::InvalidResponse(format!("Invalid audio reference {reference:?}: {e}"))
    };

    if reference.starts_with("http://") || reference.starts_with("https://") {
        return reqwest::Url::parse(reference).map_err(|e| invalid(e.to_string()));
    }
    if reference.starts_with("/v1/audio") {
        return reqwest::Url::parse(&format!("{base_url}{reference}"))
            .map_err(|e| invalid(e.to_string()));
    }
    let mut url = reqwest::Url::parse(&format!("{base_url}/v1/audio"))
        .map_err(|e| invalid(e.to_string()))?;
    url.query_pairs_mut().append_pair("path", reference);
    Ok(url)
}

/// `{ok}` / `{healthy}` / `{status:"ok"}` / `{data:{status}}` のいずれかで判定する。
/// 明示的な否定が無い 2xx は到達可能とみなす。
pub(crate) fn parse_health_body(body: &str) -> bool {
    let Ok(json) = serde_json::from_str::<Value>(body) else {
        return true;
    };
    for key in ["ok", "healthy"] {
        if let Some(flag) = json.get(key).and_then(Value::as_bool) {
            return flag;
        }
    }
    let status = json
        .get("status")
        .or_else(|| json.get("data").and_then(|d| d.get("status")));
    match status.and_then(Value::as_str) {
        Some(s) => matches!(s.to_ascii_lowercase().as_str(), "ok" | "healthy" | "ready"),
        None => true,
    }
}

pub(crate) fn parse_submit_response(body: &Value) -> Result<String, BackendError> {
    let task_id = body
        .get("data")
        .and_then(|d| d.get("task_id"))
        .or_else(|| body.get("task_id"));

    match task_id {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(BackendError::MissingTaskId),
    }
}

fn string_field(v: &Value, key: &str) -> Option<String> {
    match v.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// 進捗は 0.0〜1.0 に正規化する。百分率で届いた場合も受け付ける。
fn parse_progress(v: &Value) -> Option<f32> {
    let raw = match v.get("progress")? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok()?,
        _ => return None,
    };
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    let normalized = if raw > 1.0 { raw / 100.0 } else { raw };
    Some(normalized.min(1.0) as f32)
}

pub(crate) fn parse_query_response(body: &Value, task_id: &str) -> Result<TaskRecord, BackendError> {
    let list = body
        .get("data")
        .or_else(|| body.get("data_list"))
        .unwrap_or(body);
    let items = list.as_array().ok_or_else(|| {
        BackendError::InvalidResponse("No task data in response".to_string())
    })?;

    let item = items
        .iter()
        .find(|t| match t.get("task_id") {
            Some(Value::String(s)) => s == task_id,
            Some(Value::Number(n)) => n.to_string() == task_id,
            _ => false,
        })
        .or_else(|| items.first())
        .ok_or_else(|| BackendError::InvalidResponse("No task data in response".to_string()))?;

    let (status_code, status_text) = match item.get("status") {
        Some(Value::Number(n)) => (n.as_i64(), None),
        Some(Value::String(s)) => (s.trim().parse::<i64>().ok(), Some(s.clone())),
        _ => (None, None),
    };
    let status_code = status_code.ok_or_else(|| {
        BackendError::InvalidResponse(format!("Task status code missing: {item}"))
    })?;

    let result = match item.get("result") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(v @ (Value::Array(_) | Value::Object(_))) => Some(v.to_string()),
        _ => None,
    };

    Ok(TaskRecord {
        status_code,
        result,
        error: string_field(item, "error"),
        message: string_field(item, "message"),
        status_text,
        progress: parse_progress(item),
        stage: string_field(item, "stage").or_else(|| string_field(item, "progress_text")),
        raw: item.clone(),
    })
}

/// エラーボディから人が読める文字列を取り出す。
fn error_text_from_body(raw: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(raw) {
        for key in ["error", "message", "detail"] {
            if let Some(s) = string_field(&json, key) {
                return s;
            }
        }
    }
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        "empty response body".to_string()
    } else {
        trimmed.chars().take(500).collect()
    }
}
