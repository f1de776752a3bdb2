use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::domain::error::AppError;
use crate::infra::backend::{BackendError, GenerationBackend, TaskRecord};

/// バックエンドが報告した楽曲メタデータと生成情報
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendMetas {
    pub duration: Option<f64>,
    pub bpm: Option<u32>,
    pub key_scale: Option<String>,
    pub time_signature: Option<String>,
    pub dit_model: Option<String>,
    pub lm_model: Option<String>,
    pub seed_value: Option<String>,
    pub generation_info: Option<Value>,
}

/// リモートタスク状態をオーケストレータの語彙に変換した結果
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    StillRunning {
        progress: Option<f32>,
        stage: Option<String>,
    },
    Done {
        audio_refs: Vec<String>,
        metas: BackendMetas,
        raw: Value,
    },
    BackendFailed {
        details: String,
    },
}

/// 完了したリモートタスク
#[derive(Debug, Clone)]
pub struct Completion {
    pub audio_refs: Vec<String>,
    pub metas: BackendMetas,
    pub raw: Value,
}

/// ステータストランスレータ
pub struct StatusTranslator {
    backend: Arc<dyn GenerationBackend>,
    interval: Duration,
    max_wait: Duration,
}

impl StatusTranslator {
    pub fn new(backend: Arc<dyn GenerationBackend>, interval: Duration, max_wait: Duration) -> Self {
        Self {
            backend,
            interval,
            max_wait,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 1回だけ問い合わせて変換する。
    pub async fn poll(&self, task_id: &str) -> Result<PollOutcome, BackendError> {
        let record = self.backend.query(task_id).await?;
        Ok(Self::translate(&record))
    }

    /// 状態コードの対応: 0 → 実行中, 1 → 完了, 2 → 失敗。
    /// 未知のコードは実行中として扱う。
    pub fn translate(record: &TaskRecord) -> PollOutcome {
        match record.status_code {
            1 => match parse_result_payload(record.result.as_deref()) {
                Ok((audio_refs, metas)) if !audio_refs.is_empty() => PollOutcome::Done {
                    audio_refs,
                    metas,
                    raw: record.raw.clone(),
                },
                Ok(_) => PollOutcome::BackendFailed {
                    details: "Generation finished but returned no audio files".to_string(),
                },
                Err(e) => PollOutcome::BackendFailed { details: e },
            },
            2 => PollOutcome::BackendFailed {
                details: failure_details(record),
            },
            _ => PollOutcome::StillRunning {
                progress: record.progress,
                stage: record.stage.clone(),
            },
        }
    }

    /// 完了・失敗・タイムアウトまで一定間隔でポーリングする。
    ///
    /// 単発の問い合わせ失敗は「今回は新しい情報なし」として握りつぶす。
    pub async fn await_completion<F>(&self, task_id: &str, mut on_progress: F) -> Result<Completion, AppError>
    where
        F: FnMut(Option<f32>, Option<String>),
    {
        let deadline = Instant::now() + self.max_wait;

        loop {
            tokio::time::sleep(self.interval).await;

            match self.poll(task_id).await {
                Ok(PollOutcome::StillRunning { progress, stage }) => on_progress(progress, stage),
                Ok(PollOutcome::Done {
                    audio_refs,
                    metas,
                    raw,
                }) => {
                    return Ok(Completion {
                        audio_refs,
                        metas,
                        raw,
                    })
                }
                Ok(PollOutcome::BackendFailed { details }) => {
                    return Err(AppError::backend(details));
                }
                Err(e) => {
                    log::warn!("タスク {task_id} の状態取得に失敗（次回再試行）: {e}");
                }
            }

            if Instant::now() >= deadline {
                return Err(AppError::timeout(format!(
                    "Generation timed out after {}s waiting for backend task {task_id}",
                    self.max_wait.as_secs()
                )));
            }
        }
    }
}

/// 失敗詳細: error → message → 状態文字列 → 生ボディ の優先順。
fn failure_details(record: &TaskRecord) -> String {
    let from_result = record
        .result
        .as_deref()
        .and_then(|r| serde_json::from_str::<Value>(r).ok())
        .and_then(|v| {
            first_item(&v)
                .and_then(|i| i.get("error").and_then(Value::as_str).map(str::to_string))
        });

    record
        .error
        .clone()
        .or_else(|| record.message.clone())
        .or(from_result)
        .or_else(|| {
            record
                .status_text
                .clone()
                .filter(|s| s.trim().parse::<i64>().is_err())
        })
        .unwrap_or_else(|| format!("Backend reported failure: {}", record.raw))
}

fn first_item(v: &Value) -> Option<&Value> {
    match v {
        Value::Array(items) => items.first(),
        Value::Object(_) => Some(v),
        _ => None,
    }
}

fn number(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

fn text(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// 結果ペイロード（1件のオブジェクトまたは配列）から音声参照とメタデータを取り出す。
/// メタデータは先頭要素のものを使う。
fn parse_result_payload(result: Option<&str>) -> Result<(Vec<String>, BackendMetas), String> {
    let raw = result.ok_or_else(|| "Backend reported success without a result payload".to_string())?;
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| format!("Invalid result payload from backend: {e}"))?;

    let items: Vec<&Value> = match &value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![&value],
        _ => return Err(format!("Unexpected result payload from backend: {raw}")),
    };

    let audio_refs = items
        .iter()
        .filter_map(|item| {
            ["file", "audio_path", "path", "url"]
                .iter()
                .find_map(|key| text(item.get(*key)))
        })
        .collect();

    let first = items.first();
    let mut metas = first
        .and_then(|item| item.get("metas"))
        .map(|m| BackendMetas {
            duration: number(m.get("duration")).filter(|d| *d > 0.0),
            bpm: number(m.get("bpm"))
                .filter(|b| *b > 0.0)
                .map(|b| b.round() as u32),
            key_scale: text(m.get("keyscale").or_else(|| m.get("key_scale"))),
            time_signature: text(m.get("timesignature").or_else(|| m.get("time_signature"))),
            ..Default::default()
        })
        .unwrap_or_default();
    if let Some(item) = first {
        metas.dit_model = text(item.get("dit_model"));
        metas.lm_model = text(item.get("lm_model"));
        metas.seed_value = text(item.get("seed_value"));
        metas.generation_info = item.get("generation_info").filter(|v| !v.is_null()).cloned();
    }

    Ok((audio_refs, metas))
}
