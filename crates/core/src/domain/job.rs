use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::domain::params::GenerationParams;

/// ジョブ状態
///
/// `Queued → Running → {Succeeded | Failed}` のみ。終端状態からの遷移は無い。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// 投入経路
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchRoute {
    Remote,
    Local,
}

/// 成功時の生成結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// 公開配信可能な音声URL（ジョブID + 連番）
    pub audio_urls: Vec<String>,
    /// 秒。計測値 > バックエンド報告値 > 要求値 > 既定値 の順で決定
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bpm: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_scale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_signature: Option<String>,
    /// 以下はリモート生成時のみ。バックエンドの報告をそのまま渡す
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dit_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lm_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_info: Option<serde_json::Value>,
}

/// ジョブレコード
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub params: Arc<GenerationParams>,
    pub status: JobStatus,
    /// Queued の間だけ Some（先頭から1始まり）
    pub queue_position: Option<usize>,
    pub route: Option<DispatchRoute>,
    pub remote_task: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: Option<f32>,
    pub stage: Option<String>,
    /// 最後にリモートへ状態問い合わせした時刻
    pub last_polled_at: Option<DateTime<Utc>>,
    pub result: Option<GenerationResult>,
    pub error: Option<String>,
    /// デバッグ用の生レスポンス（契約外）
    pub raw_response: Option<serde_json::Value>,
}

impl Job {
    pub fn new(id: String, params: GenerationParams, now: DateTime<Utc>) -> Self {
        Self {
            id,
            params: Arc::new(params),
            status: JobStatus::Queued,
            queue_position: None,
            route: None,
            remote_task: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            progress: None,
            stage: None,
            last_polled_at: None,
            result: None,
            error: None,
            raw_response: None,
        }
    }

    /// 呼び出し元に返す状態ビューを作る。
    pub fn view(&self, per_job_estimate_secs: u64) -> JobStatusView {
        match self.status {
            JobStatus::Queued => {
                let position = self.queue_position.unwrap_or(1);
                JobStatusView::Queued {
                    queue_position: position,
                    estimated_wait_seconds: position as u64 * per_job_estimate_secs,
                }
            }
            JobStatus::Running => JobStatusView::Running {
                started_at: self.started_at.unwrap_or(self.created_at),
                progress: self.progress,
                stage: self.stage.clone(),
            },
            JobStatus::Succeeded => match &self.result {
                Some(result) => JobStatusView::Succeeded {
                    result: result.clone(),
                },
                None => JobStatusView::Failed {
                    error: "Generation finished without a result".to_string(),
                },
            },
            JobStatus::Failed => JobStatusView::Failed {
                error: self
                    .error
                    .clone()
                    .unwrap_or_else(|| "Generation failed".to_string()),
            },
        }
    }
}

/// `get_status` の返却値。現在の状態に属するフィールドのみを持つ。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatusView {
    Queued {
        queue_position: usize,
        estimated_wait_seconds: u64,
    },
    Running {
        started_at: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
    },
    Succeeded {
        result: GenerationResult,
    },
    Failed {
        error: String,
    },
}

impl JobStatusView {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Queued { .. } => JobStatus::Queued,
            Self::Running { .. } => JobStatus::Running,
            Self::Succeeded { .. } => JobStatus::Succeeded,
            Self::Failed { .. } => JobStatus::Failed,
        }
    }
}
