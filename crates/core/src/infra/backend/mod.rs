pub mod rest;

#[cfg(test)]
pub(crate) mod mock;

pub use rest::GenerationApiClient;

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::params::{defaults, GenerationParams};
use crate::infra::layout::AudioLayout;

/// リモートバックエンドエラー
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(String),
    #[error("Backend request timed out")]
    Timeout,
    #[error("Backend rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("No task ID returned from generation backend")]
    MissingTaskId,
    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(e.to_string())
        }
    }
}

/// `release_task` に送るリクエストボディ。未指定項目は既定値で埋める。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitRequest {
    pub prompt: String,
    pub lyrics: String,
    pub thinking: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dit_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bpm: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_scale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_duration: Option<f64>,
    pub vocal_language: String,
    pub inference_steps: u32,
    pub guidance_scale: f64,
    pub use_random_seed: bool,
    pub seed: i64,
    pub batch_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_code_string: Option<String>,
    pub repainting_start: f64,
    pub repainting_end: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_audio_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_audio_path: Option<String>,
    pub audio_cover_strength: f64,
    pub task_type: String,
    pub use_adg: bool,
    pub cfg_interval_start: f64,
    pub cfg_interval_end: f64,
    pub infer_method: String,
    pub shift: f64,
    pub audio_format: String,
    /// thinking 有効時のみ送る LM 設定
    #[serde(flatten)]
    pub lm: Option<LmOptions>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LmOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lm_model_path: Option<String>,
    pub lm_backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lm_temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lm_cfg_scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lm_top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lm_top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lm_negative_prompt: Option<String>,
    pub use_cot_caption: bool,
    pub use_cot_language: bool,
    pub use_cot_metas: bool,
}

impl SubmitRequest {
    pub fn from_params(params: &GenerationParams, layout: &AudioLayout) -> Self {
        let thinking = params.thinking_enabled();
        let lm = thinking.then(|| LmOptions {
            lm_model_path: params.lm_model.clone(),
            lm_backend: params
                .lm_backend
                .clone()
                .unwrap_or_else(|| defaults::LM_BACKEND.to_string()),
            lm_temperature: params.lm_temperature,
            lm_cfg_scale: params.lm_cfg_scale,
            lm_top_k: params.lm_top_k,
            lm_top_p: params.lm_top_p,
            lm_negative_prompt: params.lm_negative_prompt.clone(),
            use_cot_caption: params.use_cot_caption != Some(false),
            use_cot_language: params.use_cot_language != Some(false),
            use_cot_metas: params.use_cot_metas != Some(false),
        });

        Self {
            prompt: params.prompt(),
            lyrics: params.lyrics_text().to_string(),
            thinking,
            dit_model: params.dit_model.clone(),
            bpm: params.requested_bpm(),
            key_scale: params.requested_key_scale().map(str::to_string),
            time_signature: params.requested_time_signature().map(str::to_string),
            audio_duration: params.requested_duration(),
            vocal_language: params
                .vocal_language
                .clone()
                .unwrap_or_else(|| defaults::VOCAL_LANGUAGE.to_string()),
            inference_steps: params.inference_steps.unwrap_or(defaults::INFERENCE_STEPS),
            guidance_scale: params.guidance_scale.unwrap_or(defaults::GUIDANCE_SCALE),
            use_random_seed: params.random_seed != Some(false),
            seed: params.seed.unwrap_or(defaults::SEED),
            batch_size: params.batch_size.unwrap_or(defaults::BATCH_SIZE),
            audio_code_string: params.audio_codes().map(str::to_string),
            repainting_start: params
                .repainting_start
                .unwrap_or(defaults::REPAINTING_START),
            repainting_end: params.repainting_end.unwrap_or(defaults::REPAINTING_END),
            instruction: params.instruction.clone(),
            reference_audio_path: params
                .reference_audio()
                .map(|r| layout.resolve_reference(r)),
            src_audio_path: params.source_audio().map(|r| layout.resolve_reference(r)),
            audio_cover_strength: params
                .audio_cover_strength
                .unwrap_or(defaults::AUDIO_COVER_STRENGTH),
            task_type: params.task().as_str().to_string(),
            use_adg: params.use_adg.unwrap_or(false),
            cfg_interval_start: params
                .cfg_interval_start
                .unwrap_or(defaults::CFG_INTERVAL_START),
            cfg_interval_end: params
                .cfg_interval_end
                .unwrap_or(defaults::CFG_INTERVAL_END),
            infer_method: params.infer_method.unwrap_or_default().as_str().to_string(),
            shift: params.shift.unwrap_or(defaults::SHIFT),
            audio_format: params.format().extension().to_string(),
            lm,
        }
    }
}

/// `query_result` の1タスク分。境界で一度だけ検証した形。
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    /// 0=実行中, 1=成功, 2=失敗
    pub status_code: i64,
    /// 成功時の結果ペイロード（JSON文字列）
    pub result: Option<String>,
    pub error: Option<String>,
    pub message: Option<String>,
    /// 文字列で返ってきた状態説明
    pub status_text: Option<String>,
    pub progress: Option<f32>,
    pub stage: Option<String>,
    /// 元のタスクJSON
    pub raw: serde_json::Value,
}

/// リモート生成バックエンド trait
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// ヘルスチェック。到達不能・非成功はエラーまたは false。
    async fn health(&self) -> Result<bool, BackendError>;

    /// タスクを投入してタスクIDを返す。
    async fn submit(&self, request: &SubmitRequest) -> Result<String, BackendError>;

    /// タスク状態を1回問い合わせる。
    async fn query(&self, task_id: &str) -> Result<TaskRecord, BackendError>;

    /// バックエンドが返した音声参照をバイト列として取得する。
    async fn fetch_audio(&self, reference: &str) -> Result<Vec<u8>, BackendError>;

    fn name(&self) -> &str;
}
