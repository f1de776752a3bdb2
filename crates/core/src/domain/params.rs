use serde::{Deserialize, Serialize};

use crate::domain::error::AppError;

/// 未指定パラメータの既定値。リモート/ローカルの両経路で共有する。
pub mod defaults {
    pub const CAPTION: &str = "pop music";
    pub const VOCAL_LANGUAGE: &str = "en";
    pub const INFERENCE_STEPS: u32 = 8;
    pub const GUIDANCE_SCALE: f64 = 7.0;
    pub const BATCH_SIZE: u32 = 1;
    pub const MAX_BATCH_SIZE: u32 = 8;
    pub const SEED: i64 = -1;
    pub const SHIFT: f64 = 3.0;
    pub const REPAINTING_START: f64 = 0.0;
    pub const REPAINTING_END: f64 = -1.0;
    pub const AUDIO_COVER_STRENGTH: f64 = 1.0;
    pub const CFG_INTERVAL_START: f64 = 0.0;
    pub const CFG_INTERVAL_END: f64 = 1.0;
    pub const LM_BACKEND: &str = "pt";
    /// 長さ指定が無い場合の最終フォールバック（秒）
    pub const DURATION_SECS: f64 = 60.0;
}

/// 出力音声フォーマット
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Flac,
    Wav,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Flac => "flac",
            Self::Wav => "wav",
        }
    }
}

/// 拡散サンプラの推論方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferMethod {
    #[default]
    Ode,
    Sde,
}

impl InferMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ode => "ode",
            Self::Sde => "sde",
        }
    }
}

/// 生成タスク種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TaskType {
    #[default]
    #[serde(rename = "text2music")]
    Text2Music,
    #[serde(rename = "cover")]
    Cover,
    #[serde(rename = "audio2audio")]
    Audio2Audio,
    #[serde(rename = "repaint")]
    Repaint,
    #[serde(rename = "lego")]
    Lego,
    #[serde(rename = "extract")]
    Extract,
    #[serde(rename = "complete")]
    Complete,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text2Music => "text2music",
            Self::Cover => "cover",
            Self::Audio2Audio => "audio2audio",
            Self::Repaint => "repaint",
            Self::Lego => "lego",
            Self::Extract => "extract",
            Self::Complete => "complete",
        }
    }

    /// ソース音声または音声コードが必須のタスクか
    pub fn requires_source(&self) -> bool {
        matches!(self, Self::Cover | Self::Audio2Audio)
    }
}

/// 呼び出し元が指定する生成パラメータ。投入時にスナップショットされ以後不変。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GenerationParams {
    // モード
    pub custom_mode: bool,
    pub song_description: Option<String>,

    // カスタムモード
    pub lyrics: String,
    pub style: String,
    pub title: String,

    pub instrumental: bool,
    pub vocal_language: Option<String>,

    // 楽曲パラメータ
    pub duration: Option<f64>,
    pub bpm: Option<u32>,
    pub key_scale: Option<String>,
    pub time_signature: Option<String>,

    // 生成設定
    pub inference_steps: Option<u32>,
    pub guidance_scale: Option<f64>,
    pub batch_size: Option<u32>,
    pub random_seed: Option<bool>,
    pub seed: Option<i64>,
    pub thinking: Option<bool>,
    pub audio_format: Option<AudioFormat>,
    pub infer_method: Option<InferMethod>,
    pub shift: Option<f64>,

    // LM パラメータ
    pub lm_temperature: Option<f64>,
    pub lm_cfg_scale: Option<f64>,
    pub lm_top_k: Option<u32>,
    pub lm_top_p: Option<f64>,
    pub lm_negative_prompt: Option<String>,
    pub lm_backend: Option<String>,
    pub lm_model: Option<String>,
    pub dit_model: Option<String>,

    // エキスパート
    pub reference_audio_url: Option<String>,
    pub source_audio_url: Option<String>,
    pub audio_codes: Option<String>,
    pub repainting_start: Option<f64>,
    pub repainting_end: Option<f64>,
    pub instruction: Option<String>,
    pub audio_cover_strength: Option<f64>,
    pub task_type: Option<TaskType>,
    pub use_adg: Option<bool>,
    pub cfg_interval_start: Option<f64>,
    pub cfg_interval_end: Option<f64>,
    pub use_cot_metas: Option<bool>,
    pub use_cot_caption: Option<bool>,
    pub use_cot_language: Option<bool>,
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl GenerationParams {
    /// バックエンドに渡すキャプション。
    /// カスタムモードは style、シンプルモードは description → style → 既定値。
    pub fn prompt(&self) -> String {
        let caption = if self.style.trim().is_empty() {
            defaults::CAPTION
        } else {
            self.style.as_str()
        };
        if self.custom_mode {
            return caption.to_string();
        }
        non_empty(&self.song_description)
            .unwrap_or(caption)
            .to_string()
    }

    /// インストゥルメンタル時は空文字
    pub fn lyrics_text(&self) -> &str {
        if self.instrumental {
            ""
        } else {
            &self.lyrics
        }
    }

    pub fn task(&self) -> TaskType {
        self.task_type.unwrap_or_default()
    }

    pub fn format(&self) -> AudioFormat {
        self.audio_format.unwrap_or_default()
    }

    pub fn thinking_enabled(&self) -> bool {
        self.thinking.unwrap_or(false)
    }

    /// 呼び出し元が要求した長さ（正の有限値のみ）
    pub fn requested_duration(&self) -> Option<f64> {
        self.duration.filter(|d| d.is_finite() && *d > 0.0)
    }

    /// 呼び出し元が要求したBPM（0 は自動扱い）
    pub fn requested_bpm(&self) -> Option<u32> {
        self.bpm.filter(|b| *b > 0)
    }

    pub fn requested_key_scale(&self) -> Option<&str> {
        non_empty(&self.key_scale)
    }

    pub fn requested_time_signature(&self) -> Option<&str> {
        non_empty(&self.time_signature)
    }

    pub fn reference_audio(&self) -> Option<&str> {
        non_empty(&self.reference_audio_url)
    }

    pub fn source_audio(&self) -> Option<&str> {
        non_empty(&self.source_audio_url)
    }

    pub fn audio_codes(&self) -> Option<&str> {
        non_empty(&self.audio_codes)
    }

    /// 固定シードを使うか（random_seed=false かつ seed>=0）
    pub fn fixed_seed(&self) -> Option<i64> {
        if self.random_seed.unwrap_or(true) {
            return None;
        }
        self.seed.filter(|s| *s >= 0)
    }

    /// 投入前の同期検証。失敗したジョブはキューに入らない。
    pub fn validate(&self) -> Result<(), AppError> {
        let task = self.task();
        if task.requires_source() && self.source_audio().is_none() && self.audio_codes().is_none()
        {
            return Err(AppError::validation(format!(
                "task_type='{}' requires a source audio or audio codes",
                task.as_str()
            )));
        }

        if self.custom_mode {
            if self.style.trim().is_empty()
                && self.lyrics.trim().is_empty()
                && self.reference_audio().is_none()
            {
                return Err(AppError::validation(
                    "Style, lyrics, or reference audio required for custom mode",
                ));
            }
        } else if non_empty(&self.song_description).is_none() {
            return Err(AppError::validation(
                "Song description required for simple mode",
            ));
        }

        if let Some(n) = self.batch_size {
            if n == 0 || n > defaults::MAX_BATCH_SIZE {
                return Err(AppError::validation(format!(
                    "batch_size must be between 1 and {}, got {n}",
                    defaults::MAX_BATCH_SIZE
                )));
            }
        }
        if self.inference_steps == Some(0) {
            return Err(AppError::validation("inference_steps must be positive"));
        }
        if let Some(d) = self.duration {
            if !d.is_finite() {
                return Err(AppError::validation("duration must be a finite number"));
            }
        }
        Ok(())
    }
}
