use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::domain::error::AppError;
use crate::domain::job::GenerationResult;
use crate::domain::params::{defaults, GenerationParams};
use crate::infra::audio_probe::DurationProbe;
use crate::infra::backend::{BackendError, GenerationBackend};
use crate::infra::layout::AudioLayout;
use crate::infra::status::BackendMetas;

const KNOWN_EXTENSIONS: &[&str] = &["mp3", "flac", "wav", "ogg", "opus", "m4a", "aac"];

/// 結果の実体化エラー
#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("No audio files to materialize")]
    Empty,
    #[error("Failed to prepare audio directory {path:?}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to copy generated audio {from:?}: {source}")]
    Copy {
        from: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to download generated audio {reference}: {source}")]
    Download {
        reference: String,
        source: BackendError,
    },
    #[error("Failed to write audio file {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl From<MaterializeError> for AppError {
    fn from(e: MaterializeError) -> Self {
        AppError::materialize(e.to_string())
    }
}

/// 生成物の所在
#[derive(Debug, Clone, PartialEq)]
pub enum AudioSource {
    /// ローカル実行が書き出したファイル
    Local(PathBuf),
    /// リモートバックエンドが返した参照
    Remote(String),
}

impl AudioSource {
    /// 参照文字列から既知の拡張子を探す（最後に現れたもの）。
    fn declared_extension(&self) -> Option<&'static str> {
        let text = match self {
            Self::Local(path) => {
                return path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_ascii_lowercase)
                    .and_then(|ext| KNOWN_EXTENSIONS.iter().copied().find(|k| *k == ext));
            }
            Self::Remote(reference) => reference.to_ascii_lowercase(),
        };
        KNOWN_EXTENSIONS
            .iter()
            .copied()
            .filter_map(|ext| text.rfind(&format!(".{ext}")).map(|pos| (pos, ext)))
            .filter(|(pos, ext)| {
                // ".mp3" の直後が英数字なら拡張子ではない（".mp3x" 等）
                let end = pos + ext.len() + 1;
                text[end..]
                    .chars()
                    .next()
                    .map_or(true, |c| !c.is_ascii_alphanumeric())
            })
            .max_by_key(|(pos, _)| *pos)
            .map(|(_, ext)| ext)
    }
}

/// `"4"` → `"4/4"`。分数表記はそのまま。
pub fn normalize_time_signature(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if v.contains('/') {
        return Some(v.to_string());
    }
    match v.parse::<u32>() {
        Ok(n) if n > 0 => Some(format!("{n}/4")),
        _ => Some(v.to_string()),
    }
}

/// 生成物を公開ディレクトリへ配置し、最終メタデータを確定する。
pub struct ResultMaterializer {
    layout: AudioLayout,
    backend: Arc<dyn GenerationBackend>,
    probe: Arc<dyn DurationProbe>,
}

impl ResultMaterializer {
    pub fn new(layout: AudioLayout, backend: Arc<dyn GenerationBackend>, probe: Arc<dyn DurationProbe>) -> Self {
        Self { layout, backend, probe }
    }

    pub fn layout(&self) -> &AudioLayout {
        &self.layout
    }

    /// 全ファイルの配置に成功した場合のみ結果を返す。
    /// 途中で失敗した場合は書き出し済みファイルを削除してエラーを返す。
    pub async fn materialize(
        &self,
        job_id: &str,
        sources: &[AudioSource],
        metas: &BackendMetas,
        params: &GenerationParams,
    ) -> Result<GenerationResult, AppError> {
        if sources.is_empty() {
            return Err(MaterializeError::Empty.into());
        }
        let dir = self.layout.audio_dir();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| MaterializeError::Directory {
                path: dir.to_path_buf(),
                source,
            })?;

        let fallback_ext = params.format().extension();
        let mut written: Vec<PathBuf> = Vec::with_capacity(sources.len());
        let mut audio_urls = Vec::with_capacity(sources.len());

        for (index, source) in sources.iter().enumerate() {
            let ext = source.declared_extension().unwrap_or(fallback_ext);
            let file_name = AudioLayout::file_name(job_id, index, ext);
            let dest = self.layout.file_path(&file_name);

            if let Err(e) = self.place(source, &dest).await {
                log::error!("Job {job_id}: 音声の配置に失敗 ({index}): {e}");
                // 書きかけの可能性があるため dest も含めて削除
                written.push(dest);
                remove_all(&written).await;
                return Err(e.into());
            }
            log::debug!("Job {job_id}: {source:?} → {dest:?}");
            written.push(dest);
            audio_urls.push(self.layout.public_url(&file_name));
        }

        let probed = self.probe_duration(&written[0]).await;
        let duration = probed
            .or(metas.duration.filter(|d| d.is_finite() && *d > 0.0))
            .or(params.requested_duration())
            .unwrap_or(defaults::DURATION_SECS);
        log::info!(
            "Job {job_id}: {} files materialized, duration={duration:.2}s (probed={})",
            audio_urls.len(),
            probed.is_some()
        );

        Ok(GenerationResult {
            audio_urls,
            duration,
            bpm: metas.bpm.or(params.requested_bpm()),
            key_scale: metas
                .key_scale
                .clone()
                .or_else(|| params.requested_key_scale().map(str::to_string)),
            time_signature: metas
                .time_signature
                .as_deref()
                .and_then(normalize_time_signature)
                .or_else(|| params.requested_time_signature().and_then(normalize_time_signature)),
            dit_model: metas.dit_model.clone(),
            lm_model: metas.lm_model.clone(),
            seed_value: metas.seed_value.clone(),
            generation_info: metas.generation_info.clone(),
        })
    }

    async fn place(&self, source: &AudioSource, dest: &Path) -> Result<(), MaterializeError> {
        match source {
            AudioSource::Local(path) => {
                tokio::fs::copy(path, dest)
                    .await
                    .map_err(|source| MaterializeError::Copy {
                        from: path.clone(),
                        source,
                    })?;
            }
            AudioSource::Remote(reference) => {
                let bytes = self.backend.fetch_audio(reference).await.map_err(|source| {
                    MaterializeError::Download {
                        reference: reference.clone(),
                        source,
                    }
                })?;
                tokio::fs::write(dest, &bytes)
                    .await
                    .map_err(|source| MaterializeError::Write {
                        path: dest.to_path_buf(),
                        source,
                    })?;
            }
        }
        Ok(())
    }

    /// 計測はブロッキングなので専用スレッドで行う。
    async fn probe_duration(&self, path: &Path) -> Option<f64> {
        let probe = self.probe.clone();
        let path = path.to_path_buf();
        match tokio::task::spawn_blocking(move || probe.probe_seconds(&path)).await {
            Ok(secs) => secs.filter(|s| s.is_finite() && *s > 0.0),
            Err(e) => {
                log::warn!("音声長の計測タスクが異常終了: {e}");
                None
            }
        }
    }
}

async fn remove_all(paths: &[PathBuf]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("部分ファイルの削除に失敗: {path:?}: {e}"),
        }
    }
}
