use std::path::{Path, PathBuf};

/// 生成音声の保存先ディレクトリと公開URLの対応
#[derive(Debug, Clone)]
pub struct AudioLayout {
    audio_dir: PathBuf,
    public_prefix: String,
}

impl AudioLayout {
    pub fn new(audio_dir: impl Into<PathBuf>, public_prefix: impl Into<String>) -> Self {
        let prefix = public_prefix.into();
        Self {
            audio_dir: audio_dir.into(),
            public_prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn audio_dir(&self) -> &Path {
        &self.audio_dir
    }

    /// ジョブID + 連番 + 拡張子から決定的なファイル名を作る。
    pub fn file_name(job_id: &str, index: usize, extension: &str) -> String {
        format!("{job_id}_{index}.{extension}")
    }

    pub fn file_path(&self, file_name: &str) -> PathBuf {
        self.audio_dir.join(file_name)
    }

    pub fn public_url(&self, file_name: &str) -> String {
        format!("{}/{}", self.public_prefix, file_name)
    }

    /// 公開URL（`/audio/x.mp3` や同パスを持つ絶対URL）をローカルファイルパスに解決する。
    /// 該当しない参照はそのまま返す。
    pub fn resolve_reference(&self, reference: &str) -> String {
        let marker = format!("{}/", self.public_prefix);
        if let Some(rest) = reference.strip_prefix(&marker) {
            return self.audio_dir.join(rest).to_string_lossy().into_owned();
        }
        if reference.starts_with("http://") || reference.starts_with("https://") {
            if let Ok(url) = reqwest::Url::parse(reference) {
                if let Some(rest) = url.path().strip_prefix(&marker) {
                    return self.audio_dir.join(rest).to_string_lossy().into_owned();
                }
            }
        }
        reference.to_string()
    }
}
