use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// オーケストレータ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// リモート生成バックエンドのベースURL
    pub api_url: String,
    /// `x-api-key` ヘッダに載せるキー（任意）
    pub api_key: Option<String>,
    /// ヘルスチェックのタイムアウト（ミリ秒）
    pub health_timeout_ms: u64,
    /// submit/query/音声取得のHTTPタイムアウト（秒）
    pub request_timeout_secs: u64,
    /// タスク状態ポーリング間隔（ミリ秒）
    pub poll_interval_ms: u64,
    /// ポーリングの最大待ち時間（秒）。超過は timeout 失敗
    pub max_poll_wait_secs: u64,
    /// 1ジョブあたりの待ち時間見積り（秒）
    pub per_job_estimate_secs: u64,
    /// 生成音声の保存先（公開配信ディレクトリ）
    pub audio_dir: PathBuf,
    /// 保存先に対応する公開URLプレフィックス
    pub public_audio_prefix: String,
    /// ローカル実行時のジョブ別作業ディレクトリのルート
    pub scratch_root: PathBuf,
    /// ローカル生成プロセスの設定
    pub generator: LocalGeneratorConfig,
    /// スイープで削除するジョブの経過時間（秒）
    pub max_job_age_secs: u64,
    /// 定期スイープ間隔（秒、None=無効）
    pub sweep_interval_secs: Option<u64>,
}

/// ローカル生成プロセス（フォールバック）の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalGeneratorConfig {
    /// 実行ファイル（python など）
    pub program: PathBuf,
    /// パラメータ引数の前に置く引数（スクリプトパスなど）
    pub leading_args: Vec<String>,
    /// 追加の環境変数
    pub env: Vec<(String, String)>,
}

impl Default for LocalGeneratorConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python"),
            leading_args: vec!["scripts/simple_generate.py".to_string()],
            env: vec![],
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mg-studio")
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8001".to_string(),
            api_key: None,
            health_timeout_ms: 3_000,
            request_timeout_secs: 30,
            poll_interval_ms: 2_000,
            max_poll_wait_secs: 600,
            per_job_estimate_secs: 180,
            audio_dir: default_data_dir().join("audio"),
            public_audio_prefix: "/audio".to_string(),
            scratch_root: std::env::temp_dir().join("mg-studio-jobs"),
            generator: LocalGeneratorConfig::default(),
            max_job_age_secs: 3_600,
            sweep_interval_secs: None,
        }
    }
}

impl OrchestratorSettings {
    /// デフォルト値に `MG_*` 環境変数を上書きして設定を構築する。
    pub fn from_env() -> Self {
        let mut s = Self::default();
        if let Ok(v) = std::env::var("MG_API_URL") {
            s.api_url = v;
        }
        if let Ok(v) = std::env::var("MG_API_KEY") {
            if !v.is_empty() {
                s.api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("MG_AUDIO_DIR") {
            s.audio_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MG_SCRATCH_DIR") {
            s.scratch_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MG_GENERATOR_BIN") {
            s.generator.program = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MG_GENERATOR_SCRIPT") {
            s.generator.leading_args = vec![v];
        }
        env_u64("MG_POLL_INTERVAL_MS", &mut s.poll_interval_ms);
        env_u64("MG_MAX_POLL_WAIT_SECS", &mut s.max_poll_wait_secs);
        env_u64("MG_MAX_JOB_AGE_SECS", &mut s.max_job_age_secs);
        let mut sweep = 0;
        env_u64("MG_SWEEP_INTERVAL_SECS", &mut sweep);
        if sweep > 0 {
            s.sweep_interval_secs = Some(sweep);
        }
        s
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_wait(&self) -> Duration {
        Duration::from_secs(self.max_poll_wait_secs)
    }

    pub fn max_job_age(&self) -> Duration {
        Duration::from_secs(self.max_job_age_secs)
    }
}

fn env_u64(key: &str, target: &mut u64) {
    if let Ok(raw) = std::env::var(key) {
        match raw.trim().parse::<u64>() {
            Ok(v) => *target = v,
            Err(e) => log::warn!("{key} を無視します（数値ではありません: {raw:?}, {e}）"),
        }
    }
}
