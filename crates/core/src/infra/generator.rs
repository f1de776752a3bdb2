use serde::Deserialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, Command};

use crate::domain::params::{defaults, GenerationParams, TaskType};
use crate::domain::settings::LocalGeneratorConfig;
use crate::infra::layout::AudioLayout;

/// ローカル生成プロセスのエラー
#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("Failed to prepare scratch directory: {0}")]
    Scratch(String),
    #[error("Failed to start generator: {0}")]
    Spawn(String),
    #[error("Generator exited with status {status}: {stderr}")]
    Exited { status: String, stderr: String },
    #[error("{0}")]
    Output(String),
    #[error("{0}")]
    Reported(String),
}

// ─── ジョブ別作業ディレクトリ ─────────────────────────────────────

/// ジョブ専用の作業ディレクトリ。Drop 時に必ず削除される。
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn create(path: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => log::debug!("作業ディレクトリを削除: {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("作業ディレクトリの削除に失敗: {:?}: {e}", self.path),
        }
    }
}

// ─── 出力 ────────────────────────────────────────────────────────

/// 生成スクリプトが標準出力の最終行に出す JSON
#[derive(Debug, Deserialize)]
struct GeneratorReport {
    success: bool,
    #[serde(default)]
    audio_paths: Vec<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    elapsed_seconds: Option<f64>,
}

/// ローカル実行の完了結果。`scratch` を破棄すると作業ディレクトリも消える。
#[derive(Debug)]
pub struct LocalRun {
    pub audio_paths: Vec<PathBuf>,
    pub elapsed_seconds: Option<f64>,
    pub scratch: ScratchDir,
    pub raw: serde_json::Value,
}

/// 最終の非空行を JSON オブジェクトとして解釈する。
fn parse_report(stdout: &str) -> Result<(GeneratorReport, serde_json::Value), GeneratorError> {
    let last = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .ok_or_else(|| GeneratorError::Output("No JSON output from generation script".into()))?;

    let raw: serde_json::Value = serde_json::from_str(last).map_err(|_| {
        GeneratorError::Output(format!(
            "Invalid JSON from generation script: {}",
            &last[..last.len().min(200)]
        ))
    })?;
    if !raw.is_object() {
        return Err(GeneratorError::Output(format!(
            "Generation script output is not a JSON object: {}",
            &last[..last.len().min(200)]
        )));
    }
    let report: GeneratorReport = serde_json::from_value(raw.clone())
        .map_err(|e| GeneratorError::Output(format!("Malformed generation report: {e}")))?;
    Ok((report, raw))
}

async fn forward_stderr(stderr: Option<ChildStderr>) -> String {
    let Some(stderr) = stderr else {
        return String::new();
    };
    // 非 UTF-8 の行があっても読み続ける
    let mut segments = BufReader::new(stderr).split(b'\n');
    let mut tail: VecDeque<String> = VecDeque::new();
    while let Ok(Some(segment)) = segments.next_segment().await {
        let line = String::from_utf8_lossy(&segment).trim_end().to_string();
        if line.trim().is_empty() {
            continue;
        }
        log::debug!("[generator] {line}");
        tail.push_back(line);
        if tail.len() > 20 {
            tail.pop_front();
        }
    }
    Vec::from(tail).join("\n")
}

// ─── LocalGenerator ──────────────────────────────────────────────

/// ローカル生成プロセス（リモート不在時のフォールバック）
pub struct LocalGenerator {
    config: parking_lot::RwLock<LocalGeneratorConfig>,
    scratch_root: PathBuf,
    layout: AudioLayout,
}

impl LocalGenerator {
    pub fn new(config: LocalGeneratorConfig, scratch_root: PathBuf, layout: AudioLayout) -> Self {
        Self {
            config: parking_lot::RwLock::new(config),
            scratch_root,
            layout,
        }
    }

    /// 設定を動的に差し替える。
    pub fn update_config(&self, config: LocalGeneratorConfig) {
        *self.config.write() = config;
    }

    pub fn config(&self) -> LocalGeneratorConfig {
        self.config.read().clone()
    }

    /// パラメータから引数列を組み立てる。任意項目は指定時（または既定値と異なる時）のみ付与。
    pub(crate) fn build_args(
        params: &GenerationParams,
        layout: &AudioLayout,
        output_dir: &Path,
    ) -> Vec<String> {
        let duration = params.requested_duration().unwrap_or(defaults::DURATION_SECS);
        let mut args: Vec<String> = vec![
            "--prompt".into(),
            params.prompt(),
            "--duration".into(),
            duration.to_string(),
            "--audio-format".into(),
            params.format().extension().into(),
            "--output-dir".into(),
            output_dir.to_string_lossy().into(),
            "--json".into(),
        ];

        fn push(args: &mut Vec<String>, flag: &str, value: impl ToString) {
            args.push(flag.into());
            args.push(value.to_string());
        }

        let lyrics = params.lyrics_text();
        if !lyrics.is_empty() {
            push(&mut args, "--lyrics", lyrics);
        }
        if params.instrumental {
            args.push("--instrumental".into());
        }
        if let Some(n) = params.batch_size {
            push(&mut args, "--batch-size", n);
        }
        if let Some(n) = params.inference_steps {
            push(&mut args, "--infer-steps", n);
        }
        if let Some(g) = params.guidance_scale {
            push(&mut args, "--guidance-scale", g);
        }
        if let Some(bpm) = params.requested_bpm() {
            push(&mut args, "--bpm", bpm);
        }
        if let Some(k) = params.requested_key_scale() {
            push(&mut args, "--key-scale", k);
        }
        if let Some(t) = params.requested_time_signature() {
            push(&mut args, "--time-signature", t);
        }
        if let Some(lang) = &params.vocal_language {
            push(&mut args, "--vocal-language", lang);
        }
        if let Some(seed) = params.fixed_seed() {
            push(&mut args, "--seed", seed);
        }
        if let Some(shift) = params.shift {
            push(&mut args, "--shift", shift);
        }
        if let Some(method) = params.infer_method {
            push(&mut args, "--infer-method", method.as_str());
        }
        if let Some(model) = &params.dit_model {
            push(&mut args, "--dit-model", model);
        }

        let task = params.task();
        if task != TaskType::Text2Music {
            push(&mut args, "--task-type", task.as_str());
        }
        if let Some(r) = params.reference_audio() {
            push(&mut args, "--reference-audio", layout.resolve_reference(r));
        }
        if let Some(s) = params.source_audio() {
            push(&mut args, "--src-audio", layout.resolve_reference(s));
        }
        if let Some(codes) = params.audio_codes() {
            push(&mut args, "--audio-codes", codes);
        }
        if let Some(v) = params.repainting_start.filter(|v| *v > 0.0) {
            push(&mut args, "--repainting-start", v);
        }
        if let Some(v) = params.repainting_end.filter(|v| *v > 0.0) {
            push(&mut args, "--repainting-end", v);
        }
        let needs_cover_strength = matches!(task, TaskType::Cover | TaskType::Repaint)
            || params.source_audio().is_some();
        match params.audio_cover_strength {
            _ if needs_cover_strength => push(
                &mut args,
                "--audio-cover-strength",
                params
                    .audio_cover_strength
                    .unwrap_or(defaults::AUDIO_COVER_STRENGTH),
            ),
            Some(v) if v != defaults::AUDIO_COVER_STRENGTH => {
                push(&mut args, "--audio-cover-strength", v)
            }
            _ => {}
        }
        if let Some(instruction) = params.instruction.as_deref().filter(|s| !s.is_empty()) {
            push(&mut args, "--instruction", instruction);
        }

        if params.thinking_enabled() {
            args.push("--thinking".into());
        }
        if let Some(v) = params.lm_temperature {
            push(&mut args, "--lm-temperature", v);
        }
        if let Some(v) = params.lm_cfg_scale {
            push(&mut args, "--lm-cfg-scale", v);
        }
        if let Some(v) = params.lm_top_k.filter(|k| *k > 0) {
            push(&mut args, "--lm-top-k", v);
        }
        if let Some(v) = params.lm_top_p {
            push(&mut args, "--lm-top-p", v);
        }
        if let Some(v) = params.lm_negative_prompt.as_deref().filter(|s| !s.is_empty()) {
            push(&mut args, "--lm-negative-prompt", v);
        }
        if let Some(v) = &params.lm_backend {
            push(&mut args, "--lm-backend", v);
        }
        if let Some(v) = &params.lm_model {
            push(&mut args, "--lm-model", v);
        }
        if params.use_cot_metas == Some(false) {
            args.push("--no-cot-metas".into());
        }
        if params.use_cot_caption == Some(false) {
            args.push("--no-cot-caption".into());
        }
        if params.use_cot_language == Some(false) {
            args.push("--no-cot-language".into());
        }
        if params.use_adg == Some(true) {
            args.push("--use-adg".into());
        }
        if let Some(v) = params.cfg_interval_start.filter(|v| *v > defaults::CFG_INTERVAL_START) {
            push(&mut args, "--cfg-interval-start", v);
        }
        if let Some(v) = params.cfg_interval_end.filter(|v| *v < defaults::CFG_INTERVAL_END) {
            push(&mut args, "--cfg-interval-end", v);
        }
        args
    }

    /// 作業ディレクトリ相対の引数（スクリプトパス等）を絶対パス化する。
    fn absolutize(arg: &str) -> String {
        let p = Path::new(arg);
        if p.is_relative() && p.exists() {
            if let Ok(cwd) = std::env::current_dir() {
                return cwd.join(p).to_string_lossy().into_owned();
            }
        }
        arg.to_string()
    }

    /// ジョブ専用ディレクトリで生成プロセスを実行し、終了を待つ。
    pub async fn run(&self, job_id: &str, params: &GenerationParams) -> Result<LocalRun, GeneratorError> {
        let scratch = ScratchDir::create(self.scratch_root.join(job_id))
            .map_err(|e| GeneratorError::Scratch(e.to_string()))?;

        // config のスナップショットを取得（ロック保持を最小化）
        let config = self.config.read().clone();
        let mut args: Vec<String> = config.leading_args.iter().map(|a| Self::absolutize(a)).collect();
        args.extend(Self::build_args(params, &self.layout, scratch.path()));

        log::info!(
            "Job {job_id}: ローカル生成を開始 {:?} (prompt={:?})",
            config.program,
            params.prompt().chars().take(50).collect::<String>()
        );
        log::debug!("Running generator: {:?} {:?}", config.program, args);

        let mut child = Command::new(&config.program)
            .args(&args)
            .current_dir(scratch.path())
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    GeneratorError::Spawn(format!("Generator not found: {:?}", config.program))
                } else {
                    GeneratorError::Spawn(format!("Failed to spawn {:?}: {e}", config.program))
                }
            })?;

        let stderr_task = tokio::spawn(forward_stderr(child.stderr.take()));

        let mut stdout = Vec::new();
        if let Some(mut out) = child.stdout.take() {
            out.read_to_end(&mut stdout)
                .await
                .map_err(|e| GeneratorError::Output(format!("Failed to read generator output: {e}")))?;
        }
        // 途中の進捗行は任意のバイト列でよい。判定に使うのは最終行だけ
        let stdout = String::from_utf8_lossy(&stdout);

        let status = child
            .wait()
            .await
            .map_err(|e| GeneratorError::Spawn(format!("Generator process error: {e}")))?;
        let stderr_tail = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(GeneratorError::Exited {
                status: status.to_string(),
                stderr: if stderr_tail.is_empty() {
                    "no diagnostic output".to_string()
                } else {
                    stderr_tail
                },
            });
        }

        let (report, raw) = parse_report(&stdout)?;
        if !report.success {
            return Err(GeneratorError::Reported(
                report
                    .error
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| "Generation failed".to_string()),
            ));
        }
        if report.audio_paths.is_empty() {
            return Err(GeneratorError::Reported("No audio files generated".to_string()));
        }

        let audio_paths = report
            .audio_paths
            .iter()
            .map(|p| {
                let p = PathBuf::from(p);
                if p.is_relative() {
                    scratch.path().join(p)
                } else {
                    p
                }
            })
            .collect();

        Ok(LocalRun {
            audio_paths,
            elapsed_seconds: report.elapsed_seconds,
            scratch,
            raw,
        })
    }
}
