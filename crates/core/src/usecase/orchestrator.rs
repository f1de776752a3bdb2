use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tokio::task::{AbortHandle, JoinHandle};

use crate::domain::error::{AppError, ErrorCode};
use crate::domain::job::{GenerationResult, JobStatusView};
use crate::domain::params::GenerationParams;
use crate::domain::settings::{LocalGeneratorConfig, OrchestratorSettings};
use crate::infra::audio_probe::{DurationProbe, SymphoniaDurationProbe};
use crate::infra::backend::{GenerationApiClient, GenerationBackend};
use crate::infra::dispatcher::{DispatchOutcome, GenerationDispatcher};
use crate::infra::generator::LocalGenerator;
use crate::infra::layout::AudioLayout;
use crate::infra::materializer::{AudioSource, ResultMaterializer};
use crate::infra::metrics::{Metrics, MetricsSummary, Phase};
use crate::infra::probe::BackendProber;
use crate::infra::status::{BackendMetas, PollOutcome, StatusTranslator};
use crate::usecase::job_queue::JobQueue;

const SHUTDOWN_MESSAGE: &str = "orchestrator shut down";

/// 生成ジョブのオーケストレータ
///
/// キューとレジストリを所有し、単一のワーカーがジョブを投入順に1件ずつ処理する。
pub struct Orchestrator {
    core: Arc<Core>,
    tasks: Mutex<Option<BackgroundTasks>>,
}

/// ワーカー・スイーパーから共有される部分
struct Core {
    settings: OrchestratorSettings,
    queue: JobQueue,
    dispatcher: GenerationDispatcher,
    translator: StatusTranslator,
    materializer: ResultMaterializer,
    metrics: Metrics,
    wake: Notify,
    /// 実行中ジョブのタスク。オーケストレータ破棄時に止めるため保持する
    current_job: Mutex<Option<AbortHandle>>,
}

struct BackgroundTasks {
    worker: JoinHandle<()>,
    worker_stop: oneshot::Sender<()>,
    sweeper: Option<(JoinHandle<()>, oneshot::Sender<()>)>,
}

impl Orchestrator {
    /// 設定から REST クライアントと Symphonia 計測器を組み立てる（ワーカーは未起動）。
    pub fn new(settings: OrchestratorSettings) -> Result<Self, AppError> {
        let backend = GenerationApiClient::new(&settings)
            .map_err(|e| AppError::internal(format!("Failed to build backend client: {e}")))?;
        Ok(Self::with_components(
            settings,
            Arc::new(backend),
            Arc::new(SymphoniaDurationProbe),
        ))
    }

    /// バックエンドと計測器を差し替えて組み立てる。
    pub fn with_components(
        settings: OrchestratorSettings,
        backend: Arc<dyn GenerationBackend>,
        probe: Arc<dyn DurationProbe>,
    ) -> Self {
        let layout = AudioLayout::new(settings.audio_dir.clone(), settings.public_audio_prefix.clone());
        let prober = Arc::new(BackendProber::new(backend.clone(), settings.health_timeout()));
        let generator = Arc::new(LocalGenerator::new(
            settings.generator.clone(),
            settings.scratch_root.clone(),
            layout.clone(),
        ));
        let dispatcher = GenerationDispatcher::new(prober, backend.clone(), generator, layout.clone());
        let translator = StatusTranslator::new(
            backend.clone(),
            settings.poll_interval(),
            settings.max_poll_wait(),
        );
        let materializer = ResultMaterializer::new(layout, backend, probe);

        Self {
            core: Arc::new(Core {
                settings,
                queue: JobQueue::new(),
                dispatcher,
                translator,
                materializer,
                metrics: Metrics::new(),
                wake: Notify::new(),
                current_job: Mutex::new(None),
            }),
            tasks: Mutex::new(None),
        }
    }

    // ==================== Lifecycle ====================

    /// ワーカー（と設定されていればスイーパー）を起動する。起動済みなら何もしない。
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            log::warn!("オーケストレータは既に起動しています");
            return;
        }

        let (worker_stop, stop_rx) = oneshot::channel();
        let worker = tokio::spawn(worker_loop(self.core.clone(), stop_rx));

        let sweeper = self.core.settings.sweep_interval_secs.filter(|s| *s > 0).map(|secs| {
            let (tx, rx) = oneshot::channel();
            let handle = tokio::spawn(sweep_loop(self.core.clone(), Duration::from_secs(secs), rx));
            (handle, tx)
        });

        log::info!(
            "オーケストレータ起動 (backend={}, sweep={:?}s)",
            self.core.settings.api_url,
            self.core.settings.sweep_interval_secs
        );
        *tasks = Some(BackgroundTasks {
            worker,
            worker_stop,
            sweeper,
        });
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    /// ワーカーとスイーパーを停止する。実行中・待機中のジョブは failed になる。
    pub async fn shutdown(&self) {
        let Some(tasks) = self.tasks.lock().take() else {
            return;
        };

        let _ = tasks.worker_stop.send(());
        if let Err(e) = tasks.worker.await {
            log::error!("ワーカーの停止に失敗: {e}");
        }
        if let Some((handle, stop)) = tasks.sweeper {
            let _ = stop.send(());
            if let Err(e) = handle.await {
                log::error!("スイーパーの停止に失敗: {e}");
            }
        }

        let dropped = self.core.queue.fail_pending(SHUTDOWN_MESSAGE, Utc::now());
        if !dropped.is_empty() {
            log::warn!("停止により待機中ジョブ {} 件を failed にしました", dropped.len());
        }
        log::info!("オーケストレータ停止");
    }

    // ==================== Jobs ====================

    /// ジョブを投入してIDを返す。生成の完了は待たない。
    ///
    /// パラメータ不正はここで同期的に拒否され、ジョブは作られない。
    pub fn submit(&self, params: GenerationParams) -> Result<String, AppError> {
        params.validate()?;

        let job_id = self.core.queue.enqueue(params, Utc::now());
        self.core.metrics.inc_submitted();
        log::info!(
            "Job {job_id}: queued (position={})",
            self.core.queue.queued_len()
        );
        self.core.wake.notify_one();
        Ok(job_id)
    }

    /// ジョブ状態を返す。実行中のリモートジョブは必要に応じて1回だけ再問い合わせし、
    /// 進捗のみを更新する（状態遷移はワーカーの責務）。
    pub async fn get_status(&self, job_id: &str) -> Result<JobStatusView, AppError> {
        let core = &self.core;
        if core.queue.get(job_id).is_none() {
            return Err(AppError::not_found(format!("Job not found: {job_id}")));
        }

        if let Some(task_id) = core
            .queue
            .claim_poll(job_id, Utc::now(), core.settings.poll_interval())
        {
            match core.translator.poll(&task_id).await {
                Ok(PollOutcome::StillRunning { progress, stage }) => {
                    core.queue.update_progress(job_id, progress, stage, Utc::now());
                }
                Ok(_) => {}
                Err(e) => log::debug!("Job {job_id}: 進捗の再取得に失敗: {e}"),
            }
        }

        core.queue
            .get(job_id)
            .map(|job| job.view(core.settings.per_job_estimate_secs))
            .ok_or_else(|| AppError::not_found(format!("Job not found: {job_id}")))
    }

    /// 終端状態のジョブを削除する。
    pub fn cleanup(&self, job_id: &str) -> Result<(), AppError> {
        self.core.queue.remove(job_id)?;
        log::info!("Job {job_id}: evicted");
        Ok(())
    }

    /// `max_age` 以上前に作られた終端ジョブを削除し、件数を返す。
    pub fn cleanup_older_than(&self, max_age: Duration) -> usize {
        self.core.sweep(max_age)
    }

    /// デバッグ用の生レスポンス
    pub fn raw_response(&self, job_id: &str) -> Result<Option<serde_json::Value>, AppError> {
        self.core
            .queue
            .raw_response(job_id)
            .ok_or_else(|| AppError::not_found(format!("Job not found: {job_id}")))
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.core.metrics.summary()
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.core.settings
    }

    /// ローカル生成プロセスの設定を差し替える（次のジョブから有効）。
    pub fn update_generator_config(&self, config: LocalGeneratorConfig) {
        self.core.dispatcher.generator().update_config(config);
    }

    #[cfg(test)]
    fn running_count(&self) -> usize {
        self.core.queue.running_count()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.get_mut().take() {
            tasks.worker.abort();
            // ワーカーの JoinHandle を捨てても子タスクは止まらないので個別に止める
            if let Some(job) = self.core.current_job.lock().take() {
                job.abort();
            }
            if let Some((handle, _)) = tasks.sweeper {
                handle.abort();
            }
        }
    }
}

// ==================== Worker ====================

async fn worker_loop(core: Arc<Core>, mut stop: oneshot::Receiver<()>) {
    log::debug!("ワーカー開始");
    loop {
        let job_id = match core.queue.front() {
            Some(id) => id,
            None => {
                tokio::select! {
                    _ = core.wake.notified() => {}
                    _ = &mut stop => break,
                }
                continue;
            }
        };

        if let Err(e) = core.queue.mark_running(&job_id, Utc::now()) {
            // 単一ワーカーなので通常は起こらない
            log::error!("Job {job_id}: 開始できません: {e}");
            core.queue.mark_failed(&job_id, e.message.clone(), Utc::now());
            core.metrics.inc_failed(e.code);
            continue;
        }
        log::info!("Job {job_id}: running");

        // ジョブ内の panic はここで failed として回収する
        let mut task = tokio::spawn(process_job(core.clone(), job_id.clone()));
        *core.current_job.lock() = Some(task.abort_handle());
        let interrupted = tokio::select! {
            joined = &mut task => {
                if let Err(e) = joined {
                    let err = AppError::internal(format!("Job processing aborted: {e}"));
                    log::error!("Job {job_id}: {err}");
                    core.queue.mark_failed(&job_id, err.message, Utc::now());
                    core.metrics.inc_failed(err.code);
                }
                false
            }
            _ = &mut stop => {
                task.abort();
                // 子プロセスと作業ディレクトリは abort による drop で片付く
                let _ = task.await;
                log::warn!("Job {job_id}: 停止により中断");
                core.queue.mark_failed(&job_id, SHUTDOWN_MESSAGE.to_string(), Utc::now());
                core.metrics.inc_failed(ErrorCode::Internal);
                true
            }
        };
        core.current_job.lock().take();
        core.queue.finish(&job_id);
        if interrupted {
            break;
        }
    }
    log::debug!("ワーカー終了");
}

async fn process_job(core: Arc<Core>, job_id: String) {
    let started = Instant::now();
    let Some(params) = core.queue.params(&job_id) else {
        log::warn!("Job {job_id}: レジストリから消えています");
        return;
    };

    match core.run_job(&job_id, &params).await {
        Ok((result, raw)) => {
            log::info!(
                "Job {job_id}: succeeded ({} files, {:.1}s audio)",
                result.audio_urls.len(),
                result.duration
            );
            core.queue.mark_succeeded(&job_id, result, raw, Utc::now());
            core.metrics.inc_succeeded();
        }
        Err(e) => {
            log::error!("Job {job_id}: failed: {e}");
            core.queue.mark_failed(&job_id, e.message, Utc::now());
            core.metrics.inc_failed(e.code);
        }
    }
    core.metrics
        .record_latency(Phase::Total, started.elapsed().as_millis() as u64);
}

impl Core {
    /// 投入 → (リモートなら完了待ち) → 実体化
    async fn run_job(
        &self,
        job_id: &str,
        params: &GenerationParams,
    ) -> Result<(GenerationResult, Option<serde_json::Value>), AppError> {
        // ジョブ間で到達性は変わりうるため毎回判定し直す
        self.dispatcher.prober().reset_cache().await;

        let t = Instant::now();
        let outcome = self.dispatcher.dispatch(job_id, params).await?;
        self.metrics
            .record_latency(Phase::Dispatch, t.elapsed().as_millis() as u64);

        let route = outcome.route();
        self.metrics.inc_dispatched(route);

        match outcome {
            DispatchOutcome::Remote { task_id } => {
                self.queue.set_dispatch(job_id, route, Some(task_id.clone()));

                let t = Instant::now();
                let completion = self
                    .translator
                    .await_completion(&task_id, |progress, stage| {
                        self.queue.update_progress(job_id, progress, stage, Utc::now());
                    })
                    .await?;
                self.metrics
                    .record_latency(Phase::Generate, t.elapsed().as_millis() as u64);

                let sources: Vec<AudioSource> = completion
                    .audio_refs
                    .into_iter()
                    .map(AudioSource::Remote)
                    .collect();
                let result = self
                    .materialize(job_id, &sources, &completion.metas, params)
                    .await?;
                Ok((result, Some(completion.raw)))
            }
            DispatchOutcome::Local(run) => {
                self.queue.set_dispatch(job_id, route, None);

                let sources: Vec<AudioSource> =
                    run.audio_paths.iter().cloned().map(AudioSource::Local).collect();
                let result = self
                    .materialize(job_id, &sources, &BackendMetas::default(), params)
                    .await;
                // 作業ディレクトリは成否に関わらずここで削除
                drop(run.scratch);
                Ok((result?, Some(run.raw)))
            }
        }
    }

    async fn materialize(
        &self,
        job_id: &str,
        sources: &[AudioSource],
        metas: &BackendMetas,
        params: &GenerationParams,
    ) -> Result<GenerationResult, AppError> {
        let t = Instant::now();
        let result = self
            .materializer
            .materialize(job_id, sources, metas, params)
            .await;
        self.metrics
            .record_latency(Phase::Materialize, t.elapsed().as_millis() as u64);
        result
    }

    fn sweep(&self, max_age: Duration) -> usize {
        let removed = self.queue.remove_older_than(max_age, Utc::now());
        if !removed.is_empty() {
            log::info!("{} 件の古いジョブを削除", removed.len());
        }
        removed.len()
    }
}

// ==================== Sweeper ====================

async fn sweep_loop(core: Arc<Core>, every: Duration, mut stop: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(every);
    // 初回の即時 tick を捨てる
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                core.sweep(core.settings.max_job_age());
            }
            _ = &mut stop => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::JobStatus;
    use crate::domain::params::TaskType;
    use crate::infra::backend::mock::{self, MockBackend, SubmitBehavior};
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::Ordering;

    struct FixedProbe(Option<f64>);

    impl DurationProbe for FixedProbe {
        fn probe_seconds(&self, _path: &Path) -> Option<f64> {
            self.0
        }
        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn settings(root: &Path) -> OrchestratorSettings {
        OrchestratorSettings {
            poll_interval_ms: 10,
            max_poll_wait_secs: 5,
            audio_dir: root.join("audio"),
            scratch_root: root.join("scratch"),
            generator: LocalGeneratorConfig {
                program: PathBuf::from("/nonexistent/generator-xyz"),
                leading_args: vec![],
                env: vec![],
            },
            ..Default::default()
        }
    }

    fn with_script(mut settings: OrchestratorSettings, root: &Path, script: &str) -> OrchestratorSettings {
        let path = root.join("gen.sh");
        std::fs::write(&path, script).unwrap();
        settings.generator = LocalGeneratorConfig {
            program: PathBuf::from("/bin/sh"),
            leading_args: vec![path.to_string_lossy().into_owned()],
            env: vec![],
        };
        settings
    }

    fn simple() -> GenerationParams {
        GenerationParams {
            song_description: Some("lofi beats to study to".into()),
            ..Default::default()
        }
    }

    async fn wait_terminal(orch: &Orchestrator, job_id: &str) -> JobStatusView {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let view = orch.get_status(job_id).await.unwrap();
            if view.status().is_terminal() {
                return view;
            }
            assert!(Instant::now() < deadline, "job {job_id} did not finish: {view:?}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_remote_job_succeeds() {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            MockBackend::new(true)
                .with_queries(vec![
                    Ok(mock::running(Some(0.2), Some("lm"))),
                    Ok(mock::running(Some(0.7), Some("dit"))),
                    Ok(mock::succeeded(json!([{
                        "file": "/v1/audio?path=%2Fout%2Fa.mp3",
                        "metas": {"duration": 58.0, "bpm": 120, "keyscale": "C major", "timesignature": "4"},
                        "dit_model": "acestep-v15-turbo",
                        "seed_value": "77"
                    }]))),
                ])
                .with_audio("/v1/audio?path=%2Fout%2Fa.mp3", b"ID3 remote"),
        );
        let orch = Orchestrator::with_components(settings(root.path()), backend, Arc::new(FixedProbe(None)));
        orch.start();

        let id = orch.submit(simple()).unwrap();
        match wait_terminal(&orch, &id).await {
            JobStatusView::Succeeded { result } => {
                assert_eq!(result.audio_urls, vec![format!("/audio/{id}_0.mp3")]);
                assert_eq!(result.duration, 58.0);
                assert_eq!(result.bpm, Some(120));
                assert_eq!(result.key_scale.as_deref(), Some("C major"));
                assert_eq!(result.time_signature.as_deref(), Some("4/4"));
                assert_eq!(result.dit_model.as_deref(), Some("acestep-v15-turbo"));
                assert_eq!(result.seed_value.as_deref(), Some("77"));
                assert_eq!(result.lm_model, None);
            }
            other => panic!("unexpected status: {other:?}"),
        }
        let copied = std::fs::read(root.path().join("audio").join(format!("{id}_0.mp3"))).unwrap();
        assert_eq!(copied, b"ID3 remote");
        assert!(orch.raw_response(&id).unwrap().is_some());

        let m = orch.metrics();
        assert_eq!(m.jobs_succeeded, 1);
        assert_eq!(m.dispatched_remote, 1);
        orch.shutdown().await;
    }

    // Scenario B
    #[tokio::test]
    async fn test_missing_task_id_fails_job() {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new(true).with_submit(SubmitBehavior::MissingTaskId));
        let orch = Orchestrator::with_components(settings(root.path()), backend, Arc::new(FixedProbe(None)));
        orch.start();

        let id = orch.submit(simple()).unwrap();
        match wait_terminal(&orch, &id).await {
            JobStatusView::Failed { error } => {
                let lower = error.to_lowercase();
                assert!(lower.contains("task") || lower.contains("id"), "{error}");
            }
            other => panic!("unexpected status: {other:?}"),
        }
        assert_eq!(orch.metrics().error_counts.get("E_DISPATCH"), Some(&1));
        orch.shutdown().await;
    }

    // Scenario C
    #[tokio::test]
    async fn test_backend_failure_text_is_preserved() {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            MockBackend::new(true).with_queries(vec![Ok(mock::failed("CUDA OOM"))]),
        );
        let orch = Orchestrator::with_components(settings(root.path()), backend, Arc::new(FixedProbe(None)));
        orch.start();

        let id = orch.submit(simple()).unwrap();
        match wait_terminal(&orch, &id).await {
            JobStatusView::Failed { error } => assert!(error.contains("CUDA OOM")),
            other => panic!("unexpected status: {other:?}"),
        }
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_timeout_is_distinct() {
        let root = tempfile::tempdir().unwrap();
        let mut s = settings(root.path());
        s.max_poll_wait_secs = 0;
        let backend = Arc::new(MockBackend::new(true).with_queries(vec![Ok(mock::running(None, None))]));
        let orch = Orchestrator::with_components(s, backend, Arc::new(FixedProbe(None)));
        orch.start();

        let id = orch.submit(simple()).unwrap();
        match wait_terminal(&orch, &id).await {
            JobStatusView::Failed { error } => assert!(error.contains("timed out"), "{error}"),
            other => panic!("unexpected status: {other:?}"),
        }
        assert_eq!(orch.metrics().error_counts.get("E_TIMEOUT"), Some(&1));
        orch.shutdown().await;
    }

    // Scenario E
    #[tokio::test]
    async fn test_invalid_cover_rejected_synchronously() {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new(true));
        let orch = Orchestrator::with_components(settings(root.path()), backend.clone(), Arc::new(FixedProbe(None)));
        orch.start();

        let params = GenerationParams {
            task_type: Some(TaskType::Cover),
            ..simple()
        };
        let err = orch.submit(params).unwrap_err();
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(orch.metrics().jobs_submitted, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.submit_calls.load(Ordering::SeqCst), 0);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let root = tempfile::tempdir().unwrap();
        let orch = Orchestrator::with_components(
            settings(root.path()),
            Arc::new(MockBackend::new(true)),
            Arc::new(FixedProbe(None)),
        );
        assert_eq!(orch.get_status("nope").await.unwrap_err().code, ErrorCode::NotFound);
        assert_eq!(orch.cleanup("nope").unwrap_err().code, ErrorCode::NotFound);
        assert_eq!(orch.raw_response("nope").unwrap_err().code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_queued_before_start_reports_positions() {
        let root = tempfile::tempdir().unwrap();
        let orch = Orchestrator::with_components(
            settings(root.path()),
            Arc::new(MockBackend::new(true)),
            Arc::new(FixedProbe(None)),
        );
        let ids: Vec<String> = (0..3).map(|_| orch.submit(simple()).unwrap()).collect();
        for (k, id) in ids.iter().enumerate() {
            let view = orch.get_status(id).await.unwrap();
            assert_eq!(
                view,
                JobStatusView::Queued {
                    queue_position: k + 1,
                    estimated_wait_seconds: (k as u64 + 1) * 180,
                }
            );
            let json = serde_json::to_value(&view).unwrap();
            assert!(json.get("progress").is_none());
        }
        assert_eq!(
            orch.cleanup(&ids[0]).unwrap_err().code,
            ErrorCode::InvalidState
        );
    }

    #[tokio::test]
    async fn test_terminal_status_is_idempotent_and_cleanup() {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new(true).with_queries(vec![Ok(mock::failed("bad prompt"))]));
        let orch = Orchestrator::with_components(settings(root.path()), backend, Arc::new(FixedProbe(None)));
        orch.start();

        let id = orch.submit(simple()).unwrap();
        wait_terminal(&orch, &id).await;
        let a = serde_json::to_string(&orch.get_status(&id).await.unwrap()).unwrap();
        let b = serde_json::to_string(&orch.get_status(&id).await.unwrap()).unwrap();
        assert_eq!(a, b);

        assert_eq!(orch.cleanup_older_than(Duration::from_secs(3600)), 0);
        assert_eq!(orch.cleanup_older_than(Duration::ZERO), 1);
        assert_eq!(orch.get_status(&id).await.unwrap_err().code, ErrorCode::NotFound);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_jobs_run_one_at_a_time_in_order() {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            MockBackend::new(true)
                .with_queries(vec![
                    Ok(mock::running(None, None)),
                    Ok(mock::running(None, None)),
                    Ok(mock::succeeded(json!({"file": "/out/a.mp3"}))),
                ])
                .with_audio("/out/a.mp3", b"a"),
        );
        let orch = Orchestrator::with_components(settings(root.path()), backend, Arc::new(FixedProbe(Some(10.0))));
        orch.start();

        let ids: Vec<String> = (0..4).map(|_| orch.submit(simple()).unwrap()).collect();
        let mut finished_order = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while finished_order.len() < ids.len() {
            assert!(orch.running_count() <= 1);
            for id in &ids {
                let job = orch.core.queue.get(id).unwrap();
                if job.status.is_terminal() && !finished_order.contains(id) {
                    finished_order.push(id.clone());
                }
            }
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let finished: Vec<_> = ids
            .iter()
            .map(|id| orch.core.queue.get(id).unwrap().finished_at.unwrap())
            .collect();
        assert!(finished.windows(2).all(|w| w[0] <= w[1]));
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_twice_keeps_single_worker() {
        let root = tempfile::tempdir().unwrap();
        let orch = Orchestrator::with_components(
            settings(root.path()),
            Arc::new(MockBackend::new(true)),
            Arc::new(FixedProbe(None)),
        );
        orch.start();
        orch.start();
        assert!(orch.is_running());
        orch.shutdown().await;
        assert!(!orch.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_fails_interrupted_and_pending_jobs() {
        let root = tempfile::tempdir().unwrap();
        // 完了しないリモートタスク
        let backend = Arc::new(MockBackend::new(true).with_queries(vec![Ok(mock::running(Some(0.1), None))]));
        let mut s = settings(root.path());
        s.max_poll_wait_secs = 600;
        let orch = Orchestrator::with_components(s, backend, Arc::new(FixedProbe(None)));
        orch.start();

        let first = orch.submit(simple()).unwrap();
        let second = orch.submit(simple()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while orch.core.queue.get(&first).unwrap().status != JobStatus::Running {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        orch.shutdown().await;
        for id in [&first, &second] {
            match orch.get_status(id).await.unwrap() {
                JobStatusView::Failed { error } => assert_eq!(error, SHUTDOWN_MESSAGE),
                other => panic!("unexpected status: {other:?}"),
            }
        }
    }

    async fn wait_remote_dispatch(orch: &Orchestrator, job_id: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while orch.core.queue.get(job_id).unwrap().remote_task.is_none() {
            assert!(Instant::now() < deadline, "job {job_id} was not dispatched");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_status_refresh_of_running_remote_job_is_throttled() {
        let root = tempfile::tempdir().unwrap();
        let mut s = settings(root.path());
        // ワーカー自身の問い合わせはテスト中には来ない
        s.poll_interval_ms = 60_000;
        s.max_poll_wait_secs = 600;
        let backend = Arc::new(
            MockBackend::new(true).with_queries(vec![Ok(mock::running(Some(0.4), Some("dit")))]),
        );
        let orch = Arc::new(Orchestrator::with_components(s, backend.clone(), Arc::new(FixedProbe(None))));
        orch.start();

        let id = orch.submit(simple()).unwrap();
        wait_remote_dispatch(&orch, &id).await;
        assert_eq!(backend.query_calls.load(Ordering::SeqCst), 0);

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let orch = orch.clone();
                let id = id.clone();
                tokio::spawn(async move { orch.get_status(&id).await.unwrap() })
            })
            .collect();
        for reader in readers {
            assert_eq!(reader.await.unwrap().status(), JobStatus::Running);
        }
        assert_eq!(backend.query_calls.load(Ordering::SeqCst), 1);

        match orch.get_status(&id).await.unwrap() {
            JobStatusView::Running { progress, stage, .. } => {
                assert_eq!(progress, Some(0.4));
                assert_eq!(stage.as_deref(), Some("dit"));
            }
            other => panic!("unexpected status: {other:?}"),
        }
        assert_eq!(backend.query_calls.load(Ordering::SeqCst), 1);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_refresh_does_not_complete_job() {
        let root = tempfile::tempdir().unwrap();
        let mut s = settings(root.path());
        s.poll_interval_ms = 60_000;
        s.max_poll_wait_secs = 600;
        let backend = Arc::new(
            MockBackend::new(true)
                .with_queries(vec![Ok(mock::succeeded(json!({"file": "/out/a.mp3"})))])
                .with_audio("/out/a.mp3", b"a"),
        );
        let orch = Orchestrator::with_components(s, backend.clone(), Arc::new(FixedProbe(None)));
        orch.start();

        let id = orch.submit(simple()).unwrap();
        wait_remote_dispatch(&orch, &id).await;

        let view = orch.get_status(&id).await.unwrap();
        assert_eq!(backend.query_calls.load(Ordering::SeqCst), 1);
        assert_eq!(view.status(), JobStatus::Running);
        let job = orch.core.queue.get(&id).unwrap();
        assert!(job.result.is_none());
        assert!(!root.path().join("audio").join(format!("{id}_0.mp3")).exists());
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_submitters_run_serially_in_fifo_order() {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            MockBackend::new(true)
                .with_queries(vec![
                    Ok(mock::running(None, None)),
                    Ok(mock::succeeded(json!({"file": "/out/a.mp3"}))),
                ])
                .with_audio("/out/a.mp3", b"a"),
        );
        let orch = Arc::new(Orchestrator::with_components(
            settings(root.path()),
            backend,
            Arc::new(FixedProbe(Some(10.0))),
        ));
        orch.start();

        let submitters: Vec<_> = (0..8)
            .map(|_| {
                let orch = orch.clone();
                tokio::spawn(async move { orch.submit(simple()).unwrap() })
            })
            .collect();
        let mut ids = Vec::new();
        for submitter in submitters {
            ids.push(submitter.await.unwrap());
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while !ids
            .iter()
            .all(|id| orch.core.queue.get(id).unwrap().status.is_terminal())
        {
            assert!(orch.running_count() <= 1);
            assert!(Instant::now() < deadline, "jobs did not finish");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let mut jobs: Vec<_> = ids.iter().map(|id| orch.core.queue.get(id).unwrap()).collect();
        assert!(jobs.iter().all(|j| j.status == JobStatus::Succeeded));
        jobs.sort_by_key(|j| j.started_at);
        for pair in jobs.windows(2) {
            // 投入順に開始し、前のジョブが終わってから次が始まる
            assert!(pair[0].created_at <= pair[1].created_at);
            assert!(pair[0].finished_at.unwrap() <= pair[1].started_at.unwrap());
        }
        orch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep() {
        let root = tempfile::tempdir().unwrap();
        let mut s = settings(root.path());
        s.sweep_interval_secs = Some(60);
        s.max_job_age_secs = 0;
        let backend = Arc::new(MockBackend::new(true).with_submit(SubmitBehavior::MissingTaskId));
        let orch = Orchestrator::with_components(s, backend, Arc::new(FixedProbe(None)));
        orch.start();

        let id = orch.submit(simple()).unwrap();
        while !orch.core.queue.get(&id).unwrap().status.is_terminal() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(orch.core.queue.get(&id).is_none());
        orch.shutdown().await;
    }

    #[cfg(unix)]
    mod local {
        use super::*;

        // Scenario A
        #[tokio::test]
        async fn test_local_fallback_with_absolute_path() {
            let root = tempfile::tempdir().unwrap();
            let produced = root.path().join("x.mp3");
            std::fs::write(&produced, b"local audio bytes").unwrap();
            let script = format!(
                "echo '{{\"success\":true,\"audio_paths\":[\"{}\"],\"elapsed_seconds\":12.3}}'\n",
                produced.display()
            );
            let s = with_script(settings(root.path()), root.path(), &script);
            let orch = Orchestrator::with_components(s, Arc::new(MockBackend::new(false)), Arc::new(FixedProbe(Some(33.25))));
            orch.start();

            let id = orch.submit(simple()).unwrap();
            match wait_terminal(&orch, &id).await {
                JobStatusView::Succeeded { result } => {
                    assert_eq!(result.duration, 33.25);
                    assert_eq!(result.audio_urls, vec![format!("/audio/{id}_0.mp3")]);
                }
                other => panic!("unexpected status: {other:?}"),
            }
            assert_eq!(orch.metrics().dispatched_local, 1);
            orch.shutdown().await;
        }

        #[tokio::test]
        async fn test_local_default_duration_without_probe() {
            let root = tempfile::tempdir().unwrap();
            let s = with_script(
                settings(root.path()),
                root.path(),
                "printf 'RIFF' > a.wav\necho '{\"success\":true,\"audio_paths\":[\"a.wav\"]}'\n",
            );
            let orch = Orchestrator::with_components(s, Arc::new(MockBackend::new(false)), Arc::new(FixedProbe(None)));
            orch.start();

            let id = orch.submit(simple()).unwrap();
            match wait_terminal(&orch, &id).await {
                JobStatusView::Succeeded { result } => assert_eq!(result.duration, 60.0),
                other => panic!("unexpected status: {other:?}"),
            }
            orch.shutdown().await;
        }

        // a.wav の内容がそのまま公開ディレクトリに複製される
        #[tokio::test]
        async fn test_local_copy_round_trip_and_scratch_cleanup() {
            let root = tempfile::tempdir().unwrap();
            let s = with_script(
                settings(root.path()),
                root.path(),
                "printf 'wave-bytes-0123456789' > a.wav\necho '{\"success\":true,\"audio_paths\":[\"a.wav\"]}'\n",
            );
            let orch = Orchestrator::with_components(s, Arc::new(MockBackend::new(false)), Arc::new(FixedProbe(None)));
            orch.start();

            let id = orch.submit(simple()).unwrap();
            let url = match wait_terminal(&orch, &id).await {
                JobStatusView::Succeeded { result } => result.audio_urls[0].clone(),
                other => panic!("unexpected status: {other:?}"),
            };
            let file_name = url.trim_start_matches("/audio/");
            let copied = std::fs::read(root.path().join("audio").join(file_name)).unwrap();
            assert_eq!(copied, b"wave-bytes-0123456789");
            assert!(!root.path().join("scratch").join(&id).exists());
            orch.shutdown().await;
        }

        #[tokio::test]
        async fn test_local_failure_removes_scratch() {
            let root = tempfile::tempdir().unwrap();
            let s = with_script(
                settings(root.path()),
                root.path(),
                "printf 'x' > a.wav\necho '{\"success\":true,\"audio_paths\":[\"missing.wav\"]}'\n",
            );
            let orch = Orchestrator::with_components(s, Arc::new(MockBackend::new(false)), Arc::new(FixedProbe(None)));
            orch.start();

            let id = orch.submit(simple()).unwrap();
            match wait_terminal(&orch, &id).await {
                JobStatusView::Failed { error } => assert!(error.contains("missing.wav"), "{error}"),
                other => panic!("unexpected status: {other:?}"),
            }
            assert!(!root.path().join("scratch").join(&id).exists());
            assert_eq!(orch.metrics().error_counts.get("E_MATERIALIZE"), Some(&1));
            orch.shutdown().await;
        }

        // Scenario D
        #[tokio::test]
        async fn test_second_job_waits_while_first_runs() {
            let root = tempfile::tempdir().unwrap();
            let s = with_script(
                settings(root.path()),
                root.path(),
                "sleep 3\nprintf 'x' > a.wav\necho '{\"success\":true,\"audio_paths\":[\"a.wav\"]}'\n",
            );
            let orch = Orchestrator::with_components(s, Arc::new(MockBackend::new(false)), Arc::new(FixedProbe(None)));
            orch.start();

            let first = orch.submit(simple()).unwrap();
            let second = orch.submit(simple()).unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;

            assert_eq!(orch.get_status(&first).await.unwrap().status(), JobStatus::Running);
            assert_eq!(
                orch.get_status(&second).await.unwrap(),
                JobStatusView::Queued {
                    queue_position: 1,
                    estimated_wait_seconds: 180,
                }
            );
            assert_eq!(orch.running_count(), 1);
            orch.shutdown().await;
        }

        #[tokio::test]
        async fn test_drop_stops_running_local_job() {
            let root = tempfile::tempdir().unwrap();
            let marker = root.path().join("marker");
            let script = format!(
                "sleep 2\ntouch '{}'\nprintf 'x' > a.wav\necho '{{\"success\":true,\"audio_paths\":[\"a.wav\"]}}'\n",
                marker.display()
            );
            let s = with_script(settings(root.path()), root.path(), &script);
            let orch = Orchestrator::with_components(s, Arc::new(MockBackend::new(false)), Arc::new(FixedProbe(None)));
            orch.start();

            let id = orch.submit(simple()).unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            assert_eq!(orch.core.queue.get(&id).unwrap().status, JobStatus::Running);
            drop(orch);

            tokio::time::sleep(Duration::from_secs(3)).await;
            assert!(!marker.exists());
            let written = std::fs::read_dir(root.path().join("audio"))
                .map(|entries| entries.count())
                .unwrap_or(0);
            assert_eq!(written, 0);
            assert!(!root.path().join("scratch").join(&id).exists());
        }
    }
}
