use std::sync::Arc;

use crate::domain::error::AppError;
use crate::domain::job::DispatchRoute;
use crate::domain::params::GenerationParams;
use crate::infra::backend::{BackendError, GenerationBackend, SubmitRequest};
use crate::infra::generator::{GeneratorError, LocalGenerator, LocalRun};
use crate::infra::layout::AudioLayout;
use crate::infra::probe::BackendProber;

/// 投入結果
#[derive(Debug)]
pub enum DispatchOutcome {
    /// リモートに受理された（以降はポーリング）
    Remote { task_id: String },
    /// ローカル実行が完了した
    Local(LocalRun),
}

impl DispatchOutcome {
    pub fn route(&self) -> DispatchRoute {
        match self {
            Self::Remote { .. } => DispatchRoute::Remote,
            Self::Local(_) => DispatchRoute::Local,
        }
    }
}

fn submit_error(e: BackendError) -> AppError {
    match e {
        BackendError::MissingTaskId => AppError::dispatch(e.to_string()),
        BackendError::Rejected { status, body } => {
            AppError::dispatch(format!("Generation backend rejected the task ({status}): {body}"))
        }
        other => AppError::dispatch(format!("Failed to submit generation task: {other}")),
    }
}

fn generator_error(e: GeneratorError) -> AppError {
    match e {
        // プロセスは起動したが生成自体が失敗した
        GeneratorError::Exited { .. } | GeneratorError::Reported(_) => AppError::backend(e.to_string()),
        _ => AppError::dispatch(e.to_string()),
    }
}

/// 生成ディスパッチャ（リモート / ローカルの振り分け）
pub struct GenerationDispatcher {
    prober: Arc<BackendProber>,
    backend: Arc<dyn GenerationBackend>,
    generator: Arc<LocalGenerator>,
    layout: AudioLayout,
}

impl GenerationDispatcher {
    pub fn new(
        prober: Arc<BackendProber>,
        backend: Arc<dyn GenerationBackend>,
        generator: Arc<LocalGenerator>,
        layout: AudioLayout,
    ) -> Self {
        Self {
            prober,
            backend,
            generator,
            layout,
        }
    }

    pub fn prober(&self) -> &BackendProber {
        &self.prober
    }

    pub fn generator(&self) -> &LocalGenerator {
        &self.generator
    }

    /// パラメータを検証し、到達可能ならリモートへ、そうでなければローカルで実行する。
    ///
    /// 検証エラーの場合はネットワーク呼び出しもプロセス起動も行わない。
    pub async fn dispatch(&self, job_id: &str, params: &GenerationParams) -> Result<DispatchOutcome, AppError> {
        params.validate()?;

        if self.prober.is_available().await {
            let request = SubmitRequest::from_params(params, &self.layout);
            log::info!(
                "Job {job_id}: [{}] にリモート投入 (batch={}, steps={})",
                self.backend.name(),
                request.batch_size,
                request.inference_steps
            );
            let task_id = self.backend.submit(&request).await.map_err(submit_error)?;
            log::info!("Job {job_id}: リモートタスク {task_id} を受理");
            Ok(DispatchOutcome::Remote { task_id })
        } else {
            log::info!("Job {job_id}: リモート不在のためローカル生成にフォールバック");
            let run = self.generator.run(job_id, params).await.map_err(generator_error)?;
            log::info!(
                "Job {job_id}: ローカル生成完了 ({} files, {:?}s)",
                run.audio_paths.len(),
                run.elapsed_seconds
            );
            Ok(DispatchOutcome::Local(run))
        }
    }
}
