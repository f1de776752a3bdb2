use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::error::AppError;
use crate::domain::job::{DispatchRoute, GenerationResult, Job, JobStatus};
use crate::domain::params::GenerationParams;

/// ジョブレジストリ + FIFO キュー
///
/// 読み取りは常にロック内で複製を返すため、更新途中のレコードは見えない。
pub struct JobQueue {
    inner: RwLock<QueueState>,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    /// Queued のジョブIDのみ（投入順）
    pending: VecDeque<String>,
    running: Option<String>,
}

impl QueueState {
    /// 待機中ジョブの位置を先頭から1始まりで振り直す。
    fn recompute_positions(&mut self) {
        for (i, id) in self.pending.iter().enumerate() {
            if let Some(job) = self.jobs.get_mut(id) {
                job.queue_position = Some(i + 1);
            }
        }
    }

    fn running_job_mut(&mut self, job_id: &str) -> Option<&mut Job> {
        self.jobs
            .get_mut(job_id)
            .filter(|j| j.status == JobStatus::Running)
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(QueueState::default()),
        }
    }

    /// ジョブを登録して末尾に追加し、ジョブIDを返す。
    pub fn enqueue(&self, params: GenerationParams, now: DateTime<Utc>) -> String {
        let job_id = uuid::Uuid::new_v4().to_string();
        let mut job = Job::new(job_id.clone(), params, now);

        let mut state = self.inner.write();
        job.queue_position = Some(state.pending.len() + 1);
        state.jobs.insert(job_id.clone(), job);
        state.pending.push_back(job_id.clone());
        job_id
    }

    /// 次に処理すべきジョブID
    pub fn front(&self) -> Option<String> {
        self.inner.read().pending.front().cloned()
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.inner.read().jobs.get(job_id).cloned()
    }

    pub fn params(&self, job_id: &str) -> Option<Arc<GenerationParams>> {
        self.inner.read().jobs.get(job_id).map(|j| j.params.clone())
    }

    /// 先頭のジョブを Running にする。先頭以外や実行中ジョブがある場合は拒否。
    pub fn mark_running(&self, job_id: &str, now: DateTime<Utc>) -> Result<(), AppError> {
        let mut state = self.inner.write();
        if let Some(current) = &state.running {
            return Err(AppError::invalid_state(format!(
                "Job {current} is still running"
            )));
        }
        if state.pending.front().map(String::as_str) != Some(job_id) {
            return Err(AppError::invalid_state(format!(
                "Job {job_id} is not at the head of the queue"
            )));
        }
        state.pending.pop_front();
        if let Some(job) = state.jobs.get_mut(job_id) {
            job.status = JobStatus::Running;
            job.started_at = Some(now);
            job.queue_position = None;
        }
        state.running = Some(job_id.to_string());
        state.recompute_positions();
        Ok(())
    }

    pub fn set_dispatch(&self, job_id: &str, route: DispatchRoute, remote_task: Option<String>) {
        let mut state = self.inner.write();
        if let Some(job) = state.running_job_mut(job_id) {
            job.route = Some(route);
            job.remote_task = remote_task;
        }
    }

    /// 進捗を更新する（Running の間のみ）。
    pub fn update_progress(
        &self,
        job_id: &str,
        progress: Option<f32>,
        stage: Option<String>,
        polled_at: DateTime<Utc>,
    ) {
        let mut state = self.inner.write();
        if let Some(job) = state.running_job_mut(job_id) {
            if progress.is_some() {
                job.progress = progress;
            }
            if stage.is_some() {
                job.stage = stage;
            }
            job.last_polled_at = Some(polled_at);
        }
    }

    /// リモート実行中で、前回の問い合わせから `interval` 以上経っていればタスクIDを返し、
    /// 問い合わせ時刻を記録する。同時に呼ばれても問い合わせ権を得るのは1件のみ。
    pub fn claim_poll(&self, job_id: &str, now: DateTime<Utc>, interval: Duration) -> Option<String> {
        let mut state = self.inner.write();
        let job = state.running_job_mut(job_id)?;
        if job.route != Some(DispatchRoute::Remote) {
            return None;
        }
        let task = job.remote_task.clone()?;
        let due = match job.last_polled_at {
            Some(last) => (now - last).to_std().map_or(false, |elapsed| elapsed >= interval),
            None => true,
        };
        if !due {
            return None;
        }
        job.last_polled_at = Some(now);
        Some(task)
    }

    pub fn mark_succeeded(
        &self,
        job_id: &str,
        result: GenerationResult,
        raw: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) {
        let mut state = self.inner.write();
        if let Some(job) = state.running_job_mut(job_id) {
            job.status = JobStatus::Succeeded;
            job.result = Some(result);
            job.raw_response = raw;
            job.finished_at = Some(now);
            job.stage = None;
        }
    }

    /// Running / Queued のジョブを Failed にする。終端状態のジョブは変更しない。
    pub fn mark_failed(&self, job_id: &str, error: String, now: DateTime<Utc>) {
        let mut state = self.inner.write();
        let was_queued = match state.jobs.get_mut(job_id) {
            Some(job) if !job.status.is_terminal() => {
                let was_queued = job.status == JobStatus::Queued;
                job.status = JobStatus::Failed;
                job.error = Some(error);
                job.finished_at = Some(now);
                job.queue_position = None;
                job.stage = None;
                was_queued
            }
            _ => return,
        };
        if was_queued {
            state.pending.retain(|id| id != job_id);
            state.recompute_positions();
        }
    }

    /// 実行枠を解放する。処理が終端状態に到達した後にワーカーが呼ぶ。
    pub fn finish(&self, job_id: &str) {
        let mut state = self.inner.write();
        if state.running.as_deref() == Some(job_id) {
            state.running = None;
        }
        state.recompute_positions();
    }

    /// 待機中ジョブを全て Failed にする（停止時）。
    ///
    /// 一度も実行されないまま終わるため Queued から直接 Failed へ遷移する。
    pub fn fail_pending(&self, error: &str, now: DateTime<Utc>) -> Vec<String> {
        let mut state = self.inner.write();
        let ids: Vec<String> = state.pending.drain(..).collect();
        for id in &ids {
            if let Some(job) = state.jobs.get_mut(id) {
                job.status = JobStatus::Failed;
                job.error = Some(error.to_string());
                job.finished_at = Some(now);
                job.queue_position = None;
            }
        }
        ids
    }

    /// 終端状態のジョブを削除する。Queued / Running は拒否。
    pub fn remove(&self, job_id: &str) -> Result<Job, AppError> {
        let mut state = self.inner.write();
        match state.jobs.get(job_id) {
            None => Err(AppError::not_found(format!("Job not found: {job_id}"))),
            Some(job) if !job.status.is_terminal() => Err(AppError::invalid_state(format!(
                "Job {job_id} is {:?} and cannot be removed",
                job.status
            ))),
            Some(_) => state
                .jobs
                .remove(job_id)
                .ok_or_else(|| AppError::not_found(format!("Job not found: {job_id}"))),
        }
    }

    /// 作成から `max_age` 以上経過した終端ジョブを削除し、そのIDを返す。
    pub fn remove_older_than(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<String> {
        let mut state = self.inner.write();
        let expired: Vec<String> = state
            .jobs
            .values()
            .filter(|j| j.status.is_terminal())
            .filter(|j| {
                (now - j.created_at)
                    .to_std()
                    .map_or(false, |age| age >= max_age)
            })
            .map(|j| j.id.clone())
            .collect();
        for id in &expired {
            state.jobs.remove(id);
        }
        expired
    }

    pub fn raw_response(&self, job_id: &str) -> Option<Option<serde_json::Value>> {
        self.inner
            .read()
            .jobs
            .get(job_id)
            .map(|j| j.raw_response.clone())
    }

    pub fn running_id(&self) -> Option<String> {
        self.inner.read().running.clone()
    }

    pub fn running_count(&self) -> usize {
        self.inner
            .read()
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .count()
    }

    pub fn queued_len(&self) -> usize {
        self.inner.read().pending.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}
