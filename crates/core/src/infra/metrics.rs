use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;

use crate::domain::error::ErrorCode;
use crate::domain::job::DispatchRoute;

const MAX_LATENCY_RECORDS: usize = 1000;

/// 計測フェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// 投入（ローカルの場合は生成完了まで）
    Dispatch,
    /// リモート生成の待機
    Generate,
    Materialize,
    /// 開始から終端まで
    Total,
}

/// ローカルメトリクス収集器
pub struct Metrics {
    counters: Mutex<MetricsCounters>,
    latencies: Mutex<Vec<LatencyRecord>>,
}

#[derive(Debug, Default)]
struct MetricsCounters {
    jobs_submitted: u64,
    jobs_succeeded: u64,
    jobs_failed: u64,
    dispatched_remote: u64,
    dispatched_local: u64,
    errors: HashMap<&'static str, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyRecord {
    pub phase: Phase,
    pub duration_ms: u64,
    pub timestamp: String,
}

/// メトリクスサマリー
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub jobs_submitted: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub dispatched_remote: u64,
    pub dispatched_local: u64,
    /// エラーコード（`E_*`）ごとの失敗件数
    pub error_counts: HashMap<String, u64>,
    pub avg_latency_ms: AvgLatency,
    pub recent_latencies: Vec<LatencyRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AvgLatency {
    pub dispatch: Option<f64>,
    pub generate: Option<f64>,
    pub materialize: Option<f64>,
    pub total: Option<f64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(MetricsCounters::default()),
            latencies: Mutex::new(Vec::new()),
        }
    }

    pub fn inc_submitted(&self) {
        self.counters.lock().jobs_submitted += 1;
    }

    pub fn inc_succeeded(&self) {
        self.counters.lock().jobs_succeeded += 1;
    }

    /// 失敗件数とエラーコード別件数を同時に加算する。
    pub fn inc_failed(&self, code: ErrorCode) {
        let mut c = self.counters.lock();
        c.jobs_failed += 1;
        *c.errors.entry(code.as_str()).or_default() += 1;
    }

    pub fn inc_dispatched(&self, route: DispatchRoute) {
        let mut c = self.counters.lock();
        match route {
            DispatchRoute::Remote => c.dispatched_remote += 1,
            DispatchRoute::Local => c.dispatched_local += 1,
        }
    }

    pub fn record_latency(&self, phase: Phase, duration_ms: u64) {
        let record = LatencyRecord {
            phase,
            duration_ms,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let mut latencies = self.latencies.lock();
        latencies.push(record);
        // 最新1000件のみ保持
        if latencies.len() > MAX_LATENCY_RECORDS {
            let excess = latencies.len() - MAX_LATENCY_RECORDS;
            latencies.drain(0..excess);
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let c = self.counters.lock();
        let latencies = self.latencies.lock();

        let avg = |phase: Phase| -> Option<f64> {
            let vals: Vec<f64> = latencies
                .iter()
                .filter(|r| r.phase == phase)
                .map(|r| r.duration_ms as f64)
                .collect();
            if vals.is_empty() {
                None
            } else {
                Some(vals.iter().sum::<f64>() / vals.len() as f64)
            }
        };

        let recent: Vec<LatencyRecord> = latencies.iter().rev().take(20).cloned().collect();

        MetricsSummary {
            jobs_submitted: c.jobs_submitted,
            jobs_succeeded: c.jobs_succeeded,
            jobs_failed: c.jobs_failed,
            dispatched_remote: c.dispatched_remote,
            dispatched_local: c.dispatched_local,
            error_counts: c
                .errors
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            avg_latency_ms: AvgLatency {
                dispatch: avg(Phase::Dispatch),
                generate: avg(Phase::Generate),
                materialize: avg(Phase::Materialize),
                total: avg(Phase::Total),
            },
            recent_latencies: recent,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
