use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::infra::backend::GenerationBackend;

/// リモートバックエンドの到達性判定（結果をキャッシュ）
///
/// 判定中の呼び出しは同じロックで待機し、進行中の1回のプローブ結果を共有する。
pub struct BackendProber {
    backend: Arc<dyn GenerationBackend>,
    timeout: Duration,
    cache: Mutex<Option<bool>>,
}

impl BackendProber {
    pub fn new(backend: Arc<dyn GenerationBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            cache: Mutex::new(None),
        }
    }

    /// 利用可能か。失敗・タイムアウトは false として扱い、エラーにはしない。
    pub async fn is_available(&self) -> bool {
        let mut cached = self.cache.lock().await;
        if let Some(available) = *cached {
            return available;
        }
        let available = self.probe().await;
        *cached = Some(available);
        available
    }

    /// キャッシュを破棄し、次回の `is_available` で再プローブさせる。
    pub async fn reset_cache(&self) {
        *self.cache.lock().await = None;
    }

    /// 判定済みの値（判定中/未判定は None）
    pub fn cached(&self) -> Option<bool> {
        self.cache.try_lock().ok().and_then(|g| *g)
    }

    async fn probe(&self) -> bool {
        match tokio::time::timeout(self.timeout, self.backend.health()).await {
            Ok(Ok(available)) => {
                log::info!(
                    "バックエンド [{}] 到達性: {}",
                    self.backend.name(),
                    if available { "available" } else { "unavailable" }
                );
                available
            }
            Ok(Err(e)) => {
                log::info!("バックエンド [{}] に到達できません: {e}", self.backend.name());
                false
            }
            Err(_) => {
                log::info!(
                    "バックエンド [{}] のヘルスチェックが {}ms でタイムアウト",
                    self.backend.name(),
                    self.timeout.as_millis()
                );
                false
            }
        }
    }
}
