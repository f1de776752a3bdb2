//! 音楽生成ジョブのオーケストレーション
//!
//! 投入されたジョブを単一ワーカーで1件ずつ処理する。リモートの生成バックエンドに
//! 到達できればそこへ投入して完了をポーリングし、できなければローカルの生成
//! プロセスを起動する。生成物は公開ディレクトリへ配置され、結果として返される。

pub mod domain;
pub mod infra;
pub mod usecase;

pub use domain::error::{AppError, ErrorCode};
pub use domain::job::{GenerationResult, JobStatus, JobStatusView};
pub use domain::params::GenerationParams;
pub use domain::settings::{LocalGeneratorConfig, OrchestratorSettings};
pub use usecase::orchestrator::Orchestrator;
