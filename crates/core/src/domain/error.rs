use serde::Serialize;

/// オーケストレータ共通エラーコード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorCode {
    #[serde(rename = "E_VALIDATION")]
    Validation,
    #[serde(rename = "E_DISPATCH")]
    Dispatch,
    #[serde(rename = "E_BACKEND")]
    Backend,
    #[serde(rename = "E_TIMEOUT")]
    Timeout,
    #[serde(rename = "E_MATERIALIZE")]
    Materialize,
    #[serde(rename = "E_NOT_FOUND")]
    NotFound,
    #[serde(rename = "E_INVALID_STATE")]
    InvalidState,
    #[serde(rename = "E_INTERNAL")]
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "E_VALIDATION",
            Self::Dispatch => "E_DISPATCH",
            Self::Backend => "E_BACKEND",
            Self::Timeout => "E_TIMEOUT",
            Self::Materialize => "E_MATERIALIZE",
            Self::NotFound => "E_NOT_FOUND",
            Self::InvalidState => "E_INVALID_STATE",
            Self::Internal => "E_INTERNAL",
        }
    }
}

/// アプリケーションエラー
///
/// ジョブの `error` フィールドには `message` のみが保存される。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppError {
    pub code: ErrorCode,
    pub message: String,
}

impl AppError {
    fn new(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: msg.into(),
        }
    }

    /// パラメータ不正（キュー投入前に同期的に拒否）
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, msg)
    }

    /// 投入失敗（リモート拒否 / ローカルプロセス起動失敗）
    pub fn dispatch(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Dispatch, msg)
    }

    /// バックエンドが受理後に失敗を報告した
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Backend, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, msg)
    }

    /// 音声のダウンロード/コピー失敗
    pub fn materialize(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Materialize, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, msg)
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidState, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, msg)
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}
