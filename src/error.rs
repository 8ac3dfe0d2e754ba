//! 上传错误类型
//!
//! 引擎对外只暴露类型化错误，不把底层传输错误直接抛给调用方

use thiserror::Error;

/// 上传结果类型别名
pub type UploadResult<T> = std::result::Result<T, UploadError>;

/// 上传错误分类
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    /// 令牌获取/刷新失败
    #[error("认证失败: {0}")]
    AuthFailure(String),

    /// 创建上传会话重试耗尽
    #[error("创建上传会话失败（已尝试 {attempts} 次）: {reason}")]
    SessionCreationFailed { attempts: u32, reason: String },

    /// 网络/服务器瞬时错误（重试预算内会被吞掉）
    #[error("传输错误: {0}")]
    TransientTransport(String),

    /// 服务器限流
    #[error("服务器限流，建议 {retry_after_secs} 秒后重试")]
    RateLimited { retry_after_secs: u64 },

    /// 上传会话已失效，需要从创建会话重新开始
    #[error("上传会话已失效")]
    StaleSession,

    /// 用户取消
    #[error("上传已取消")]
    CancelledByUser,

    /// 重试耗尽后仍失败
    #[error("上传失败: {0}")]
    UnrecoverableUpload(String),

    /// 本地文件读取失败
    #[error("本地文件错误: {0}")]
    Io(String),

    /// 后端拒绝请求（不可重试）
    #[error("API 错误: HTTP {status}, code={code}, message={message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
}

impl UploadError {
    /// 是否属于可重试的瞬时错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UploadError::TransientTransport(_)
                | UploadError::RateLimited { .. }
                | UploadError::StaleSession
        )
    }

    /// 是否为用户取消
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::CancelledByUser)
    }
}

impl From<std::io::Error> for UploadError {
    fn from(e: std::io::Error) -> Self {
        UploadError::Io(e.to_string())
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(e: reqwest::Error) -> Self {
        UploadError::TransientTransport(e.to_string())
    }
}
