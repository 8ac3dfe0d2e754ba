// Graph Drive Uploader Library
// 云盘大文件断点续传上传核心库

// 错误类型
pub mod error;

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 认证模块
pub mod auth;

// 云盘 API 模块
pub mod graph;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use auth::{AuthProvider, OAuthRefreshProvider, TokenManager};
pub use config::AppConfig;
pub use error::{UploadError, UploadResult};
pub use graph::{DriveApi, GraphClient, SessionTransport};
pub use uploader::{
    ConcurrencyScheduler, EngineState, FolderUploadReport, ResumableUploadEngine,
    TransferProgress, UploadManager, UploadTask, UploadTaskStatus,
};
