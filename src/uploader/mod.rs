// 上传模块
//
// 自底向上：
// - chunk:       分片规划
// - session:     上传会话创建与删除
// - transmitter: 单分片发送、重试与退避
// - engine:      单文件断点续传状态机
// - progress:    进度与速度
// - scheduler:   多文件并发调度
// - folder:      本地文件夹扫描
// - task:        任务记录
// - manager:     对外入口

pub mod chunk;
pub mod engine;
pub mod folder;
pub mod manager;
pub mod progress;
pub mod scheduler;
pub mod session;
pub mod task;
pub mod transmitter;

pub use chunk::{plan, ChunkDescriptor, ChunkPlan};
pub use engine::{EngineState, ResumableUploadEngine};
pub use folder::{FolderScanner, ScanOptions, ScannedFile};
pub use manager::{FileOutcome, FolderUploadReport, UploadManager};
pub use progress::{compute_speed, TransferProgress};
pub use scheduler::{CompletedTask, ConcurrencyScheduler, TaskHandle, DEFAULT_SCHEDULER_WIDTH};
pub use session::{SessionManager, UploadSession};
pub use task::{UploadTask, UploadTaskStatus};
pub use transmitter::{backoff_delay, build_chunk_request, ChunkOutcome, ChunkTransmitter, RetryState};
