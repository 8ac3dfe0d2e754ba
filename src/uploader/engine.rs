// 断点续传上传引擎
//
// 核心功能：
// 1. 创建会话后按偏移升序逐个发送分片（单文件内不并发）
// 2. 每个分片开始前检查取消标志，取消时删除会话
// 3. 会话失效时重建会话并从头开始，重建次数有上限
// 4. 服务器返回的 nextExpectedRanges 与本地偏移不一致时按服务器偏移重新规划
// 5. 完成后为条目创建分享链接
//
// 状态机：Idle -> SessionCreated -> Transmitting -> {Completed | Cancelled | Failed}

use crate::auth::TokenManager;
use crate::config::{ShareLinkType, UploadConfig};
use crate::error::{UploadError, UploadResult};
use crate::graph::{DriveApi, SessionTransport};
use crate::uploader::chunk;
use crate::uploader::progress::TransferProgress;
use crate::uploader::session::{SessionManager, UploadSession};
use crate::uploader::transmitter::{ChunkOutcome, ChunkTransmitter};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 引擎状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    SessionCreated,
    Transmitting,
    Completed,
    Cancelled,
    Failed,
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineState::Completed | EngineState::Cancelled | EngineState::Failed
        )
    }
}

/// 一次会话的传输结果
enum TransmitResult {
    Completed(String),
    Stale,
}

/// 断点续传上传引擎
///
/// 一个实例负责一个文件；令牌管理器在所有实例间共享
pub struct ResumableUploadEngine {
    sessions: SessionManager,
    transmitter: ChunkTransmitter,
    drive: Arc<dyn DriveApi>,
    chunk_size: u64,
    max_session_restarts: u32,
    /// 服务器连续不推进偏移的容忍次数
    max_stalled_replies: u32,
    share_link_type: ShareLinkType,
    progress: Arc<TransferProgress>,
    cancel_token: CancellationToken,
    /// 状态迁移历史，首项为 Idle
    history: Mutex<Vec<EngineState>>,
}

impl ResumableUploadEngine {
    pub fn new(
        transport: Arc<dyn SessionTransport>,
        drive: Arc<dyn DriveApi>,
        tokens: Arc<TokenManager>,
        config: &UploadConfig,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            sessions: SessionManager::new(transport.clone(), tokens.clone(), config),
            transmitter: ChunkTransmitter::new(transport, tokens, config),
            drive,
            chunk_size: config.chunk_size,
            max_session_restarts: config.max_session_restarts,
            max_stalled_replies: config.max_attempts.max(1),
            share_link_type: config.share_link_type,
            progress: Arc::new(TransferProgress::new(0)),
            cancel_token,
            history: Mutex::new(vec![EngineState::Idle]),
        }
    }

    /// 让本引擎的进度汇总到 parent
    pub fn with_parent_progress(mut self, parent: Arc<TransferProgress>) -> Self {
        self.progress = Arc::new(TransferProgress::with_parent(0, parent));
        self
    }

    pub fn state(&self) -> EngineState {
        self.history
            .lock()
            .last()
            .copied()
            .unwrap_or(EngineState::Idle)
    }

    pub fn history(&self) -> Vec<EngineState> {
        self.history.lock().clone()
    }

    /// 进度在失败后仍可查询
    pub fn progress(&self) -> Arc<TransferProgress> {
        self.progress.clone()
    }

    /// 平均上传速度 (bytes/s)
    pub fn speed(&self) -> u64 {
        self.progress.speed()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    fn transition(&self, next: EngineState) {
        let mut history = self.history.lock();
        let previous = history.last().copied().unwrap_or(EngineState::Idle);
        if previous != next {
            debug!("引擎状态: {:?} -> {:?}", previous, next);
            history.push(next);
        }
    }

    /// 上传文件并返回分享链接
    pub async fn upload_file(&self, local_path: &Path, remote_folder: &str) -> UploadResult<String> {
        let item_id = self.upload_item(local_path, remote_folder).await?;
        let url = self
            .drive
            .create_share_link(&item_id, self.share_link_type)
            .await?;
        info!("上传完成: {} -> {}", local_path.display(), url);
        Ok(url)
    }

    /// 上传文件并返回云盘条目 ID
    pub async fn upload_item(&self, local_path: &Path, remote_folder: &str) -> UploadResult<String> {
        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| UploadError::Io(format!("无效的文件名: {}", local_path.display())))?
            .to_string();
        let total_size = tokio::fs::metadata(local_path).await?.len();

        self.progress.reset(total_size);
        info!(
            "开始分片上传: {} ({} bytes) -> {}",
            local_path.display(),
            total_size,
            remote_folder
        );

        let mut restarts = 0u32;
        loop {
            let mut session = match self
                .sessions
                .create_session(remote_folder, &file_name, total_size, &self.cancel_token)
                .await
            {
                Ok(session) => session,
                Err(e) => {
                    self.transition(if e.is_cancelled() {
                        EngineState::Cancelled
                    } else {
                        EngineState::Failed
                    });
                    return Err(e);
                }
            };
            self.transition(EngineState::SessionCreated);

            match self.transmit(&mut session, local_path).await {
                Ok(TransmitResult::Completed(item_id)) => {
                    self.progress.set_uploaded(total_size);
                    self.transition(EngineState::Completed);
                    return Ok(item_id);
                }
                Ok(TransmitResult::Stale) => {
                    restarts += 1;
                    if restarts > self.max_session_restarts {
                        error!(
                            "上传会话连续失效 {} 次，放弃: {}",
                            restarts, file_name
                        );
                        self.transition(EngineState::Failed);
                        return Err(UploadError::UnrecoverableUpload(format!(
                            "上传会话失效次数超过上限 ({})",
                            self.max_session_restarts
                        )));
                    }
                    warn!(
                        "上传会话失效，重新创建会话 [{}/{}]: {}",
                        restarts, self.max_session_restarts, file_name
                    );
                    self.progress.set_uploaded(0);
                    self.transition(EngineState::Idle);
                }
                Err(e) if e.is_cancelled() => {
                    info!("上传已取消: {}", file_name);
                    self.transition(EngineState::Cancelled);
                    self.sessions.cancel_session(&mut session).await;
                    return Err(e);
                }
                Err(e) => {
                    error!("上传失败: {} - {}", file_name, e);
                    self.transition(EngineState::Failed);
                    return Err(e);
                }
            }
        }
    }

    /// 在一个会话内发送全部分片
    async fn transmit(
        &self,
        session: &mut UploadSession,
        local_path: &Path,
    ) -> UploadResult<TransmitResult> {
        let total_size = session.total_size;
        let mut plan = chunk::plan(total_size, self.chunk_size);
        let mut stalled = 0u32;

        while let Some(descriptor) = plan.next() {
            if self.cancel_token.is_cancelled() {
                return Err(UploadError::CancelledByUser);
            }
            self.transition(EngineState::Transmitting);

            let data = descriptor.read_data(local_path).await?;
            let outcome = self
                .transmitter
                .send_chunk(session, &descriptor, data, &self.cancel_token)
                .await?;

            match outcome {
                ChunkOutcome::Accepted(next) => {
                    if next > descriptor.start_byte {
                        stalled = 0;
                    } else {
                        stalled += 1;
                        if stalled >= self.max_stalled_replies {
                            return Err(UploadError::UnrecoverableUpload(format!(
                                "服务器连续 {} 次未推进偏移 (停留在 {})",
                                stalled, next
                            )));
                        }
                    }
                    let expected = descriptor.start_byte + descriptor.length;
                    if next == expected {
                        self.progress.add(descriptor.length);
                    } else {
                        warn!(
                            "服务器期望偏移 {} 与本地偏移 {} 不一致，按服务器偏移续传",
                            next, expected
                        );
                        self.progress.set_uploaded(next);
                        plan = plan.resume_from(next);
                    }
                }
                ChunkOutcome::Completed(item_id) => {
                    return Ok(TransmitResult::Completed(item_id));
                }
                ChunkOutcome::RetryableError(reason) => {
                    return Err(UploadError::UnrecoverableUpload(format!(
                        "分片 #{} (bytes {}-{}) 重试耗尽: {}",
                        descriptor.index, descriptor.start_byte, descriptor.end_byte, reason
                    )));
                }
                ChunkOutcome::InvalidRequest => {
                    return Ok(TransmitResult::Stale);
                }
            }
        }

        Err(UploadError::UnrecoverableUpload(
            "全部分片已发送，但服务器未确认文件完成".to_string(),
        ))
    }
}
