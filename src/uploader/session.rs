// 上传会话管理
//
// 负责创建断点续传会话、维护服务器期望的字节范围、在取消时删除会话

use crate::auth::TokenManager;
use crate::config::UploadConfig;
use crate::error::{UploadError, UploadResult};
use crate::graph::{SessionTransport, UploadSessionResponse};
use crate::uploader::transmitter::sleep_or_cancel;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 服务器尚未确认的字节范围，end 为 None 表示直到文件末尾
pub type ExpectedRange = (u64, Option<u64>);

/// 断点续传会话
#[derive(Debug, Clone)]
pub struct UploadSession {
    /// 会话上传地址
    pub session_url: String,
    /// 服务器期望的字节范围，按偏移升序
    pub expected_ranges: Vec<ExpectedRange>,
    pub total_size: u64,
    /// 会话过期时间（服务器原样返回）
    pub expires_at: Option<String>,
    cancelled: bool,
}

impl UploadSession {
    pub fn new(session_url: impl Into<String>, total_size: u64) -> Self {
        Self {
            session_url: session_url.into(),
            expected_ranges: vec![(0, None)],
            total_size,
            expires_at: None,
            cancelled: false,
        }
    }

    /// 用分片响应中的 nextExpectedRanges 更新期望范围
    pub fn update_expected_ranges(&mut self, ranges: &[String]) {
        let parsed: Vec<ExpectedRange> = ranges.iter().filter_map(|r| parse_range(r)).collect();
        if !parsed.is_empty() {
            self.expected_ranges = parsed;
        }
    }

    /// 标记全部字节已被确认
    pub fn mark_complete(&mut self) {
        self.expected_ranges.clear();
    }

    /// 服务器期望的下一个字节偏移
    pub fn next_expected_offset(&self) -> Option<u64> {
        self.expected_ranges.first().map(|(start, _)| *start)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// 解析 "start-end" 或 "start-"
fn parse_range(range: &str) -> Option<ExpectedRange> {
    let (start, end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => None,
        e => Some(e.parse().ok()?),
    };
    Some((start, end))
}

/// 会话管理器
pub struct SessionManager {
    transport: Arc<dyn SessionTransport>,
    tokens: Arc<TokenManager>,
    max_attempts: u32,
    backoff_secs: u64,
    conflict_behavior: String,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn SessionTransport>,
        tokens: Arc<TokenManager>,
        config: &UploadConfig,
    ) -> Self {
        Self {
            transport,
            tokens,
            max_attempts: config.max_attempts.max(1),
            backoff_secs: config.session_backoff_secs,
            conflict_behavior: config.conflict_behavior.clone(),
        }
    }

    /// 创建上传会话
    ///
    /// 失败后等待 attempt * backoff 秒并刷新令牌再试，
    /// 用尽次数返回 SessionCreationFailed
    pub async fn create_session(
        &self,
        remote_folder: &str,
        file_name: &str,
        total_size: u64,
        cancel: &CancellationToken,
    ) -> UploadResult<UploadSession> {
        let mut last_reason = String::new();

        for attempt in 1..=self.max_attempts {
            match self
                .transport
                .create_upload_session(remote_folder, file_name, &self.conflict_behavior)
                .await
            {
                Ok(reply) if reply.is_success() => {
                    let upload_url = reply
                        .json::<UploadSessionResponse>()
                        .and_then(|r| r.upload_url.map(|url| (url, r.expiration_date_time)));
                    match upload_url {
                        Some((url, expires_at)) => {
                            info!(
                                "上传会话已创建: {} (第 {} 次尝试)",
                                file_name, attempt
                            );
                            let mut session = UploadSession::new(url, total_size);
                            session.expires_at = expires_at;
                            return Ok(session);
                        }
                        None => {
                            last_reason = format!("响应缺少 uploadUrl (HTTP {})", reply.status);
                        }
                    }
                }
                Ok(reply) => {
                    last_reason = match reply.error() {
                        Some(e) => format!("HTTP {}: {} {}", reply.status, e.code, e.message),
                        None => format!("HTTP {}", reply.status),
                    };
                }
                Err(e) => {
                    last_reason = e.to_string();
                }
            }

            warn!(
                "创建上传会话失败 [{}/{}]: {} - {}",
                attempt, self.max_attempts, file_name, last_reason
            );

            if attempt < self.max_attempts {
                let delay = Duration::from_secs(u64::from(attempt) * self.backoff_secs);
                sleep_or_cancel(delay, cancel).await?;
                if let Err(e) = self.tokens.refresh().await {
                    warn!("刷新令牌失败: {}", e);
                }
            }
        }

        Err(UploadError::SessionCreationFailed {
            attempts: self.max_attempts,
            reason: last_reason,
        })
    }

    /// 删除会话，失败只记录日志
    pub async fn cancel_session(&self, session: &mut UploadSession) {
        if session.cancelled {
            debug!("会话已取消过，跳过: {}", session.session_url);
            return;
        }
        session.cancelled = true;

        match self.transport.delete_session(&session.session_url).await {
            Ok(reply) if reply.is_success() || reply.status == 404 => {
                info!("上传会话已删除");
            }
            Ok(reply) => {
                warn!("删除上传会话失败: HTTP {}", reply.status);
            }
            Err(e) => {
                warn!("删除上传会话失败: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token_manager::tests::fake_token_manager;
    use crate::graph::{ChunkRequest, HttpReply};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// 按脚本返回会话创建结果
    struct ScriptedTransport {
        replies: Mutex<Vec<HttpReply>>,
        creates: AtomicU32,
        deletes: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(mut replies: Vec<HttpReply>) -> Self {
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                creates: AtomicU32::new(0),
                deletes: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SessionTransport for ScriptedTransport {
        async fn create_upload_session(
            &self,
            _remote_folder: &str,
            _file_name: &str,
            _conflict_behavior: &str,
        ) -> UploadResult<HttpReply> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .replies
                .lock()
                .pop()
                .unwrap_or_else(|| HttpReply::new(500, "")))
        }

        async fn put_chunk(
            &self,
            _upload_url: &str,
            _request: &ChunkRequest,
            _data: Vec<u8>,
        ) -> UploadResult<HttpReply> {
            unreachable!()
        }

        async fn delete_session(&self, _upload_url: &str) -> UploadResult<HttpReply> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(HttpReply::new(204, ""))
        }
    }

    fn session_ok() -> HttpReply {
        HttpReply::new(
            200,
            r#"{"uploadUrl":"https://upload.example/s1","expirationDateTime":"2030-01-01T00:00:00Z"}"#,
        )
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("100-"), Some((100, None)));
        assert_eq!(parse_range("0-99"), Some((0, Some(99))));
        assert_eq!(parse_range("abc"), None);
    }

    #[test]
    fn test_update_expected_ranges() {
        let mut session = UploadSession::new("u", 1000);
        assert_eq!(session.next_expected_offset(), Some(0));
        session.update_expected_ranges(&["500-".to_string()]);
        assert_eq!(session.next_expected_offset(), Some(500));
        session.update_expected_ranges(&[]);
        assert_eq!(session.next_expected_offset(), Some(500));
        session.mark_complete();
        assert_eq!(session.next_expected_offset(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_session_retries_then_succeeds() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            HttpReply::new(503, ""),
            session_ok(),
        ]));
        let tokens = fake_token_manager();
        let manager = SessionManager::new(transport.clone(), tokens.clone(), &UploadConfig::default());

        let start = tokio::time::Instant::now();
        let session = manager
            .create_session("backup", "a.bin", 10, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(session.session_url, "https://upload.example/s1");
        assert_eq!(transport.creates.load(Ordering::SeqCst), 2);
        // 第一次失败后等待 1 * 25 秒
        assert_eq!(start.elapsed(), Duration::from_secs(25));
        assert_eq!(tokens.refresh_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_session_gives_up_after_five_attempts() {
        let transport = Arc::new(ScriptedTransport::new(Vec::new()));
        let tokens = fake_token_manager();
        let manager = SessionManager::new(transport.clone(), tokens.clone(), &UploadConfig::default());

        let start = tokio::time::Instant::now();
        let err = manager
            .create_session("backup", "a.bin", 10, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UploadError::SessionCreationFailed { attempts: 5, .. }
        ));
        assert_eq!(transport.creates.load(Ordering::SeqCst), 5);
        // 25 + 50 + 75 + 100，最后一次失败后不再等待
        assert_eq!(start.elapsed(), Duration::from_secs(250));
        assert_eq!(tokens.refresh_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_upload_url_is_a_failure() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            HttpReply::new(200, "{}"),
            session_ok(),
        ]));
        let manager = SessionManager::new(transport.clone(), fake_token_manager(), &UploadConfig::default());
        let session = manager
            .create_session("", "a.bin", 10, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(session.expires_at.as_deref(), Some("2030-01-01T00:00:00Z"));
        assert_eq!(transport.creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let transport = Arc::new(ScriptedTransport::new(Vec::new()));
        let manager = SessionManager::new(transport.clone(), fake_token_manager(), &UploadConfig::default());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        let err = manager
            .create_session("", "a.bin", 10, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(transport.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_session_is_idempotent() {
        let transport = Arc::new(ScriptedTransport::new(Vec::new()));
        let manager = SessionManager::new(transport.clone(), fake_token_manager(), &UploadConfig::default());
        let mut session = UploadSession::new("https://upload.example/s1", 10);

        manager.cancel_session(&mut session).await;
        manager.cancel_session(&mut session).await;
        assert!(session.is_cancelled());
        assert_eq!(transport.deletes.load(Ordering::SeqCst), 1);
    }
}
