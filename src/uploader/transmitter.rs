// 分片发送器
//
// 核心功能：
// 1. 按 Content-Range 发送单个分片
// 2. 把响应归类为 继续 / 完成 / 可重试错误 / 会话失效
// 3. 单分片内的重试与退避：
//    - 限流（429 或 activityLimitReached）：等待 retryAfterSeconds + 附加秒数
//    - 其它失败：等待 attempt * chunk_backoff_secs
//    - 每次失败后刷新令牌
//    - 会话失效（invalidRequest / 404）立即返回，由引擎重建会话

use crate::auth::TokenManager;
use crate::config::UploadConfig;
use crate::error::{UploadError, UploadResult};
use crate::graph::{
    ChunkRequest, ChunkUploadResponse, HttpReply, SessionTransport, ERROR_ACTIVITY_LIMIT_REACHED,
    ERROR_INVALID_REQUEST,
};
use crate::uploader::chunk::ChunkDescriptor;
use crate::uploader::session::UploadSession;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 分片发送结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// 分片已被服务器缓存，值为服务器期望的下一个偏移
    Accepted(u64),
    /// 文件组装完成，值为云盘条目 ID
    Completed(String),
    /// 重试次数耗尽
    RetryableError(String),
    /// 会话失效，需要重建会话
    InvalidRequest,
}

/// 单个分片的重试状态，换下一个分片时重置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub max_attempts: u32,
}

impl RetryState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts: max_attempts.max(1),
        }
    }

    /// 记录一次失败，返回当前尝试序号（从 1 开始）
    pub fn record_failure(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// 失败类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// 限流，携带服务器建议的等待秒数
    RateLimited { retry_after_secs: u64 },
    /// 其它瞬时错误
    Transient(String),
}

/// 退避参数
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub chunk_backoff_secs: u64,
    pub rate_limit_padding_secs: u64,
}

/// 计算退避时长
///
/// - 限流: retry_after + padding
/// - 其它: attempt * chunk_backoff_secs
pub fn backoff_delay(attempt: u32, failure: &FailureKind, policy: &BackoffPolicy) -> Duration {
    let secs = match failure {
        FailureKind::RateLimited { retry_after_secs } => {
            retry_after_secs.saturating_add(policy.rate_limit_padding_secs)
        }
        FailureKind::Transient(_) => u64::from(attempt).saturating_mul(policy.chunk_backoff_secs),
    };
    Duration::from_secs(secs)
}

/// 构建分片请求头
///
/// declare_full_chunk_length 为 true 时 Content-Length 固定为配置的分片大小
pub fn build_chunk_request(
    chunk: &ChunkDescriptor,
    total_size: u64,
    chunk_size: u64,
    declare_full_chunk_length: bool,
) -> ChunkRequest {
    ChunkRequest {
        content_range: format!(
            "bytes {}-{}/{}",
            chunk.start_byte, chunk.end_byte, total_size
        ),
        content_length: if declare_full_chunk_length {
            chunk_size
        } else {
            chunk.length
        },
    }
}

/// 可被取消打断的等待
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> UploadResult<()> {
    if delay.is_zero() {
        return if cancel.is_cancelled() {
            Err(UploadError::CancelledByUser)
        } else {
            Ok(())
        };
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(UploadError::CancelledByUser),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// 单次响应的归类
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplyClass {
    Accepted { next: u64, ranges: Vec<String> },
    Completed(String),
    Stale,
    Failed(FailureKind),
}

fn is_chunk_success(status: u16) -> bool {
    matches!(status, 200 | 201 | 202)
}

fn classify_reply(reply: &HttpReply, chunk: &ChunkDescriptor) -> ReplyClass {
    let parsed = reply.json::<ChunkUploadResponse>().unwrap_or_default();

    if is_chunk_success(reply.status) {
        if let Some(id) = parsed.completed_item_id() {
            return ReplyClass::Completed(id.to_string());
        }
        let next = parsed
            .next_expected_start()
            .unwrap_or(chunk.start_byte + chunk.length);
        return ReplyClass::Accepted {
            next,
            ranges: parsed.next_expected_ranges.unwrap_or_default(),
        };
    }

    let error = parsed.error;
    let code = error.as_ref().map(|e| e.code.as_str()).unwrap_or("");

    if code == ERROR_INVALID_REQUEST || reply.status == 404 {
        return ReplyClass::Stale;
    }

    if code == ERROR_ACTIVITY_LIMIT_REACHED || reply.status == 429 {
        let retry_after_secs = error
            .as_ref()
            .and_then(|e| e.retry_after_seconds)
            .or(reply.retry_after)
            .unwrap_or(0);
        return ReplyClass::Failed(FailureKind::RateLimited { retry_after_secs });
    }

    let reason = match error {
        Some(e) if !e.code.is_empty() => format!("HTTP {}: {} {}", reply.status, e.code, e.message),
        _ => format!("HTTP {}", reply.status),
    };
    ReplyClass::Failed(FailureKind::Transient(reason))
}

/// 分片发送器
pub struct ChunkTransmitter {
    transport: Arc<dyn SessionTransport>,
    tokens: Arc<TokenManager>,
    max_attempts: u32,
    chunk_size: u64,
    declare_full_chunk_length: bool,
    backoff: BackoffPolicy,
}

impl ChunkTransmitter {
    pub fn new(
        transport: Arc<dyn SessionTransport>,
        tokens: Arc<TokenManager>,
        config: &UploadConfig,
    ) -> Self {
        Self {
            transport,
            tokens,
            max_attempts: config.max_attempts,
            chunk_size: config.chunk_size,
            declare_full_chunk_length: config.declare_full_chunk_length,
            backoff: BackoffPolicy {
                chunk_backoff_secs: config.chunk_backoff_secs,
                rate_limit_padding_secs: config.rate_limit_padding_secs,
            },
        }
    }

    /// 发送一个分片，内部完成重试
    ///
    /// 只有退避期间被取消时返回 Err(CancelledByUser)
    pub async fn send_chunk(
        &self,
        session: &mut UploadSession,
        chunk: &ChunkDescriptor,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> UploadResult<ChunkOutcome> {
        let request = build_chunk_request(
            chunk,
            session.total_size,
            self.chunk_size,
            self.declare_full_chunk_length,
        );
        let mut retry = RetryState::new(self.max_attempts);

        loop {
            let class = match self
                .transport
                .put_chunk(&session.session_url, &request, data.clone())
                .await
            {
                Ok(reply) => classify_reply(&reply, chunk),
                Err(e) => ReplyClass::Failed(FailureKind::Transient(e.to_string())),
            };

            let failure = match class {
                ReplyClass::Accepted { next, ranges } => {
                    debug!("分片 #{} 已接受 ({}), 下一个偏移 {}", chunk.index, request.content_range, next);
                    session.update_expected_ranges(&ranges);
                    return Ok(ChunkOutcome::Accepted(next));
                }
                ReplyClass::Completed(id) => {
                    info!("分片 #{} 已接受，文件组装完成: {}", chunk.index, id);
                    session.mark_complete();
                    return Ok(ChunkOutcome::Completed(id));
                }
                ReplyClass::Stale => {
                    warn!("分片 #{} 被拒绝：上传会话已失效", chunk.index);
                    return Ok(ChunkOutcome::InvalidRequest);
                }
                ReplyClass::Failed(failure) => failure,
            };

            let attempt = retry.record_failure();
            let reason = match &failure {
                FailureKind::RateLimited { retry_after_secs } => {
                    UploadError::RateLimited {
                        retry_after_secs: *retry_after_secs,
                    }
                    .to_string()
                }
                FailureKind::Transient(reason) => reason.clone(),
            };
            warn!(
                "分片 #{} 发送失败 [{}/{}]: {}",
                chunk.index, attempt, retry.max_attempts, reason
            );

            if retry.is_exhausted() {
                return Ok(ChunkOutcome::RetryableError(reason));
            }

            let delay = backoff_delay(attempt, &failure, &self.backoff);
            debug!("分片 #{} 等待 {:?} 后重试", chunk.index, delay);
            sleep_or_cancel(delay, cancel).await?;

            if let Err(e) = self.tokens.refresh().await {
                warn!("刷新令牌失败: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token_manager::tests::fake_token_manager;
    use crate::uploader::chunk::plan;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// 记录每次分片请求并按脚本应答
    struct ChunkScript {
        replies: Mutex<Vec<UploadResult<HttpReply>>>,
        requests: Mutex<Vec<ChunkRequest>>,
    }

    impl ChunkScript {
        fn new(mut replies: Vec<UploadResult<HttpReply>>) -> Self {
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SessionTransport for ChunkScript {
        async fn create_upload_session(
            &self,
            _remote_folder: &str,
            _file_name: &str,
            _conflict_behavior: &str,
        ) -> UploadResult<HttpReply> {
            unreachable!()
        }

        async fn put_chunk(
            &self,
            _upload_url: &str,
            request: &ChunkRequest,
            _data: Vec<u8>,
        ) -> UploadResult<HttpReply> {
            self.requests.lock().push(request.clone());
            self.replies
                .lock()
                .pop()
                .unwrap_or_else(|| Ok(HttpReply::new(500, "")))
        }

        async fn delete_session(&self, _upload_url: &str) -> UploadResult<HttpReply> {
            Ok(HttpReply::new(204, ""))
        }
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            chunk_backoff_secs: 20,
            rate_limit_padding_secs: 60,
        }
    }

    fn transmitter(script: Arc<ChunkScript>) -> (ChunkTransmitter, Arc<TokenManager>) {
        let tokens = fake_token_manager();
        let config = UploadConfig {
            chunk_size: 327_680,
            ..UploadConfig::default()
        };
        (ChunkTransmitter::new(script, tokens.clone(), &config), tokens)
    }

    #[test]
    fn test_backoff_delay() {
        let p = policy();
        assert_eq!(
            backoff_delay(1, &FailureKind::Transient("x".into()), &p),
            Duration::from_secs(20)
        );
        assert_eq!(
            backoff_delay(3, &FailureKind::Transient("x".into()), &p),
            Duration::from_secs(60)
        );
        assert_eq!(
            backoff_delay(2, &FailureKind::RateLimited { retry_after_secs: 30 }, &p),
            Duration::from_secs(90)
        );
        assert_eq!(
            backoff_delay(1, &FailureKind::RateLimited { retry_after_secs: 0 }, &p),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_build_chunk_request() {
        let chunks: Vec<_> = plan(1000, 400).collect();
        let last = chunks[2];

        let request = build_chunk_request(&last, 1000, 400, false);
        assert_eq!(request.content_range, "bytes 800-999/1000");
        assert_eq!(request.content_length, 200);

        let legacy = build_chunk_request(&last, 1000, 400, true);
        assert_eq!(legacy.content_range, "bytes 800-999/1000");
        assert_eq!(legacy.content_length, 400);
    }

    #[test]
    fn test_retry_state() {
        let mut retry = RetryState::new(5);
        for _ in 0..4 {
            retry.record_failure();
            assert!(!retry.is_exhausted());
        }
        assert_eq!(retry.record_failure(), 5);
        assert!(retry.is_exhausted());
        retry.reset();
        assert_eq!(retry.attempt, 0);
    }

    #[test]
    fn test_classify_reply() {
        let chunk = plan(1000, 400).next().unwrap();

        let accepted = HttpReply::new(202, r#"{"nextExpectedRanges":["400-"]}"#);
        assert_eq!(
            classify_reply(&accepted, &chunk),
            ReplyClass::Accepted {
                next: 400,
                ranges: vec!["400-".to_string()]
            }
        );

        let no_body = HttpReply::new(202, "");
        assert!(matches!(
            classify_reply(&no_body, &chunk),
            ReplyClass::Accepted { next: 400, .. }
        ));

        let done = HttpReply::new(201, r#"{"id":"ITEM","createdBy":{"user":{}}}"#);
        assert_eq!(
            classify_reply(&done, &chunk),
            ReplyClass::Completed("ITEM".to_string())
        );

        let stale = HttpReply::new(400, r#"{"error":{"code":"invalidRequest","message":"bad"}}"#);
        assert_eq!(classify_reply(&stale, &chunk), ReplyClass::Stale);
        assert_eq!(classify_reply(&HttpReply::new(404, ""), &chunk), ReplyClass::Stale);

        let limited = HttpReply::new(
            503,
            r#"{"error":{"code":"activityLimitReached","retryAfterSeconds":12}}"#,
        );
        assert_eq!(
            classify_reply(&limited, &chunk),
            ReplyClass::Failed(FailureKind::RateLimited {
                retry_after_secs: 12
            })
        );

        let mut header_only = HttpReply::new(429, "");
        header_only.retry_after = Some(7);
        assert_eq!(
            classify_reply(&header_only, &chunk),
            ReplyClass::Failed(FailureKind::RateLimited {
                retry_after_secs: 7
            })
        );

        assert!(matches!(
            classify_reply(&HttpReply::new(500, ""), &chunk),
            ReplyClass::Failed(FailureKind::Transient(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_chunk_retries_transient_errors() {
        let script = Arc::new(ChunkScript::new(vec![
            Ok(HttpReply::new(500, "")),
            Err(UploadError::TransientTransport("connection reset".into())),
            Ok(HttpReply::new(202, r#"{"nextExpectedRanges":["327680-"]}"#)),
        ]));
        let (tx, tokens) = transmitter(script.clone());
        let mut session = UploadSession::new("https://upload.example/s", 1_000_000);
        let chunk = plan(1_000_000, 327_680).next().unwrap();

        let start = tokio::time::Instant::now();
        let outcome = tx
            .send_chunk(&mut session, &chunk, vec![0; 327_680], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ChunkOutcome::Accepted(327_680));
        assert_eq!(session.next_expected_offset(), Some(327_680));
        assert_eq!(script.requests.lock().len(), 3);
        // 20 + 40
        assert_eq!(start.elapsed(), Duration::from_secs(60));
        assert_eq!(tokens.refresh_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_for_server_hint() {
        let script = Arc::new(ChunkScript::new(vec![
            Ok(HttpReply::new(
                429,
                r#"{"error":{"code":"activityLimitReached","retryAfterSeconds":30}}"#,
            )),
            Ok(HttpReply::new(202, r#"{"nextExpectedRanges":["327680-"]}"#)),
        ]));
        let (tx, _) = transmitter(script.clone());
        let mut session = UploadSession::new("https://upload.example/s", 1_000_000);
        let chunk = plan(1_000_000, 327_680).next().unwrap();

        let start = tokio::time::Instant::now();
        tx.send_chunk(&mut session, &chunk, Vec::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_are_terminal() {
        let script = Arc::new(ChunkScript::new(Vec::new()));
        let (tx, _) = transmitter(script.clone());
        let mut session = UploadSession::new("https://upload.example/s", 1_000_000);
        let chunk = plan(1_000_000, 327_680).next().unwrap();

        let start = tokio::time::Instant::now();
        let outcome = tx
            .send_chunk(&mut session, &chunk, Vec::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, ChunkOutcome::RetryableError(_)));
        assert_eq!(script.requests.lock().len(), 5);
        // 20 + 40 + 60 + 80，第五次失败后不等待
        assert_eq!(start.elapsed(), Duration::from_secs(200));
    }

    #[tokio::test]
    async fn test_invalid_request_short_circuits() {
        let script = Arc::new(ChunkScript::new(vec![Ok(HttpReply::new(
            400,
            r#"{"error":{"code":"invalidRequest","message":"stale"}}"#,
        ))]));
        let (tx, tokens) = transmitter(script.clone());
        let mut session = UploadSession::new("https://upload.example/s", 1_000_000);
        let chunk = plan(1_000_000, 327_680).next().unwrap();

        let outcome = tx
            .send_chunk(&mut session, &chunk, Vec::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ChunkOutcome::InvalidRequest);
        assert_eq!(script.requests.lock().len(), 1);
        assert_eq!(tokens.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_legacy_content_length_on_final_chunk() {
        let script = Arc::new(ChunkScript::new(vec![Ok(HttpReply::new(
            201,
            r#"{"id":"X","createdBy":{}}"#,
        ))]));
        let tokens = fake_token_manager();
        let config = UploadConfig {
            chunk_size: 327_680,
            declare_full_chunk_length: true,
            ..UploadConfig::default()
        };
        let tx = ChunkTransmitter::new(script.clone(), tokens, &config);
        let mut session = UploadSession::new("https://upload.example/s", 1000);
        let chunk = plan(1000, 327_680).next().unwrap();

        let outcome = tx
            .send_chunk(&mut session, &chunk, vec![0; 1000], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ChunkOutcome::Completed("X".to_string()));
        let requests = script.requests.lock();
        assert_eq!(requests[0].content_length, 327_680);
        assert_eq!(requests[0].content_range, "bytes 0-999/1000");
    }
}
