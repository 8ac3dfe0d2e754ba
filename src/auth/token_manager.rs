//! 令牌管理器
//!
//! 进程内唯一的令牌持有者，所有上传引擎共享同一个实例（Arc）。
//! 多个上传任务可能同时失败并要求刷新，这里保证：
//! 1. 同一时刻只有一个刷新请求打到提供者
//! 2. 最小刷新间隔内的重复刷新直接复用刚签发的令牌
//! 3. 刷新后的令牌对所有引擎立即可见

use crate::auth::provider::AuthProvider;
use crate::auth::types::{AccessToken, Identity};
use crate::error::UploadResult;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 令牌剩余有效期低于该值时视为过期
const EXPIRY_MARGIN_SECS: i64 = 60;

/// 默认最小刷新间隔
const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

pub struct TokenManager {
    provider: Arc<dyn AuthProvider>,
    /// 当前令牌
    current: RwLock<Option<AccessToken>>,
    /// 串行化刷新
    refresh_lock: Mutex<()>,
    /// 上次真正调用提供者刷新的时间
    last_refresh: RwLock<Option<Instant>>,
    min_refresh_interval: Duration,
    /// 实际刷新次数（诊断用）
    refresh_count: AtomicU64,
}

impl TokenManager {
    pub fn new(provider: Arc<dyn AuthProvider>) -> Self {
        Self::with_min_refresh_interval(provider, DEFAULT_MIN_REFRESH_INTERVAL)
    }

    pub fn with_min_refresh_interval(
        provider: Arc<dyn AuthProvider>,
        min_refresh_interval: Duration,
    ) -> Self {
        Self {
            provider,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            last_refresh: RwLock::new(None),
            min_refresh_interval,
            refresh_count: AtomicU64::new(0),
        }
    }

    fn margin() -> chrono::Duration {
        chrono::Duration::seconds(EXPIRY_MARGIN_SECS)
    }

    fn valid_cached(&self) -> Option<String> {
        self.current
            .read()
            .as_ref()
            .filter(|t| t.is_valid_for(Self::margin()))
            .map(|t| t.token.clone())
    }

    /// 获取可用的访问令牌，必要时刷新
    pub async fn access_token(&self) -> UploadResult<String> {
        if let Some(token) = self.valid_cached() {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        // 等锁期间可能已被其他任务刷新
        if let Some(token) = self.valid_cached() {
            return Ok(token);
        }

        let first_load = self.current.read().is_none();
        let mut token = if first_load {
            self.provider.get_token().await?
        } else {
            self.provider.refresh_token().await?
        };

        if first_load && !token.is_valid_for(Self::margin()) {
            debug!("缓存令牌已过期，立即刷新");
            token = self.provider.refresh_token().await?;
            self.mark_refreshed();
        } else if !first_load {
            self.mark_refreshed();
        }

        let value = token.token.clone();
        *self.current.write() = Some(token);
        Ok(value)
    }

    /// 强制刷新令牌
    ///
    /// 可被多个任务重复调用：最小刷新间隔内的调用直接返回刚刷新的令牌
    pub async fn refresh(&self) -> UploadResult<String> {
        let _guard = self.refresh_lock.lock().await;

        let last_refresh = *self.last_refresh.read();
        let recently = last_refresh
            .map(|at| at.elapsed() < self.min_refresh_interval)
            .unwrap_or(false);
        if recently {
            if let Some(token) = self.current.read().as_ref() {
                debug!("令牌刚刚刷新过，复用现有令牌");
                return Ok(token.token.clone());
            }
        }

        let token = self.provider.refresh_token().await?;
        let value = token.token.clone();
        *self.current.write() = Some(token);
        self.mark_refreshed();
        info!("访问令牌已更新");
        Ok(value)
    }

    fn mark_refreshed(&self) {
        *self.last_refresh.write() = Some(Instant::now());
        self.refresh_count.fetch_add(1, Ordering::SeqCst);
    }

    /// 确认令牌仍被后端接受，被拒绝时刷新后重试一次
    pub async fn ensure_valid(&self) -> UploadResult<Identity> {
        self.access_token().await?;
        match self.provider.current_identity().await {
            Ok(identity) => Ok(identity),
            Err(e) => {
                warn!("令牌校验失败，尝试刷新: {}", e);
                self.refresh().await?;
                self.provider.current_identity().await
            }
        }
    }

    /// 实际调用提供者刷新的次数
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::SeqCst)
    }
}
