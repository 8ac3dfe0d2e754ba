// 令牌提供者
//
// 只负责用缓存中的 refresh_token 换取新令牌；
// 首次登录（设备码 / 授权码流程）不在这里，缓存缺失时直接报错

use crate::auth::types::{
    AccessToken, Identity, TokenCache, TokenResponse, DEFAULT_TOKEN_LIFETIME_SECS,
};
use crate::config::GraphConfig;
use crate::error::{UploadError, UploadResult};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 认证提供者
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// 获取当前令牌（可能已过期，由调用方判断）
    async fn get_token(&self) -> UploadResult<AccessToken>;

    /// 重新签发令牌
    async fn refresh_token(&self) -> UploadResult<AccessToken>;

    /// 查询当前身份，用于确认令牌仍被后端接受
    async fn current_identity(&self) -> UploadResult<Identity>;
}

/// 基于 refresh_token 的 OAuth 提供者
pub struct OAuthRefreshProvider {
    http: reqwest::Client,
    config: GraphConfig,
    /// 令牌缓存（None 表示尚未从磁盘加载）
    cache: Mutex<Option<TokenCache>>,
}

impl OAuthRefreshProvider {
    pub fn new(config: GraphConfig) -> UploadResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| UploadError::AuthFailure(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self {
            http,
            config,
            cache: Mutex::new(None),
        })
    }

    fn cache_path(&self) -> PathBuf {
        self.config.token_cache_path.clone()
    }

    fn token_url(&self) -> String {
        format!(
            "{}/oauth2/v2.0/token",
            self.config.authority.trim_end_matches('/')
        )
    }

    async fn load_cache(&self) -> UploadResult<TokenCache> {
        let path = self.cache_path();
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            UploadError::AuthFailure(format!(
                "读取令牌缓存失败 {:?}: {}，请先完成登录",
                path, e
            ))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| UploadError::AuthFailure(format!("令牌缓存格式错误: {}", e)))
    }

    async fn persist_cache(&self, cache: &TokenCache) {
        let path = self.cache_path();
        let content = match serde_json::to_string_pretty(cache) {
            Ok(c) => c,
            Err(e) => {
                warn!("序列化令牌缓存失败: {}", e);
                return;
            }
        };
        // 写失败不影响本次上传，下次启动会重新刷新
        if let Err(e) = tokio::fs::write(&path, content).await {
            warn!("写入令牌缓存失败 {:?}: {}", path, e);
        }
    }

    /// 确保缓存已加载，返回其副本
    async fn cached(&self) -> UploadResult<TokenCache> {
        let mut guard = self.cache.lock().await;
        if guard.is_none() {
            *guard = Some(self.load_cache().await?);
        }
        Ok(guard.clone().unwrap_or_default())
    }
}

#[async_trait]
impl AuthProvider for OAuthRefreshProvider {
    async fn get_token(&self) -> UploadResult<AccessToken> {
        match self.cached().await?.access_token() {
            Some(token) => Ok(token),
            None => self.refresh_token().await,
        }
    }

    async fn refresh_token(&self) -> UploadResult<AccessToken> {
        let cache = self.cached().await?;
        let refresh_token = cache.refresh_token.clone().ok_or_else(|| {
            UploadError::AuthFailure("缓存中没有 refresh_token，需要重新登录".to_string())
        })?;

        let scope = self.config.scopes.join(" ");
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("scope", scope.as_str()),
        ];

        debug!("刷新访问令牌: {}", self.token_url());
        let response = self
            .http
            .post(self.token_url())
            .form(&params)
            .send()
            .await
            .map_err(|e| UploadError::AuthFailure(format!("令牌刷新请求失败: {}", e)))?;

        let status = response.status();
        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|e| UploadError::AuthFailure(format!("解析令牌响应失败: {}", e)))?;

        if let Some(error) = payload.error {
            return Err(UploadError::AuthFailure(format!(
                "{}: {}",
                error,
                payload.error_description.unwrap_or_default()
            )));
        }
        if !status.is_success() {
            return Err(UploadError::AuthFailure(format!(
                "令牌端点返回 HTTP {}",
                status
            )));
        }

        let access_token = payload
            .access_token
            .ok_or_else(|| UploadError::AuthFailure("令牌响应缺少 access_token".to_string()))?;
        let lifetime = payload.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        let expires_at = Utc::now() + Duration::seconds(lifetime);

        let updated = TokenCache {
            access_token: Some(access_token.clone()),
            refresh_token: payload.refresh_token.or(Some(refresh_token)),
            expires_at: Some(expires_at.timestamp()),
            scope: payload.scope.or(cache.scope),
        };
        self.persist_cache(&updated).await;
        *self.cache.lock().await = Some(updated);

        info!("访问令牌已刷新，有效期 {} 秒", lifetime);
        Ok(AccessToken::new(access_token, expires_at))
    }

    async fn current_identity(&self) -> UploadResult<Identity> {
        let token = self.get_token().await?;
        let url = format!("{}/me", self.config.endpoint.trim_end_matches('/'));

        let response = self
            .http
            .get(url)
            .bearer_auth(&token.token)
            .send()
            .await
            .map_err(|e| UploadError::AuthFailure(format!("查询当前用户失败: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::AuthFailure(format!(
                "令牌被拒绝: HTTP {}",
                status
            )));
        }

        response
            .json::<Identity>()
            .await
            .map_err(|e| UploadError::AuthFailure(format!("解析用户信息失败: {}", e)))
    }
}
