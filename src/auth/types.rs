// 认证模块数据类型定义

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 令牌响应未给出 expires_in 时假定的有效期（秒）
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3000;

/// 访问令牌
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// Bearer 令牌
    pub token: String,
    /// 过期时间
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// 至少还能用 margin 这么久
    pub fn is_valid_for(&self, margin: Duration) -> bool {
        Utc::now() + margin < self.expires_at
    }
}

/// 当前登录身份（/me）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub user_principal_name: Option<String>,
}

/// 持久化到磁盘的令牌缓存
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenCache {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// 过期时间 (Unix timestamp)
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenCache {
    /// 缓存中的访问令牌（如果有）
    pub fn access_token(&self) -> Option<AccessToken> {
        let token = self.access_token.as_ref()?;
        let expires_at = self
            .expires_at
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
            .unwrap_or_else(Utc::now);
        Some(AccessToken::new(token.clone(), expires_at))
    }
}

/// OAuth 令牌端点响应
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}
