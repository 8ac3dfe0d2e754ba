// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Graph 会话上传要求分片大小为 320 KiB 的整数倍
pub const CHUNK_SIZE_ALIGNMENT: u64 = 320 * 1024;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Graph API 配置
    #[serde(default)]
    pub graph: GraphConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// Graph API 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// REST 入口
    #[serde(default = "default_graph_endpoint")]
    pub endpoint: String,
    /// OAuth 授权服务器（含租户）
    #[serde(default = "default_authority")]
    pub authority: String,
    /// 应用 client_id
    #[serde(default)]
    pub client_id: String,
    /// 申请的权限范围
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// 令牌缓存文件
    #[serde(default = "default_token_cache_path")]
    pub token_cache_path: PathBuf,
    /// 单个请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_graph_endpoint() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_authority() -> String {
    "https://login.microsoftonline.com/common".to_string()
}

fn default_scopes() -> Vec<String> {
    vec![
        "Files.ReadWrite.All".to_string(),
        "User.Read".to_string(),
        "offline_access".to_string(),
    ]
}

fn default_token_cache_path() -> PathBuf {
    PathBuf::from("ms-graph.json")
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            endpoint: default_graph_endpoint(),
            authority: default_authority(),
            client_id: String::new(),
            scopes: default_scopes(),
            token_cache_path: default_token_cache_path(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// 分享链接类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShareLinkType {
    /// 只读
    #[default]
    View,
    /// 可编辑
    Edit,
    /// 嵌入
    Embed,
}

impl ShareLinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShareLinkType::View => "view",
            ShareLinkType::Edit => "edit",
            ShareLinkType::Embed => "embed",
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 分片大小（字节），必须是 320 KiB 的整数倍
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// 小文件阈值，不超过该大小走单请求上传
    #[serde(default = "default_small_file_threshold")]
    pub small_file_threshold: u64,
    /// 最大同时上传文件数
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,
    /// 单个分片 / 创建会话的最大尝试次数
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 创建会话失败后的退避基数（秒），实际等待 attempt * base
    #[serde(default = "default_session_backoff_secs")]
    pub session_backoff_secs: u64,
    /// 分片失败后的退避基数（秒），实际等待 attempt * base
    #[serde(default = "default_chunk_backoff_secs")]
    pub chunk_backoff_secs: u64,
    /// 限流时在服务器建议等待时间之外额外等待的秒数
    #[serde(default = "default_rate_limit_padding_secs")]
    pub rate_limit_padding_secs: u64,
    /// 会话失效后允许整文件重新开始的次数
    #[serde(default = "default_max_session_restarts")]
    pub max_session_restarts: u32,
    /// 最后一个分片也声明完整分片大小的 Content-Length（旧行为）
    #[serde(default)]
    pub declare_full_chunk_length: bool,
    /// 同名冲突策略：rename / replace / fail
    #[serde(default = "default_conflict_behavior")]
    pub conflict_behavior: String,
    /// 上传完成后创建的分享链接类型
    #[serde(default)]
    pub share_link_type: ShareLinkType,
    /// 上传文件夹时是否跳过隐藏文件（以.开头的文件/文件夹）
    #[serde(default)]
    pub skip_hidden_files: bool,
}

fn default_chunk_size() -> u64 {
    100 * CHUNK_SIZE_ALIGNMENT // 32,768,000
}

fn default_small_file_threshold() -> u64 {
    4_000_000
}

fn default_max_concurrent_files() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    5
}

fn default_session_backoff_secs() -> u64 {
    25
}

fn default_chunk_backoff_secs() -> u64 {
    20
}

fn default_rate_limit_padding_secs() -> u64 {
    60
}

fn default_max_session_restarts() -> u32 {
    3
}

fn default_conflict_behavior() -> String {
    "rename".to_string()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            small_file_threshold: default_small_file_threshold(),
            max_concurrent_files: default_max_concurrent_files(),
            max_attempts: default_max_attempts(),
            session_backoff_secs: default_session_backoff_secs(),
            chunk_backoff_secs: default_chunk_backoff_secs(),
            rate_limit_padding_secs: default_rate_limit_padding_secs(),
            max_session_restarts: default_max_session_restarts(),
            declare_full_chunk_length: false,
            conflict_behavior: default_conflict_behavior(),
            share_link_type: ShareLinkType::default(),
            skip_hidden_files: false,
        }
    }
}

impl UploadConfig {
    /// 校验上传参数
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("分片大小必须大于 0");
        }
        if self.chunk_size % CHUNK_SIZE_ALIGNMENT != 0 {
            anyhow::bail!(
                "分片大小必须是 {} 字节的整数倍，当前: {}",
                CHUNK_SIZE_ALIGNMENT,
                self.chunk_size
            );
        }
        if self.max_attempts == 0 {
            anyhow::bail!("最大尝试次数至少为 1");
        }
        if self.max_concurrent_files == 0 {
            anyhow::bail!("最大同时上传文件数至少为 1");
        }
        if !matches!(
            self.conflict_behavior.as_str(),
            "rename" | "replace" | "fail"
        ) {
            anyhow::bail!("未知的冲突策略: {}", self.conflict_behavior);
        }
        Ok(())
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("配置已保存: {}", path.display());
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 仅在文件不存在时写出默认配置，避免覆盖用户写错的配置
                if !path.exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {:#}", e);
                    }
                }

                default_config
            }
        }
    }

    /// 校验整体配置
    pub fn validate(&self) -> Result<()> {
        self.upload.validate().context("上传配置无效")?;
        if self.graph.endpoint.trim().is_empty() {
            anyhow::bail!("Graph endpoint 不能为空");
        }
        Ok(())
    }
}
