// Graph API 数据类型定义

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 限流错误码
pub const ERROR_ACTIVITY_LIMIT_REACHED: &str = "activityLimitReached";

/// 会话失效（请求被判定为无效）错误码
pub const ERROR_INVALID_REQUEST: &str = "invalidRequest";

/// 原始 HTTP 响应
///
/// 只保留上传核心关心的字段，解析交给调用方
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    /// HTTP 状态码
    pub status: u16,
    /// 响应体文本
    pub body: String,
    /// Retry-After 响应头（秒）
    pub retry_after: Option<u64>,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 按 JSON 解析响应体
    pub fn json<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_str(&self.body).ok()
    }

    /// 响应体中的 error 对象（如果有）
    pub fn error(&self) -> Option<GraphErrorBody> {
        self.json::<GraphErrorEnvelope>().map(|e| e.error)
    }
}

/// 错误响应外层
#[derive(Debug, Clone, Deserialize)]
pub struct GraphErrorEnvelope {
    pub error: GraphErrorBody,
}

/// 错误响应体
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GraphErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    /// 限流时服务器建议的等待秒数
    #[serde(default)]
    pub retry_after_seconds: Option<u64>,
}

/// 云盘条目
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub web_url: Option<String>,
    /// 上传完成的标志字段
    #[serde(default)]
    pub created_by: Option<Value>,
    #[serde(default)]
    pub folder: Option<Value>,
}

impl DriveItem {
    pub fn is_folder(&self) -> bool {
        self.folder.is_some()
    }
}

/// 条目摘要（搜索 / 列表结果）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriveItemSummary {
    pub id: String,
    pub name: String,
    pub url: Option<String>,
    pub size: Option<u64>,
}

impl From<DriveItem> for DriveItemSummary {
    fn from(item: DriveItem) -> Self {
        Self {
            id: item.id,
            name: item.name,
            url: item.web_url,
            size: item.size,
        }
    }
}

/// 条目集合
#[derive(Debug, Clone, Deserialize)]
pub struct DriveItemCollection {
    #[serde(default)]
    pub value: Vec<DriveItem>,
}

/// createUploadSession 响应
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSessionResponse {
    #[serde(default)]
    pub upload_url: Option<String>,
    #[serde(default)]
    pub expiration_date_time: Option<String>,
}

/// 分片上传响应
///
/// 三选一：nextExpectedRanges（继续）/ 条目元数据（完成）/ error
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    #[serde(default)]
    pub next_expected_ranges: Option<Vec<String>>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub created_by: Option<Value>,
    #[serde(default)]
    pub error: Option<GraphErrorBody>,
}

impl ChunkUploadResponse {
    /// 文件是否已组装完成
    pub fn completed_item_id(&self) -> Option<&str> {
        if self.created_by.is_some() {
            self.id.as_deref()
        } else {
            None
        }
    }

    /// 服务器期望的下一个字节偏移
    ///
    /// 形如 "12345-" 或 "12345-99999"
    pub fn next_expected_start(&self) -> Option<u64> {
        let first = self.next_expected_ranges.as_ref()?.first()?;
        first.split('-').next()?.trim().parse().ok()
    }
}

/// 单个分片请求的头部参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    /// Content-Range: bytes {start}-{end}/{total}
    pub content_range: String,
    /// Content-Length
    pub content_length: u64,
}

/// createLink 响应
#[derive(Debug, Clone, Deserialize)]
pub struct ShareLinkResponse {
    pub link: ShareLink,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareLink {
    pub web_url: String,
}
