// 云盘接口抽象
//
// 上传核心只依赖这两个 trait，便于测试时替换为假实现

use crate::config::ShareLinkType;
use crate::error::UploadResult;
use crate::graph::types::{ChunkRequest, DriveItem, DriveItemSummary, HttpReply};
use async_trait::async_trait;

/// 普通 REST 操作
#[async_trait]
pub trait DriveApi: Send + Sync {
    /// 在 parent_path 下创建文件夹，已存在时返回现有文件夹
    async fn create_folder(&self, name: &str, parent_path: &str) -> UploadResult<DriveItem>;

    /// 按路径查询条目 ID
    async fn get_item_id(&self, path: &str) -> UploadResult<String>;

    /// 创建匿名分享链接
    async fn create_share_link(
        &self,
        item_id: &str,
        link_type: ShareLinkType,
    ) -> UploadResult<String>;

    /// 全盘搜索
    async fn search(&self, query: &str) -> UploadResult<Vec<DriveItemSummary>>;

    /// 列出文件夹内容，空路径为根目录
    async fn list_children(&self, folder: &str) -> UploadResult<Vec<DriveItemSummary>>;

    /// 删除条目
    async fn delete_item(&self, item_id: &str) -> UploadResult<()>;

    /// 单请求上传小文件
    async fn upload_small(
        &self,
        remote_folder: &str,
        file_name: &str,
        content: Vec<u8>,
    ) -> UploadResult<DriveItem>;
}

/// 上传会话的底层传输
///
/// 只负责发请求、返回原始响应；重试与结果判定在 uploader 里完成。
/// 连接失败等传输层错误以 Err(TransientTransport) 返回
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn create_upload_session(
        &self,
        remote_folder: &str,
        file_name: &str,
        conflict_behavior: &str,
    ) -> UploadResult<HttpReply>;

    async fn put_chunk(
        &self,
        upload_url: &str,
        request: &ChunkRequest,
        data: Vec<u8>,
    ) -> UploadResult<HttpReply>;

    async fn delete_session(&self, upload_url: &str) -> UploadResult<HttpReply>;
}
