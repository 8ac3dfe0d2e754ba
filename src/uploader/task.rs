// 上传任务记录

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// 上传任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadTaskStatus {
    /// 等待中
    Pending,
    /// 上传中
    Uploading,
    /// 已完成
    Completed,
    /// 已取消
    Cancelled,
    /// 失败
    Failed,
}

impl UploadTaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            UploadTaskStatus::Completed | UploadTaskStatus::Cancelled | UploadTaskStatus::Failed
        )
    }
}

/// 单个文件的上传任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    /// 任务ID
    pub id: String,
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 云盘目标文件夹
    pub remote_folder: String,
    /// 文件大小
    pub total_size: u64,
    /// 已上传大小
    pub uploaded_size: u64,
    /// 任务状态
    pub status: UploadTaskStatus,
    /// 平均上传速度 (bytes/s)
    pub speed: u64,
    /// 是否走分片会话上传
    pub chunked: bool,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 错误信息
    pub error: Option<String>,
    /// 云盘条目 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    /// 分享链接（单文件上传时才有）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_url: Option<String>,

    // === 文件夹上传相关字段 ===
    /// 文件夹上传组ID，单文件上传时为 None
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// 相对于根文件夹的路径，如 "2024/01/photo.jpg"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,
}

impl UploadTask {
    pub fn new(local_path: PathBuf, remote_folder: String, total_size: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            local_path,
            remote_folder,
            total_size,
            uploaded_size: 0,
            status: UploadTaskStatus::Pending,
            speed: 0,
            chunked: false,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
            error: None,
            item_id: None,
            share_url: None,
            group_id: None,
            relative_path: None,
        }
    }

    /// 创建属于文件夹上传组的任务
    pub fn new_with_group(
        local_path: PathBuf,
        remote_folder: String,
        total_size: u64,
        group_id: String,
        relative_path: String,
    ) -> Self {
        let mut task = Self::new(local_path, remote_folder, total_size);
        task.group_id = Some(group_id);
        task.relative_path = Some(relative_path);
        task
    }

    /// 进度百分比
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return if self.status == UploadTaskStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        (self.uploaded_size as f64 / self.total_size as f64) * 100.0
    }

    pub fn mark_uploading(&mut self, chunked: bool) {
        self.status = UploadTaskStatus::Uploading;
        self.chunked = chunked;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    pub fn mark_completed(&mut self, item_id: String) {
        self.status = UploadTaskStatus::Completed;
        self.uploaded_size = self.total_size;
        self.item_id = Some(item_id);
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = UploadTaskStatus::Cancelled;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = UploadTaskStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }
}
