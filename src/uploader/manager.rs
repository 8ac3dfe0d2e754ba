// 上传管理器
//
// 对外入口：upload(本地路径, 云盘文件夹) -> 分享链接
// - 文件 <= small_file_threshold：单请求上传
// - 更大的文件：断点续传引擎
// - 文件夹：扫描后交给并发调度器，最后为整个文件夹创建分享链接

use crate::auth::TokenManager;
use crate::config::UploadConfig;
use crate::error::{UploadError, UploadResult};
use crate::graph::{join_remote_path, DriveApi, SessionTransport};
use crate::uploader::engine::ResumableUploadEngine;
use crate::uploader::folder::{format_bytes, remote_subdirectories, FolderScanner, ScanOptions};
use crate::uploader::progress::TransferProgress;
use crate::uploader::scheduler::ConcurrencyScheduler;
use crate::uploader::task::{UploadTask, UploadTaskStatus};
use dashmap::DashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// 文件夹上传中单个文件的结果
#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub relative_path: String,
    pub item_id: Option<String>,
    pub error: Option<String>,
}

/// 文件夹上传报告
#[derive(Debug, Clone, Serialize)]
pub struct FolderUploadReport {
    /// 云盘上的文件夹路径
    pub remote_path: String,
    pub share_url: Option<String>,
    /// 按完成顺序排列
    pub files: Vec<FileOutcome>,
}

impl FolderUploadReport {
    pub fn succeeded(&self) -> usize {
        self.files.iter().filter(|f| f.error.is_none()).count()
    }

    pub fn failed(&self) -> usize {
        self.files.len() - self.succeeded()
    }
}

/// 单个文件上传的调度参数
struct FileJob {
    local_path: PathBuf,
    remote_folder: String,
    file_name: String,
    size: u64,
    group: Option<(String, String)>,
}

/// 上传管理器
///
/// 内部全是 Arc，clone 代价很小，文件夹上传时每个并发任务持有一份
#[derive(Clone)]
pub struct UploadManager {
    drive: Arc<dyn DriveApi>,
    transport: Arc<dyn SessionTransport>,
    tokens: Arc<TokenManager>,
    config: Arc<UploadConfig>,
    cancel_token: CancellationToken,
    tasks: Arc<DashMap<String, UploadTask>>,
    progress: Arc<TransferProgress>,
}

impl UploadManager {
    pub fn new(
        drive: Arc<dyn DriveApi>,
        transport: Arc<dyn SessionTransport>,
        tokens: Arc<TokenManager>,
        config: UploadConfig,
    ) -> Self {
        Self {
            drive,
            transport,
            tokens,
            config: Arc::new(config),
            cancel_token: CancellationToken::new(),
            tasks: Arc::new(DashMap::new()),
            progress: Arc::new(TransferProgress::new(0)),
        }
    }

    /// 云盘 API（搜索、列表、删除等直接调用）
    pub fn drive(&self) -> &Arc<dyn DriveApi> {
        &self.drive
    }

    /// 汇总进度
    pub fn progress(&self) -> Arc<TransferProgress> {
        self.progress.clone()
    }

    /// 取消所有进行中的上传
    pub fn cancel(&self) {
        info!("取消所有上传任务");
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 所有任务记录，按创建时间排序
    pub fn tasks(&self) -> Vec<UploadTask> {
        let mut tasks: Vec<UploadTask> = self.tasks.iter().map(|t| t.value().clone()).collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn get_task(&self, id: &str) -> Option<UploadTask> {
        self.tasks.get(id).map(|t| t.value().clone())
    }

    /// 上传文件或文件夹，返回分享链接
    pub async fn upload(&self, local_path: &Path, remote_folder: &str) -> UploadResult<String> {
        let metadata = tokio::fs::metadata(local_path).await?;
        if metadata.is_dir() {
            let report = self.upload_folder(local_path, remote_folder).await?;
            report.share_url.ok_or_else(|| {
                UploadError::UnrecoverableUpload(format!(
                    "文件夹 {} 没有生成分享链接",
                    report.remote_path
                ))
            })
        } else {
            self.upload_file(local_path, remote_folder).await
        }
    }

    /// 上传单个文件并返回分享链接
    pub async fn upload_file(&self, local_path: &Path, remote_folder: &str) -> UploadResult<String> {
        let size = tokio::fs::metadata(local_path).await?.len();
        let file_name = file_name_of(local_path)?;
        self.progress.reset(size);

        let job = FileJob {
            local_path: local_path.to_path_buf(),
            remote_folder: remote_folder.trim_matches('/').to_string(),
            file_name,
            size,
            group: None,
        };
        let (task_id, item_id) = self.run_file(job).await;
        let item_id = item_id?;

        let url = self
            .drive
            .create_share_link(&item_id, self.config.share_link_type)
            .await?;
        if let Some(mut task) = self.tasks.get_mut(&task_id) {
            task.share_url = Some(url.clone());
        }
        info!("文件上传完成: {} -> {}", local_path.display(), url);
        Ok(url)
    }

    /// 上传文件夹
    ///
    /// 单个文件失败只记入报告；全部失败或被取消时返回错误
    pub async fn upload_folder(
        &self,
        local_path: &Path,
        remote_folder: &str,
    ) -> UploadResult<FolderUploadReport> {
        let dir_name = file_name_of(local_path)?;
        let remote_folder = remote_folder.trim_matches('/').to_string();
        let remote_root = join_remote_path(&remote_folder, &dir_name);

        let scanner = FolderScanner::with_options(ScanOptions {
            follow_symlinks: false,
            skip_hidden: self.config.skip_hidden_files,
        });
        let root = local_path.to_path_buf();
        let files = tokio::task::spawn_blocking(move || scanner.scan(root))
            .await
            .map_err(|e| UploadError::Io(format!("扫描任务异常: {}", e)))?
            .map_err(|e| UploadError::Io(format!("{:#}", e)))?;

        let total: u64 = files.iter().map(|f| f.size).sum();
        info!(
            "开始上传文件夹: {} -> {} ({} 个文件, {})",
            local_path.display(),
            remote_root,
            files.len(),
            format_bytes(total)
        );

        self.drive.create_folder(&dir_name, &remote_folder).await?;
        for sub in remote_subdirectories(&files) {
            let (parent, name) = match sub.rsplit_once('/') {
                Some((parent, name)) => (join_remote_path(&remote_root, parent), name.to_string()),
                None => (remote_root.clone(), sub.clone()),
            };
            self.drive.create_folder(&name, &parent).await?;
        }

        self.progress.reset(total);
        let group_id = Uuid::new_v4().to_string();
        let mut scheduler = ConcurrencyScheduler::new(self.config.max_concurrent_files);

        for file in &files {
            let relative = file.relative_path.to_string_lossy().replace('\\', "/");
            let job = FileJob {
                local_path: file.local_path.clone(),
                remote_folder: join_remote_path(&remote_root, &file.relative_dir()),
                file_name: file.file_name(),
                size: file.size,
                group: Some((group_id.clone(), relative.clone())),
            };
            let manager = self.clone();
            scheduler.submit(relative, async move { manager.run_file(job).await.1 });
        }

        let results = scheduler.wait_all().await;
        let outcomes: Vec<FileOutcome> = results
            .into_iter()
            .map(|done| {
                let (item_id, error) = match done.result {
                    Ok(Ok(id)) => (Some(id), None),
                    Ok(Err(e)) => (None, Some(e.to_string())),
                    Err(panic) => (None, Some(panic)),
                };
                FileOutcome {
                    relative_path: done.label,
                    item_id,
                    error,
                }
            })
            .collect();

        if self.is_cancelled() {
            return Err(UploadError::CancelledByUser);
        }

        let mut report = FolderUploadReport {
            remote_path: remote_root.clone(),
            share_url: None,
            files: outcomes,
        };

        if !report.files.is_empty() && report.succeeded() == 0 {
            error!("文件夹上传失败，所有文件均未成功: {}", remote_root);
            return Err(UploadError::UnrecoverableUpload(format!(
                "文件夹 {} 中的 {} 个文件全部上传失败",
                remote_root,
                report.files.len()
            )));
        }
        if report.failed() > 0 {
            warn!(
                "文件夹上传部分失败: 成功 {}, 失败 {}",
                report.succeeded(),
                report.failed()
            );
        }

        let folder_id = self.drive.get_item_id(&remote_root).await?;
        let url = self
            .drive
            .create_share_link(&folder_id, self.config.share_link_type)
            .await?;
        info!("文件夹上传完成: {} -> {}", remote_root, url);
        report.share_url = Some(url);
        Ok(report)
    }

    /// 上传一个文件并维护任务记录，返回 (任务 ID, 条目 ID)
    async fn run_file(&self, job: FileJob) -> (String, UploadResult<String>) {
        let full_remote = join_remote_path(&job.remote_folder, &job.file_name);
        let mut task = match &job.group {
            Some((group_id, relative)) => UploadTask::new_with_group(
                job.local_path.clone(),
                job.remote_folder.clone(),
                job.size,
                group_id.clone(),
                relative.clone(),
            ),
            None => UploadTask::new(job.local_path.clone(), job.remote_folder.clone(), job.size),
        };
        let chunked = job.size > self.config.small_file_threshold;
        task.mark_uploading(chunked);
        let task_id = task.id.clone();
        self.tasks.insert(task_id.clone(), task);

        let result = if chunked {
            let engine = ResumableUploadEngine::new(
                self.transport.clone(),
                self.drive.clone(),
                self.tokens.clone(),
                &self.config,
                self.cancel_token.child_token(),
            )
            .with_parent_progress(self.progress.clone());
            let result = engine.upload_item(&job.local_path, &job.remote_folder).await;
            self.update_task(&task_id, engine.progress().as_ref());
            result
        } else {
            let progress = TransferProgress::with_parent(job.size, self.progress.clone());
            let result = self.upload_small(&job, &progress).await;
            self.update_task(&task_id, &progress);
            result
        };

        if let Some(mut task) = self.tasks.get_mut(&task_id) {
            match &result {
                Ok(item_id) => task.mark_completed(item_id.clone()),
                Err(e) if e.is_cancelled() => task.mark_cancelled(),
                Err(e) => task.mark_failed(e.to_string()),
            }
        }
        match &result {
            Ok(_) => info!("上传成功: {}", full_remote),
            Err(e) if e.is_cancelled() => info!("上传已取消: {}", full_remote),
            Err(e) => error!("上传失败: {} - {}", full_remote, e),
        }
        (task_id, result)
    }

    async fn upload_small(&self, job: &FileJob, progress: &TransferProgress) -> UploadResult<String> {
        if self.cancel_token.is_cancelled() {
            return Err(UploadError::CancelledByUser);
        }
        let content = tokio::fs::read(&job.local_path).await?;
        let item = self
            .drive
            .upload_small(&job.remote_folder, &job.file_name, content)
            .await?;
        progress.add(job.size);
        Ok(item.id)
    }

    fn update_task(&self, task_id: &str, progress: &TransferProgress) {
        if let Some(mut task) = self.tasks.get_mut(task_id) {
            task.uploaded_size = progress.uploaded_bytes();
            task.speed = progress.speed();
        }
    }

    /// 统计各状态的任务数
    pub fn status_counts(&self) -> Vec<(UploadTaskStatus, usize)> {
        let mut counts: Vec<(UploadTaskStatus, usize)> = Vec::new();
        for task in self.tasks.iter() {
            match counts.iter_mut().find(|(s, _)| *s == task.status) {
                Some((_, n)) => *n += 1,
                None => counts.push((task.status, 1)),
            }
        }
        counts
    }
}

fn file_name_of(path: &Path) -> UploadResult<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_string())
        .ok_or_else(|| UploadError::Io(format!("无效的路径: {}", path.display())))
}
