//! 文件夹扫描模块
//!
//! 负责:
//! - 递归扫描本地文件夹
//! - 保留目录结构（相对路径 -> 远程子目录）
//! - 列出需要预先创建的远程子目录

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// 文件扫描结果
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 相对于扫描根目录的路径
    pub relative_path: PathBuf,
    /// 文件大小（字节）
    pub size: u64,
}

impl ScannedFile {
    /// 相对目录，用 / 连接，根目录下的文件为空串
    pub fn relative_dir(&self) -> String {
        self.relative_path
            .parent()
            .map(path_to_remote)
            .unwrap_or_default()
    }

    pub fn file_name(&self) -> String {
        self.relative_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// 扫描配置
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// 是否跟随符号链接
    pub follow_symlinks: bool,
    /// 跳过隐藏文件和文件夹（以 . 开头）
    pub skip_hidden: bool,
}

/// 文件夹扫描器
#[derive(Debug, Default)]
pub struct FolderScanner {
    options: ScanOptions,
}

impl FolderScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ScanOptions) -> Self {
        Self { options }
    }

    /// 递归扫描文件夹，按相对路径排序返回
    pub fn scan<P: AsRef<Path>>(&self, root_path: P) -> Result<Vec<ScannedFile>> {
        let root_path = root_path.as_ref();

        if !root_path.exists() {
            anyhow::bail!("扫描路径不存在: {}", root_path.display());
        }
        if !root_path.is_dir() {
            anyhow::bail!("扫描路径不是文件夹: {}", root_path.display());
        }

        info!("开始扫描文件夹: {}", root_path.display());

        let skip_hidden = self.options.skip_hidden;
        let walker = WalkDir::new(root_path)
            .follow_links(self.options.follow_symlinks)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !(skip_hidden && is_hidden(e)));

        let mut files = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("跳过无法读取的条目: {}", e);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let metadata = entry
                .metadata()
                .with_context(|| format!("读取文件元数据失败: {}", entry.path().display()))?;
            let relative_path = entry
                .path()
                .strip_prefix(root_path)
                .with_context(|| {
                    format!(
                        "计算相对路径失败: {} (root: {})",
                        entry.path().display(),
                        root_path.display()
                    )
                })?
                .to_path_buf();

            debug!("扫描到文件: {} ({} bytes)", relative_path.display(), metadata.len());
            files.push(ScannedFile {
                local_path: entry.path().to_path_buf(),
                relative_path,
                size: metadata.len(),
            });
        }

        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        info!(
            "文件夹扫描完成: {} 个文件，总大小 {}",
            files.len(),
            format_bytes(files.iter().map(|f| f.size).sum())
        );
        Ok(files)
    }
}

/// 需要创建的远程子目录，父目录排在子目录前面
pub fn remote_subdirectories(files: &[ScannedFile]) -> Vec<String> {
    let mut dirs = BTreeSet::new();
    for file in files {
        let mut current = String::new();
        for part in file.relative_dir().split('/').filter(|s| !s.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            dirs.insert(current.clone());
        }
    }
    let mut dirs: Vec<String> = dirs.into_iter().collect();
    dirs.sort_by_key(|d| d.matches('/').count());
    dirs
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

fn path_to_remote(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// 格式化字节大小
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_folder() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        fs::write(root.join("file1.txt"), "content1").unwrap();
        fs::write(root.join("file2.txt"), "content22").unwrap();
        fs::create_dir_all(root.join("sub/deeper")).unwrap();
        fs::write(root.join("sub/file3.txt"), "c3").unwrap();
        fs::write(root.join("sub/deeper/file4.txt"), "c4").unwrap();
        fs::create_dir(root.join(".hidden")).unwrap();
        fs::write(root.join(".hidden/secret.txt"), "s").unwrap();
        fs::write(root.join(".dotfile"), "d").unwrap();

        temp_dir
    }

    #[test]
    fn test_scan_folder() {
        let temp = create_test_folder();
        let files = FolderScanner::new().scan(temp.path()).unwrap();

        assert_eq!(files.len(), 6);
        let file1 = files
            .iter()
            .find(|f| f.relative_path == Path::new("file1.txt"))
            .unwrap();
        assert_eq!(file1.size, 8);
        assert_eq!(file1.relative_dir(), "");
    }

    #[test]
    fn test_scan_skip_hidden() {
        let temp = create_test_folder();
        let scanner = FolderScanner::with_options(ScanOptions {
            skip_hidden: true,
            ..Default::default()
        });
        let files = scanner.scan(temp.path()).unwrap();

        assert_eq!(files.len(), 4);
        assert!(files
            .iter()
            .all(|f| !f.relative_path.to_string_lossy().contains(".hidden")));
    }

    #[test]
    fn test_scan_nonexistent_folder() {
        let result = FolderScanner::new().scan("/nonexistent/folder/path");
        assert!(result.is_err());
    }

    #[test]
    fn test_scan_file_not_folder() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a.txt");
        fs::write(&file, "x").unwrap();
        assert!(FolderScanner::new().scan(&file).is_err());
    }

    #[test]
    fn test_relative_dir_and_subdirectories() {
        let temp = create_test_folder();
        let scanner = FolderScanner::with_options(ScanOptions {
            skip_hidden: true,
            ..Default::default()
        });
        let files = scanner.scan(temp.path()).unwrap();

        let deep = files.iter().find(|f| f.file_name() == "file4.txt").unwrap();
        assert_eq!(deep.relative_dir(), "sub/deeper");

        assert_eq!(remote_subdirectories(&files), vec!["sub", "sub/deeper"]);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(32_768_000), "31.25 MB");
    }
}
