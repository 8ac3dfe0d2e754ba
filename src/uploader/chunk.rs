// 上传分片规划
//
// 会话上传分片规则：
// - 分片按文件偏移升序、首尾相接、互不重叠
// - 最后一个分片长度为 total % chunk_size（整除时为完整 chunk_size）
// - 空文件也要产生一个 0-0 的最终分片，否则上传循环一次都不会执行
// - 分片序列可从任意已确认偏移重新生成（服务器指示续传时使用）

use crate::error::{UploadError, UploadResult};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// 分片描述
///
/// end_byte 为闭区间端点，与 Content-Range 的写法一致；
/// 空文件的占位分片 start_byte = end_byte = 0 且 length = 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// 分片序号，续传后继续递增，不随偏移回退
    pub index: u64,
    pub start_byte: u64,
    pub end_byte: u64,
    pub is_final: bool,
    /// 分片实际字节数
    pub length: u64,
}

impl ChunkDescriptor {
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// 读取分片数据
    pub async fn read_data(&self, file_path: &Path) -> UploadResult<Vec<u8>> {
        let length = self.length as usize;
        if length == 0 {
            return Ok(Vec::new());
        }

        let mut file = File::open(file_path).await?;
        file.seek(std::io::SeekFrom::Start(self.start_byte)).await?;

        let mut buffer = vec![0u8; length];
        file.read_exact(&mut buffer).await.map_err(|e| {
            UploadError::Io(format!(
                "读取分片 #{} 失败 (bytes={}-{}): {}",
                self.index, self.start_byte, self.end_byte, e
            ))
        })?;

        debug!(
            "读取分片 #{}: bytes={}-{}, 大小={} bytes",
            self.index, self.start_byte, self.end_byte, length
        );
        Ok(buffer)
    }
}

/// 惰性分片序列
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    total_size: u64,
    chunk_size: u64,
    next_start: u64,
    next_index: u64,
    /// 空文件的占位分片是否已产出
    emitted_empty: bool,
}

/// 从文件开头规划分片
///
/// chunk_size 为 0 时按 1 处理
pub fn plan(total_size: u64, chunk_size: u64) -> ChunkPlan {
    ChunkPlan {
        total_size,
        chunk_size: chunk_size.max(1),
        next_start: 0,
        next_index: 0,
        emitted_empty: false,
    }
}

impl ChunkPlan {
    /// 从已确认的偏移重新规划，偏移超过文件大小时截断
    ///
    /// 新计划沿用当前序号继续编号
    pub fn resume_from(&self, offset: u64) -> ChunkPlan {
        let offset = offset.min(self.total_size);
        ChunkPlan {
            total_size: self.total_size,
            chunk_size: self.chunk_size,
            next_start: offset,
            next_index: self.next_index,
            emitted_empty: false,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// 下一个分片的起始偏移
    pub fn next_offset(&self) -> u64 {
        self.next_start
    }

    /// 分片总数（空文件为 1）
    pub fn chunk_count(&self) -> u64 {
        if self.total_size == 0 {
            1
        } else {
            self.total_size.div_ceil(self.chunk_size)
        }
    }
}

impl Iterator for ChunkPlan {
    type Item = ChunkDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        if self.total_size == 0 {
            if self.emitted_empty {
                return None;
            }
            self.emitted_empty = true;
            return Some(ChunkDescriptor {
                index: 0,
                start_byte: 0,
                end_byte: 0,
                is_final: true,
                length: 0,
            });
        }

        if self.next_start >= self.total_size {
            return None;
        }

        let start = self.next_start;
        let end = (start + self.chunk_size).min(self.total_size);
        let chunk = ChunkDescriptor {
            index: self.next_index,
            start_byte: start,
            end_byte: end - 1,
            is_final: end == self.total_size,
            length: end - start,
        };

        self.next_start = end;
        self.next_index += 1;
        Some(chunk)
    }
}
