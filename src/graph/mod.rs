// Graph 云盘 API 模块

pub mod api;
pub mod client;
pub mod types;

pub use api::{DriveApi, SessionTransport};
pub use client::{encode_remote_path, join_remote_path, GraphClient};
pub use types::{
    ChunkRequest, ChunkUploadResponse, DriveItem, DriveItemSummary, GraphErrorBody, HttpReply,
    UploadSessionResponse, ERROR_ACTIVITY_LIMIT_REACHED, ERROR_INVALID_REQUEST,
};
