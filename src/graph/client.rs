// Graph 云盘客户端实现

use crate::auth::TokenManager;
use crate::config::{GraphConfig, ShareLinkType};
use crate::error::{UploadError, UploadResult};
use crate::graph::api::{DriveApi, SessionTransport};
use crate::graph::types::{
    ChunkRequest, DriveItem, DriveItemCollection, DriveItemSummary, HttpReply,
    ShareLinkResponse,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 请求体
enum Payload {
    Empty,
    Json(Value),
    Bytes(Vec<u8>),
}

/// Graph 云盘客户端
#[derive(Clone)]
pub struct GraphClient {
    http: Client,
    endpoint: String,
    tokens: Arc<TokenManager>,
}

impl GraphClient {
    pub fn new(config: &GraphConfig, tokens: Arc<TokenManager>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("Failed to create HTTP client")?;

        info!("初始化 Graph 客户端: {}", config.endpoint);
        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    /// 共享的令牌管理器
    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn build(&self, method: Method, url: &str, token: &str, payload: &Payload) -> RequestBuilder {
        let builder = self.http.request(method, url).bearer_auth(token);
        match payload {
            Payload::Empty => builder,
            Payload::Json(value) => builder.json(value),
            Payload::Bytes(bytes) => builder
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(bytes.clone()),
        }
    }

    /// 发往预授权上传 URL 的请求，不带 Authorization 头
    fn upload_url_request(&self, method: Method, upload_url: &str) -> RequestBuilder {
        self.http.request(method, upload_url)
    }

    /// 带令牌发送一次请求
    async fn send_once(&self, method: Method, url: &str, payload: &Payload) -> UploadResult<HttpReply> {
        let token = self.tokens.access_token().await?;
        let response = self.build(method, url, &token, payload).send().await?;
        into_reply(response).await
    }

    /// 带令牌发送请求，401 时刷新令牌后重发一次
    async fn send(&self, method: Method, url: &str, payload: Payload) -> UploadResult<HttpReply> {
        let reply = self.send_once(method.clone(), url, &payload).await?;
        if reply.status != 401 {
            return Ok(reply);
        }

        warn!("令牌被拒绝，刷新后重试: {} {}", method, url);
        self.tokens.refresh().await?;
        let reply = self.send_once(method, url, &payload).await?;
        if reply.status == 401 {
            return Err(UploadError::AuthFailure(format!(
                "刷新令牌后仍被拒绝: {}",
                url
            )));
        }
        Ok(reply)
    }

    async fn get_item(&self, path: &str) -> UploadResult<DriveItem> {
        let reply = self
            .send(Method::GET, &self.url(&item_path(path)), Payload::Empty)
            .await?;
        parse_item(&reply)
    }
}

/// 把 reqwest 响应转换为 HttpReply
async fn into_reply(response: Response) -> UploadResult<HttpReply> {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = response.text().await?;
    Ok(HttpReply {
        status,
        body,
        retry_after,
    })
}

/// 把非成功响应转换为 Api 错误
fn api_error(reply: &HttpReply) -> UploadError {
    let (code, message) = reply
        .error()
        .map(|e| (e.code, e.message))
        .unwrap_or_else(|| (String::new(), reply.body.chars().take(200).collect()));
    UploadError::Api {
        status: reply.status,
        code,
        message,
    }
}

fn parse_item(reply: &HttpReply) -> UploadResult<DriveItem> {
    if !reply.is_success() {
        return Err(api_error(reply));
    }
    reply.json::<DriveItem>().ok_or_else(|| UploadError::Api {
        status: reply.status,
        code: "malformedResponse".to_string(),
        message: "无法解析条目元数据".to_string(),
    })
}

fn parse_collection(reply: &HttpReply) -> UploadResult<Vec<DriveItemSummary>> {
    if !reply.is_success() {
        return Err(api_error(reply));
    }
    let collection = reply
        .json::<DriveItemCollection>()
        .unwrap_or(DriveItemCollection { value: Vec::new() });
    Ok(collection.value.into_iter().map(Into::into).collect())
}

/// 逐段编码云盘路径，去掉首尾斜杠
pub fn encode_remote_path(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::encode(s).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// 拼接云盘路径
pub fn join_remote_path(parent: &str, name: &str) -> String {
    let parent = parent.trim_matches('/');
    let name = name.trim_matches('/');
    match (parent.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (false, true) => parent.to_string(),
        (false, false) => format!("{}/{}", parent, name),
    }
}

/// 按路径寻址的条目 URL 片段
fn item_path(path: &str) -> String {
    let encoded = encode_remote_path(path);
    if encoded.is_empty() {
        "/me/drive/root".to_string()
    } else {
        format!("/me/drive/root:/{}", encoded)
    }
}

/// 文件夹子项 URL 片段
fn children_path(folder: &str) -> String {
    let encoded = encode_remote_path(folder);
    if encoded.is_empty() {
        "/me/drive/root/children".to_string()
    } else {
        format!("/me/drive/root:/{}:/children", encoded)
    }
}

/// 文件内容 / 会话 URL 片段：/me/drive/items/root:/{folder}/{name}:/{action}
fn file_action_path(remote_folder: &str, file_name: &str, action: &str) -> String {
    format!(
        "/me/drive/items/root:/{}:/{}",
        encode_remote_path(&join_remote_path(remote_folder, file_name)),
        action
    )
}

#[async_trait]
impl DriveApi for GraphClient {
    async fn create_folder(&self, name: &str, parent_path: &str) -> UploadResult<DriveItem> {
        let body = json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail",
        });
        let reply = self
            .send(
                Method::POST,
                &self.url(&children_path(parent_path)),
                Payload::Json(body),
            )
            .await?;

        if reply.status == 409 {
            debug!("文件夹已存在: {}/{}", parent_path, name);
            return self.get_item(&join_remote_path(parent_path, name)).await;
        }
        let item = parse_item(&reply)?;
        info!("创建文件夹: {}/{} -> {}", parent_path, name, item.id);
        Ok(item)
    }

    async fn get_item_id(&self, path: &str) -> UploadResult<String> {
        Ok(self.get_item(path).await?.id)
    }

    async fn create_share_link(
        &self,
        item_id: &str,
        link_type: ShareLinkType,
    ) -> UploadResult<String> {
        let body = json!({
            "type": link_type.as_str(),
            "scope": "anonymous",
        });
        let url = self.url(&format!(
            "/me/drive/items/{}/createLink",
            urlencoding::encode(item_id)
        ));
        let reply = self.send(Method::POST, &url, Payload::Json(body)).await?;
        if !reply.is_success() {
            return Err(api_error(&reply));
        }

        let link = reply
            .json::<ShareLinkResponse>()
            .ok_or_else(|| UploadError::Api {
                status: reply.status,
                code: "malformedResponse".to_string(),
                message: "分享链接响应缺少 link.webUrl".to_string(),
            })?;
        info!("已创建分享链接: item={}", item_id);
        Ok(link.link.web_url)
    }

    async fn search(&self, query: &str) -> UploadResult<Vec<DriveItemSummary>> {
        if query.trim().is_empty() {
            return self.list_children("").await;
        }
        // 单引号需要双写转义
        let escaped = query.replace('\'', "''");
        let url = self.url(&format!(
            "/me/drive/root/search(q='{}')",
            urlencoding::encode(&escaped)
        ));
        let reply = self.send(Method::GET, &url, Payload::Empty).await?;
        parse_collection(&reply)
    }

    async fn list_children(&self, folder: &str) -> UploadResult<Vec<DriveItemSummary>> {
        let reply = self
            .send(Method::GET, &self.url(&children_path(folder)), Payload::Empty)
            .await?;
        parse_collection(&reply)
    }

    async fn delete_item(&self, item_id: &str) -> UploadResult<()> {
        let url = self.url(&format!("/me/drive/items/{}", urlencoding::encode(item_id)));
        let reply = self.send(Method::DELETE, &url, Payload::Empty).await?;
        if !reply.is_success() {
            return Err(api_error(&reply));
        }
        info!("已删除条目: {}", item_id);
        Ok(())
    }

    async fn upload_small(
        &self,
        remote_folder: &str,
        file_name: &str,
        content: Vec<u8>,
    ) -> UploadResult<DriveItem> {
        let url = self.url(&file_action_path(remote_folder, file_name, "content"));
        debug!("小文件上传: {} ({} bytes)", file_name, content.len());
        let reply = self.send(Method::PUT, &url, Payload::Bytes(content)).await?;
        parse_item(&reply)
    }
}

#[async_trait]
impl SessionTransport for GraphClient {
    async fn create_upload_session(
        &self,
        remote_folder: &str,
        file_name: &str,
        conflict_behavior: &str,
    ) -> UploadResult<HttpReply> {
        let url = self.url(&file_action_path(
            remote_folder,
            file_name,
            "createUploadSession",
        ));
        let body = json!({
            "item": {
                "@microsoft.graph.conflictBehavior": conflict_behavior,
                "name": file_name,
            }
        });
        self.send_once(Method::POST, &url, &Payload::Json(body)).await
    }

    async fn put_chunk(
        &self,
        upload_url: &str,
        request: &ChunkRequest,
        data: Vec<u8>,
    ) -> UploadResult<HttpReply> {
        let response = self
            .upload_url_request(Method::PUT, upload_url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, request.content_length)
            .header(CONTENT_RANGE, &request.content_range)
            .body(data)
            .send()
            .await?;
        into_reply(response).await
    }

    async fn delete_session(&self, upload_url: &str) -> UploadResult<HttpReply> {
        let response = self
            .upload_url_request(Method::DELETE, upload_url)
            .send()
            .await?;
        into_reply(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_remote_path() {
        assert_eq!(encode_remote_path("/Backups/2024 Q1/"), "Backups/2024%20Q1");
        assert_eq!(encode_remote_path(""), "");
        assert_eq!(encode_remote_path("a#b/c"), "a%23b/c");
    }

    #[test]
    fn test_join_remote_path() {
        assert_eq!(join_remote_path("", "a.txt"), "a.txt");
        assert_eq!(join_remote_path("/docs/", "a.txt"), "docs/a.txt");
        assert_eq!(join_remote_path("docs", ""), "docs");
    }

    #[test]
    fn test_url_fragments() {
        assert_eq!(item_path(""), "/me/drive/root");
        assert_eq!(item_path("docs/x"), "/me/drive/root:/docs/x");
        assert_eq!(children_path("/"), "/me/drive/root/children");
        assert_eq!(children_path("docs"), "/me/drive/root:/docs:/children");
        assert_eq!(
            file_action_path("backup", "big file.iso", "createUploadSession"),
            "/me/drive/items/root:/backup/big%20file.iso:/createUploadSession"
        );
        assert_eq!(
            file_action_path("", "a.txt", "content"),
            "/me/drive/items/root:/a.txt:/content"
        );
    }

    #[test]
    fn test_api_error_mapping() {
        let reply = HttpReply::new(
            403,
            r#"{"error":{"code":"accessDenied","message":"nope"}}"#,
        );
        match api_error(&reply) {
            UploadError::Api {
                status,
                code,
                message,
            } => {
                assert_eq!(status, 403);
                assert_eq!(code, "accessDenied");
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_upload_url_requests_carry_no_bearer() {
        use crate::auth::token_manager::tests::fake_token_manager;
        use reqwest::header::AUTHORIZATION;

        let client = GraphClient::new(&GraphConfig::default(), fake_token_manager()).unwrap();
        let url = "https://upload.example/session/abc";

        let delete = client
            .upload_url_request(Method::DELETE, url)
            .build()
            .unwrap();
        assert_eq!(delete.method(), Method::DELETE);
        assert!(delete.headers().get(AUTHORIZATION).is_none());

        let api = client
            .build(Method::GET, url, "token-0", &Payload::Empty)
            .build()
            .unwrap();
        assert_eq!(api.headers()[AUTHORIZATION], "Bearer token-0");
    }

    #[test]
    fn test_parse_collection() {
        let reply = HttpReply::new(
            200,
            r#"{"value":[{"id":"1","name":"a"},{"id":"2","name":"b","folder":{"childCount":0}}]}"#,
        );
        let items = parse_collection(&reply).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].name, "b");
    }
}
