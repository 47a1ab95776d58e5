pub mod auth;
pub mod local;
pub mod webdav;

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub use auth::{AuthType, Credentials};
pub use local::LocalStore;
pub use webdav::WebDavStore;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- PROPFIND, MKCOL 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- PUT, GET 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 远程对象元数据（PROPFIND depth 0 的结果）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMeta {
    pub size: u64,
    /// 最后修改时间（Unix 时间戳）
    pub modified_time: Option<i64>,
    pub is_dir: bool,
    /// 服务器提供的内容标识（ETag，已去掉引号和 W/ 前缀）
    pub etag: Option<String>,
}

/// 远程存储错误
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("网络错误: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("认证失败 (HTTP {0})")]
    Unauthorized(u16),
    #[error("HTTP {status}: {context}")]
    Status { status: u16, context: String },
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("响应无法解析: {0}")]
    Protocol(String),
}

impl RemoteError {
    /// 是否为可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Transport(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            RemoteError::Status { status, .. } => {
                *status == 408 || *status == 429 || ((500..600).contains(status) && *status != 507)
            }
            RemoteError::Io(_) => true,
            RemoteError::Unauthorized(_) | RemoteError::Protocol(_) => false,
        }
    }
}

/// 远程存储抽象接口
///
/// 路径统一使用 `/` 分隔，相对于存储根目录。
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 获取对象元数据，不存在时返回 None
    async fn stat(&self, path: &str) -> Result<Option<RemoteMeta>, RemoteError>;

    /// 创建单级目录，已存在视为成功
    async fn create_dir(&self, path: &str) -> Result<(), RemoteError>;

    /// 写入整个对象（小数据，如校验和附属文件）
    async fn put(&self, path: &str, data: Bytes) -> Result<(), RemoteError>;

    /// 单次流式上传本地文件
    async fn put_file(&self, path: &str, local: &Path, size: u64) -> Result<(), RemoteError>;

    /// 写入对象的一个字节区间（Content-Range）
    async fn put_range(
        &self,
        path: &str,
        offset: u64,
        data: Bytes,
        total_size: u64,
    ) -> Result<(), RemoteError>;

    /// 读取对象从 offset 开始的最多 length 字节，不存在时返回 None
    async fn read_range(
        &self,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<Option<Bytes>, RemoteError>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 依次创建路径上的每一级目录
pub async fn create_dir_all(store: &dyn RemoteStore, path: &str) -> Result<(), RemoteError> {
    let mut current = String::new();
    for part in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(part);
        store.create_dir(&current).await?;
    }
    Ok(())
}

/// 规范化远程路径：统一分隔符，以 `/` 开头，去掉重复斜杠
pub fn normalize_remote_path(path: &str) -> String {
    let parts: Vec<&str> = path
        .split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    format!("/{}", parts.join("/"))
}

/// 远程路径的父目录
pub fn remote_parent(path: &str) -> Option<String> {
    let normalized = normalize_remote_path(path);
    let idx = normalized.rfind('/')?;
    if idx == 0 {
        None
    } else {
        Some(normalized[..idx].to_string())
    }
}

/// 校验和附属文件路径
pub fn sidecar_path(path: &str) -> String {
    format!("{}.checksum", normalize_remote_path(path))
}

/// 根据配置创建存储实例
pub fn create_store(
    config: &crate::config::RemoteConfig,
    credentials: Option<Credentials>,
) -> anyhow::Result<Arc<dyn RemoteStore>> {
    if config.url.starts_with("http://") || config.url.starts_with("https://") {
        tracing::info!("初始化WebDAV存储: {}", config.url);
        Ok(Arc::new(WebDavStore::new(&config.url, credentials)?) as Arc<dyn RemoteStore>)
    } else {
        let path = config.url.trim_start_matches("file://");
        tracing::info!("初始化本地目录存储: {}", path);
        Ok(Arc::new(LocalStore::new(path)?) as Arc<dyn RemoteStore>)
    }
}
