use super::auth::{Authenticator, Credentials};
use super::{normalize_remote_path, RemoteError, RemoteMeta, RemoteStore};
use super::{IO_TIMEOUT_SECS, OP_TIMEOUT_SECS};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use regex::Regex;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE, WWW_AUTHENTICATE};
use reqwest::{Body, Client, Method, RequestBuilder, Response, StatusCode};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<propfind xmlns="DAV:">
    <prop>
        <resourcetype/>
        <getcontentlength/>
        <getlastmodified/>
        <getetag/>
    </prop>
</propfind>"#;

pub struct WebDavStore {
    client: Client,
    /// 不带结尾斜杠的服务器地址，例如 https://host/webdav
    base_url: String,
    /// base_url 中的路径部分（Digest 的 uri 字段需要）
    base_path: String,
    auth: Authenticator,
    name: String,
}

impl WebDavStore {
    pub fn new(endpoint: &str, credentials: Option<Credentials>) -> Result<Self, RemoteError> {
        let base_url = endpoint.trim_end_matches('/').to_string();
        let parsed = reqwest::Url::parse(&base_url)
            .map_err(|e| RemoteError::Protocol(format!("无效的地址 {}: {}", endpoint, e)))?;
        let base_path = parsed.path().trim_end_matches('/').to_string();

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            name: format!("webdav://{}", base_url.split("://").nth(1).unwrap_or(&base_url)),
            base_url,
            base_path,
            auth: Authenticator::new(credentials),
        })
    }

    /// 对路径的每一段做 URL 编码
    fn encode_path(path: &str) -> String {
        let normalized = normalize_remote_path(path);
        normalized
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, Self::encode_path(path))
    }

    fn uri_for(&self, path: &str) -> String {
        format!("{}{}", self.base_path, Self::encode_path(path))
    }

    /// 发送请求；Digest 模式下收到新质询时重建请求重试一次
    async fn send<F>(
        &self,
        method: Method,
        path: &str,
        timeout: Duration,
        build: F,
    ) -> Result<Response, RemoteError>
    where
        F: Fn(RequestBuilder) -> Result<RequestBuilder, RemoteError>,
    {
        let url = self.url_for(path);
        let uri = self.uri_for(path);

        for attempt in 0..2 {
            let request = self.client.request(method.clone(), &url).timeout(timeout);
            let request = build(self.auth.apply(request, &method, &uri))?;
            let response = request.send().await?;

            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }

            let digest_header = response
                .headers()
                .get_all(WWW_AUTHENTICATE)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .find(|v| v.trim_start().starts_with("Digest"))
                .map(str::to_string);

            if attempt == 0 {
                if let Some(header) = digest_header {
                    if self.auth.absorb_challenge(&header) {
                        debug!("收到 Digest 质询，重新发送 {} {}", method, path);
                        continue;
                    }
                }
            }
            return Err(RemoteError::Unauthorized(StatusCode::UNAUTHORIZED.as_u16()));
        }

        Err(RemoteError::Unauthorized(StatusCode::UNAUTHORIZED.as_u16()))
    }

    fn status_error(response: &Response, context: String) -> RemoteError {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return RemoteError::Unauthorized(status.as_u16());
        }
        RemoteError::Status {
            status: status.as_u16(),
            context: format!(
                "{} ({})",
                context,
                status.canonical_reason().unwrap_or("unknown")
            ),
        }
    }

    fn method(name: &[u8]) -> Method {
        Method::from_bytes(name).unwrap_or(Method::GET)
    }

    /// 测试连接：对根路径执行 PROPFIND
    pub async fn test_connection(&self) -> Result<RemoteMeta, RemoteError> {
        match self.stat("/").await? {
            Some(meta) => Ok(meta),
            None => Err(RemoteError::Status {
                status: 404,
                context: format!("{} 不存在", self.base_url),
            }),
        }
    }
}

/// 去掉 ETag 的 W/ 前缀和引号
pub fn clean_etag(raw: &str) -> String {
    raw.trim()
        .replace("&quot;", "\"")
        .trim_start_matches("W/")
        .trim_matches('"')
        .to_string()
}

static CONTENT_LENGTH_RE: OnceLock<Regex> = OnceLock::new();
static LAST_MODIFIED_RE: OnceLock<Regex> = OnceLock::new();
static ETAG_RE: OnceLock<Regex> = OnceLock::new();
static COLLECTION_RE: OnceLock<Regex> = OnceLock::new();

/// 匹配某个属性元素（忽略命名空间前缀）
fn prop_regex(name: &str) -> Regex {
    Regex::new(&format!(
        r"(?s)<(?:[A-Za-z0-9_]+:)?{name}(?:\s[^>]*)?>(.*?)</(?:[A-Za-z0-9_]+:)?{name}\s*>"
    ))
    .expect("valid regex")
}

/// 提取 PROPFIND 响应中某个属性的文本
fn prop_text(xml: &str, cell: &'static OnceLock<Regex>, name: &str) -> Option<String> {
    cell.get_or_init(|| prop_regex(name))
        .captures(xml)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// 解析 depth 0 的 PROPFIND 多状态响应
pub fn parse_propfind(xml: &str) -> Result<RemoteMeta, RemoteError> {
    if !xml.contains("multistatus") {
        return Err(RemoteError::Protocol("缺少 multistatus 元素".to_string()));
    }

    let size = match prop_text(xml, &CONTENT_LENGTH_RE, "getcontentlength") {
        Some(text) => text
            .parse::<u64>()
            .map_err(|e| RemoteError::Protocol(format!("getcontentlength 无效 '{}': {}", text, e)))?,
        None => 0,
    };

    let modified_time = prop_text(xml, &LAST_MODIFIED_RE, "getlastmodified")
        .and_then(|text| chrono::DateTime::parse_from_rfc2822(&text).ok())
        .map(|dt| dt.timestamp());

    let is_dir = COLLECTION_RE
        .get_or_init(|| Regex::new(r"<(?:[A-Za-z0-9_]+:)?collection\s*/?>").expect("valid regex"))
        .is_match(xml);

    let etag = prop_text(xml, &ETAG_RE, "getetag")
        .map(|raw| clean_etag(&raw))
        .filter(|s| !s.is_empty());

    Ok(RemoteMeta {
        size,
        modified_time,
        is_dir,
        etag,
    })
}

#[async_trait]
impl RemoteStore for WebDavStore {
    async fn stat(&self, path: &str) -> Result<Option<RemoteMeta>, RemoteError> {
        let response = self
            .send(
                Self::method(b"PROPFIND"),
                path,
                Duration::from_secs(OP_TIMEOUT_SECS),
                |req| {
                    Ok(req
                        .header("Depth", "0")
                        .header(CONTENT_TYPE, "application/xml")
                        .body(PROPFIND_BODY))
                },
            )
            .await?;

        match response.status() {
            StatusCode::MULTI_STATUS => {
                let xml = response.text().await?;
                parse_propfind(&xml).map(Some)
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(Self::status_error(&response, format!("PROPFIND {}", path))),
        }
    }

    async fn create_dir(&self, path: &str) -> Result<(), RemoteError> {
        let response = self
            .send(
                Self::method(b"MKCOL"),
                path,
                Duration::from_secs(OP_TIMEOUT_SECS),
                Ok,
            )
            .await?;

        match response.status().as_u16() {
            200 | 201 | 204 => {
                debug!("已创建远程目录: {}", path);
                Ok(())
            }
            // 目录已存在
            405 => Ok(()),
            _ => Err(Self::status_error(&response, format!("MKCOL {}", path))),
        }
    }

    async fn put(&self, path: &str, data: Bytes) -> Result<(), RemoteError> {
        let response = self
            .send(
                Method::PUT,
                path,
                Duration::from_secs(IO_TIMEOUT_SECS),
                |req| Ok(req.body(data.clone())),
            )
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::status_error(&response, format!("PUT {}", path)))
        }
    }

    async fn put_file(&self, path: &str, local: &Path, size: u64) -> Result<(), RemoteError> {
        let response = self
            .send(
                Method::PUT,
                path,
                Duration::from_secs(IO_TIMEOUT_SECS),
                |req| {
                    let file = std::fs::File::open(local)?;
                    let reader = tokio::fs::File::from_std(file).take(size);
                    Ok(req
                        .header(CONTENT_LENGTH, size)
                        .body(Body::wrap_stream(ReaderStream::new(reader))))
                },
            )
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::status_error(&response, format!("PUT {}", path)))
        }
    }

    async fn put_range(
        &self,
        path: &str,
        offset: u64,
        data: Bytes,
        total_size: u64,
    ) -> Result<(), RemoteError> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset + data.len() as u64 - 1;
        let range = format!("bytes {}-{}/{}", offset, end, total_size);

        let response = self
            .send(
                Method::PUT,
                path,
                Duration::from_secs(IO_TIMEOUT_SECS),
                |req| Ok(req.header(CONTENT_RANGE, range.as_str()).body(data.clone())),
            )
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::status_error(
                &response,
                format!("PUT {} [{}]", path, range),
            ))
        }
    }

    async fn read_range(
        &self,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<Option<Bytes>, RemoteError> {
        if length == 0 {
            return Ok(self.stat(path).await?.map(|_| Bytes::new()));
        }

        let range = format!("bytes={}-{}", offset, offset + length - 1);
        let mut response = self
            .send(
                Method::GET,
                path,
                Duration::from_secs(OP_TIMEOUT_SECS),
                |req| Ok(req.header(RANGE, range.as_str())),
            )
            .await?;

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => return Ok(None),
            StatusCode::RANGE_NOT_SATISFIABLE => return Ok(Some(Bytes::new())),
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => {}
            _ => return Err(Self::status_error(&response, format!("GET {}", path))),
        }

        // 服务器忽略 Range 时返回完整内容，只读取需要的部分
        let mut skip = if status == StatusCode::OK { offset } else { 0 };
        let mut buffer = BytesMut::with_capacity(length as usize);
        while let Some(chunk) = response.chunk().await? {
            let mut chunk = chunk;
            if skip > 0 {
                let n = skip.min(chunk.len() as u64) as usize;
                skip -= n as u64;
                chunk = chunk.slice(n..);
            }
            let remaining = length as usize - buffer.len();
            buffer.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
            if buffer.len() >= length as usize {
                break;
            }
        }

        Ok(Some(buffer.freeze()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/webdav/runs/sample%2001.raw</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype/>
        <d:getcontentlength>5242880</d:getcontentlength>
        <d:getlastmodified>Tue, 05 Mar 2024 10:15:30 GMT</d:getlastmodified>
        <d:getetag>W/"9a0364b9e99bb480dd25e1f0284c8555"</d:getetag>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#;

    #[test]
    fn test_parse_file_propfind() {
        let meta = parse_propfind(SAMPLE).unwrap();
        assert_eq!(meta.size, 5_242_880);
        assert!(!meta.is_dir);
        assert_eq!(meta.etag.as_deref(), Some("9a0364b9e99bb480dd25e1f0284c8555"));
        assert_eq!(meta.modified_time, Some(1_709_633_730));
    }

    #[test]
    fn test_parse_collection_propfind() {
        let xml = r#"<D:multistatus xmlns:D="DAV:"><D:response><D:href>/webdav/</D:href>
            <D:propstat><D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop>
            <D:status>HTTP/1.1 200 OK</D:status></D:propstat></D:response></D:multistatus>"#;
        let meta = parse_propfind(xml).unwrap();
        assert!(meta.is_dir);
        assert_eq!(meta.size, 0);
        assert!(meta.etag.is_none());

        assert!(parse_propfind("<html>login</html>").is_err());
    }

    #[test]
    fn test_property_patterns_compiled_once() {
        let first = parse_propfind(SAMPLE).unwrap();
        let pattern = CONTENT_LENGTH_RE.get().map(|re| re as *const Regex);
        assert!(pattern.is_some());

        // 无前缀的默认命名空间
        let xml = r#"<multistatus xmlns="DAV:"><response><propstat><prop>
            <getcontentlength>42</getcontentlength><getetag>"abc"</getetag>
            </prop></propstat></response></multistatus>"#;
        let second = parse_propfind(xml).unwrap();
        assert_eq!(CONTENT_LENGTH_RE.get().map(|re| re as *const Regex), pattern);

        assert_eq!(first.size, 5_242_880);
        assert_eq!(second.size, 42);
        assert_eq!(second.etag.as_deref(), Some("abc"));
        assert!(second.modified_time.is_none());
    }

    #[test]
    fn test_url_encoding() {
        let store = WebDavStore::new("https://example.org/webdav/", None).unwrap();
        assert_eq!(
            store.url_for("runs/sample 01.raw"),
            "https://example.org/webdav/runs/sample%2001.raw"
        );
        assert_eq!(store.uri_for("/a#b.raw"), "/webdav/a%23b.raw");
        assert_eq!(clean_etag("&quot;abc&quot;"), "abc");
    }
}
