//! WebDAV 认证：Basic 与 Digest（RFC 2617, qop=auth）

use md5::{Digest, Md5};
use regex::Regex;
use reqwest::{Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};

/// 认证方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    Basic,
    Digest,
}

/// 登录凭据（由外部提供，不落盘）
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub auth_type: AuthType,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("auth_type", &self.auth_type)
            .finish_non_exhaustive()
    }
}

/// 服务器下发的 Digest 质询
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub qop: Option<String>,
    pub algorithm: Option<String>,
}

impl DigestChallenge {
    /// 解析 `WWW-Authenticate: Digest ...` 头
    pub fn parse(header: &str) -> Option<Self> {
        let rest = header.trim().strip_prefix("Digest")?.trim_start();

        static PARAM_RE: OnceLock<Regex> = OnceLock::new();
        let re = PARAM_RE.get_or_init(|| {
            Regex::new(r#"([A-Za-z-]+)\s*=\s*(?:"([^"]*)"|([^,\s]*))"#).expect("valid regex")
        });

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop = None;
        let mut algorithm = None;

        for caps in re.captures_iter(rest) {
            let key = caps[1].to_lowercase();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            match key.as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "qop" => qop = Some(value),
                "algorithm" => algorithm = Some(value),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            nonce: nonce?,
            opaque,
            qop,
            algorithm,
        })
    }

    /// 服务器是否支持 qop=auth
    fn supports_auth_qop(&self) -> bool {
        self.qop
            .as_deref()
            .map(|q| q.split(',').any(|v| v.trim() == "auth"))
            .unwrap_or(false)
    }
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 计算 Digest 的 response 字段
pub fn digest_response(
    challenge: &DigestChallenge,
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    nc: u32,
    cnonce: &str,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, challenge.realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    if challenge.supports_auth_qop() {
        md5_hex(&format!(
            "{}:{}:{:08x}:{}:auth:{}",
            ha1, challenge.nonce, nc, cnonce, ha2
        ))
    } else {
        md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2))
    }
}

/// 请求认证器
///
/// Digest 模式下缓存最近一次质询，nonce 过期（401）后由调用方刷新。
pub struct Authenticator {
    credentials: Option<Credentials>,
    challenge: Mutex<Option<DigestChallenge>>,
    nonce_count: AtomicU32,
}

impl Authenticator {
    pub fn new(credentials: Option<Credentials>) -> Self {
        Self {
            credentials,
            challenge: Mutex::new(None),
            nonce_count: AtomicU32::new(0),
        }
    }

    /// 是否使用 Digest 认证
    pub fn is_digest(&self) -> bool {
        matches!(
            self.credentials.as_ref().map(|c| c.auth_type),
            Some(AuthType::Digest)
        )
    }

    /// 为请求附加认证头
    pub fn apply(&self, request: RequestBuilder, method: &Method, uri: &str) -> RequestBuilder {
        let Some(creds) = &self.credentials else {
            return request;
        };

        match creds.auth_type {
            AuthType::Basic => request.basic_auth(&creds.username, Some(&creds.password)),
            AuthType::Digest => {
                let challenge = self
                    .challenge
                    .lock()
                    .map(|guard| guard.clone())
                    .unwrap_or(None);
                match challenge {
                    Some(challenge) => {
                        let header = self.authorization(creds, &challenge, method.as_str(), uri);
                        request.header(reqwest::header::AUTHORIZATION, header)
                    }
                    // 尚未收到质询，先发送无认证请求获取 401
                    None => request,
                }
            }
        }
    }

    /// 记录服务器返回的质询，返回是否可以重试
    pub fn absorb_challenge(&self, www_authenticate: &str) -> bool {
        if !self.is_digest() {
            return false;
        }
        let Some(challenge) = DigestChallenge::parse(www_authenticate) else {
            return false;
        };
        if let Ok(mut guard) = self.challenge.lock() {
            *guard = Some(challenge);
        }
        self.nonce_count.store(0, Ordering::SeqCst);
        true
    }

    fn authorization(
        &self,
        creds: &Credentials,
        challenge: &DigestChallenge,
        method: &str,
        uri: &str,
    ) -> String {
        let nc = self.nonce_count.fetch_add(1, Ordering::SeqCst) + 1;
        let cnonce = uuid::Uuid::new_v4().simple().to_string();
        let response = digest_response(
            challenge,
            &creds.username,
            &creds.password,
            method,
            uri,
            nc,
            &cnonce,
        );

        let mut header = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}""#,
            creds.username, challenge.realm, challenge.nonce, uri, response
        );
        if challenge.supports_auth_qop() {
            header.push_str(&format!(r#", qop=auth, nc={:08x}, cnonce="{}""#, nc, cnonce));
        }
        if let Some(opaque) = &challenge.opaque {
            header.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        if let Some(algorithm) = &challenge.algorithm {
            header.push_str(&format!(", algorithm={}", algorithm));
        }
        header
    }
}
