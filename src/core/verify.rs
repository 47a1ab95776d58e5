//! 远程完整性校验
//!
//! 由便宜到昂贵依次检查，尽量避免下载整个文件：
//! 1. 大小（仅元数据请求）
//! 2. 内容标识：校验和附属文件，其次 ETag。长度与本地摘要一致才比较
//! 3. 兜底：读取开头一小段确认可读（可选：小文件完整哈希）

use super::cache::digest_bytes;
use crate::storage::{sidecar_path, RemoteStore};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 附属文件的最大读取长度
const SIDECAR_MAX_BYTES: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum VerifyMethod {
    Sidecar,
    Etag,
    FullHash,
    /// 只确认远程文件存在且可读，未比较内容
    Accessibility,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified {
        method: VerifyMethod,
        reason: String,
    },
    /// 内容标识长度一致但值不同，交给冲突处理
    Divergent {
        remote_id: String,
        remote_modified: Option<i64>,
    },
    Failed {
        reason: String,
    },
}

impl VerifyOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, VerifyOutcome::Verified { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VerifySettings {
    /// 兜底读取的字节数
    pub probe_bytes: u64,
    /// 不超过此大小时下载完整内容比较哈希，0 表示从不下载
    pub full_hash_max_bytes: u64,
}

pub struct IntegrityVerifier {
    store: Arc<dyn RemoteStore>,
    settings: VerifySettings,
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

enum IdentityCheck {
    Match,
    Differs(String),
    Inconclusive,
}

/// 比较一个远程内容标识；长度不同或不是十六进制视为无法比较
fn compare_identity(remote_id: &str, digest: &str) -> IdentityCheck {
    let remote_id = remote_id.trim();
    if remote_id.len() != digest.len() || !is_hex(remote_id) {
        return IdentityCheck::Inconclusive;
    }
    if remote_id.eq_ignore_ascii_case(digest) {
        IdentityCheck::Match
    } else {
        IdentityCheck::Differs(remote_id.to_lowercase())
    }
}

impl IntegrityVerifier {
    pub fn new(store: Arc<dyn RemoteStore>, settings: VerifySettings) -> Self {
        Self { store, settings }
    }

    pub async fn verify(&self, local_path: &Path, remote_path: &str, expected_digest: &str) -> VerifyOutcome {
        let local_size = match tokio::fs::metadata(local_path).await {
            Ok(m) => m.len(),
            Err(e) => {
                return VerifyOutcome::Failed {
                    reason: format!("无法读取本地文件信息: {}", e),
                }
            }
        };

        let outcome = self.verify_sized(local_size, remote_path, expected_digest).await;
        match &outcome {
            VerifyOutcome::Verified { reason, .. } => {
                info!("校验通过: {} ({})", remote_path, reason)
            }
            VerifyOutcome::Divergent { remote_id, .. } => {
                info!("远程内容不一致: {} (远程标识 {})", remote_path, remote_id)
            }
            VerifyOutcome::Failed { reason } => warn!("校验失败: {} ({})", remote_path, reason),
        }
        outcome
    }

    async fn verify_sized(&self, local_size: u64, remote_path: &str, digest: &str) -> VerifyOutcome {
        // 1. 大小
        let meta = match self.store.stat(remote_path).await {
            Ok(Some(meta)) if !meta.is_dir => meta,
            Ok(Some(_)) => {
                return VerifyOutcome::Failed {
                    reason: "远程路径是目录".to_string(),
                }
            }
            Ok(None) => {
                return VerifyOutcome::Failed {
                    reason: "远程文件不存在".to_string(),
                }
            }
            Err(e) => {
                return VerifyOutcome::Failed {
                    reason: format!("获取远程文件信息失败: {}", e),
                }
            }
        };

        if meta.size != local_size {
            return VerifyOutcome::Failed {
                reason: format!("大小不一致: 本地 {} 字节, 远程 {} 字节", local_size, meta.size),
            };
        }

        // 2. 内容标识
        let sidecar = self.read_sidecar(remote_path).await;
        let candidates = [
            (VerifyMethod::Sidecar, sidecar),
            (VerifyMethod::Etag, meta.etag.clone()),
        ];
        for (method, remote_id) in candidates {
            let Some(remote_id) = remote_id else {
                continue;
            };
            match compare_identity(&remote_id, digest) {
                IdentityCheck::Match => {
                    return VerifyOutcome::Verified {
                        method,
                        reason: match method {
                            VerifyMethod::Sidecar => "大小和校验和文件一致".to_string(),
                            _ => "大小和 ETag 一致".to_string(),
                        },
                    }
                }
                IdentityCheck::Differs(remote_id) => {
                    return VerifyOutcome::Divergent {
                        remote_id,
                        remote_modified: meta.modified_time,
                    }
                }
                IdentityCheck::Inconclusive => {
                    debug!(
                        "{:?} 标识无法与本地摘要比较 ({} vs {} 字符)，继续",
                        method,
                        remote_id.len(),
                        digest.len()
                    );
                }
            }
        }

        // 3. 兜底
        if local_size == 0 {
            return VerifyOutcome::Verified {
                method: VerifyMethod::Accessibility,
                reason: "远程空文件存在（未比较内容）".to_string(),
            };
        }

        if local_size <= self.settings.full_hash_max_bytes {
            return self.verify_full_hash(remote_path, local_size, digest, meta.modified_time).await;
        }

        let probe = self.settings.probe_bytes.clamp(1, local_size);
        match self.store.read_range(remote_path, 0, probe).await {
            Ok(Some(head)) if head.len() as u64 == probe => VerifyOutcome::Verified {
                method: VerifyMethod::Accessibility,
                reason: format!("大小一致，远程前 {} 字节可读（未比较内容）", probe),
            },
            Ok(Some(head)) => VerifyOutcome::Failed {
                reason: format!("远程文件读取不完整: 期望 {} 字节, 实际 {} 字节", probe, head.len()),
            },
            Ok(None) => VerifyOutcome::Failed {
                reason: "远程文件不存在".to_string(),
            },
            Err(e) => VerifyOutcome::Failed {
                reason: format!("远程文件不可读: {}", e),
            },
        }
    }

    async fn verify_full_hash(
        &self,
        remote_path: &str,
        size: u64,
        digest: &str,
        remote_modified: Option<i64>,
    ) -> VerifyOutcome {
        match self.store.read_range(remote_path, 0, size).await {
            Ok(Some(data)) => {
                let remote_digest = digest_bytes(&data);
                if remote_digest == digest {
                    VerifyOutcome::Verified {
                        method: VerifyMethod::FullHash,
                        reason: "远程完整内容哈希一致".to_string(),
                    }
                } else {
                    VerifyOutcome::Divergent {
                        remote_id: remote_digest,
                        remote_modified,
                    }
                }
            }
            Ok(None) => VerifyOutcome::Failed {
                reason: "远程文件不存在".to_string(),
            },
            Err(e) => VerifyOutcome::Failed {
                reason: format!("下载远程文件失败: {}", e),
            },
        }
    }

    async fn read_sidecar(&self, remote_path: &str) -> Option<String> {
        match self
            .store
            .read_range(&sidecar_path(remote_path), 0, SIDECAR_MAX_BYTES)
            .await
        {
            // 只取第一个字段，兼容 `sha256sum` 的 "<摘要>  <文件名>" 格式
            Ok(Some(data)) => String::from_utf8_lossy(&data)
                .split_whitespace()
                .next()
                .map(str::to_string),
            Ok(None) => None,
            Err(e) => {
                debug!("读取校验和文件失败 {}: {}", remote_path, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LocalStore, RemoteError, RemoteMeta};
    use async_trait::async_trait;
    use bytes::Bytes;

    const DATA: &[u8] = b"mass spectrometry run 0042";

    fn settings() -> VerifySettings {
        VerifySettings {
            probe_bytes: 8192,
            full_hash_max_bytes: 0,
        }
    }

    /// 带固定 ETag 的本地存储
    struct EtagStore {
        inner: LocalStore,
        etag: String,
    }

    #[async_trait]
    impl RemoteStore for EtagStore {
        async fn stat(&self, path: &str) -> Result<Option<RemoteMeta>, RemoteError> {
            Ok(self.inner.stat(path).await?.map(|meta| RemoteMeta {
                etag: Some(self.etag.clone()),
                ..meta
            }))
        }
        async fn create_dir(&self, path: &str) -> Result<(), RemoteError> {
            self.inner.create_dir(path).await
        }
        async fn put(&self, path: &str, data: Bytes) -> Result<(), RemoteError> {
            self.inner.put(path, data).await
        }
        async fn put_file(&self, path: &str, local: &Path, size: u64) -> Result<(), RemoteError> {
            self.inner.put_file(path, local, size).await
        }
        async fn put_range(&self, path: &str, offset: u64, data: Bytes, total: u64) -> Result<(), RemoteError> {
            self.inner.put_range(path, offset, data, total).await
        }
        async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Option<Bytes>, RemoteError> {
            self.inner.read_range(path, offset, length).await
        }
        fn name(&self) -> &str {
            "etag"
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        local: std::path::PathBuf,
        remote_root: std::path::PathBuf,
        digest: String,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("run.raw");
        std::fs::write(&local, DATA).unwrap();
        let remote_root = dir.path().join("remote");
        std::fs::create_dir_all(&remote_root).unwrap();
        std::fs::write(remote_root.join("run.raw"), DATA).unwrap();
        Fixture {
            local,
            remote_root,
            digest: digest_bytes(DATA),
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_size_mismatch_fails_without_further_checks() {
        let fx = fixture();
        std::fs::write(fx.remote_root.join("run.raw"), b"short").unwrap();
        let store = Arc::new(LocalStore::new(&fx.remote_root).unwrap());
        let verifier = IntegrityVerifier::new(store, settings());

        match verifier.verify(&fx.local, "/run.raw", &fx.digest).await {
            VerifyOutcome::Failed { reason } => assert!(reason.contains("大小不一致")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sidecar_match_verifies() {
        let fx = fixture();
        std::fs::write(fx.remote_root.join("run.raw.checksum"), format!("{}\n", fx.digest)).unwrap();
        let store = Arc::new(LocalStore::new(&fx.remote_root).unwrap());
        let verifier = IntegrityVerifier::new(store, settings());

        let outcome = verifier.verify(&fx.local, "/run.raw", &fx.digest).await;
        assert!(matches!(
            outcome,
            VerifyOutcome::Verified { method: VerifyMethod::Sidecar, .. }
        ));
    }

    #[tokio::test]
    async fn test_sidecar_from_other_uploader_verifies() {
        // 由其他工具（sha256sum）写入的附属文件，大写且带文件名
        let fx = fixture();
        std::fs::write(
            fx.remote_root.join("run.raw.checksum"),
            "240FC105A75619B3D4C5091D92B09849C16479D3A2F37DC4C77A5B661E8996E5  run.raw\n",
        )
        .unwrap();
        let store = Arc::new(LocalStore::new(&fx.remote_root).unwrap());
        let verifier = IntegrityVerifier::new(store, settings());

        assert_eq!(fx.digest, "240fc105a75619b3d4c5091d92b09849c16479d3a2f37dc4c77a5b661e8996e5");
        let outcome = verifier.verify(&fx.local, "/run.raw", &fx.digest).await;
        assert!(matches!(
            outcome,
            VerifyOutcome::Verified { method: VerifyMethod::Sidecar, .. }
        ));
    }

    #[tokio::test]
    async fn test_shorter_identifier_falls_back_to_accessibility() {
        let fx = fixture();
        let store = Arc::new(EtagStore {
            inner: LocalStore::new(&fx.remote_root).unwrap(),
            etag: "9a0364b9e99bb480dd25e1f0284c8555".into(),
        });
        let verifier = IntegrityVerifier::new(store, settings());

        match verifier.verify(&fx.local, "/run.raw", &fx.digest).await {
            VerifyOutcome::Verified { method, reason } => {
                assert_eq!(method, VerifyMethod::Accessibility);
                assert!(reason.contains("未比较内容"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_same_length_identifier_diverges() {
        let fx = fixture();
        let other = digest_bytes(b"someone else's run");
        let store = Arc::new(EtagStore {
            inner: LocalStore::new(&fx.remote_root).unwrap(),
            etag: other.clone(),
        });
        let verifier = IntegrityVerifier::new(store, settings());

        match verifier.verify(&fx.local, "/run.raw", &fx.digest).await {
            VerifyOutcome::Divergent { remote_id, remote_modified } => {
                assert_eq!(remote_id, other);
                assert!(remote_modified.is_some());
            }
            outcome => panic!("unexpected: {:?}", outcome),
        }
    }

    #[tokio::test]
    async fn test_non_hex_etag_is_inconclusive() {
        let fx = fixture();
        let store = Arc::new(EtagStore {
            inner: LocalStore::new(&fx.remote_root).unwrap(),
            etag: "x".repeat(64),
        });
        let verifier = IntegrityVerifier::new(store, settings());

        let outcome = verifier.verify(&fx.local, "/run.raw", &fx.digest).await;
        assert!(matches!(
            outcome,
            VerifyOutcome::Verified { method: VerifyMethod::Accessibility, .. }
        ));
    }

    #[tokio::test]
    async fn test_full_hash_for_small_files() {
        let fx = fixture();
        let store = Arc::new(LocalStore::new(&fx.remote_root).unwrap());
        let verifier = IntegrityVerifier::new(
            store,
            VerifySettings {
                probe_bytes: 8192,
                full_hash_max_bytes: 1024,
            },
        );

        let outcome = verifier.verify(&fx.local, "/run.raw", &fx.digest).await;
        assert!(matches!(
            outcome,
            VerifyOutcome::Verified { method: VerifyMethod::FullHash, .. }
        ));

        std::fs::write(fx.remote_root.join("run.raw"), b"mass spectrometry run 0043").unwrap();
        let outcome = verifier.verify(&fx.local, "/run.raw", &fx.digest).await;
        assert!(matches!(outcome, VerifyOutcome::Divergent { .. }));
    }

    #[tokio::test]
    async fn test_missing_remote_fails() {
        let fx = fixture();
        let store = Arc::new(LocalStore::new(&fx.remote_root).unwrap());
        let verifier = IntegrityVerifier::new(store, settings());

        let outcome = verifier.verify(&fx.local, "/nope.raw", &fx.digest).await;
        assert_eq!(
            outcome,
            VerifyOutcome::Failed {
                reason: "远程文件不存在".to_string()
            }
        );
    }
}
