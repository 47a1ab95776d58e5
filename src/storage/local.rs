use super::{normalize_remote_path, RemoteError, RemoteMeta, RemoteStore};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// 以本地目录作为远程存储（挂载的网络共享、测试）
pub struct LocalStore {
    base_path: PathBuf,
    name: String,
}

impl LocalStore {
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let name = format!("local:{}", base_path.display());
        Ok(Self { base_path, name })
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let normalized = normalize_remote_path(path);
        let relative = normalized.trim_start_matches('/');
        if relative.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(relative)
        }
    }

    async fn ensure_parent(full_path: &Path) -> Result<(), RemoteError> {
        if let Some(parent) = full_path.parent() {
            if !fs::try_exists(parent).await? {
                return Err(RemoteError::Status {
                    status: 409,
                    context: format!("父目录不存在: {}", parent.display()),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for LocalStore {
    async fn stat(&self, path: &str) -> Result<Option<RemoteMeta>, RemoteError> {
        match fs::metadata(self.resolve_path(path)).await {
            Ok(metadata) => {
                let modified = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64);

                Ok(Some(RemoteMeta {
                    size: if metadata.is_dir() { 0 } else { metadata.len() },
                    modified_time: modified,
                    is_dir: metadata.is_dir(),
                    etag: None,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_dir(&self, path: &str) -> Result<(), RemoteError> {
        let full_path = self.resolve_path(path);
        if fs::try_exists(&full_path).await? {
            return Ok(());
        }
        Self::ensure_parent(&full_path).await?;
        match fs::create_dir(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, path: &str, data: Bytes) -> Result<(), RemoteError> {
        let full_path = self.resolve_path(path);
        Self::ensure_parent(&full_path).await?;
        fs::write(&full_path, &data).await?;
        Ok(())
    }

    async fn put_file(&self, path: &str, local: &Path, size: u64) -> Result<(), RemoteError> {
        let full_path = self.resolve_path(path);
        Self::ensure_parent(&full_path).await?;

        let mut source = fs::File::open(local).await?;
        let mut target = fs::File::create(&full_path).await?;
        let copied = tokio::io::copy(&mut (&mut source).take(size), &mut target).await?;
        target.flush().await?;

        if copied != size {
            return Err(RemoteError::Protocol(format!(
                "写入长度不一致: 期望 {} 字节, 实际 {} 字节",
                size, copied
            )));
        }
        Ok(())
    }

    async fn put_range(
        &self,
        path: &str,
        offset: u64,
        data: Bytes,
        total_size: u64,
    ) -> Result<(), RemoteError> {
        let full_path = self.resolve_path(path);
        Self::ensure_parent(&full_path).await?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(offset == 0)
            .open(&full_path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
        if offset + data.len() as u64 >= total_size {
            file.set_len(total_size).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn read_range(
        &self,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<Option<Bytes>, RemoteError> {
        let full_path = self.resolve_path(path);
        let mut file = match fs::File::open(&full_path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        file.seek(SeekFrom::Start(offset)).await?;
        let mut buffer = Vec::new();
        file.take(length).read_to_end(&mut buffer).await?;
        Ok(Some(Bytes::from(buffer)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::create_dir_all;

    #[tokio::test]
    async fn test_ranged_writes_assemble_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();

        create_dir_all(&store, "/runs/2024").await.unwrap();
        // 重复创建不报错
        create_dir_all(&store, "/runs/2024").await.unwrap();

        store
            .put_range("/runs/2024/a.raw", 0, Bytes::from_static(b"hello "), 11)
            .await
            .unwrap();
        store
            .put_range("/runs/2024/a.raw", 6, Bytes::from_static(b"world"), 11)
            .await
            .unwrap();

        let meta = store.stat("/runs/2024/a.raw").await.unwrap().unwrap();
        assert_eq!(meta.size, 11);
        assert!(!meta.is_dir);

        let head = store.read_range("/runs/2024/a.raw", 0, 5).await.unwrap();
        assert_eq!(head.as_deref(), Some(&b"hello"[..]));
        assert!(store.read_range("/missing", 0, 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_without_parent_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();

        let err = store
            .put("/no/such/dir/a.raw", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Status { status: 409, .. }));
    }
}
