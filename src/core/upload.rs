//! 自适应分块上传
//!
//! 小文件单次流式 PUT；超过阈值的文件按大小分档选择块大小，
//! 逐块发送带 `Content-Range` 的 PUT，块之间顺序执行，失败只重试当前块。

use super::error::TransferError;
use crate::config::ChunkTier;
use crate::storage::{create_dir_all, remote_parent, sidecar_path, RemoteError, RemoteStore};
use bytes::{Bytes, BytesMut};
use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 未配置分档时的块大小
const FALLBACK_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// 按文件大小选择块大小（第一个 `up_to >= size` 的档位）
pub fn chunk_size_for(size: u64, tiers: &[ChunkTier]) -> u64 {
    tiers
        .iter()
        .find(|tier| tier.up_to.map_or(true, |limit| size <= limit))
        .or_else(|| tiers.last())
        .map(|tier| tier.chunk_size.max(1))
        .unwrap_or(FALLBACK_CHUNK_SIZE)
}

/// 进度节流：按固定百分比步长上报，完成时必报一次
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    step_percent: u64,
    next_percent: u64,
    done: bool,
}

impl ProgressThrottle {
    pub fn new(step_percent: u8) -> Self {
        let step = u64::from(step_percent.clamp(1, 100));
        Self {
            step_percent: step,
            next_percent: step,
            done: false,
        }
    }

    /// 返回本次是否需要上报
    pub fn update(&mut self, bytes: u64, total: u64) -> bool {
        if self.done {
            return false;
        }
        if bytes >= total {
            self.done = true;
            return true;
        }
        let percent = bytes.saturating_mul(100) / total;
        if percent >= self.next_percent {
            self.next_percent = (percent / self.step_percent + 1) * self.step_percent;
            return true;
        }
        false
    }
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub chunk_tiers: Vec<ChunkTier>,
    /// 达到此大小的文件使用分块上传
    pub range_threshold: u64,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub progress_step_percent: u8,
}

/// 已打开的本地文件
pub struct UploadSource {
    pub path: PathBuf,
    pub file: tokio::fs::File,
    pub size: u64,
}

/// 单次退避等待的上限
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// 第 `attempt` 次重试前的等待时间，按指数增长并封顶
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    2_u32
        .checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(MAX_BACKOFF, |delay| delay.min(MAX_BACKOFF))
}

pub struct UploadEngine {
    store: Arc<dyn RemoteStore>,
    settings: UploadSettings,
    /// 本次运行中已确认存在的远程目录
    created_dirs: Mutex<HashSet<String>>,
    cancel: CancellationToken,
}

impl UploadEngine {
    pub fn new(store: Arc<dyn RemoteStore>, settings: UploadSettings) -> Self {
        Self {
            store,
            settings,
            created_dirs: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// 上传文件，返回发送的字节数
    ///
    /// `progress(bytes, total)` 按节流频率调用。
    pub async fn upload<P>(
        &self,
        source: UploadSource,
        remote_path: &str,
        mut progress: P,
    ) -> Result<u64, TransferError>
    where
        P: FnMut(u64, u64) + Send,
    {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        self.ensure_parent_dirs(remote_path).await?;

        let UploadSource { path, file, size } = source;
        let mut throttle = ProgressThrottle::new(self.settings.progress_step_percent);

        if size < self.settings.range_threshold || size == 0 {
            debug!("单次上传: {} -> {} ({} 字节)", path.display(), remote_path, size);
            drop(file);
            self.with_retry(0, || self.store.put_file(remote_path, &path, size))
                .await?;
            if throttle.update(size, size) {
                progress(size, size);
            }
            return Ok(size);
        }

        let chunk_size = chunk_size_for(size, &self.settings.chunk_tiers);
        info!(
            "分块上传: {} -> {} ({} 字节, 块大小 {})",
            path.display(),
            remote_path,
            size,
            chunk_size
        );

        let mut file = file;
        let mut offset = 0u64;
        while offset < size {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let want = chunk_size.min(size - offset) as usize;
            let chunk = read_chunk(&mut file, want)
                .await
                .map_err(|e| TransferError::File(super::error::FileAccessError::from_io(&path, e)))?;
            if chunk.len() < want {
                // 文件在上传过程中被截断
                return Err(TransferError::FileChanged);
            }

            let len = chunk.len() as u64;
            self.with_retry(offset, || {
                self.store.put_range(remote_path, offset, chunk.clone(), size)
            })
            .await?;

            offset += len;
            if throttle.update(offset, size) {
                progress(offset, size);
            }
        }

        Ok(size)
    }

    /// 写入校验和附属文件，失败只记录警告
    pub async fn write_sidecar(&self, remote_path: &str, digest: &str) -> bool {
        let path = sidecar_path(remote_path);
        match self
            .with_retry(0, || self.store.put(&path, Bytes::from(digest.to_string())))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("写入校验和文件失败 {}: {}", path, e);
                false
            }
        }
    }

    /// 按需创建远程父目录，每个目录每次运行只创建一次
    async fn ensure_parent_dirs(&self, remote_path: &str) -> Result<(), TransferError> {
        let Some(parent) = remote_parent(remote_path) else {
            return Ok(());
        };

        let known = self
            .created_dirs
            .lock()
            .map(|dirs| dirs.contains(&parent))
            .unwrap_or(false);
        if known {
            return Ok(());
        }

        self.with_retry(0, || create_dir_all(self.store.as_ref(), &parent))
            .await?;

        if let Ok(mut dirs) = self.created_dirs.lock() {
            let mut current = parent.as_str();
            loop {
                dirs.insert(current.to_string());
                match current.rfind('/') {
                    Some(idx) if idx > 0 => current = &current[..idx],
                    _ => break,
                }
            }
        }
        debug!("远程目录已就绪: {}", parent);
        Ok(())
    }

    /// 瞬时错误按指数退避重试
    async fn with_retry<F, Fut>(&self, offset: u64, mut op: F) -> Result<(), TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), RemoteError>>,
    {
        let max_retries = self.settings.max_retries;
        let base_delay = self.settings.retry_base_delay;

        for attempt in 0..=max_retries {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let err = match op().await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_transient() => return Err(TransferError::Remote(e)),
                Err(e) => e,
            };

            if attempt < max_retries {
                let delay = backoff_delay(base_delay, attempt);
                warn!(
                    "偏移 {} 处上传失败，{}ms 后重试 ({}/{}): {}",
                    offset,
                    delay.as_millis(),
                    attempt + 1,
                    max_retries,
                    err
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                error!("偏移 {} 处上传最终失败 (已重试{}次): {}", offset, max_retries, err);
                return Err(TransferError::RetriesExhausted {
                    offset,
                    attempts: attempt + 1,
                    source: err,
                });
            }
        }

        Err(TransferError::Cancelled)
    }
}

/// 读取最多 `want` 字节，遇到文件末尾提前返回
async fn read_chunk(file: &mut tokio::fs::File, want: usize) -> std::io::Result<Bytes> {
    let mut buffer = BytesMut::zeroed(want);
    let mut filled = 0;
    while filled < want {
        let n = file.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buffer.truncate(filled);
    Ok(buffer.freeze())
}
