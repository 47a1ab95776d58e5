//! 校验和缓存
//!
//! 以 `路径|大小|修改时间` 为键缓存文件内容摘要，避免每次重启都重新哈希
//! 数 GB 的仪器文件。文件一旦变化键就不同，旧条目不会被修改，只会在容量
//! 超限时按插入顺序批量淘汰。

use super::error::FileAccessError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fs::Metadata;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// 哈希时每次读取的块大小
const HASH_BLOCK_SIZE: usize = 256 * 1024;
const CACHE_FILE_VERSION: u32 = 1;

/// 持久化格式
#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    /// 保存时间（Unix 时间戳）
    saved_at: u64,
    /// 按插入顺序排列
    entries: Vec<CacheFileEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFileEntry {
    key: String,
    digest: String,
}

#[derive(Default)]
struct CacheInner {
    map: HashMap<String, String>,
    order: VecDeque<String>,
    dirty: bool,
}

/// 内容摘要缓存
pub struct ChecksumCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    evict_batch: usize,
    /// 持久化文件路径，None 表示仅内存
    file_path: Option<PathBuf>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// 文件修改时间（秒）
pub fn mtime_secs(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// 缓存键
pub fn cache_key(path: &Path, size: u64, mtime: i64) -> String {
    format!("{}|{}|{}", path.display(), size, mtime)
}

/// 内存数据的 SHA-256 摘要（64 位十六进制）
pub fn digest_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// 流式计算文件的 SHA-256 摘要，与 `.checksum` 附属文件格式一致
pub fn hash_file(path: &Path) -> Result<String, FileAccessError> {
    let mut file = std::fs::File::open(path).map_err(|e| FileAccessError::from_io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BLOCK_SIZE];
    loop {
        let n = file
            .read(&mut buffer)
            .map_err(|e| FileAccessError::from_io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// 格式化时间间隔
pub fn format_age(age_seconds: u64) -> String {
    if age_seconds < 60 {
        format!("{}秒前", age_seconds)
    } else if age_seconds < 3600 {
        format!("{}分钟前", age_seconds / 60)
    } else if age_seconds < 86400 {
        format!("{}小时前", age_seconds / 3600)
    } else {
        format!("{}天前", age_seconds / 86400)
    }
}

impl ChecksumCache {
    /// 创建仅内存缓存
    pub fn new(capacity: usize, evict_batch: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            capacity: capacity.max(1),
            evict_batch: evict_batch.clamp(1, capacity.max(1)),
            file_path: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// 创建带持久化的缓存，并尝试从文件加载
    ///
    /// 文件损坏时删除并从空缓存开始。
    pub fn load(file_path: PathBuf, capacity: usize, evict_batch: usize) -> Self {
        let mut cache = Self::new(capacity, evict_batch);

        match std::fs::read(&file_path) {
            Ok(data) => match serde_json::from_slice::<CacheFile>(&data) {
                Ok(file) if file.version == CACHE_FILE_VERSION => {
                    let count = file.entries.len();
                    for entry in file.entries {
                        cache.insert(entry.key, entry.digest);
                    }
                    if let Ok(mut inner) = cache.inner.lock() {
                        inner.dirty = false;
                    }
                    info!(
                        "从缓存加载 {} 个校验和 (保存于 {})",
                        count,
                        format_age(now().saturating_sub(file.saved_at))
                    );
                }
                Ok(file) => {
                    warn!("校验和缓存版本不匹配 ({})，忽略", file.version);
                }
                Err(e) => {
                    warn!("校验和缓存损坏，清除: {}", e);
                    let _ = std::fs::remove_file(&file_path);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("读取校验和缓存失败: {}", e),
        }

        cache.file_path = Some(file_path);
        cache
    }

    /// 获取文件摘要，命中缓存时不读取文件内容
    ///
    /// 读取失败（包括文件被占用）不会写入缓存，错误原样返回给调用方。
    pub async fn digest(&self, path: &Path) -> Result<String, FileAccessError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| FileAccessError::from_io(path, e))?;
        let size = metadata.len();
        let mtime = mtime_secs(&metadata);
        let key = cache_key(path, size, mtime);

        if let Some(digest) = self.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(digest);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let owned = path.to_path_buf();
        let digest = tokio::task::spawn_blocking(move || hash_file(&owned))
            .await
            .map_err(|e| FileAccessError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::other(e.to_string()),
            })??;

        // 哈希期间文件仍在变化则不缓存
        match tokio::fs::metadata(path).await {
            Ok(after) if after.len() == size && mtime_secs(&after) == mtime => {
                self.insert(key, digest.clone());
            }
            _ => debug!("文件在哈希期间发生变化，不缓存: {}", path.display()),
        }

        Ok(digest)
    }

    /// 仅查询缓存，不计算
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().ok()?.map.get(key).cloned()
    }

    /// 写入条目，超出容量时淘汰最早插入的一批
    pub fn insert(&self, key: String, digest: String) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };

        if let Some(existing) = inner.map.get_mut(&key) {
            *existing = digest;
            inner.dirty = true;
            return;
        }

        inner.map.insert(key.clone(), digest);
        inner.order.push_back(key);
        inner.dirty = true;

        if inner.map.len() > self.capacity {
            // 最新条目永远不在淘汰范围内
            let batch = self.evict_batch.min(inner.order.len() - 1);
            for _ in 0..batch {
                if let Some(old) = inner.order.pop_front() {
                    inner.map.remove(&old);
                }
            }
            debug!("校验和缓存超出容量，淘汰 {} 个最早条目", batch);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (命中次数, 未命中次数)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    /// 写入持久化文件（先写临时文件再重命名）
    pub fn save(&self) -> Result<()> {
        let Some(file_path) = &self.file_path else {
            return Ok(());
        };

        let snapshot = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| anyhow::anyhow!("校验和缓存锁已损坏"))?;
            inner.dirty = false;
            CacheFile {
                version: CACHE_FILE_VERSION,
                saved_at: now(),
                entries: inner
                    .order
                    .iter()
                    .filter_map(|key| {
                        inner.map.get(key).map(|digest| CacheFileEntry {
                            key: key.clone(),
                            digest: digest.clone(),
                        })
                    })
                    .collect(),
            }
        };

        if let Err(e) = write_json_atomic(file_path, &snapshot) {
            if let Ok(mut inner) = self.inner.lock() {
                inner.dirty = true;
            }
            return Err(e);
        }
        debug!("已保存 {} 个校验和到 {}", snapshot.entries.len(), file_path.display());
        Ok(())
    }

    /// 有改动时才写盘
    pub fn save_if_dirty(&self) -> Result<()> {
        let dirty = self.inner.lock().map(|inner| inner.dirty).unwrap_or(false);
        if dirty {
            self.save()?;
        }
        Ok(())
    }
}

/// 先写 `.tmp` 再重命名，避免中途失败留下半个文件
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("创建目录失败: {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, data).with_context(|| format!("写入失败: {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("重命名失败: {}", path.display()))?;
    Ok(())
}
