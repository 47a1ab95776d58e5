//! 上传历史
//!
//! 只记录已通过完整性校验的上传，用于重启后跳过未变化的文件。

use super::cache::{write_json_atomic, ChecksumCache};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub digest: String,
    pub size: u64,
    /// 上传完成时间（Unix 时间戳）
    pub uploaded_at: i64,
}

pub struct UploadHistoryStore {
    records: Mutex<HashMap<PathBuf, UploadRecord>>,
    file_path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl Default for UploadHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadHistoryStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            file_path: None,
            dirty: AtomicBool::new(false),
        }
    }

    /// 从文件加载，文件不存在或损坏时从空历史开始
    pub fn load(file_path: PathBuf) -> Self {
        let mut store = Self::new();

        match std::fs::read(&file_path) {
            Ok(data) => match serde_json::from_slice::<BTreeMap<String, UploadRecord>>(&data) {
                Ok(map) => {
                    info!("加载上传历史: {} 条记录", map.len());
                    if let Ok(mut records) = store.records.lock() {
                        records.extend(map.into_values().map(|r| (r.local_path.clone(), r)));
                    }
                }
                Err(e) => {
                    // 保留损坏的文件供人工检查
                    let backup = file_path.with_extension("json.bad");
                    warn!("上传历史损坏 ({})，已移至 {}", e, backup.display());
                    let _ = std::fs::rename(&file_path, &backup);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("读取上传历史失败: {}", e),
        }

        store.file_path = Some(file_path);
        store
    }

    /// 记录一次已校验的上传并立即写盘
    pub fn record(&self, local_path: &Path, remote_path: &str, digest: &str, size: u64) -> Result<()> {
        let record = UploadRecord {
            local_path: local_path.to_path_buf(),
            remote_path: remote_path.to_string(),
            digest: digest.to_string(),
            size,
            uploaded_at: chrono::Utc::now().timestamp(),
        };
        if let Ok(mut records) = self.records.lock() {
            records.insert(record.local_path.clone(), record);
        }
        self.dirty.store(true, Ordering::SeqCst);
        self.save()
    }

    pub fn get(&self, local_path: &Path) -> Option<UploadRecord> {
        self.records.lock().ok()?.get(local_path).cloned()
    }

    pub fn remove(&self, local_path: &Path) -> Option<UploadRecord> {
        let removed = self.records.lock().ok()?.remove(local_path);
        if removed.is_some() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        removed
    }

    pub fn records(&self) -> Vec<UploadRecord> {
        let mut records: Vec<UploadRecord> = self
            .records
            .lock()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.local_path.cmp(&b.local_path));
        records
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 文件自上次成功上传到同一目标后是否未变化（先比大小，再比摘要）
    pub async fn is_unchanged(&self, local_path: &Path, remote_path: &str, cache: &ChecksumCache) -> bool {
        let Some(record) = self.get(local_path) else {
            return false;
        };
        if record.remote_path != remote_path {
            return false;
        }

        let size = match tokio::fs::metadata(local_path).await {
            Ok(m) => m.len(),
            Err(_) => return false,
        };
        if size != record.size {
            return false;
        }

        match cache.digest(local_path).await {
            Ok(digest) => digest == record.digest,
            Err(e) => {
                // 读取失败交给上传流程处理
                debug!("比较上传历史时无法计算摘要: {}", e);
                false
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        let Some(file_path) = &self.file_path else {
            self.dirty.store(false, Ordering::SeqCst);
            return Ok(());
        };

        let snapshot: BTreeMap<String, UploadRecord> = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("上传历史锁已损坏"))?
            .values()
            .map(|r| (r.local_path.display().to_string(), r.clone()))
            .collect();
        self.dirty.store(false, Ordering::SeqCst);

        if let Err(e) = write_json_atomic(file_path, &snapshot) {
            // 下次定期保存时重试
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        debug!("已保存上传历史: {} 条记录", snapshot.len());
        Ok(())
    }

    pub fn save_if_dirty(&self) -> Result<()> {
        if self.dirty.load(Ordering::SeqCst) {
            self.save()?;
        }
        Ok(())
    }
}
