//! 上传队列
//!
//! 严格先进先出，单个 worker 消费。同一路径任一时刻最多出现在
//! 排队集合或处理集合之一中，在 `admit` 时保证。

use super::cache::ChecksumCache;
use super::conflict::ConflictAction;
use super::history::UploadHistoryStore;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// 保留的已结束条目数量
const FINISHED_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueStatus {
    Queued,
    Processing,
    Complete,
    Failed,
    AwaitingDecision,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueStatus::Queued => write!(f, "queued"),
            QueueStatus::Processing => write!(f, "processing"),
            QueueStatus::Complete => write!(f, "complete"),
            QueueStatus::Failed => write!(f, "failed"),
            QueueStatus::AwaitingDecision => write!(f, "awaiting_decision"),
        }
    }
}

impl From<&str> for QueueStatus {
    fn from(s: &str) -> Self {
        match s {
            "processing" => QueueStatus::Processing,
            "complete" => QueueStatus::Complete,
            "failed" => QueueStatus::Failed,
            "awaiting_decision" => QueueStatus::AwaitingDecision,
            _ => QueueStatus::Queued,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub status: QueueStatus,
    /// 失败或跳过的原因
    pub reason: Option<String>,
    /// 外部已做出的冲突决定
    pub forced_action: Option<ConflictAction>,
    /// 做出决定时的远程内容标识
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_remote_id: Option<String>,
    pub enqueued_at: i64,
}

impl QueueItem {
    fn new(local_path: PathBuf, remote_path: String, forced_action: Option<ConflictAction>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            local_path,
            remote_path,
            status: QueueStatus::Queued,
            reason: None,
            forced_action,
            conflict_remote_id: None,
            enqueued_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// 队列状态快照
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSnapshot {
    pub queued: Vec<QueueItem>,
    pub processing: Vec<QueueItem>,
    pub finished: Vec<QueueItem>,
}

#[derive(Default)]
struct QueueInner {
    items: VecDeque<QueueItem>,
    queued: HashSet<PathBuf>,
    processing: HashMap<PathBuf, QueueItem>,
    finished: VecDeque<QueueItem>,
}

impl QueueInner {
    fn is_tracked(&self, path: &Path) -> bool {
        self.queued.contains(path) || self.processing.contains_key(path)
    }

    fn push(&mut self, item: QueueItem) {
        // 重新入队后，旧的待决定记录不再有意义
        self.finished.retain(|f| {
            !(f.local_path == item.local_path && f.status == QueueStatus::AwaitingDecision)
        });
        self.queued.insert(item.local_path.clone());
        self.items.push_back(item);
    }
}

#[derive(Default)]
pub struct TransferQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl TransferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 路径是否在排队或处理中
    pub fn is_tracked(&self, path: &Path) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.is_tracked(path))
            .unwrap_or(false)
    }

    /// 申请入队
    ///
    /// 已在排队/处理中，或上传历史显示文件未变化时返回 false。
    /// 历史比较可能需要计算摘要，期间不持有队列锁。
    pub async fn admit(
        &self,
        local_path: &Path,
        remote_path: &str,
        history: &UploadHistoryStore,
        cache: &ChecksumCache,
    ) -> bool {
        if self.is_tracked(local_path) {
            debug!("已在队列中，忽略: {}", local_path.display());
            return false;
        }
        if history.is_unchanged(local_path, remote_path, cache).await {
            debug!("文件未变化，无需上传: {}", local_path.display());
            return false;
        }
        self.push(QueueItem::new(
            local_path.to_path_buf(),
            remote_path.to_string(),
            None,
        ))
    }

    /// 带外部冲突决定入队，跳过历史比较
    pub fn admit_forced(
        &self,
        local_path: &Path,
        remote_path: &str,
        action: ConflictAction,
        remote_id: &str,
    ) -> bool {
        let mut item = QueueItem::new(local_path.to_path_buf(), remote_path.to_string(), Some(action));
        item.conflict_remote_id = Some(remote_id.to_string());
        self.push(item)
    }

    fn push(&self, item: QueueItem) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        if inner.is_tracked(&item.local_path) {
            return false;
        }
        inner.push(item);
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// 取出队首并标记为处理中
    pub fn try_next(&self) -> Option<QueueItem> {
        let mut inner = self.inner.lock().ok()?;
        let mut item = inner.items.pop_front()?;
        inner.queued.remove(&item.local_path);
        item.status = QueueStatus::Processing;
        inner.processing.insert(item.local_path.clone(), item.clone());
        Some(item)
    }

    /// 等待下一个条目
    pub async fn next(&self) -> QueueItem {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_next() {
                return item;
            }
            notified.await;
        }
    }

    /// 结束处理：移出处理集合并记录最终状态
    pub fn finish(&self, local_path: &Path, status: QueueStatus, reason: Option<String>) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let Some(mut item) = inner.processing.remove(local_path) else {
            return;
        };
        item.status = status;
        item.reason = reason;
        inner.finished.push_back(item);
        while inner.finished.len() > FINISHED_LIMIT {
            inner.finished.pop_front();
        }
    }

    /// 移出处理集合且不留下结束记录（文件将重新进入稳定性检测）
    pub fn discard(&self, local_path: &Path) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.processing.remove(local_path);
        }
    }

    /// 兜底释放：若条目仍在处理集合中（未正常结束），标记为失败
    pub fn release(&self, local_path: &Path) {
        let still_processing = self
            .inner
            .lock()
            .map(|inner| inner.processing.contains_key(local_path))
            .unwrap_or(false);
        if still_processing {
            warn!("处理意外中断，释放: {}", local_path.display());
            self.finish(
                local_path,
                QueueStatus::Failed,
                Some("处理意外中断".to_string()),
            );
        }
    }

    /// 队列与处理集合都为空
    pub fn is_idle(&self) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.items.is_empty() && inner.processing.is_empty())
            .unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let Ok(inner) = self.inner.lock() else {
            return QueueSnapshot::default();
        };
        let mut processing: Vec<QueueItem> = inner.processing.values().cloned().collect();
        processing.sort_by_key(|item| item.enqueued_at);
        QueueSnapshot {
            queued: inner.items.iter().cloned().collect(),
            processing,
            finished: inner.finished.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fixtures() -> (ChecksumCache, UploadHistoryStore) {
        (ChecksumCache::new(100, 10), UploadHistoryStore::new())
    }

    #[tokio::test]
    async fn test_second_admission_rejected_while_in_flight() {
        let (cache, history) = fixtures();
        let queue = TransferQueue::new();
        let path = Path::new("/data/a.raw");

        assert!(queue.admit(path, "/lab/a.raw", &history, &cache).await);
        assert!(!queue.admit(path, "/lab/a.raw", &history, &cache).await);

        let item = queue.try_next().unwrap();
        assert_eq!(item.status, QueueStatus::Processing);
        // 处理中同样拒绝
        assert!(!queue.admit(path, "/lab/a.raw", &history, &cache).await);
        assert!(!queue.admit_forced(path, "/lab/a.raw", ConflictAction::Skip, "bb"));

        queue.finish(path, QueueStatus::Complete, None);
        assert!(queue.admit(path, "/lab/a.raw", &history, &cache).await);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (cache, history) = fixtures();
        let queue = TransferQueue::new();
        for name in ["c", "a", "b"] {
            let path = PathBuf::from(format!("/data/{}.raw", name));
            assert!(queue.admit(&path, "/lab/x.raw", &history, &cache).await);
        }

        let order: Vec<PathBuf> = (0..3).map(|_| queue.try_next().unwrap().local_path).collect();
        assert_eq!(
            order,
            vec![
                PathBuf::from("/data/c.raw"),
                PathBuf::from("/data/a.raw"),
                PathBuf::from("/data/b.raw")
            ]
        );
        assert!(queue.try_next().is_none());
    }

    #[tokio::test]
    async fn test_unchanged_file_is_not_admitted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.raw");
        std::fs::write(&path, b"spectrum").unwrap();
        let (cache, history) = fixtures();
        let digest = cache.digest(&path).await.unwrap();
        history.record(&path, "/lab/run.raw", &digest, 8).unwrap();

        let queue = TransferQueue::new();
        assert!(!queue.admit(&path, "/lab/run.raw", &history, &cache).await);
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn test_release_after_panic() {
        let (cache, history) = fixtures();
        let queue = Arc::new(TransferQueue::new());
        let path = PathBuf::from("/data/a.raw");
        assert!(queue.admit(&path, "/lab/a.raw", &history, &cache).await);

        let item = queue.next().await;
        let worker_queue = queue.clone();
        let result = tokio::spawn(async move {
            let path = item.local_path.clone();
            scopeguard::defer! {
                worker_queue.release(&path);
            }
            panic!("boom");
        })
        .await;

        assert!(result.is_err());
        assert!(queue.is_idle());
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.finished.len(), 1);
        assert_eq!(snapshot.finished[0].status, QueueStatus::Failed);
        assert!(queue.admit(&path, "/lab/a.raw", &history, &cache).await);
    }

    #[tokio::test]
    async fn test_next_waits_for_admission() {
        let queue = Arc::new(TransferQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };

        tokio::task::yield_now().await;
        assert!(queue.admit_forced(Path::new("/data/a.raw"), "/lab/a.raw", ConflictAction::UploadOverwrite, "bb"));

        let item = waiter.await.unwrap();
        assert_eq!(item.forced_action, Some(ConflictAction::UploadOverwrite));
        assert_eq!(item.conflict_remote_id.as_deref(), Some("bb"));
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(QueueStatus::AwaitingDecision.to_string(), "awaiting_decision");
        assert_eq!(QueueStatus::from("failed"), QueueStatus::Failed);
    }
}
