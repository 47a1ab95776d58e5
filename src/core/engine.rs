//! 上传流水线
//!
//! 监控 → 稳定性检测 → 队列 → 单 worker 处理（摘要、预检查、上传、校验）。
//! 监控和稳定性检测在独立任务中运行，不受上传耗时影响。

use super::cache::{mtime_secs, ChecksumCache};
use super::conflict::{ConflictAction, ConflictResolver, PendingConflict, SettledConflict};
use super::error::{FileAccessError, TransferError};
use super::events::{self, emit, EventSender, PipelineEvent};
use super::history::{UploadHistoryStore, UploadRecord};
use super::lock_retry::{AccessFailure, LockedAccessRetrier};
use super::queue::{QueueItem, QueueSnapshot, QueueStatus, TransferQueue};
use super::stability::{file_size, StabilityTracker};
use super::upload::{UploadEngine, UploadSource};
use super::verify::{IntegrityVerifier, VerifyOutcome};
use super::watcher::{remote_path_for, scan_tree, DirectoryWatcher, WatchFilter};
use crate::config::PipelineConfig;
use crate::storage::{RemoteError, RemoteStore};
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 停止时等待后台任务退出的最长时间
const SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// 一个条目的处理结果
#[derive(Debug)]
enum Disposition {
    /// 远程已校验一致并写入历史
    Done { reason: String },
    Skipped { reason: String },
    Failed { reason: String },
    /// 等待外部冲突决定
    Parked,
    /// 重新进入稳定性检测
    Requeued { reason: String },
}

/// 处理开始时的本地文件状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileSnapshot {
    size: u64,
    mtime: i64,
}

impl FileSnapshot {
    async fn read(path: &Path) -> Result<Self, FileAccessError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| FileAccessError::from_io(path, e))?;
        Ok(Self {
            size: metadata.len(),
            mtime: mtime_secs(&metadata),
        })
    }

    async fn changed(&self, path: &Path) -> bool {
        Self::read(path).await.map(|now| now != *self).unwrap_or(true)
    }
}

/// 本地文件的只读访问
///
/// 仪器独占文件时 `open` 返回 PermissionDenied 或共享冲突，由锁重试状态机处理。
#[async_trait]
pub trait LocalFiles: Send + Sync {
    async fn open(&self, path: &Path) -> std::io::Result<tokio::fs::File>;
}

/// 直接访问文件系统
pub struct OsFiles;

#[async_trait]
impl LocalFiles for OsFiles {
    async fn open(&self, path: &Path) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(path).await
    }
}

/// 历史记录远程复核结果
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub checked: usize,
    pub verified: usize,
    /// 远程缺失或不一致、已重新排入上传的文件
    pub requeued: Vec<PathBuf>,
    /// 本地文件已不存在，跳过
    pub missing_local: usize,
}

struct PipelineInner {
    config: PipelineConfig,
    watch_root: PathBuf,
    store: Arc<dyn RemoteStore>,
    files: Arc<dyn LocalFiles>,
    cache: ChecksumCache,
    history: UploadHistoryStore,
    queue: TransferQueue,
    retrier: LockedAccessRetrier,
    uploader: UploadEngine,
    verifier: IntegrityVerifier,
    resolver: ConflictResolver,
    events: EventSender,
    candidates: mpsc::UnboundedSender<PathBuf>,
    cancel: CancellationToken,
}

/// 上传流水线
pub struct Pipeline {
    inner: Arc<PipelineInner>,
    candidates_rx: Mutex<Option<mpsc::UnboundedReceiver<PathBuf>>>,
    watcher: Mutex<Option<DirectoryWatcher>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// 创建流水线
    ///
    /// `state_dir` 为 None 时校验和缓存和上传历史只保存在内存中。
    pub fn new(config: PipelineConfig, store: Arc<dyn RemoteStore>, state_dir: Option<&Path>) -> Self {
        Self::with_local_files(config, store, Arc::new(OsFiles), state_dir)
    }

    /// 使用指定的本地文件访问方式创建流水线
    pub fn with_local_files(
        config: PipelineConfig,
        store: Arc<dyn RemoteStore>,
        files: Arc<dyn LocalFiles>,
        state_dir: Option<&Path>,
    ) -> Self {
        let (cache, history) = match state_dir {
            Some(dir) => (
                ChecksumCache::load(
                    dir.join("cache").join("checksums.json"),
                    config.cache_capacity,
                    config.cache_evict_batch,
                ),
                UploadHistoryStore::load(dir.join("upload_history.json")),
            ),
            None => (
                ChecksumCache::new(config.cache_capacity, config.cache_evict_batch),
                UploadHistoryStore::new(),
            ),
        };

        // 统一使用规范路径，避免符号链接导致同一文件出现两个路径
        let watch_root = std::fs::canonicalize(&config.watch_dir).unwrap_or_else(|_| config.watch_dir.clone());

        let events = events::channel();
        let cancel = CancellationToken::new();
        let (candidates, candidates_rx) = mpsc::unbounded_channel();

        let retrier = LockedAccessRetrier::new(config.lock_settings())
            .with_events(events.clone())
            .with_cancellation(cancel.clone());
        let uploader = UploadEngine::new(store.clone(), config.upload_settings()).with_cancellation(cancel.clone());
        let verifier = IntegrityVerifier::new(store.clone(), config.verify_settings());
        let resolver = ConflictResolver::new(config.conflict_policy);

        let inner = PipelineInner {
            config,
            watch_root,
            store,
            files,
            cache,
            history,
            queue: TransferQueue::new(),
            retrier,
            uploader,
            verifier,
            resolver,
            events,
            candidates,
            cancel,
        };

        Self {
            inner: Arc::new(inner),
            candidates_rx: Mutex::new(Some(candidates_rx)),
            watcher: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// 启动监控和后台任务
    pub async fn start(&self) -> Result<()> {
        let Some(rx) = self.candidates_rx.lock().ok().and_then(|mut guard| guard.take()) else {
            bail!("流水线已启动");
        };

        let inner = &self.inner;
        let config = &inner.config;
        let filter = WatchFilter::new(&config.extensions);

        let watcher = DirectoryWatcher::start(
            &inner.watch_root,
            config.recursive,
            filter.clone(),
            config.rescan_interval(),
            inner.candidates.clone(),
            inner.cancel.clone(),
        )?;
        if let Ok(mut guard) = self.watcher.lock() {
            *guard = Some(watcher);
        }

        self.track([
            tokio::spawn(inner.clone().stability_loop(rx)),
            tokio::spawn(inner.clone().worker_loop()),
            tokio::spawn(inner.clone().persist_loop()),
        ]);

        if config.scan_existing_on_start {
            let (root, recursive) = (inner.watch_root.clone(), config.recursive);
            let paths = tokio::task::spawn_blocking(move || scan_tree(&root, recursive, &filter)).await?;
            info!("启动扫描发现 {} 个文件", paths.len());
            for path in paths {
                let _ = inner.candidates.send(path);
            }
        }

        if config.verify_history_on_start {
            let inner = inner.clone();
            self.track([tokio::spawn(async move {
                let report = inner.check_remote_integrity().await;
                info!(
                    "启动复核完成: 检查 {} 个, 一致 {} 个, 重新上传 {} 个",
                    report.checked,
                    report.verified,
                    report.requeued.len()
                );
            })]);
        }

        info!(
            "流水线已启动: {} → {}{}",
            inner.watch_root.display(),
            inner.store.name(),
            config.remote.base_path
        );
        Ok(())
    }

    fn track(&self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        if let Ok(mut guard) = self.tasks.lock() {
            guard.extend(handles);
        }
    }

    /// 停止流水线：取消进行中的等待和上传，保存缓存与历史
    pub async fn stop(&self) {
        info!("正在停止流水线...");
        self.inner.cancel.cancel();

        if let Some(watcher) = self.watcher.lock().ok().and_then(|mut guard| guard.take()) {
            watcher.stop();
        }

        let tasks = self
            .tasks
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default();
        let joined = tokio::time::timeout(
            Duration::from_secs(SHUTDOWN_TIMEOUT_SECS),
            futures::future::join_all(tasks),
        )
        .await;
        if joined.is_err() {
            warn!("后台任务未能在 {} 秒内退出", SHUTDOWN_TIMEOUT_SECS);
        }

        self.inner.flush();
        info!("流水线已停止");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    /// 直接申请上传一个文件（跳过稳定性检测，忽略之前记住的冲突处理结果）
    pub async fn enqueue(&self, path: &Path) -> bool {
        self.inner.resolver.forget(path);
        self.inner.admit(path).await
    }

    /// 外部对冲突做出决定；`apply_to_all` 时同时处理所有待决定的冲突，
    /// 并在队列清空前对新冲突沿用该决定
    pub fn resolve_conflict(&self, path: &Path, action: ConflictAction, apply_to_all: bool) -> bool {
        let inner = &self.inner;
        if action == ConflictAction::DeferToExternal {
            return false;
        }
        let Some(conflict) = inner.resolver.take_pending(path) else {
            warn!("没有待决定的冲突: {}", path.display());
            return false;
        };
        info!("冲突决定: {} → {}", path.display(), action);
        inner.requeue_with(&conflict, action);

        if apply_to_all {
            inner.resolver.set_batch_override(action);
            for conflict in inner.resolver.take_all_pending() {
                inner.requeue_with(&conflict, action);
            }
        }
        true
    }

    pub fn pending_conflicts(&self) -> Vec<PendingConflict> {
        self.inner.resolver.pending()
    }

    /// 复核历史记录对应的远程文件
    pub async fn check_remote_integrity(&self) -> IntegrityReport {
        self.inner.check_remote_integrity().await
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.inner.queue.snapshot()
    }

    pub fn history(&self) -> Vec<UploadRecord> {
        self.inner.history.records()
    }

    /// (命中次数, 未命中次数)
    pub fn cache_stats(&self) -> (u64, u64) {
        self.inner.cache.stats()
    }
}

impl PipelineInner {
    fn remote_path(&self, path: &Path) -> String {
        remote_path_for(
            path,
            &self.watch_root,
            &self.config.remote.base_path,
            self.config.remote.preserve_structure,
        )
    }

    async fn admit(&self, path: &Path) -> bool {
        let parked = self.resolver.pending().into_iter().find(|c| c.local_path.as_path() == path);
        if let Some(conflict) = parked {
            let mtime = std::fs::metadata(path).map(|m| mtime_secs(&m)).ok();
            if mtime == conflict.local_modified {
                debug!("等待冲突决定，忽略: {}", path.display());
                return false;
            }
            // 文件再次变化，之前的冲突已失效
            self.resolver.take_pending(path);
            info!("待决定的文件已变化，重新处理: {}", path.display());
        }

        if let Ok(snapshot) = FileSnapshot::read(path).await {
            if let Some(action) = self.resolver.settled(path, snapshot.size, snapshot.mtime) {
                debug!("冲突已按 {} 处理且文件未变化，忽略: {}", action, path.display());
                return false;
            }
        }

        let remote_path = self.remote_path(path);
        if !self.queue.admit(path, &remote_path, &self.history, &self.cache).await {
            return false;
        }
        info!("加入上传队列: {} → {}", path.display(), remote_path);
        emit(
            &self.events,
            PipelineEvent::Queued {
                path: path.to_path_buf(),
                remote_path,
            },
        );
        true
    }

    fn requeue_with(&self, conflict: &PendingConflict, action: ConflictAction) {
        if self
            .queue
            .admit_forced(&conflict.local_path, &conflict.remote_path, action, &conflict.remote_id)
        {
            emit(
                &self.events,
                PipelineEvent::Queued {
                    path: conflict.local_path.clone(),
                    remote_path: conflict.remote_path.clone(),
                },
            );
        }
    }

    /// 重新送入稳定性检测
    fn reinject(&self, path: &Path, reason: String) {
        info!("重新检测: {} ({})", path.display(), reason);
        emit(
            &self.events,
            PipelineEvent::Requeued {
                path: path.to_path_buf(),
                reason,
            },
        );
        let _ = self.candidates.send(path.to_path_buf());
    }

    async fn stability_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<PathBuf>) {
        let mut tracker = StabilityTracker::new(self.config.stability_window());
        let mut ticker = tokio::time::interval(self.config.stability_tick());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = rx.recv() => {
                    let Some(path) = received else { break };
                    match file_size(&path) {
                        Ok(size) => {
                            if !tracker.contains(&path) {
                                debug!("发现文件: {}", path.display());
                                emit(&self.events, PipelineEvent::Detected { path: path.clone() });
                            }
                            tracker.observe(path, size, Instant::now());
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => debug!("无法获取文件大小 {}: {}", path.display(), e),
                    }
                }
                _ = ticker.tick() => {
                    for path in tracker.tick(Instant::now(), file_size) {
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        self.admit(&path).await;
                    }
                }
            }
        }
        debug!("稳定性检测已退出 (剩余 {} 个未稳定文件)", tracker.len());
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => break,
                item = self.queue.next() => item,
            };
            let path = item.local_path.clone();

            let task = {
                let inner = self.clone();
                tokio::spawn(async move {
                    let guard_inner = inner.clone();
                    let guard_path = item.local_path.clone();
                    scopeguard::defer! {
                        guard_inner.queue.release(&guard_path);
                    }
                    let disposition = inner.process(&item).await;
                    inner.finish(&item, disposition);
                })
            };

            if let Err(e) = task.await {
                error!("处理 {} 时发生内部错误: {}", path.display(), e);
                emit(
                    &self.events,
                    PipelineEvent::Failed {
                        path,
                        reason: format!("内部错误: {}", e),
                    },
                );
            }

            if self.queue.is_idle() {
                self.resolver.clear_batch_override();
            }
        }
        debug!("上传 worker 已退出");
    }

    async fn persist_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.persist_interval());
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.flush(),
            }
        }
    }

    fn flush(&self) {
        if let Err(e) = self.cache.save_if_dirty() {
            warn!("保存校验和缓存失败: {}", e);
        }
        if let Err(e) = self.history.save_if_dirty() {
            warn!("保存上传历史失败: {}", e);
        }
    }

    fn finish(&self, item: &QueueItem, disposition: Disposition) {
        let path = item.local_path.clone();
        match disposition {
            Disposition::Done { reason } => {
                info!("完成: {} ({})", path.display(), reason);
                self.queue.finish(&path, QueueStatus::Complete, Some(reason.clone()));
                emit(&self.events, PipelineEvent::Verified { path, reason });
            }
            Disposition::Skipped { reason } => {
                info!("跳过: {} ({})", path.display(), reason);
                self.queue.finish(&path, QueueStatus::Complete, Some(reason.clone()));
                emit(&self.events, PipelineEvent::Skipped { path, reason });
            }
            Disposition::Failed { reason } => {
                error!("失败: {} ({})", path.display(), reason);
                self.queue.finish(&path, QueueStatus::Failed, Some(reason.clone()));
                emit(&self.events, PipelineEvent::Failed { path, reason });
            }
            Disposition::Parked => {
                self.queue.finish(
                    &path,
                    QueueStatus::AwaitingDecision,
                    Some("等待冲突决定".to_string()),
                );
            }
            Disposition::Requeued { reason } => {
                // 先移出处理集合，否则重新入队会被拒绝
                self.queue.discard(&path);
                self.reinject(&path, reason);
            }
        }
    }

    fn access_failure(&self, failure: AccessFailure<FileAccessError>) -> Disposition {
        match failure {
            AccessFailure::Failed(FileAccessError::NotFound(_)) => Disposition::Skipped {
                reason: "文件已不存在".to_string(),
            },
            AccessFailure::Cancelled => Disposition::Failed {
                reason: "已取消".to_string(),
            },
            other => Disposition::Failed {
                reason: other.to_string(),
            },
        }
    }

    fn record(&self, path: &Path, remote_path: &str, digest: &str, size: u64) {
        if let Err(e) = self.history.record(path, remote_path, digest, size) {
            warn!("保存上传历史失败: {}", e);
        }
    }

    async fn process(&self, item: &QueueItem) -> Disposition {
        let path = item.local_path.as_path();
        emit(
            &self.events,
            PipelineEvent::Processing {
                path: path.to_path_buf(),
            },
        );
        debug!("开始处理: {} → {}", path.display(), item.remote_path);

        let snapshot = match FileSnapshot::read(path).await {
            Ok(snapshot) => snapshot,
            Err(FileAccessError::NotFound(_)) => {
                return Disposition::Skipped {
                    reason: "文件已不存在".to_string(),
                }
            }
            Err(e) => {
                return Disposition::Failed {
                    reason: e.to_string(),
                }
            }
        };

        let digest = match self.retrier.run(path, || self.read_digest(path)).await {
            Ok(accessed) if accessed.waited => {
                return Disposition::Requeued {
                    reason: "文件解锁，重新确认写入完成".to_string(),
                }
            }
            Ok(accessed) => accessed.value,
            Err(e) => return self.access_failure(e),
        };

        let decision = match item.forced_action {
            Some(action) => {
                let remote_id = item.conflict_remote_id.clone().unwrap_or_default();
                self.decide(path, &snapshot, remote_id, action, &item.remote_path)
            }
            None => self.probe(item, &digest, &snapshot).await,
        };
        let (target, renamed_from) = match decision {
            Ok(decided) => decided,
            Err(disposition) => return disposition,
        };

        // 上传后内容不一致时最多重新上传一次
        let mut last_remote_id = String::new();
        for round in 0..2 {
            match self.upload_and_verify(path, &target, &digest, &snapshot).await {
                Ok(disposition) => {
                    // 改名上传后远程原文件仍不一致，本地不变时不再重复处理
                    if let (Disposition::Done { .. }, Some(remote_id)) = (&disposition, &renamed_from) {
                        self.settle(path, &snapshot, remote_id.clone(), ConflictAction::RenameAndUpload);
                    }
                    return disposition;
                }
                Err(remote_id) => {
                    if round == 0 {
                        warn!("上传后远程内容不一致，重新上传: {}", target);
                    }
                    last_remote_id = remote_id;
                }
            }
        }
        Disposition::Failed {
            reason: format!("重新上传后远程内容仍不一致 (远程标识 {})", last_remote_id),
        }
    }

    async fn open_local(&self, path: &Path) -> Result<tokio::fs::File, FileAccessError> {
        self.files
            .open(path)
            .await
            .map_err(|e| FileAccessError::from_io(path, e))
    }

    /// 确认文件可以打开后再取摘要；缓存命中时不会读取文件内容
    async fn read_digest(&self, path: &Path) -> Result<String, FileAccessError> {
        drop(self.open_local(path).await?);
        self.cache.digest(path).await
    }

    fn settle(&self, path: &Path, snapshot: &FileSnapshot, remote_id: String, action: ConflictAction) {
        self.resolver.settle(
            path,
            SettledConflict {
                size: snapshot.size,
                mtime: snapshot.mtime,
                remote_id,
                action,
            },
        );
    }

    /// 执行冲突决定，返回上传目标；改名上传时附带远程标识
    fn decide(
        &self,
        path: &Path,
        snapshot: &FileSnapshot,
        remote_id: String,
        action: ConflictAction,
        remote_path: &str,
    ) -> Result<(String, Option<String>), Disposition> {
        if action == ConflictAction::Skip {
            self.settle(path, snapshot, remote_id.clone(), action);
        }
        let target = self.plan(action, remote_path)?;
        let renamed_from = (action == ConflictAction::RenameAndUpload).then_some(remote_id);
        Ok((target, renamed_from))
    }

    /// 把冲突决定转为上传目标
    fn plan(&self, action: ConflictAction, remote_path: &str) -> Result<String, Disposition> {
        match action {
            ConflictAction::UploadOverwrite => Ok(remote_path.to_string()),
            ConflictAction::RenameAndUpload => Ok(ConflictResolver::generate_conflict_name(
                remote_path,
                "local",
                chrono::Utc::now().timestamp(),
            )),
            ConflictAction::Skip => Err(Disposition::Skipped {
                reason: "内容不一致，保留远程文件".to_string(),
            }),
            ConflictAction::DeferToExternal => Err(Disposition::Parked),
        }
    }

    /// 上传前检查远程是否已有文件
    async fn probe(
        &self,
        item: &QueueItem,
        digest: &str,
        snapshot: &FileSnapshot,
    ) -> Result<(String, Option<String>), Disposition> {
        let path = item.local_path.as_path();
        let remote_path = item.remote_path.as_str();

        match self.store.stat(remote_path).await {
            Ok(Some(meta)) if !meta.is_dir => {}
            Ok(_) => return Ok((remote_path.to_string(), None)),
            Err(e @ RemoteError::Unauthorized(_)) => {
                return Err(Disposition::Failed {
                    reason: e.to_string(),
                })
            }
            Err(e) => {
                warn!("预检查远程文件失败，直接上传: {}", e);
                return Ok((remote_path.to_string(), None));
            }
        }

        match self.verifier.verify(path, remote_path, digest).await {
            VerifyOutcome::Verified { reason, .. } => {
                self.record(path, remote_path, digest, snapshot.size);
                Err(Disposition::Done {
                    reason: format!("远程已是最新: {}", reason),
                })
            }
            VerifyOutcome::Divergent {
                remote_id,
                remote_modified,
            } => {
                let action = self.resolver.resolve(
                    path,
                    digest,
                    &remote_id,
                    Some(snapshot.mtime),
                    remote_modified,
                );
                if action == ConflictAction::DeferToExternal {
                    self.resolver.park(PendingConflict {
                        local_path: path.to_path_buf(),
                        remote_path: remote_path.to_string(),
                        local_digest: digest.to_string(),
                        remote_id: remote_id.clone(),
                        local_modified: Some(snapshot.mtime),
                        remote_modified,
                        detected_at: chrono::Utc::now().timestamp(),
                    });
                    emit(
                        &self.events,
                        PipelineEvent::ConflictPending {
                            path: path.to_path_buf(),
                            remote_path: remote_path.to_string(),
                            local_digest: digest.to_string(),
                            remote_id: remote_id.clone(),
                        },
                    );
                }
                self.decide(path, snapshot, remote_id, action, remote_path)
            }
            // 大小不同、不可读等：以本地为准重新上传
            VerifyOutcome::Failed { reason } => {
                debug!("远程文件与本地不符 ({})，重新上传", reason);
                Ok((remote_path.to_string(), None))
            }
        }
    }

    /// 上传并校验；上传后内容标识仍不一致时返回远程标识
    async fn upload_and_verify(
        &self,
        path: &Path,
        target: &str,
        digest: &str,
        snapshot: &FileSnapshot,
    ) -> Result<Disposition, String> {
        let file = match self.retrier.run(path, || self.open_local(path)).await {
            Ok(accessed) if accessed.waited => {
                return Ok(Disposition::Requeued {
                    reason: "文件解锁，重新确认写入完成".to_string(),
                })
            }
            Ok(accessed) => accessed.value,
            Err(e) => return Ok(self.access_failure(e)),
        };

        let source = UploadSource {
            path: path.to_path_buf(),
            file,
            size: snapshot.size,
        };
        let progress = {
            let events = self.events.clone();
            let path = path.to_path_buf();
            move |bytes, total| {
                emit(
                    &events,
                    PipelineEvent::Progress {
                        path: path.clone(),
                        bytes,
                        total,
                    },
                )
            }
        };

        match self.uploader.upload(source, target, progress).await {
            Ok(_) => {}
            Err(TransferError::FileChanged) => {
                return Ok(Disposition::Requeued {
                    reason: "上传过程中文件发生变化".to_string(),
                })
            }
            Err(e) if e.is_locked() => {
                return Ok(Disposition::Requeued {
                    reason: "上传过程中文件被占用".to_string(),
                })
            }
            Err(TransferError::Cancelled) => {
                return Ok(Disposition::Failed {
                    reason: "已取消".to_string(),
                })
            }
            Err(e) => {
                return Ok(Disposition::Failed {
                    reason: format!("上传失败: {}", e),
                })
            }
        }

        if snapshot.changed(path).await {
            return Ok(Disposition::Requeued {
                reason: "上传过程中文件发生变化".to_string(),
            });
        }

        self.uploader.write_sidecar(target, digest).await;

        match self.verifier.verify(path, target, digest).await {
            VerifyOutcome::Verified { reason, .. } => {
                self.record(path, target, digest, snapshot.size);
                Ok(Disposition::Done { reason })
            }
            VerifyOutcome::Divergent { remote_id, .. } => Err(remote_id),
            VerifyOutcome::Failed { reason } => Ok(Disposition::Failed {
                reason: format!("上传后校验失败: {}", reason),
            }),
        }
    }

    async fn check_remote_integrity(&self) -> IntegrityReport {
        let mut report = IntegrityReport::default();

        for record in self.history.records() {
            if self.cancel.is_cancelled() {
                break;
            }
            if !record.local_path.exists() {
                report.missing_local += 1;
                continue;
            }
            report.checked += 1;

            let outcome = self
                .verifier
                .verify(&record.local_path, &record.remote_path, &record.digest)
                .await;
            if outcome.is_verified() {
                report.verified += 1;
                continue;
            }

            self.history.remove(&record.local_path);
            self.reinject(&record.local_path, "远程文件缺失或不一致".to_string());
            report.requeued.push(record.local_path);
        }

        if let Err(e) = self.history.save_if_dirty() {
            warn!("保存上传历史失败: {}", e);
        }
        report
    }
}
