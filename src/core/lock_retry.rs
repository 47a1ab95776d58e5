//! 被占用文件的重试状态机
//!
//! `Idle → Waiting → Retrying → {Resolved | Exhausted}`
//!
//! 首次失败后先等待 `initial_wait`（仪器采集可能持续数十分钟），之后每隔
//! `retry_interval` 重试一次，最多 `max_attempts` 次。耗尽只影响当前文件。

use super::error::LockAware;
use super::events::{emit, EventSender, PipelineEvent};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPhase {
    Idle,
    Waiting,
    Retrying,
    Resolved,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRetrySettings {
    pub initial_wait: Duration,
    pub retry_interval: Duration,
    /// 初始等待之后的最大重试次数
    pub max_attempts: u32,
}

/// 单个文件的重试状态
#[derive(Debug, Clone)]
pub struct LockRetryState {
    pub phase: LockPhase,
    /// 已失败的访问次数（含第一次）
    pub attempt_count: u32,
    pub next_retry_deadline: Instant,
    pub first_failure: Instant,
    pub initial_wait: Duration,
    pub retry_interval: Duration,
    pub max_attempts: u32,
}

impl LockRetryState {
    fn new(settings: &LockRetrySettings, now: Instant) -> Self {
        Self {
            phase: LockPhase::Waiting,
            attempt_count: 1,
            next_retry_deadline: now + settings.initial_wait,
            first_failure: now,
            initial_wait: settings.initial_wait,
            retry_interval: settings.retry_interval,
            max_attempts: settings.max_attempts,
        }
    }

    /// 记录一次重试失败
    pub fn record_failure(&mut self, now: Instant) -> LockPhase {
        self.attempt_count += 1;
        if self.retries_done() >= self.max_attempts {
            self.phase = LockPhase::Exhausted;
        } else {
            self.phase = LockPhase::Retrying;
            self.next_retry_deadline = now + self.retry_interval;
        }
        self.phase
    }

    pub fn retries_done(&self) -> u32 {
        self.attempt_count.saturating_sub(1)
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.first_failure)
    }

    /// 距离放弃的最长剩余时间
    pub fn remaining(&self, now: Instant) -> Duration {
        if self.phase == LockPhase::Exhausted {
            return Duration::ZERO;
        }
        let retries_left = self.max_attempts.saturating_sub(self.retries_done());
        self.next_retry_deadline.saturating_duration_since(now)
            + self.retry_interval * retries_left.saturating_sub(1)
    }
}

/// 访问成功的结果
#[derive(Debug)]
pub struct Accessed<T> {
    pub value: T,
    /// 是否经历过锁等待（等待期间文件可能已变化）
    pub waited: bool,
}

#[derive(Debug, Error)]
pub enum AccessFailure<E> {
    #[error("文件持续被占用，{attempts} 次尝试均失败（{elapsed_secs} 秒）: {source}")]
    Exhausted {
        attempts: u32,
        elapsed_secs: u64,
        source: E,
    },
    #[error(transparent)]
    Failed(E),
    #[error("等待文件解锁时被取消")]
    Cancelled,
}

pub struct LockedAccessRetrier {
    settings: LockRetrySettings,
    states: Mutex<HashMap<PathBuf, LockRetryState>>,
    events: Option<EventSender>,
    cancel: CancellationToken,
}

impl LockedAccessRetrier {
    pub fn new(settings: LockRetrySettings) -> Self {
        Self {
            settings,
            states: Mutex::new(HashMap::new()),
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &LockRetrySettings {
        &self.settings
    }

    pub fn phase(&self, path: &Path) -> LockPhase {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(path).map(|s| s.phase))
            .unwrap_or(LockPhase::Idle)
    }

    /// 记录一次被占用失败，返回更新后的状态副本
    pub fn on_failure(&self, path: &Path, now: Instant) -> LockRetryState {
        let Ok(mut states) = self.states.lock() else {
            // 锁损坏时按单次状态处理
            return LockRetryState::new(&self.settings, now);
        };
        match states.get_mut(path) {
            Some(state) => {
                state.record_failure(now);
                state.clone()
            }
            None => {
                let state = LockRetryState::new(&self.settings, now);
                states.insert(path.to_path_buf(), state.clone());
                state
            }
        }
    }

    /// 访问成功，状态转为 Resolved 并销毁
    pub fn on_success(&self, path: &Path) -> LockPhase {
        let removed = self
            .states
            .lock()
            .ok()
            .and_then(|mut states| states.remove(path));
        match removed {
            Some(state) => {
                info!(
                    "文件已解锁: {} (共尝试 {} 次)",
                    path.display(),
                    state.attempt_count + 1
                );
                LockPhase::Resolved
            }
            None => LockPhase::Idle,
        }
    }

    fn forget(&self, path: &Path) {
        if let Ok(mut states) = self.states.lock() {
            states.remove(path);
        }
    }

    /// 执行一次本地文件访问，被占用时按状态机等待并重试
    pub async fn run<T, E, F, Fut>(
        &self,
        path: &Path,
        mut op: F,
    ) -> Result<Accessed<T>, AccessFailure<E>>
    where
        E: LockAware + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut waited = false;
        loop {
            let err = match op().await {
                Ok(value) => {
                    if waited {
                        self.on_success(path);
                    }
                    return Ok(Accessed { value, waited });
                }
                Err(e) if !e.is_locked() => {
                    self.forget(path);
                    return Err(AccessFailure::Failed(e));
                }
                Err(e) => e,
            };

            let now = Instant::now();
            let state = self.on_failure(path, now);
            let elapsed = state.elapsed(now);

            if state.phase == LockPhase::Exhausted {
                self.forget(path);
                warn!(
                    "文件持续被占用，放弃: {} ({} 次尝试, 已等待 {} 秒)",
                    path.display(),
                    state.attempt_count,
                    elapsed.as_secs()
                );
                return Err(AccessFailure::Exhausted {
                    attempts: state.attempt_count,
                    elapsed_secs: elapsed.as_secs(),
                    source: err,
                });
            }

            let remaining = state.remaining(now);
            info!(
                "文件被占用: {} ({}), 第 {}/{} 次重试前等待, 已等待 {} 秒, 最多剩余 {} 秒",
                path.display(),
                err,
                state.retries_done() + 1,
                state.max_attempts,
                elapsed.as_secs(),
                remaining.as_secs()
            );
            if let Some(events) = &self.events {
                emit(
                    events,
                    PipelineEvent::LockWaiting {
                        path: path.to_path_buf(),
                        attempt: state.retries_done() + 1,
                        max_attempts: state.max_attempts,
                        elapsed_secs: elapsed.as_secs(),
                        remaining_secs: remaining.as_secs(),
                    },
                );
            }

            let wait = state.next_retry_deadline.saturating_duration_since(now);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.forget(path);
                    return Err(AccessFailure::Cancelled);
                }
                _ = tokio::time::sleep(wait) => {}
            }
            waited = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::ChecksumCache;
    use crate::core::error::FileAccessError;
    use crate::storage::{LocalStore, RemoteStore};
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn settings(initial_ms: u64, interval_ms: u64, max_attempts: u32) -> LockRetrySettings {
        LockRetrySettings {
            initial_wait: Duration::from_millis(initial_ms),
            retry_interval: Duration::from_millis(interval_ms),
            max_attempts,
        }
    }

    fn locked(path: &Path) -> FileAccessError {
        FileAccessError::from_io(path, io::Error::from(io::ErrorKind::PermissionDenied))
    }

    #[test]
    fn test_state_machine_transitions() {
        let retrier = LockedAccessRetrier::new(settings(1000, 100, 2));
        let path = Path::new("/data/a.raw");
        let t0 = Instant::now();

        assert_eq!(retrier.phase(path), LockPhase::Idle);

        let state = retrier.on_failure(path, t0);
        assert_eq!(state.phase, LockPhase::Waiting);
        assert_eq!(state.next_retry_deadline, t0 + Duration::from_millis(1000));
        assert_eq!(state.remaining(t0), Duration::from_millis(1100));

        let state = retrier.on_failure(path, t0 + Duration::from_millis(1000));
        assert_eq!(state.phase, LockPhase::Retrying);
        assert_eq!(state.retries_done(), 1);

        let state = retrier.on_failure(path, t0 + Duration::from_millis(1100));
        assert_eq!(state.phase, LockPhase::Exhausted);

        assert_eq!(retrier.on_success(path), LockPhase::Resolved);
        assert_eq!(retrier.phase(path), LockPhase::Idle);
    }

    #[tokio::test]
    async fn test_locked_file_succeeds_on_second_attempt_and_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("run.raw");
        std::fs::write(&file, b"acquisition data").unwrap();
        let remote = LocalStore::new(dir.path().join("remote")).unwrap();
        let cache = ChecksumCache::new(100, 10);

        let events = crate::core::events::channel();
        let mut rx = events.subscribe();
        let retrier = LockedAccessRetrier::new(settings(80, 10, 3)).with_events(events);
        let calls = AtomicU32::new(0);

        let started = Instant::now();
        let accessed = retrier
            .run(&file, || {
                let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                let cache = &cache;
                let file = &file;
                async move {
                    if attempt == 1 {
                        Err(locked(file))
                    } else {
                        cache.digest(file).await
                    }
                }
            })
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(accessed.waited);
        assert!(matches!(
            rx.try_recv(),
            Ok(PipelineEvent::LockWaiting { attempt: 1, .. })
        ));

        remote.put_file("/run.raw", &file, 16).await.unwrap();
        let meta = remote.stat("/run.raw").await.unwrap().unwrap();
        assert_eq!(meta.size, 16);
        assert_eq!(
            accessed.value,
            crate::core::cache::digest_bytes(b"acquisition data")
        );
    }

    #[tokio::test]
    async fn test_exhausted_after_max_attempts() {
        let retrier = LockedAccessRetrier::new(settings(5, 5, 2));
        let path = Path::new("/data/held.raw");
        let calls = AtomicU32::new(0);

        let result: Result<Accessed<()>, _> = retrier
            .run(path, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(locked(path)) }
            })
            .await;

        match result {
            Err(AccessFailure::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected: {:?}", other.map(|a| a.waited)),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retrier.phase(path), LockPhase::Idle);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let retrier = LockedAccessRetrier::new(settings(10_000, 10_000, 5));
        let path = Path::new("/data/missing.raw");

        let result: Result<Accessed<()>, _> = retrier
            .run(path, || async { Err(FileAccessError::NotFound(path.to_path_buf())) })
            .await;

        assert!(matches!(
            result,
            Err(AccessFailure::Failed(FileAccessError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_cancel_during_wait() {
        let cancel = CancellationToken::new();
        let retrier =
            LockedAccessRetrier::new(settings(60_000, 1000, 5)).with_cancellation(cancel.clone());
        let path = Path::new("/data/held.raw");

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let result: Result<Accessed<()>, _> =
            retrier.run(path, || async { Err(locked(path)) }).await;
        canceller.await.unwrap();

        assert!(matches!(result, Err(AccessFailure::Cancelled)));
    }
}
