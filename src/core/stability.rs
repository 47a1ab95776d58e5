//! 文件写入完成检测
//!
//! 仪器软件会分多次写入大文件，只有大小在稳定窗口内不再变化才交给上传队列。

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// 等待稳定的文件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEntry {
    pub last_size: u64,
    pub last_change: Instant,
    /// 首次发现的顺序，同一轮稳定的文件按此顺序交给队列
    pub seq: u64,
}

pub struct StabilityTracker {
    pending: HashMap<PathBuf, PendingEntry>,
    window: Duration,
    next_seq: u64,
}

impl StabilityTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            window,
            next_seq: 0,
        }
    }

    /// 记录一次观测到的大小，大小变化时重新计时
    pub fn observe(&mut self, path: PathBuf, size: u64, now: Instant) {
        match self.pending.get_mut(&path) {
            Some(entry) if entry.last_size == size => {}
            Some(entry) => {
                entry.last_size = size;
                entry.last_change = now;
            }
            None => {
                debug!("开始跟踪文件: {} ({} 字节)", path.display(), size);
                self.pending.insert(
                    path,
                    PendingEntry {
                        last_size: size,
                        last_change: now,
                        seq: self.next_seq,
                    },
                );
                self.next_seq += 1;
            }
        }
    }

    /// 重新检查所有等待中的文件，按发现顺序返回已稳定的路径
    ///
    /// `stat` 返回文件当前大小；文件已消失的条目直接丢弃。
    pub fn tick<F>(&mut self, now: Instant, stat: F) -> Vec<PathBuf>
    where
        F: Fn(&Path) -> io::Result<u64>,
    {
        let mut ready = Vec::new();
        let window = self.window;

        self.pending.retain(|path, entry| match stat(path) {
            Ok(size) if size != entry.last_size => {
                entry.last_size = size;
                entry.last_change = now;
                true
            }
            Ok(_) => {
                if now.saturating_duration_since(entry.last_change) >= window {
                    ready.push((entry.seq, path.clone()));
                    false
                } else {
                    true
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("文件已消失，停止跟踪: {}", path.display());
                false
            }
            // 其他错误（例如被占用）保留条目，下次再看
            Err(_) => true,
        });

        ready.sort_unstable_by_key(|(seq, _)| *seq);
        ready.into_iter().map(|(_, path)| path).collect()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.pending.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// 读取文件大小
pub fn file_size(path: &Path) -> io::Result<u64> {
    std::fs::metadata(path).map(|m| m.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_ready_after_window_exactly_once() {
        let mut tracker = StabilityTracker::new(Duration::from_secs(1));
        let t0 = Instant::now();
        let path = PathBuf::from("/data/a.raw");
        tracker.observe(path.clone(), 100, t0);

        let stat = |_: &Path| -> io::Result<u64> { Ok(100) };
        assert!(tracker.tick(t0 + Duration::from_millis(500), stat).is_empty());
        assert_eq!(tracker.tick(t0 + Duration::from_millis(1000), stat), vec![path]);
        assert!(tracker.tick(t0 + Duration::from_millis(1500), stat).is_empty());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_ready_in_detection_order() {
        let mut tracker = StabilityTracker::new(Duration::from_secs(1));
        let t0 = Instant::now();
        let zeta = PathBuf::from("/data/zeta.raw");
        let alpha = PathBuf::from("/data/alpha.raw");
        tracker.observe(zeta.clone(), 10, t0);
        tracker.observe(alpha.clone(), 10, t0 + Duration::from_millis(100));

        let ready = tracker.tick(t0 + Duration::from_secs(2), |_| Ok(10));
        assert_eq!(ready, vec![zeta, alpha]);
    }

    #[test]
    fn test_vanished_file_is_dropped() {
        let mut tracker = StabilityTracker::new(Duration::from_secs(1));
        let t0 = Instant::now();
        tracker.observe(PathBuf::from("/data/tmp.raw"), 10, t0);

        let ready = tracker.tick(t0 + Duration::from_secs(5), |_| {
            Err(io::Error::from(io::ErrorKind::NotFound))
        });
        assert!(ready.is_empty());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_locked_stat_keeps_entry() {
        let mut tracker = StabilityTracker::new(Duration::from_secs(1));
        let t0 = Instant::now();
        let path = PathBuf::from("/data/busy.raw");
        tracker.observe(path.clone(), 10, t0);

        let ready = tracker.tick(t0 + Duration::from_secs(5), |_| {
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        });
        assert!(ready.is_empty());
        assert!(tracker.contains(&path));
    }

    #[test]
    fn test_two_write_bursts_wait_for_second() {
        // 5 MB 文件分两次写入，间隔 2 秒；窗口 3 秒
        let mut tracker = StabilityTracker::new(Duration::from_secs(3));
        let t0 = Instant::now();
        let path = PathBuf::from("/data/run.raw");
        let size = RefCell::new(2_500_000u64);
        tracker.observe(path.clone(), *size.borrow(), t0);

        let mut ready_at = Vec::new();
        for step in 1..=16u64 {
            let now = t0 + Duration::from_millis(step * 500);
            if step == 4 {
                *size.borrow_mut() = 5_000_000;
            }
            let ready = tracker.tick(now, |_| Ok(*size.borrow()));
            if !ready.is_empty() {
                ready_at.push(step * 500);
            }
        }

        // 第二次写入在 2000ms 被观测到，之后至少还要等 3000ms
        assert_eq!(ready_at, vec![5000]);
    }

    #[test]
    fn test_size_change_resets_timer() {
        let mut tracker = StabilityTracker::new(Duration::from_secs(1));
        let t0 = Instant::now();
        let path = PathBuf::from("/data/a.raw");
        tracker.observe(path.clone(), 1, t0);
        tracker.observe(path.clone(), 2, t0 + Duration::from_millis(900));

        let stat = |_: &Path| -> io::Result<u64> { Ok(2) };
        assert!(tracker.tick(t0 + Duration::from_millis(1200), stat).is_empty());
        assert_eq!(tracker.tick(t0 + Duration::from_millis(1900), stat), vec![path]);
    }
}
