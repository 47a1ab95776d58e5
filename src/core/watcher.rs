//! 目录监控
//!
//! 系统文件通知为主，可选的定期全量扫描用于通知不可靠的网络盘/虚拟机共享。
//! 只产生候选路径，不读取文件内容。

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 扩展名和隐藏文件过滤
#[derive(Debug, Clone)]
pub struct WatchFilter {
    /// 小写、不带点；为空表示不限制
    extensions: Vec<String>,
}

impl WatchFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim().trim_start_matches('.').to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        // 隐藏文件和 Office 风格的临时文件
        if name.starts_with('.') || name.starts_with('~') {
            return false;
        }
        if self.extensions.is_empty() {
            return true;
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        self.extensions.iter().any(|e| *e == ext)
    }
}

/// 本地文件对应的远程路径
///
/// 保留目录结构时为 `base/相对路径`，否则为 `base/文件名`。
pub fn remote_path_for(local: &Path, watch_root: &Path, base_path: &str, preserve_structure: bool) -> String {
    let relative = if preserve_structure {
        local.strip_prefix(watch_root).ok().map(Path::to_path_buf)
    } else {
        None
    };
    let relative = relative.unwrap_or_else(|| {
        local
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_default()
    });

    let mut parts: Vec<String> = base_path
        .split(['/', '\\'])
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    parts.extend(
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned()),
    );
    format!("/{}", parts.join("/"))
}

/// 遍历目录，返回所有匹配的文件；单个条目出错时记录并跳过
pub fn scan_tree(root: &Path, recursive: bool, filter: &WatchFilter) -> Vec<PathBuf> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .max_depth(if recursive { usize::MAX } else { 1 });

    let mut found = Vec::new();
    for entry in walker {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_file() && filter.matches(entry.path()) {
                    found.push(entry.into_path());
                }
            }
            Err(e) => warn!("扫描条目失败，跳过: {}", e),
        }
    }
    found.sort();
    found
}

/// 从通知事件中提取候选路径
fn event_paths(event: Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(_) => event.paths,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths,
        // [from, to]
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.into_iter().skip(1).collect()
        }
        EventKind::Modify(ModifyKind::Name(_)) => Vec::new(),
        EventKind::Modify(_) => event.paths,
        _ => Vec::new(),
    }
}

pub struct DirectoryWatcher {
    root: PathBuf,
    _watcher: Option<RecommendedWatcher>,
    rescan_task: Option<JoinHandle<()>>,
}

impl DirectoryWatcher {
    /// 开始监控，候选路径发送到 `tx`
    pub fn start(
        root: &Path,
        recursive: bool,
        filter: WatchFilter,
        rescan_interval: Option<Duration>,
        tx: UnboundedSender<PathBuf>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        if !root.is_dir() {
            anyhow::bail!("监控目录不存在: {}", root.display());
        }

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };

        let watcher = {
            let tx = tx.clone();
            let filter = filter.clone();
            let created = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for path in event_paths(event) {
                        if filter.matches(&path) && !path.is_dir() {
                            let _ = tx.send(path);
                        }
                    }
                }
                Err(e) => warn!("文件通知错误: {}", e),
            })
            .and_then(|mut watcher| watcher.watch(root, mode).map(|_| watcher));

            match created {
                Ok(watcher) => Some(watcher),
                // 网络盘上可能无法注册通知，有定期扫描时仍可继续
                Err(e) if rescan_interval.is_some() => {
                    warn!("无法注册文件通知，仅使用定期扫描: {}", e);
                    None
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("监控目录失败: {}", root.display()))
                }
            }
        };

        let rescan_task = rescan_interval.map(|interval| {
            let root = root.to_path_buf();
            tokio::spawn(Self::rescan_loop(root, recursive, filter, interval, tx, cancel))
        });

        info!(
            "开始监控: {} (递归: {}, 定期扫描: {:?})",
            root.display(),
            recursive,
            rescan_interval
        );

        Ok(Self {
            root: root.to_path_buf(),
            _watcher: watcher,
            rescan_task,
        })
    }

    async fn rescan_loop(
        root: PathBuf,
        recursive: bool,
        filter: WatchFilter,
        interval: Duration,
        tx: UnboundedSender<PathBuf>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        // 第一次 tick 立即返回，启动扫描由流水线单独处理
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let (root_c, filter_c) = (root.clone(), filter.clone());
            match tokio::task::spawn_blocking(move || scan_tree(&root_c, recursive, &filter_c)).await {
                Ok(paths) => {
                    debug!("定期扫描发现 {} 个文件", paths.len());
                    for path in paths {
                        if tx.send(path).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!("定期扫描失败: {}", e),
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 停止监控；释放通知句柄后不再产生新事件
    pub fn stop(mut self) {
        if let Some(task) = self.rescan_task.take() {
            task.abort();
        }
        info!("停止监控: {}", self.root.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::CreateKind;

    #[test]
    fn test_filter() {
        let filter = WatchFilter::new(["RAW", ".wiff"]);
        assert!(filter.matches(Path::new("/data/run01.raw")));
        assert!(filter.matches(Path::new("/data/run01.RAW")));
        assert!(filter.matches(Path::new("/data/run01.wiff")));
        assert!(!filter.matches(Path::new("/data/run01.txt")));
        assert!(!filter.matches(Path::new("/data/.run01.raw")));
        assert!(!filter.matches(Path::new("/data/~run01.raw")));
        assert!(!filter.matches(Path::new("/data/noext")));

        let any = WatchFilter::new(Vec::<String>::new());
        assert!(any.matches(Path::new("/data/noext")));
    }

    #[test]
    fn test_remote_path_mapping() {
        let root = Path::new("/instrument/out");
        let local = Path::new("/instrument/out/2024/03/run01.raw");
        assert_eq!(
            remote_path_for(local, root, "/lab/ms", true),
            "/lab/ms/2024/03/run01.raw"
        );
        assert_eq!(remote_path_for(local, root, "lab/ms/", false), "/lab/ms/run01.raw");
        assert_eq!(remote_path_for(local, root, "", true), "/2024/03/run01.raw");
    }

    #[test]
    fn test_event_paths() {
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path("/d/a.raw".into());
        assert_eq!(event_paths(create), vec![PathBuf::from("/d/a.raw")]);

        let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path("/d/a.tmp".into())
            .add_path("/d/a.raw".into());
        assert_eq!(event_paths(rename), vec![PathBuf::from("/d/a.raw")]);

        let moved_out = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
            .add_path("/d/a.raw".into());
        assert!(event_paths(moved_out).is_empty());
    }

    #[test]
    fn test_scan_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.raw"), b"a").unwrap();
        std::fs::write(dir.path().join("sub/b.raw"), b"b").unwrap();
        std::fs::write(dir.path().join("sub/notes.txt"), b"n").unwrap();
        std::fs::write(dir.path().join(".c.raw"), b"c").unwrap();

        let filter = WatchFilter::new(["raw"]);
        let all = scan_tree(dir.path(), true, &filter);
        assert_eq!(all, vec![dir.path().join("a.raw"), dir.path().join("sub/b.raw")]);

        let top = scan_tree(dir.path(), false, &filter);
        assert_eq!(top, vec![dir.path().join("a.raw")]);
    }

    #[tokio::test]
    async fn test_rescan_finds_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let watcher = DirectoryWatcher::start(
            dir.path(),
            true,
            WatchFilter::new(["raw"]),
            Some(Duration::from_millis(50)),
            tx,
            cancel.clone(),
        )
        .unwrap();

        std::fs::write(dir.path().join("run.raw"), b"data").unwrap();
        let path = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "run.raw");

        cancel.cancel();
        watcher.stop();
    }
}
