use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// 比较修改时间时的容差（秒）
const MTIME_TOLERANCE_SECS: i64 = 2;

/// 内容不一致时的处理策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictPolicy {
    #[default]
    AskExternal,
    AlwaysUpload,
    AlwaysSkip,
    PreferNewer,
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictPolicy::AskExternal => write!(f, "askExternal"),
            ConflictPolicy::AlwaysUpload => write!(f, "alwaysUpload"),
            ConflictPolicy::AlwaysSkip => write!(f, "alwaysSkip"),
            ConflictPolicy::PreferNewer => write!(f, "preferNewer"),
        }
    }
}

impl From<&str> for ConflictPolicy {
    fn from(s: &str) -> Self {
        match s {
            "alwaysUpload" | "always_upload" => ConflictPolicy::AlwaysUpload,
            "alwaysSkip" | "always_skip" => ConflictPolicy::AlwaysSkip,
            "preferNewer" | "prefer_newer" => ConflictPolicy::PreferNewer,
            _ => ConflictPolicy::AskExternal,
        }
    }
}

/// 冲突处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictAction {
    UploadOverwrite,
    Skip,
    RenameAndUpload,
    DeferToExternal,
}

impl std::fmt::Display for ConflictAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictAction::UploadOverwrite => write!(f, "overwrite"),
            ConflictAction::Skip => write!(f, "skip"),
            ConflictAction::RenameAndUpload => write!(f, "rename"),
            ConflictAction::DeferToExternal => write!(f, "defer"),
        }
    }
}

impl From<&str> for ConflictAction {
    fn from(s: &str) -> Self {
        match s {
            "overwrite" | "uploadOverwrite" => ConflictAction::UploadOverwrite,
            "rename" | "renameAndUpload" => ConflictAction::RenameAndUpload,
            "defer" | "deferToExternal" => ConflictAction::DeferToExternal,
            _ => ConflictAction::Skip,
        }
    }
}

/// 等待外部决定的冲突
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingConflict {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub local_digest: String,
    pub remote_id: String,
    pub local_modified: Option<i64>,
    pub remote_modified: Option<i64>,
    pub detected_at: i64,
}

/// 已处理完的冲突，记录处理时的本地文件状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledConflict {
    pub size: u64,
    pub mtime: i64,
    pub remote_id: String,
    pub action: ConflictAction,
}

/// 冲突解决器
#[derive(Debug)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
    /// "应用到全部" 的批量决定，队列清空后失效
    batch_override: Mutex<Option<ConflictAction>>,
    pending: Mutex<BTreeMap<PathBuf, PendingConflict>>,
    /// 本地文件变化前不再重新处理
    settled: Mutex<HashMap<PathBuf, SettledConflict>>,
}

impl ConflictResolver {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            policy,
            batch_override: Mutex::new(None),
            pending: Mutex::new(BTreeMap::new()),
            settled: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// 按策略决定处理方式（不考虑批量决定）
    pub fn decide(
        policy: ConflictPolicy,
        local_modified: Option<i64>,
        remote_modified: Option<i64>,
    ) -> ConflictAction {
        match policy {
            ConflictPolicy::AlwaysUpload => ConflictAction::UploadOverwrite,
            ConflictPolicy::AlwaysSkip => ConflictAction::Skip,
            ConflictPolicy::AskExternal => ConflictAction::DeferToExternal,
            ConflictPolicy::PreferNewer => match (local_modified, remote_modified) {
                (Some(local), Some(remote)) if local > remote + MTIME_TOLERANCE_SECS => {
                    ConflictAction::UploadOverwrite
                }
                (Some(_), Some(_)) => ConflictAction::Skip,
                _ => ConflictAction::DeferToExternal,
            },
        }
    }

    /// 处理一次内容不一致
    pub fn resolve(
        &self,
        path: &Path,
        local_digest: &str,
        remote_id: &str,
        local_modified: Option<i64>,
        remote_modified: Option<i64>,
    ) -> ConflictAction {
        if self.policy == ConflictPolicy::AskExternal {
            if let Some(action) = self.batch_override() {
                info!("冲突 {} 使用批量决定: {}", path.display(), action);
                return action;
            }
        }

        let action = Self::decide(self.policy, local_modified, remote_modified);
        info!(
            "内容不一致: {} (本地 {}, 远程 {}), 策略 {} → {}",
            path.display(),
            short_id(local_digest),
            short_id(remote_id),
            self.policy,
            action
        );
        action
    }

    pub fn batch_override(&self) -> Option<ConflictAction> {
        self.batch_override.lock().ok().and_then(|guard| *guard)
    }

    pub fn set_batch_override(&self, action: ConflictAction) {
        if let Ok(mut guard) = self.batch_override.lock() {
            *guard = Some(action);
        }
    }

    pub fn clear_batch_override(&self) {
        if let Ok(mut guard) = self.batch_override.lock() {
            if guard.take().is_some() {
                info!("队列已清空，批量冲突决定失效");
            }
        }
    }

    /// 挂起冲突，等待外部决定
    pub fn park(&self, conflict: PendingConflict) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(conflict.local_path.clone(), conflict);
        }
    }

    pub fn take_pending(&self, path: &Path) -> Option<PendingConflict> {
        self.pending.lock().ok()?.remove(path)
    }

    pub fn take_all_pending(&self) -> Vec<PendingConflict> {
        self.pending
            .lock()
            .map(|mut pending| std::mem::take(&mut *pending).into_values().collect())
            .unwrap_or_default()
    }

    pub fn pending(&self) -> Vec<PendingConflict> {
        self.pending
            .lock()
            .map(|pending| pending.values().cloned().collect())
            .unwrap_or_default()
    }

    /// 记住冲突的处理结果
    pub fn settle(&self, path: &Path, settled: SettledConflict) {
        debug!(
            "记住冲突处理结果: {} → {} (远程 {})",
            path.display(),
            settled.action,
            short_id(&settled.remote_id)
        );
        if let Ok(mut map) = self.settled.lock() {
            map.insert(path.to_path_buf(), settled);
        }
    }

    /// 本地文件仍是处理冲突时的状态则返回当时的决定；文件已变化时丢弃记录
    pub fn settled(&self, path: &Path, size: u64, mtime: i64) -> Option<ConflictAction> {
        let mut map = self.settled.lock().ok()?;
        let entry = map.get(path)?;
        if entry.size == size && entry.mtime == mtime {
            return Some(entry.action);
        }
        map.remove(path);
        None
    }

    pub fn forget(&self, path: &Path) {
        if let Ok(mut map) = self.settled.lock() {
            map.remove(path);
        }
    }

    /// 生成冲突文件名，只改动最后一段的文件名部分
    pub fn generate_conflict_name(path: &str, side: &str, timestamp: i64) -> String {
        use chrono::DateTime;

        let dt = DateTime::from_timestamp(timestamp, 0)
            .map(|d| d.format("%Y%m%d_%H%M%S").to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let name_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
        match path[name_start..].rfind('.') {
            Some(dot) if dot > 0 => {
                let (name, ext) = path.split_at(name_start + dot);
                format!("{}_conflict_{}_{}{}", name, side, dt, ext)
            }
            _ => format!("{}_conflict_{}_{}", path, side, dt),
        }
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_decisions() {
        use ConflictAction::*;
        assert_eq!(ConflictResolver::decide(ConflictPolicy::AlwaysUpload, None, None), UploadOverwrite);
        assert_eq!(ConflictResolver::decide(ConflictPolicy::AlwaysSkip, None, None), Skip);
        assert_eq!(ConflictResolver::decide(ConflictPolicy::AskExternal, Some(1), Some(1)), DeferToExternal);

        let newer = ConflictPolicy::PreferNewer;
        assert_eq!(ConflictResolver::decide(newer, Some(1000), Some(900)), UploadOverwrite);
        // 容差内视为同时修改，保留远程
        assert_eq!(ConflictResolver::decide(newer, Some(1001), Some(1000)), Skip);
        assert_eq!(ConflictResolver::decide(newer, Some(900), Some(1000)), Skip);
        assert_eq!(ConflictResolver::decide(newer, Some(900), None), DeferToExternal);
    }

    #[test]
    fn test_batch_override_short_circuits_ask() {
        let resolver = ConflictResolver::new(ConflictPolicy::AskExternal);
        let path = Path::new("/data/a.raw");
        assert_eq!(resolver.resolve(path, "aa", "bb", None, None), ConflictAction::DeferToExternal);

        resolver.set_batch_override(ConflictAction::UploadOverwrite);
        assert_eq!(resolver.resolve(path, "aa", "bb", None, None), ConflictAction::UploadOverwrite);

        resolver.clear_batch_override();
        assert_eq!(resolver.resolve(path, "aa", "bb", None, None), ConflictAction::DeferToExternal);
    }

    #[test]
    fn test_override_ignored_for_fixed_policy() {
        let resolver = ConflictResolver::new(ConflictPolicy::AlwaysSkip);
        resolver.set_batch_override(ConflictAction::UploadOverwrite);
        assert_eq!(
            resolver.resolve(Path::new("/a.raw"), "aa", "bb", None, None),
            ConflictAction::Skip
        );
    }

    #[test]
    fn test_pending_conflicts() {
        let resolver = ConflictResolver::new(ConflictPolicy::AskExternal);
        for name in ["/data/b.raw", "/data/a.raw"] {
            resolver.park(PendingConflict {
                local_path: PathBuf::from(name),
                remote_path: name.replace("/data", "/lab"),
                local_digest: "aa".into(),
                remote_id: "bb".into(),
                local_modified: None,
                remote_modified: None,
                detected_at: 0,
            });
        }

        assert_eq!(resolver.pending().len(), 2);
        assert!(resolver.take_pending(Path::new("/data/b.raw")).is_some());
        let rest = resolver.take_all_pending();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].local_path, PathBuf::from("/data/a.raw"));
        assert!(resolver.pending().is_empty());
    }

    #[test]
    fn test_settled_until_local_changes() {
        let resolver = ConflictResolver::new(ConflictPolicy::AlwaysSkip);
        let path = Path::new("/data/a.raw");
        assert_eq!(resolver.settled(path, 64, 1000), None);

        resolver.settle(
            path,
            SettledConflict {
                size: 64,
                mtime: 1000,
                remote_id: "bb".to_string(),
                action: ConflictAction::Skip,
            },
        );
        assert_eq!(resolver.settled(path, 64, 1000), Some(ConflictAction::Skip));
        assert_eq!(resolver.settled(path, 64, 1000), Some(ConflictAction::Skip));

        // 文件被改写后记录失效，之后即使恢复原状态也需要重新处理
        assert_eq!(resolver.settled(path, 64, 1005), None);
        assert_eq!(resolver.settled(path, 64, 1000), None);

        resolver.settle(
            path,
            SettledConflict {
                size: 64,
                mtime: 1000,
                remote_id: "bb".to_string(),
                action: ConflictAction::RenameAndUpload,
            },
        );
        resolver.forget(path);
        assert_eq!(resolver.settled(path, 64, 1000), None);
    }

    #[test]
    fn test_generate_conflict_name() {
        // 2024-03-05 10:15:30 UTC
        let ts = 1_709_633_730;
        assert_eq!(
            ConflictResolver::generate_conflict_name("/lab/run01.raw", "local", ts),
            "/lab/run01_conflict_local_20240305_101530.raw"
        );
        assert_eq!(
            ConflictResolver::generate_conflict_name("/lab.v2/run01", "local", ts),
            "/lab.v2/run01_conflict_local_20240305_101530"
        );
        assert_eq!(
            ConflictResolver::generate_conflict_name("/lab/.hidden", "local", ts),
            "/lab/.hidden_conflict_local_20240305_101530"
        );
    }

    #[test]
    fn test_string_round_trip() {
        assert_eq!(ConflictPolicy::from("preferNewer"), ConflictPolicy::PreferNewer);
        assert_eq!(ConflictAction::from(ConflictAction::RenameAndUpload.to_string().as_str()), ConflictAction::RenameAndUpload);
    }
}
