//! 流水线状态事件
//!
//! 所有对外通知都通过广播通道发送，消费者（状态显示、日志）异步订阅。

use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

/// 事件通道容量
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

pub type EventSender = broadcast::Sender<PipelineEvent>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PipelineEvent {
    /// 发现候选文件，开始等待写入完成
    Detected { path: PathBuf },
    #[serde(rename_all = "camelCase")]
    Queued { path: PathBuf, remote_path: String },
    Processing { path: PathBuf },
    Progress { path: PathBuf, bytes: u64, total: u64 },
    #[serde(rename_all = "camelCase")]
    LockWaiting {
        path: PathBuf,
        attempt: u32,
        max_attempts: u32,
        elapsed_secs: u64,
        remaining_secs: u64,
    },
    Verified { path: PathBuf, reason: String },
    Skipped { path: PathBuf, reason: String },
    Failed { path: PathBuf, reason: String },
    /// 本地与远程内容不一致，等待外部决定
    #[serde(rename_all = "camelCase")]
    ConflictPending {
        path: PathBuf,
        remote_path: String,
        local_digest: String,
        remote_id: String,
    },
    /// 文件重新进入稳定性检测（锁等待结束、上传中被修改等）
    Requeued { path: PathBuf, reason: String },
}

impl PipelineEvent {
    pub fn path(&self) -> &Path {
        match self {
            PipelineEvent::Detected { path }
            | PipelineEvent::Queued { path, .. }
            | PipelineEvent::Processing { path }
            | PipelineEvent::Progress { path, .. }
            | PipelineEvent::LockWaiting { path, .. }
            | PipelineEvent::Verified { path, .. }
            | PipelineEvent::Skipped { path, .. }
            | PipelineEvent::Failed { path, .. }
            | PipelineEvent::ConflictPending { path, .. }
            | PipelineEvent::Requeued { path, .. } => path,
        }
    }
}

/// 发送事件；没有订阅者时静默丢弃
pub fn emit(sender: &EventSender, event: PipelineEvent) {
    let _ = sender.send(event);
}

pub fn channel() -> EventSender {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = PipelineEvent::Queued {
            path: PathBuf::from("/data/a.raw"),
            remote_path: "/lab/a.raw".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "queued");
        assert_eq!(json["remotePath"], "/lab/a.raw");
        assert_eq!(event.path(), Path::new("/data/a.raw"));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let sender = channel();
        emit(
            &sender,
            PipelineEvent::Detected {
                path: PathBuf::from("/data/a.raw"),
            },
        );

        let mut rx = sender.subscribe();
        emit(
            &sender,
            PipelineEvent::Processing {
                path: PathBuf::from("/data/b.raw"),
            },
        );
        assert!(matches!(rx.try_recv(), Ok(PipelineEvent::Processing { .. })));
    }
}
