//! 流水线错误类型
//!
//! 本地文件被占用是正常的控制流分支（仪器采集期间会长时间独占文件），
//! 因此单独建模为 `Locked`，而不是混在普通 IO 错误里。

use crate::storage::RemoteError;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Windows: ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
#[cfg(windows)]
const LOCK_OS_ERRORS: &[i32] = &[32, 33];
/// Unix: EBUSY / ETXTBSY
#[cfg(not(windows))]
const LOCK_OS_ERRORS: &[i32] = &[16, 26];

/// 本地文件访问错误
#[derive(Debug, Error)]
pub enum FileAccessError {
    #[error("文件被占用: {path:?}: {source}")]
    Locked { path: PathBuf, source: io::Error },
    #[error("文件不存在: {0:?}")]
    NotFound(PathBuf),
    #[error("读取文件失败: {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl FileAccessError {
    /// 根据 IO 错误类型归类
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            return Self::NotFound(path.to_path_buf());
        }
        if is_lock_error(&err) {
            return Self::Locked {
                path: path.to_path_buf(),
                source: err,
            };
        }
        Self::Io {
            path: path.to_path_buf(),
            source: err,
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}

/// 判断 IO 错误是否由其他进程占用文件引起
pub fn is_lock_error(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::PermissionDenied {
        return true;
    }
    err.raw_os_error()
        .map(|code| LOCK_OS_ERRORS.contains(&code))
        .unwrap_or(false)
}

/// 单个文件传输过程中的错误
#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    File(#[from] FileAccessError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("偏移 {offset} 处的分块上传失败（已尝试 {attempts} 次）: {source}")]
    RetriesExhausted {
        offset: u64,
        attempts: u32,
        source: RemoteError,
    },
    #[error("文件在上传过程中发生变化")]
    FileChanged,
    #[error("上传已取消")]
    Cancelled,
}

impl TransferError {
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::File(e) if e.is_locked())
    }
}

/// 可被 [`LockedAccessRetrier`](crate::core::lock_retry::LockedAccessRetrier) 识别的错误
pub trait LockAware {
    fn is_locked(&self) -> bool;
}

impl LockAware for FileAccessError {
    fn is_locked(&self) -> bool {
        FileAccessError::is_locked(self)
    }
}

impl LockAware for TransferError {
    fn is_locked(&self) -> bool {
        TransferError::is_locked(self)
    }
}
