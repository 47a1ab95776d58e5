use std::path::PathBuf;
use std::sync::Arc;

pub mod config;
pub mod core;
pub mod logging;
pub mod storage;

pub use crate::config::{PipelineConfig, RemoteConfig};
pub use crate::core::{Pipeline, PipelineEvent};
pub use crate::storage::{AuthType, Credentials};

/// 应用状态：配置目录、已校验的配置和运行中的流水线
#[derive(Clone)]
pub struct AppState {
    pub config_dir: PathBuf,
    pub config: PipelineConfig,
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    /// 从配置目录加载配置并创建流水线（尚未启动）
    pub fn new(config_dir: PathBuf, config: PipelineConfig, credentials: Option<Credentials>) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config_dir)?;

        let mut config = config;
        config.validate()?;

        let store = storage::create_store(&config.remote, credentials)?;
        let pipeline = Pipeline::new(config.clone(), store, Some(&config_dir));

        Ok(Self {
            config_dir,
            config,
            pipeline: Arc::new(pipeline),
        })
    }

    /// 清理资源（退出时调用）
    pub async fn cleanup(&self) {
        tracing::info!("正在清理应用资源...");
        self.pipeline.stop().await;
        tracing::info!("资源清理完成");
    }
}

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        }
    }
}
