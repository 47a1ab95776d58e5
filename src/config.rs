//! 应用配置模块
//!
//! 所有配置保存在配置目录的 `config.json` 中，按 section 分开：
//! `"pipeline"` 为上传流水线，`"log"` 为日志。

use crate::core::conflict::ConflictPolicy;
use crate::core::lock_retry::LockRetrySettings;
use crate::core::upload::UploadSettings;
use crate::core::verify::VerifySettings;
use crate::storage::AuthType;
use anyhow::{bail, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// 读取 config.json 中的一个 section，缺失或无法解析时返回 None
pub fn read_section<T: DeserializeOwned>(config_dir: &Path, key: &str) -> Option<T> {
    let content = fs::read_to_string(config_dir.join("config.json")).ok()?;
    let config = serde_json::from_str::<serde_json::Value>(&content).ok()?;
    let section = config.get(key)?;
    match serde_json::from_value::<T>(section.clone()) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("配置项 \"{}\" 无法解析，使用默认值: {}", key, e);
            None
        }
    }
}

/// 更新 config.json 中的一个 section，保留其余内容
pub fn write_section<T: Serialize>(config_dir: &Path, key: &str, value: &T) -> io::Result<()> {
    let config_file = config_dir.join("config.json");

    // 读取现有配置
    let mut config: serde_json::Value = if config_file.exists() {
        let content = fs::read_to_string(&config_file)?;
        serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
    } else {
        serde_json::json!({})
    };

    config[key] = serde_json::to_value(value).map_err(io::Error::other)?;

    let content = serde_json::to_string_pretty(&config).map_err(io::Error::other)?;
    fs::write(&config_file, content)
}

/// 默认配置目录，`data_path` 指向已存在的目录时改用它
pub fn resolve_config_dir() -> PathBuf {
    let default_config_dir = crate::dirs::config_dir()
        .map(|p| p.join("labbridge"))
        .unwrap_or_else(|| PathBuf::from(".labbridge"));

    fs::read_to_string(default_config_dir.join("config.json"))
        .ok()
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
        .and_then(|config| config.get("data_path")?.as_str().map(PathBuf::from))
        .filter(|p| p.is_dir())
        .inspect(|p| tracing::debug!("使用自定义数据路径: {:?}", p))
        .unwrap_or(default_config_dir)
}

/// 块大小分档：文件大小不超过 `up_to` 时使用 `chunk_size`，`up_to` 为空表示不限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkTier {
    #[serde(default)]
    pub up_to: Option<u64>,
    pub chunk_size: u64,
}

pub fn default_chunk_tiers() -> Vec<ChunkTier> {
    vec![
        ChunkTier { up_to: Some(MIB), chunk_size: 32 * KIB },
        ChunkTier { up_to: Some(100 * MIB), chunk_size: 256 * KIB },
        ChunkTier { up_to: Some(GIB), chunk_size: MIB },
        ChunkTier { up_to: None, chunk_size: 4 * MIB },
    ]
}

/// 远程服务器配置（凭据不落盘）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    /// WebDAV 地址，或本地/挂载目录
    #[serde(default)]
    pub url: String,
    /// 远程根目录
    #[serde(default)]
    pub base_path: String,
    #[serde(default)]
    pub auth_type: AuthType,
    /// 是否保留本地子目录结构
    #[serde(default = "default_true")]
    pub preserve_structure: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            base_path: String::new(),
            auth_type: AuthType::default(),
            preserve_structure: true,
        }
    }
}

/// 上传流水线配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    #[serde(default)]
    pub watch_dir: PathBuf,
    #[serde(default = "default_true")]
    pub recursive: bool,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// 定期全量扫描间隔（秒），0 表示禁用
    #[serde(default)]
    pub rescan_interval_secs: u64,
    #[serde(default = "default_true")]
    pub scan_existing_on_start: bool,

    /// 文件大小保持不变多久视为写入完成
    #[serde(default = "default_stability_window_ms")]
    pub stability_window_ms: u64,
    #[serde(default = "default_stability_tick_ms")]
    pub stability_tick_ms: u64,

    #[serde(default = "default_lock_initial_wait_secs")]
    pub lock_initial_wait_secs: u64,
    #[serde(default = "default_lock_retry_interval_secs")]
    pub lock_retry_interval_secs: u64,
    #[serde(default = "default_lock_max_attempts")]
    pub lock_max_attempts: u32,

    #[serde(default = "default_chunk_tiers")]
    pub chunk_tiers: Vec<ChunkTier>,
    /// 达到此大小使用分块上传
    #[serde(default = "default_range_upload_threshold")]
    pub range_upload_threshold: u64,
    #[serde(default = "default_chunk_max_retries")]
    pub chunk_max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_progress_step_percent")]
    pub progress_step_percent: u8,

    #[serde(default = "default_accessibility_probe_bytes")]
    pub accessibility_probe_bytes: u64,
    /// 不超过此大小时下载完整内容校验，0 表示从不下载
    #[serde(default)]
    pub full_hash_fallback_max_bytes: u64,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_cache_evict_batch")]
    pub cache_evict_batch: usize,
    /// 缓存和上传历史的定期保存间隔（秒）
    #[serde(default = "default_persist_interval_secs")]
    pub persist_interval_secs: u64,
    #[serde(default)]
    pub verify_history_on_start: bool,

    #[serde(default)]
    pub remote: RemoteConfig,
}

fn default_true() -> bool {
    true
}

fn default_extensions() -> Vec<String> {
    ["raw", "wiff", "sld", "mzml"].iter().map(|s| s.to_string()).collect()
}

fn default_stability_window_ms() -> u64 {
    1000
}

fn default_stability_tick_ms() -> u64 {
    500
}

fn default_lock_initial_wait_secs() -> u64 {
    1800 // 30 分钟
}

fn default_lock_retry_interval_secs() -> u64 {
    30
}

fn default_lock_max_attempts() -> u32 {
    20
}

fn default_range_upload_threshold() -> u64 {
    10 * MIB
}

fn default_chunk_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

fn default_progress_step_percent() -> u8 {
    25
}

fn default_accessibility_probe_bytes() -> u64 {
    8192
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_cache_evict_batch() -> usize {
    100
}

fn default_persist_interval_secs() -> u64 {
    300
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            watch_dir: PathBuf::new(),
            recursive: true,
            extensions: default_extensions(),
            rescan_interval_secs: 0,
            scan_existing_on_start: true,
            stability_window_ms: default_stability_window_ms(),
            stability_tick_ms: default_stability_tick_ms(),
            lock_initial_wait_secs: default_lock_initial_wait_secs(),
            lock_retry_interval_secs: default_lock_retry_interval_secs(),
            lock_max_attempts: default_lock_max_attempts(),
            chunk_tiers: default_chunk_tiers(),
            range_upload_threshold: default_range_upload_threshold(),
            chunk_max_retries: default_chunk_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            progress_step_percent: default_progress_step_percent(),
            accessibility_probe_bytes: default_accessibility_probe_bytes(),
            full_hash_fallback_max_bytes: 0,
            conflict_policy: ConflictPolicy::default(),
            cache_capacity: default_cache_capacity(),
            cache_evict_batch: default_cache_evict_batch(),
            persist_interval_secs: default_persist_interval_secs(),
            verify_history_on_start: false,
            remote: RemoteConfig::default(),
        }
    }
}

/// 超出范围时截断并记录警告
fn clamp_field<T: PartialOrd + Copy + std::fmt::Display>(name: &str, value: &mut T, min: T, max: T) {
    let clamped = if *value < min {
        min
    } else if *value > max {
        max
    } else {
        *value
    };
    if clamped != *value {
        warn!("配置 {} = {} 超出范围 [{}, {}]，使用 {}", name, value, min, max, clamped);
        *value = clamped;
    }
}

impl PipelineConfig {
    /// 从配置文件加载流水线配置
    pub fn load(config_dir: &Path) -> Self {
        read_section(config_dir, "pipeline").unwrap_or_default()
    }

    /// 保存流水线配置
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        write_section(config_dir, "pipeline", self)
    }

    /// 校验配置：数值截断到合法范围，结构性错误直接返回
    pub fn validate(&mut self) -> Result<()> {
        if self.watch_dir.as_os_str().is_empty() {
            bail!("未配置监控目录 (pipeline.watchDir)");
        }
        if self.remote.url.trim().is_empty() {
            bail!("未配置远程地址 (pipeline.remote.url)");
        }

        clamp_field("stabilityWindowMs", &mut self.stability_window_ms, 100, 600_000);
        clamp_field("stabilityTickMs", &mut self.stability_tick_ms, 50, 10_000);
        clamp_field("lockMaxAttempts", &mut self.lock_max_attempts, 1, 1000);
        clamp_field("lockRetryIntervalSecs", &mut self.lock_retry_interval_secs, 1, 3600);
        clamp_field("chunkMaxRetries", &mut self.chunk_max_retries, 0, 10);
        clamp_field("retryBaseDelayMs", &mut self.retry_base_delay_ms, 1, 60_000);
        clamp_field("progressStepPercent", &mut self.progress_step_percent, 1, 100);
        clamp_field("accessibilityProbeBytes", &mut self.accessibility_probe_bytes, 1, 64 * KIB);
        clamp_field("cacheCapacity", &mut self.cache_capacity, 10, 1_000_000);
        let capacity = self.cache_capacity;
        clamp_field("cacheEvictBatch", &mut self.cache_evict_batch, 1, capacity);
        clamp_field("persistIntervalSecs", &mut self.persist_interval_secs, 5, 86_400);

        Self::check_tiers(&self.chunk_tiers)
    }

    /// 分档必须按上限严格递增、块大小不递减，只有最后一档可以不设上限
    fn check_tiers(tiers: &[ChunkTier]) -> Result<()> {
        if tiers.is_empty() {
            bail!("chunkTiers 不能为空");
        }
        for (i, tier) in tiers.iter().enumerate() {
            if tier.chunk_size == 0 {
                bail!("chunkTiers[{}] 的块大小为 0", i);
            }
            if tier.up_to.is_none() && i + 1 != tiers.len() {
                bail!("chunkTiers[{}] 未设上限，只能是最后一档", i);
            }
        }
        for (i, pair) in tiers.windows(2).enumerate() {
            let (a, b) = (pair[0], pair[1]);
            if let (Some(x), Some(y)) = (a.up_to, b.up_to) {
                if y <= x {
                    bail!("chunkTiers[{}] 的上限必须大于前一档", i + 1);
                }
            }
            if b.chunk_size < a.chunk_size {
                bail!("chunkTiers[{}] 的块大小不能小于前一档", i + 1);
            }
        }
        Ok(())
    }

    pub fn stability_window(&self) -> Duration {
        Duration::from_millis(self.stability_window_ms)
    }

    pub fn stability_tick(&self) -> Duration {
        Duration::from_millis(self.stability_tick_ms)
    }

    pub fn rescan_interval(&self) -> Option<Duration> {
        (self.rescan_interval_secs > 0).then(|| Duration::from_secs(self.rescan_interval_secs))
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs)
    }

    pub fn lock_settings(&self) -> LockRetrySettings {
        LockRetrySettings {
            initial_wait: Duration::from_secs(self.lock_initial_wait_secs),
            retry_interval: Duration::from_secs(self.lock_retry_interval_secs),
            max_attempts: self.lock_max_attempts,
        }
    }

    pub fn upload_settings(&self) -> UploadSettings {
        UploadSettings {
            chunk_tiers: self.chunk_tiers.clone(),
            range_threshold: self.range_upload_threshold,
            max_retries: self.chunk_max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            progress_step_percent: self.progress_step_percent,
        }
    }

    pub fn verify_settings(&self) -> VerifySettings {
        VerifySettings {
            probe_bytes: self.accessibility_probe_bytes,
            full_hash_max_bytes: self.full_hash_fallback_max_bytes,
        }
    }
}
