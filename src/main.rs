use anyhow::Context;
use clap::Parser;
use labbridge_lib::config::{resolve_config_dir, PipelineConfig};
use labbridge_lib::logging::init_logging;
use labbridge_lib::storage::{create_store, AuthType, Credentials, RemoteStore, WebDavStore};
use labbridge_lib::AppState;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;

/// 监控仪器输出目录，把写入完成的文件上传到 WebDAV
#[derive(Debug, Parser)]
#[command(name = "labbridge", version, about)]
struct Cli {
    /// 配置目录（默认使用系统配置目录下的 labbridge）
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// 覆盖配置中的监控目录
    #[arg(long)]
    watch_dir: Option<PathBuf>,

    /// 覆盖配置中的远程地址
    #[arg(long)]
    remote_url: Option<String>,

    /// 覆盖配置中的远程根目录
    #[arg(long)]
    base_path: Option<String>,

    #[arg(long, env = "LABBRIDGE_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "LABBRIDGE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// basic 或 digest
    #[arg(long)]
    auth: Option<String>,

    /// 校验配置并测试远程连接后退出
    #[arg(long)]
    check: bool,

    /// 把命令行覆盖项写回配置文件
    #[arg(long)]
    save_config: bool,

    /// 以 JSON 行输出流水线事件
    #[arg(long)]
    json_events: bool,
}

impl Cli {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(dir) = &self.watch_dir {
            config.watch_dir = dir.clone();
        }
        if let Some(url) = &self.remote_url {
            config.remote.url = url.clone();
        }
        if let Some(base) = &self.base_path {
            config.remote.base_path = base.clone();
        }
        match self.auth.as_deref().map(str::to_lowercase).as_deref() {
            Some("digest") => config.remote.auth_type = AuthType::Digest,
            Some("basic") => config.remote.auth_type = AuthType::Basic,
            Some(other) => tracing::warn!("未知认证方式 {}，使用配置值", other),
            None => {}
        }
    }

    fn credentials(&self, auth_type: AuthType) -> Option<Credentials> {
        let username = self.username.clone()?;
        Some(Credentials {
            username,
            password: self.password.clone().unwrap_or_default(),
            auth_type,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_dir = cli.config_dir.clone().unwrap_or_else(resolve_config_dir);
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("无法创建配置目录: {}", config_dir.display()))?;
    init_logging(&config_dir);

    let mut config = PipelineConfig::load(&config_dir);
    cli.apply(&mut config);
    if cli.save_config {
        config.save(&config_dir)?;
        tracing::info!("配置已保存到 {}", config_dir.display());
    }

    let credentials = cli.credentials(config.remote.auth_type);

    if cli.check {
        config.validate()?;
        let result = if config.remote.url.starts_with("http") {
            let store = WebDavStore::new(&config.remote.url, credentials)?;
            store.test_connection().await.map(|_| store.name().to_string())
        } else {
            let store = create_store(&config.remote, credentials)?;
            store.stat("/").await.map(|_| store.name().to_string())
        };
        match result {
            Ok(name) => println!("连接成功: {}", name),
            Err(e) => anyhow::bail!("连接失败: {}", e),
        }
        return Ok(());
    }

    let state = AppState::new(config_dir, config, credentials)?;

    let mut events = state.pipeline.subscribe();
    let json_events = cli.json_events;
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if json_events {
                        if let Ok(line) = serde_json::to_string(&event) {
                            println!("{}", line);
                        }
                    }
                }
                Err(RecvError::Lagged(n)) => tracing::debug!("事件输出跳过 {} 条", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    state.pipeline.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("收到退出信号");

    state.cleanup().await;
    printer.abort();
    Ok(())
}
