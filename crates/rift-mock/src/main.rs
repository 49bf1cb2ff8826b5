//! Rift mock server - CLI entry point

use anyhow::{Context, Result};
use clap::Parser;
use rift_mock::config::{LogFormat, ServerConfig};
use rift_mock::observe::{PrometheusObserver, RequestLog};
use rift_mock::reload::{FsWatcher, ReloadCoordinator};
use rift_mock::{server, EngineOptions, MockEngine, YamlDirectorySource};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "rift-mock",
    about = "Programmable HTTP/WebSocket/SSE mock server with live-reloaded rules",
    version
)]
struct Args {
    /// Path to the server configuration file
    #[arg(short, long, env = "RIFT_MOCK_CONFIG")]
    config: Option<PathBuf>,

    /// Listen port
    #[arg(short, long, env = "RIFT_MOCK_PORT")]
    port: Option<u16>,

    /// Listen host
    #[arg(long, env = "RIFT_MOCK_HOST")]
    host: Option<String>,

    /// Rule directory (repeatable); replaces the configured directories
    #[arg(short, long = "rules", value_name = "DIR")]
    rules: Vec<PathBuf>,

    /// Active scenario
    #[arg(short, long, env = "RIFT_MOCK_SCENARIO")]
    scenario: Option<String>,

    /// Disable rule file watching
    #[arg(long)]
    no_watch: bool,

    /// Refuse to start when any rule fails validation
    #[arg(long)]
    strict: bool,
}

impl Args {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(port) = self.port {
            config.listen.port = port;
        }
        if let Some(host) = self.host {
            config.listen.host = host;
        }
        if !self.rules.is_empty() {
            config.rules.dirs = self.rules;
        }
        if self.scenario.is_some() {
            config.scenario = self.scenario;
        }
        if self.no_watch {
            config.reload.enabled = false;
        }
        if self.strict {
            config.validation.strict = true;
        }
    }
}

fn init_logging(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match config.log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServerConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;
    init_logging(&config);

    let source = YamlDirectorySource::new(config.rules.dirs.clone());
    let engine = Arc::new(MockEngine::new(
        Box::new(source),
        EngineOptions {
            observer: Arc::new(PrometheusObserver),
            tracker: Arc::new(RequestLog::new(config.tracker.capacity)),
            scenario: config.scenario.clone(),
            callback_timeout: Duration::from_secs(config.callbacks.timeout_secs),
            ..EngineOptions::default()
        },
    )?);

    info!("Script runtime: {}", engine.runtime().name());
    let report = engine.reload();
    if config.validation.strict && !report.is_clean() {
        anyhow::bail!(
            "{} rule validation issue(s) in strict mode",
            report.issues.len()
        );
    }

    // Both must stay alive for watching to continue
    let _reload = if config.reload.enabled {
        let (coordinator, handle) = ReloadCoordinator::spawn(
            engine.clone(),
            Duration::from_millis(config.reload.debounce_ms),
        );
        let watcher = FsWatcher::start(&config.rules.dirs, handle)
            .context("setting up rule directory watches")?;
        Some((coordinator, watcher))
    } else {
        info!("Rule reloading disabled");
        None
    };

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    server::serve(listener, engine, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;

    Ok(())
}
