//! gatehouse: a self-hosted reverse proxy gateway
//!
//! Built on Cloudflare's Pingora framework. Host and virtual-directory
//! endpoints, access control, SSO gates and root routing are handled by the
//! `proxy` crate; this binary wires them into listeners and background tasks.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{Config, ReloadManager};
use pingora::prelude::*;
use pingora_core::listeners::tls::TlsSettings;
use pingora_proxy::http_proxy_service;
use proxy::{wait_for_requests_drain, Dispatcher, GatehouseProxy, TlsBehaviorResolver};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tls::SniResolver;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "gatehouse")]
#[command(author, version, about = "Self-hosted reverse proxy gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "gatehouse.toml")]
    config: PathBuf,

    /// Log level, overrides `global.log_level`
    #[arg(short, long)]
    log_level: Option<String>,

    /// Watch config file and auto-reload on changes
    #[arg(short, long)]
    watch: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Run {
        #[arg(short, long, default_value = "gatehouse.toml")]
        config: PathBuf,
        #[arg(short, long)]
        watch: bool,
    },
    /// Validate configuration and exit
    Validate {
        #[arg(short, long, default_value = "gatehouse.toml")]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Validate { config }) => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"))?;
            validate_config(&config)
        }
        Some(Commands::Run { config, watch }) => run_server(config, watch, cli.log_level),
        None => run_server(cli.config, cli.watch, cli.log_level),
    }
}

fn init_logging(level: &str) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

fn run_server(config_path: PathBuf, watch_config: bool, log_level: Option<String>) -> Result<()> {
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(log_level.as_deref().unwrap_or(&config.global.log_level))?;
    info!(config = ?config_path, watch = watch_config, "Starting gatehouse");

    let dispatcher = Arc::new(
        Dispatcher::from_config(&config).context("Failed to build request dispatcher")?,
    );
    info!(
        endpoints = dispatcher.registry().range(proxy::ProxyType::Subdomain).len(),
        redirects = config.redirects.len(),
        "Configuration loaded"
    );

    let mut server = Server::new(None).context("Failed to create Pingora server")?;
    server.bootstrap();

    let gateway = GatehouseProxy::new(dispatcher.clone())
        .with_metrics_path(config.global.metrics_path.clone());
    if let Some(path) = &config.global.metrics_path {
        info!(path = %path, "Serving metrics");
    }

    for listen_addr in &config.global.listen {
        let addr = normalize_addr(listen_addr);
        let mut service = http_proxy_service(&server.configuration, gateway.clone());
        service.add_tcp(&addr);
        info!(address = %addr, "Listening (HTTP)");
        server.add_service(service);
    }

    if config.tls.enabled {
        let tls_behavior = Arc::new(TlsBehaviorResolver::new(dispatcher.registry().clone()));
        for listen_addr in &config.tls.listen {
            let addr = normalize_addr(listen_addr);
            let resolver = SniResolver::new(config.tls.default_cert.clone())
                .with_behavior_source(tls_behavior.clone());
            let loaded = resolver
                .load_dir(&config.tls.cert_dir)
                .with_context(|| format!("Failed to load certificates from {:?}", config.tls.cert_dir))?;
            if loaded == 0 {
                warn!(address = %addr, "No certificates available, TLS handshakes will fail");
            }

            let mut settings = TlsSettings::with_callbacks(Box::new(resolver))
                .context("Failed to build TLS settings")?;
            settings.enable_h2();

            let mut service = http_proxy_service(&server.configuration, gateway.clone());
            service.add_tls_with_settings(&addr, None, settings);
            info!(address = %addr, certificates = loaded, "Listening (HTTPS)");
            server.add_service(service);
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reload_manager = if watch_config {
        match ReloadManager::new(&[&config_path]) {
            Ok(manager) => {
                info!("Config file watcher enabled, changes will trigger auto-reload");
                Some(manager)
            }
            Err(e) => {
                warn!(error = %e, "Failed to watch config file, hot reload disabled");
                None
            }
        }
    } else {
        None
    };

    spawn_background_tasks(
        dispatcher,
        Duration::from_secs(config.global.captcha_gc_interval_secs.max(1)),
        reload_manager,
        config_path,
        shutdown_rx,
    );

    let grace_period = Duration::from_secs(config.global.grace_period);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, draining in-flight requests");
        let _ = shutdown_tx.send(true);

        if wait_for_requests_drain(grace_period) {
            info!("All requests drained");
        } else {
            warn!("Grace period expired, some requests may be cut off");
        }

        info!("Shutdown complete");
        std::process::exit(0);
    })
    .context("Failed to install signal handler")?;

    info!("gatehouse started");
    server.run_forever();
}

/// Rate-limit counter reset, CAPTCHA session GC and config hot reload
fn spawn_background_tasks(
    dispatcher: Arc<Dispatcher>,
    captcha_gc_interval: Duration,
    reload_manager: Option<ReloadManager>,
    config_path: PathBuf,
    shutdown_rx: watch::Receiver<bool>,
) {
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Runtime::new() {
            Ok(rt) => rt,
            Err(e) => {
                error!(error = %e, "Failed to create tokio runtime for background tasks");
                return;
            }
        };

        rt.block_on(async move {
            let mut tasks = vec![
                dispatcher.rate_limiter().spawn_reset_task(shutdown_rx.clone()),
                dispatcher
                    .captcha()
                    .spawn_gc_task(captcha_gc_interval, shutdown_rx.clone()),
            ];

            if let Some(manager) = reload_manager {
                let dispatcher = dispatcher.clone();
                tasks.push(manager.start(shutdown_rx.clone(), move |_changed: &Path| {
                    reload(&dispatcher, &config_path)
                }));
            }

            for task in tasks {
                if let Err(e) = task.await {
                    error!(error = %e, "Background task panicked");
                }
            }
        });
    });
}

fn reload(dispatcher: &Dispatcher, config_path: &Path) {
    match Config::load(config_path) {
        Ok(config) => match dispatcher.reload(&config) {
            Ok(()) => info!(endpoints = dispatcher.registry().range(proxy::ProxyType::Subdomain).len(), "Configuration reloaded"),
            Err(e) => error!(error = %e, "Failed to apply new configuration, keeping old one"),
        },
        Err(e) => error!(error = %e, "Failed to parse new configuration, keeping old one"),
    }
}

fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    println!("Configuration is valid!");
    for addr in &config.global.listen {
        println!("  Listen: {}", addr);
    }
    if config.tls.enabled {
        for addr in &config.tls.listen {
            println!("  Listen (TLS): {}", addr);
        }
    }
    println!("  Endpoints: {}", config.endpoints.len());
    for endpoint in &config.endpoints {
        println!("  - {} -> {} origins", endpoint.matching, endpoint.origins.len());
    }
    println!("  Redirects: {}", config.redirects.len());
    println!("  Root: {}", if config.root.is_some() { "configured" } else { "none" });

    Ok(())
}
