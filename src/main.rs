use clap::Parser;
use devlight_lib::config::{parse_proxy_arg, DEFAULT_IGNORE_PATTERNS};
use devlight_lib::server::{LiveServer, ServerEvent, ServerInfo, SOCKET_PATH};
use devlight_lib::shutdown::{register_signal_handlers, ShutdownState};
use devlight_lib::{ConfigMerger, PartialSettings, ProjectType, ProxyRule, ServerConfig};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::broadcast;

/// devlight - live-reloading development server
#[derive(Parser, Debug)]
#[command(name = "devlight")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory to serve
    #[arg(default_value = ".")]
    root: PathBuf,

    /// Port to listen on (default 5500, 0 picks a free port)
    #[arg(long, short, env = "DEVLIGHT_PORT")]
    port: Option<u16>,

    /// Address to bind to (default 127.0.0.1)
    #[arg(long)]
    host: Option<String>,

    /// Serve over HTTPS (mkcert if installed, otherwise self-signed)
    #[arg(long)]
    https: bool,

    /// Serve the root index.html for unknown paths
    #[arg(long)]
    spa: bool,

    /// Disable on-page reload notifications
    #[arg(long)]
    no_overlay: bool,

    /// Open the default browser once the server is up
    #[arg(long)]
    open: bool,

    /// Only reload for changes matching this glob (repeatable)
    #[arg(long = "watch", value_name = "GLOB")]
    watch: Vec<String>,

    /// Never reload for changes matching this glob (repeatable)
    #[arg(long = "ignore", value_name = "GLOB")]
    ignore: Vec<String>,

    /// Forward a path prefix to another server, e.g. /api=http://localhost:8000
    #[arg(long = "proxy", value_name = "/PATH=URL", value_parser = parse_proxy_arg)]
    proxy: Vec<ProxyRule>,

    /// Hand serving to a framework dev server (vite, next, angular, ..., auto)
    #[arg(long, value_name = "NAME")]
    project_type: Option<ProjectType>,

    /// Settings file to use instead of <ROOT>/devlight.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

impl Cli {
    /// Flags that were actually given; unset flags leave lower layers alone
    fn to_settings(&self) -> PartialSettings {
        let ignore_patterns = (!self.ignore.is_empty()).then(|| {
            DEFAULT_IGNORE_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .chain(self.ignore.iter().cloned())
                .collect()
        });
        let proxy = (!self.proxy.is_empty()).then(|| {
            self.proxy
                .iter()
                .map(|rule| (rule.path.clone(), rule.target.clone()))
                .collect::<BTreeMap<_, _>>()
        });

        PartialSettings {
            port: self.port,
            host: self.host.clone(),
            https: self.https.then_some(true),
            spa: self.spa.then_some(true),
            show_overlay: self.no_overlay.then_some(false),
            open_browser: self.open.then_some(true),
            watch_patterns: (!self.watch.is_empty()).then(|| self.watch.clone()),
            ignore_patterns,
            proxy,
            project_type: self.project_type,
            hmr_timeout_secs: None,
            collab_max_documents: None,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(cli)) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let project = match &cli.config {
        Some(path) => Some(PartialSettings::load(path)?),
        None => PartialSettings::load_from_project(&cli.root)?,
    };
    let config = ConfigMerger::new(&cli.root)
        .with_project(project)
        .with_cli(Some(cli.to_settings()))
        .merge()?;

    let shutdown_state = ShutdownState::new();
    if let Err(e) = register_signal_handlers(shutdown_state.clone()) {
        log::warn!("Failed to register signal handlers: {}", e);
    }

    let mut server = LiveServer::new(config).with_shutdown_state(shutdown_state.clone());
    tokio::spawn(forward_events(server.subscribe()));

    let info = server.start().await?;
    print_banner(server.config(), &info, server.hmr_profile_name());

    if server.config().open_browser {
        open_browser(&info.url);
    }

    shutdown_state.wait().await;
    log::info!("Shutdown signal received, stopping server...");
    server.stop().await;
    Ok(())
}

/// Mirror lifecycle events into the log
async fn forward_events(mut events: broadcast::Receiver<ServerEvent>) {
    loop {
        match events.recv().await {
            Ok(ServerEvent::Started { port, https }) => {
                log::debug!("Server started (port {}, https: {})", port, https);
            }
            Ok(ServerEvent::FileChanged { relative_path }) => {
                log::debug!("Reload triggered by {}", relative_path);
            }
            Ok(ServerEvent::Error { message }) => log::error!("{}", message),
            Ok(ServerEvent::Stopped) => log::info!("Server stopped"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::debug!("Event forwarder skipped {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_banner(config: &ServerConfig, info: &ServerInfo, hmr_profile: Option<&str>) {
    let mode = match hmr_profile {
        Some(profile) => format!("proxying {} dev server", profile),
        None if config.spa_mode => "static (SPA fallback)".to_string(),
        None => "static".to_string(),
    };

    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║                          devlight                             ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  URL:     {:<51}║", info.url);
    println!("║  Root:    {:<51}║", config.root_path.display().to_string());
    println!("║  Mode:    {:<51}║", mode);
    for rule in &config.proxy_rules {
        println!("║  Proxy:   {:<51}║", format!("{} -> {}", rule.path, rule.target));
    }
    println!("║  Reload:  {:<51}║", SOCKET_PATH);
    println!("║                                                               ║");
    println!("║  Press Ctrl+C to stop                                         ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");
}

fn open_browser(url: &str) {
    #[cfg(target_os = "macos")]
    let result = std::process::Command::new("open").arg(url).spawn();
    #[cfg(target_os = "windows")]
    let result = std::process::Command::new("cmd")
        .args(["/C", "start", "", url])
        .spawn();
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let result = std::process::Command::new("xdg-open").arg(url).spawn();

    match result {
        Ok(_) => log::info!("Opened {} in the browser", url),
        Err(e) => log::warn!("Failed to open browser: {}", e),
    }
}
