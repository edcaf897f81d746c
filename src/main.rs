use anyhow::{Context, Result};
use clap::Parser;
use gpsclock::clock::SystemClock;
use gpsclock::config::SystemConfig;
use gpsclock::dashboard::{self, DashboardState};
use gpsclock::fetch::HttpPageSource;
use gpsclock::poll::PollLoop;
use gpsclock::reference::{ReferenceTimeClient, SntpSource};
use gpsclock::snapshot::SnapshotStore;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file (defaults to ./config.yaml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override source.target_url
    #[arg(long)]
    target_url: Option<String>,

    /// Override poll.interval_sec
    #[arg(long)]
    interval: Option<f64>,

    /// Run a single poll cycle, print the snapshot as JSON and exit
    #[arg(long)]
    once: bool,
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();

    // 1. Configuration
    let (config_path, required) = match &args.config {
        Some(p) => (p.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };
    let mut cfg = SystemConfig::load(&config_path, required)?;
    if let Some(url) = args.target_url {
        cfg.source.target_url = url;
    }
    if let Some(interval) = args.interval {
        cfg.poll.interval_sec = interval;
    }
    let settings = cfg.validate().context("invalid configuration")?;
    let poll_interval = settings.interval;
    info!("Source: {} ({})", cfg.source.target_url, cfg.source.css_selector);

    // 2. State
    let runtime_file = cfg.runtime_file_path();
    if let Some(path) = &runtime_file {
        info!("Runtime file: {}", path.display());
    }
    let store = Arc::new(SnapshotStore::restore(runtime_file));

    // 3. Sources
    let page = HttpPageSource::new(&cfg.source.target_url, cfg.request_timeout())?;
    let reference = ReferenceTimeClient::new(
        SntpSource::new(&cfg.reference.ntp_server, cfg.ntp_timeout()),
        SystemClock,
        cfg.ntp_refresh(),
    );
    let mut poll = PollLoop::new(page, reference, SystemClock, store.clone(), settings);

    if args.once {
        let outcome = poll.run_cycle();
        info!("Cycle outcome: {:?}", outcome);
        println!("{}", serde_json::to_string_pretty(&store.read())?);
        return Ok(());
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received. Finishing current cycle...");
        r.store(false, Ordering::SeqCst);
    })?;

    // 4. Dashboard listener. Bound before polling starts so a taken port aborts startup.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    let listener = if cfg.dashboard.enabled {
        let addr = (cfg.dashboard.bind_host.clone(), cfg.dashboard.bind_port);
        let listener = runtime
            .block_on(tokio::net::TcpListener::bind(addr))
            .with_context(|| {
                format!(
                    "binding dashboard to {}:{}",
                    cfg.dashboard.bind_host, cfg.dashboard.bind_port
                )
            })?;
        Some(listener)
    } else {
        None
    };

    // 5. Poll loop
    let poll_running = running.clone();
    let poll_thread = thread::Builder::new()
        .name("poller".to_string())
        .spawn(move || poll.run(poll_running))?;

    notify_supervisor_ready();

    match listener {
        Some(listener) => {
            let state = DashboardState {
                store: store.clone(),
                config: Arc::new(cfg),
                poll_interval,
                running: running.clone(),
            };
            if let Err(e) = runtime.block_on(dashboard::serve(listener, state)) {
                error!("Dashboard failed: {:#}", e);
                running.store(false, Ordering::SeqCst);
            }
        }
        None => {
            while running.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(100));
            }
        }
    }

    notify_supervisor_stopping();
    if poll_thread.join().is_err() {
        error!("Poll thread panicked");
    }
    if let Err(e) = store.flush() {
        warn!("Could not flush snapshot on shutdown: {:#}", e);
    }

    info!("Exiting.");
    Ok(())
}

#[cfg(unix)]
fn notify_supervisor_ready() {
    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        warn!("sd_notify READY failed: {}", e);
    }
}

#[cfg(unix)]
fn notify_supervisor_stopping() {
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
}

#[cfg(not(unix))]
fn notify_supervisor_ready() {}

#[cfg(not(unix))]
fn notify_supervisor_stopping() {}
