//! Network Connection Manager Daemon (connctld)
//!
//! Discovers network services through the technology drivers, ranks them,
//! keeps the best one online and exposes control over the system bus.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (requires root)
//! sudo connctld
//!
//! # Verbose logging
//! sudo connctld --log-level debug
//! ```

use clap::Parser;
use libconnctl::config::ConnConfig;
use libconnctl::connection::{ConnectionManager, FileResolver};
use libconnctl::dbus::ConnDbusService;
use libconnctl::firewall::{FirewallManager, RawNetfilterSocket};
use libconnctl::inet::{self, Inet};
use libconnctl::service::{ServiceEvent, ServiceManager, ServiceState};
use libconnctl::session::SessionManager;
use libconnctl::sixtofour::SixToFour;
use libconnctl::storage::ServiceStore;
use libconnctl::technology::TechnologyRegistry;
use libconnctl::tether::TetheringManager;
use libconnctl::wispr::WisprManager;
use libconnctl::clock::Clock;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Network Connection Manager Daemon
#[derive(Parser, Debug)]
#[command(name = "connctld")]
#[command(author = "connctl contributors")]
#[command(version)]
#[command(about = "Network connection manager daemon", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file
    #[arg(short, long, default_value = "/etc/connctl/main.conf")]
    config: String,

    /// Per-service settings directory (overrides the config file)
    #[arg(long)]
    storage_dir: Option<String>,

    /// Disable the auto-connect policy
    #[arg(long)]
    no_autoconnect: bool,
}

// All components cooperate on one executor thread; parallelism is
// non-blocking I/O, never worker threads.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting connctld {}", libconnctl::VERSION);

    #[cfg(target_os = "linux")]
    {
        let uid = unsafe { libc::getuid() };
        if uid != 0 {
            warn!("not running as root - kernel operations will fail");
        }
    }

    let mut config = match ConnConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            warn!("config {} not loaded ({}), using defaults", args.config, e);
            ConnConfig::default()
        }
    };
    if let Some(dir) = &args.storage_dir {
        config.paths.storage_dir = dir.into();
    }
    config.ensure_directories()?;

    // Core components, leaves first.
    let inet = Inet::new()?;
    let firewall = Arc::new(FirewallManager::new(Box::new(RawNetfilterSocket::new()?)));

    let store = ServiceStore::new(&config.paths.storage_dir);
    let services = ServiceManager::new(store);
    services.start();

    let resolver = Arc::new(FileResolver::new("/run/connctl/resolv.conf"));
    let integrator = ConnectionManager::new(services.clone(), Arc::new(inet.clone()), resolver);
    integrator.start();

    let wispr = WisprManager::new(services.clone(), config.online_check.clone());
    wispr.start();

    let sixtofour = SixToFour::new(services.clone(), inet.clone());
    sixtofour.start();

    let tethering = Arc::new(TetheringManager::new(
        inet.clone(),
        firewall.clone(),
        config.tethering.clone(),
    ));

    let sessions = Arc::new(SessionManager::new(services.clone()));
    let technologies = Arc::new(TechnologyRegistry::new());
    let clock = Arc::new(Clock::new(config.clock.timeservers.clone()));

    spawn_default_follow(services.clone(), tethering.clone(), clock.clone());

    info!("Connecting to the system bus...");
    let _bus = match ConnDbusService::start(
        services.clone(),
        sessions,
        technologies,
        tethering.clone(),
        wispr.clone(),
        clock,
    )
    .await
    {
        Ok(bus) => {
            info!("D-Bus service ready");
            bus
        }
        Err(e) => {
            error!("D-Bus service failed to start: {}", e);
            error!("  - is another instance running?");
            error!("  - is the system bus available?");
            return Err(e.into());
        }
    };

    if !args.no_autoconnect {
        services.auto_connect().await;
    }

    wait_for_shutdown().await;

    info!("Shutting down");
    // Transient network state goes away with us.
    let _ = tethering.disable().await;
    for ident in services.services().await {
        let _ = services.disconnect(&ident).await;
    }

    info!("connctld stopped");
    Ok(())
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("libconnctl={0},connctld={0}", args.log_level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Keep the tethering uplink and the clock in step with the default
/// service.
fn spawn_default_follow(
    services: ServiceManager,
    tethering: Arc<TetheringManager>,
    clock: Arc<Clock>,
) {
    let mut events = services.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ServiceEvent::DefaultChanged { ident }) => {
                    let interface = match &ident {
                        Some(ident) => match services.snapshot(ident).await {
                            Ok(snapshot) if snapshot.index > 0 => {
                                inet::ifname(snapshot.index as u32).ok()
                            }
                            _ => None,
                        },
                        None => None,
                    };
                    tethering.update_interface(interface.as_deref()).await;
                }
                Ok(ServiceEvent::StateChanged { state, .. }) => {
                    if state == ServiceState::Online {
                        clock.sync().await;
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("signal handler setup failed: {}", e);
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
}
