use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use wsterm_core::{
    ActivityConfig, ActivityTracker, DisabledNotifier, HttpNotifier, Notifier, SecretLookup,
    ServerConfig, SessionConfig, run_server,
};

use crate::error::{AppError, Result};
use crate::realm::Realm;

pub const DEFAULT_ADDRESS: &str = "localhost:9000";

#[derive(Debug, Clone, Parser)]
#[command(
    name = "wsterm",
    about = "Serve an interactive terminal over a websocket",
    long_about = "Serve an interactive terminal over a websocket.\n\n\
                  Only the /pty websocket endpoint is served. Static files for the browser \
                  terminal are served separately.",
    version
)]
pub struct Cli {
    /// IP:PORT or HOST:PORT address to listen on.
    #[arg(long = "addr", default_value = DEFAULT_ADDRESS)]
    pub addr: String,

    /// Command to execute on the slave side of the pty.
    #[arg(long = "cmd", default_value = wsterm_core::pty_session::DEFAULT_COMMAND)]
    pub command: String,

    /// Path to an XML user list; enables basic auth when set.
    #[arg(long = "realm")]
    pub realm: Option<PathBuf>,

    /// Base URL of the workspace API receiving activity notifications.
    #[arg(long = "api-endpoint", env = "CHE_API_ENDPOINT")]
    pub api_endpoint: Option<String>,

    /// Workspace reported as active.
    #[arg(long = "workspace-id", env = "CHE_WORKSPACE_ID")]
    pub workspace_id: Option<String>,

    /// Minimum seconds between immediate activity notifications.
    #[arg(long = "activity-threshold-secs", default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub activity_threshold_secs: u64,

    /// Seconds between deferred activity flushes.
    #[arg(long = "activity-period-secs", default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    pub activity_period_secs: u64,

    /// Arguments passed to the command.
    #[arg(last = true)]
    pub args: Vec<String>,
}

impl Cli {
    /// The activity target, if both endpoint and workspace are configured.
    #[must_use]
    pub fn activity_config(&self) -> Option<ActivityConfig> {
        let endpoint = self.api_endpoint.as_deref().filter(|value| !value.is_empty())?;
        let workspace = self.workspace_id.as_deref().filter(|value| !value.is_empty())?;
        Some(
            ActivityConfig::new(endpoint, workspace)
                .threshold(Duration::from_secs(self.activity_threshold_secs))
                .flush_period(Duration::from_secs(self.activity_period_secs)),
        )
    }

    /// Session settings: the server's own environment plus `TERM=xterm`.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        let mut session = SessionConfig::with_command(&self.command)
            .args(self.args.iter().cloned())
            .inherit_env();
        if let Ok(cwd) = std::env::current_dir() {
            session = session.cwd(cwd);
        }
        session
    }

    /// # Errors
    ///
    /// Returns an error if the listen address does not resolve.
    pub fn server_config(&self) -> Result<ServerConfig> {
        ServerConfig {
            session: self.session_config(),
            ..ServerConfig::default()
        }
        .bind(&self.addr)
        .map_err(|source| AppError::Listen {
            addr: self.addr.clone(),
            source,
        })
    }
}

/// Parse the process arguments and serve until the listener fails.
pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    run(cli)
}

pub fn run(cli: Cli) -> Result<()> {
    let server_config = cli.server_config()?;

    let secrets: Option<Arc<dyn SecretLookup>> = match &cli.realm {
        Some(path) => Some(Arc::new(Realm::load(path)?)),
        None => None,
    };

    let (notifier, flush_period, threshold): (Arc<dyn Notifier>, Duration, Duration) =
        match cli.activity_config() {
            Some(config) => {
                let notifier = HttpNotifier::new(&config)?;
                info!(url = %notifier.url(), "reporting terminal activity");
                (Arc::new(notifier), config.flush_period, config.threshold)
            }
            None => {
                warn!("workspace API not configured; activity notifications disabled");
                (
                    Arc::new(DisabledNotifier),
                    Duration::from_secs(cli.activity_period_secs),
                    Duration::from_secs(cli.activity_threshold_secs),
                )
            }
        };
    let tracker = Arc::new(ActivityTracker::new(threshold, notifier));
    let flush_task = tracker.spawn_flush_task(flush_period)?;

    let result = run_server(server_config, tracker, secrets).map_err(|source| AppError::Listen {
        addr: cli.addr.clone(),
        source,
    });
    flush_task.stop();
    result
}
