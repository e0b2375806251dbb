//! Perch command line client: signs configured accounts on and logs the
//! protocol events they produce.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use perch_core::{
    AccountStore, ChannelHub, Event, EventKind, FeatureRegistry, Pattern,
    config::{self, Config},
    telemetry,
};
use perch_presence::presence_summary;
use perch_xmpp::{SessionError, SessionManager, TcpTransportFactory};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "perch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign accounts on and log traffic until interrupted
    Run {
        /// Account keys to sign on; defaults to every auto-login account
        #[arg(short, long)]
        account: Vec<String>,

        /// Also log raw wire data
        #[arg(long)]
        wire: bool,
    },
    /// List configured accounts
    Accounts,
    /// Print the configuration file path
    ConfigPath,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(config::config_path);

    if let Some(Commands::ConfigPath) = cli.command {
        println!("{}", path.display());
        return Ok(());
    }

    let config = config::load_config_from(path.clone())
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    telemetry::init(&config.logging).context("failed to initialise logging")?;

    match cli.command {
        Some(Commands::Accounts) => {
            list_accounts(&config);
            Ok(())
        }
        Some(Commands::Run { account, wire }) => run(config, &account, wire).await,
        Some(Commands::ConfigPath) | None => run(config, &[], false).await,
    }
}

fn list_accounts(config: &Config) {
    for account in config.accounts() {
        let login = if account.auto_login { "auto" } else { "manual" };
        let tls = if account.uses_tls() { "tls" } else { "plain" };
        println!("{:<12} {:<40} {login:<6} {tls}", account.key, account.jid());
    }
}

async fn run(config: Config, keys: &[String], wire: bool) -> Result<()> {
    let default_port = config.connection.default_port;
    let store = Arc::new(config);
    let hub = ChannelHub::new(FeatureRegistry::new());
    let (manager, receiver) = SessionManager::new(
        hub,
        Arc::clone(&store) as Arc<dyn AccountStore>,
        Arc::new(TcpTransportFactory),
        default_port,
    )
    .context("failed to create stanza log")?;
    let manager = Arc::new(manager);

    let channel = manager.create_channel();
    channel.on(Pattern::new(), move |event: &Event| {
        log_event(event, wire);
        Ok(())
    });

    let started = if keys.is_empty() {
        manager.auto_login()
    } else {
        let mut started = 0;
        for key in keys {
            let Some(account) = store.by_key(key) else {
                bail!("no account named {key:?} in configuration");
            };
            let jid = account.jid();
            manager
                .up(
                    &account,
                    Some(Box::new(move |result: Result<String, SessionError>| match result {
                        Ok(jid) => info!(%jid, "signed on"),
                        Err(error) => warn!(%jid, %error, "sign-on failed"),
                    })),
                )
                .with_context(|| format!("failed to sign {key} on"))?;
            started += 1;
        }
        started
    };
    if started == 0 {
        bail!("no accounts to sign on; pass --account or set auto_login");
    }

    let driver = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.run(receiver).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("interrupted, signing off");

    for (jid, _) in manager.sessions() {
        if let Ok(summary) = presence_summary(manager.cache(), Some(&jid), None) {
            info!(%jid, presence = %summary.stanza, "last own presence");
        }
        manager.down(&jid);
    }
    channel.release();
    driver.abort();
    Ok(())
}

fn log_event(event: &Event, wire: bool) {
    match event.kind {
        EventKind::Data if !wire => {}
        EventKind::Data | EventKind::Stream => {
            info!(session = %event.session, direction = %event.direction, event = %event.kind, "{:?}", event.payload);
        }
        _ => {
            if let Some(stanza) = event.as_stanza() {
                info!(session = %event.session, direction = %event.direction, "{stanza}");
            }
        }
    }
}
