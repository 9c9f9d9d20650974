mod config;
mod detector;
mod dispatch;
mod normalizer;
mod presence;
mod scrobbler;
mod source;
mod timer;
mod track;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{Config, LastFmConfig, ListenBrainzConfig, DEFAULT_LISTENBRAINZ_URL};
use dispatch::DispatchFanout;
use env_logger::WriteStyle;
use normalizer::Normalizer;
use presence::activity::ActivityBuilder;
use presence::ipc::DiscordIpc;
use presence::{PresenceEngine, PresenceHandle};
use scrobbler::ScrobbleEngine;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// Samples buffered between the reader and the dispatcher
const SAMPLE_QUEUE: usize = 64;
/// How long the presence engine gets to clear and close on shutdown
const PRESENCE_SHUTDOWN: Duration = Duration::from_secs(3);

/// Relay now-playing samples to scrobbling services and rich presence
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read samples and relay them (default)
    Run {
        /// NDJSON sample file; stdin when omitted
        #[arg(long, value_name = "PATH")]
        input: Option<PathBuf>,
    },
    /// Authorize a scrobbling service and store its credentials
    Auth {
        #[command(subcommand)]
        service: AuthService,
    },
    /// Show the configuration file location and contents
    Config,
}

#[derive(Subcommand, Debug)]
enum AuthService {
    /// Interactive Last.fm authorization; needs api_key and api_secret in the config
    Lastfm,
    /// Validate and store a ListenBrainz user token
    Listenbrainz {
        token: String,
        /// Instance name, for running several ListenBrainz-compatible services
        #[arg(long, default_value = "Primary")]
        name: String,
    },
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let style = if atty::is(atty::Stream::Stderr) {
        WriteStyle::Auto
    } else {
        WriteStyle::Never
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .write_style(style)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };
    let mut config = Config::load(&config_path)?;

    match cli.command.unwrap_or(Command::Run { input: None }) {
        Command::Run { input } => run(config, input),
        Command::Auth {
            service: AuthService::Lastfm,
        } => auth_lastfm(&mut config, &config_path),
        Command::Auth {
            service: AuthService::Listenbrainz { token, name },
        } => auth_listenbrainz(&mut config, &config_path, token, name),
        Command::Config => show_config(&config, &config_path),
    }
}

fn run(config: Config, input: Option<PathBuf>) -> Result<()> {
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let result = runtime.block_on(relay(config, input));
    // A stdin read may still be parked on a blocking thread
    runtime.shutdown_timeout(Duration::from_millis(500));
    result
}

async fn relay(config: Config, input: Option<PathBuf>) -> Result<()> {
    log::info!("Playback relay starting");

    let scrobble = ScrobbleEngine::new(scrobbler::build_sinks(&config), config.scrobble_threshold);

    let (presence, presence_task) = if config.presence.enabled {
        log::info!("Rich presence enabled");
        let engine = PresenceEngine::new(
            DiscordIpc::new(config.presence.client_id.clone()),
            ActivityBuilder::new(&config.presence),
        );
        let (handle, task) = PresenceHandle::spawn(engine);
        (Some(handle), Some(task))
    } else {
        (None, None)
    };

    let fanout = DispatchFanout::new(Normalizer::new(&config.cleanup), scrobble, presence);

    let (tx, rx) = mpsc::channel(SAMPLE_QUEUE);
    let reader = tokio::spawn(async move {
        if let Err(e) = source::read_samples(input.as_deref(), tx).await {
            log::error!("{:#}", e);
        }
    });

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    fanout.run(rx, shutdown).await;
    reader.abort();

    if let Some(task) = presence_task {
        if tokio::time::timeout(PRESENCE_SHUTDOWN, task).await.is_err() {
            log::warn!("Presence did not shut down in time");
        }
    }

    log::info!("Playback relay stopped");
    Ok(())
}

fn auth_lastfm(config: &mut Config, path: &Path) -> Result<()> {
    let lastfm = config.lastfm.get_or_insert_with(LastFmConfig::default);
    if lastfm.api_key.is_empty() || lastfm.api_secret.is_empty() {
        anyhow::bail!(
            "Set lastfm.api_key and lastfm.api_secret in {} first \
             (create an API account at https://www.last.fm/api/account/create)",
            path.display()
        );
    }

    let session = scrobbler::lastfm_auth::authenticate(&lastfm.api_key, &lastfm.api_secret)?;
    println!("Authorized as {}. Last.fm scrobbling enabled.", session.username);
    lastfm.session_key = session.key;
    lastfm.username = session.username;
    lastfm.enabled = true;

    config.save(path)
}

fn auth_listenbrainz(config: &mut Config, path: &Path, token: String, name: String) -> Result<()> {
    let existing = config.listenbrainz.iter().position(|lb| lb.name == name);
    let api_url = existing
        .map(|i| config.listenbrainz[i].api_url.clone())
        .unwrap_or_else(|| DEFAULT_LISTENBRAINZ_URL.to_string());

    scrobbler::listenbrainz::validate_token(&name, &token, &api_url)?;
    println!("Token accepted. ListenBrainz ({}) scrobbling enabled.", name);

    let entry = ListenBrainzConfig {
        enabled: true,
        name,
        token,
        api_url,
    };
    match existing {
        Some(i) => config.listenbrainz[i] = entry,
        None => config.listenbrainz.push(entry),
    }

    config.save(path)
}

fn show_config(config: &Config, path: &Path) -> Result<()> {
    println!("# {}", path.display());
    let content =
        toml::to_string_pretty(&config.redacted()).context("Failed to serialize config")?;
    println!("{}", content);
    Ok(())
}
