//! Command line interface for the relay query cache. Serves the caching HTTP
//! endpoint, runs one-off relay queries, manages local profiles, and publishes
//! signed events.

mod cache;
mod config;
mod error;
mod event;
mod fetcher;
mod keyer;
mod keys;
mod profiles;
mod publish;
mod relay;
mod server;

use std::{fs, net::SocketAddr, path::Path, sync::Arc};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cache::QueryCache;
use config::{LogFormat, Settings};
use error::Error;
use event::Event;
use fetcher::{FetchMode, Fetcher, QueryResult};
use keys::Keys;
use profiles::ProfileStore;
use publish::Publisher;
use relay::{PublishReport, WsPool};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "relaycache",
    author,
    version,
    about = "Caching query proxy and publishing client for Nostr relays"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Launch the caching HTTP service.
    Serve,
    /// Run one uncached query and print the JSON result.
    Query {
        /// Nostr filter as a JSON object.
        #[arg(long)]
        filter: String,
        /// Relay to ask; repeat for several. Defaults to `RELAYS_DEFAULT`.
        #[arg(long = "relay")]
        relays: Vec<String>,
        /// Return only the first matching event.
        #[arg(long)]
        single: bool,
    },
    /// Print a freshly generated keypair.
    Keygen,
    /// Manage local profiles.
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
    /// Sign an event with the active profile and send it to `RELAYS_DEFAULT`.
    Publish {
        #[command(subcommand)]
        action: PublishAction,
    },
}

/// Operations available under `relaycache profile`.
#[derive(Subcommand)]
enum ProfileAction {
    /// Store a profile from its nsec.
    Add {
        nsec: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Forget a profile.
    Remove { npub: String },
    /// List stored profiles; the active one is marked with `*`.
    List,
    /// Make a stored profile the active one.
    Use { npub: String },
}

/// Event kinds available under `relaycache publish`.
#[derive(Subcommand)]
enum PublishAction {
    /// Text note.
    Note { content: String },
    /// Profile metadata given as a JSON object.
    Metadata { json: String },
    Follow { npub: String },
    Unfollow { npub: String },
    /// React to an event, `+` unless `--content` is given.
    React {
        event_id: String,
        author: String,
        #[arg(long)]
        content: Option<String>,
    },
    /// Repost an event given as JSON.
    Repost { event_json: String },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    match cli.command {
        Commands::Serve => {
            let addr: SocketAddr = cfg.bind_http.as_str().parse()?;
            let cache = QueryCache::new(fetcher(&cfg), cfg.cache_ttl);
            info!(
                ttl_secs = cfg.cache_ttl.as_secs(),
                timeout_secs = cfg.fetch_timeout.as_secs(),
                "starting query cache"
            );
            server::serve_http(addr, cache, shutdown_signal()).await?;
        }
        Commands::Query {
            filter,
            relays,
            single,
        } => {
            let filter: Value = serde_json::from_str(&filter).context("parsing --filter")?;
            let relays = if relays.is_empty() {
                cfg.relays_default.clone()
            } else {
                relays
            };
            if relays.is_empty() {
                bail!("no relays given and RELAYS_DEFAULT is empty");
            }
            let mode = FetchMode::from_single_flag(single);
            let result = match fetcher(&cfg).fetch(&relays, &filter, mode).await {
                Ok(result) => result,
                Err(Error::RelayUnreachable { .. }) => QueryResult::empty(mode),
                Err(e) => return Err(e.into()),
            };
            println!("{}", serde_json::to_string(&result)?);
        }
        Commands::Keygen => {
            let keys = Keys::generate();
            println!("{}", json!({"nsec": keys.nsec()?, "npub": keys.npub()?}));
        }
        Commands::Profile { action } => {
            handle_profile(action, &ProfileStore::new(&cfg.profile_store))?;
        }
        Commands::Publish { action } => handle_publish(action, &cfg).await?,
    }
    Ok(())
}

fn fetcher(cfg: &Settings) -> Fetcher {
    let pool = WsPool::new(cfg.tor_socks.clone(), cfg.fetch_timeout);
    Fetcher::new(Arc::new(pool))
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutting down");
    }
}

fn handle_profile(action: ProfileAction, store: &ProfileStore) -> anyhow::Result<()> {
    match action {
        ProfileAction::Add { nsec, name } => {
            let profile = store.add(&nsec, name)?;
            println!("{}", profile.npub);
        }
        ProfileAction::Remove { npub } => {
            if !store.remove(&npub)? {
                bail!("profile not found: {npub}");
            }
        }
        ProfileAction::List => {
            let active = store.active()?.map(|p| p.npub);
            for p in store.list()? {
                let marker = if active.as_deref() == Some(p.npub.as_str()) {
                    "*"
                } else {
                    " "
                };
                match &p.name {
                    Some(name) => println!("{marker} {} {name}", p.npub),
                    None => println!("{marker} {}", p.npub),
                }
            }
        }
        ProfileAction::Use { npub } => store.set_active(&npub)?,
    }
    Ok(())
}

async fn handle_publish(action: PublishAction, cfg: &Settings) -> anyhow::Result<()> {
    let store = ProfileStore::new(&cfg.profile_store);
    let Some(profile) = store.active()? else {
        bail!(
            "no active profile in {}; add one with `relaycache profile add`",
            store.path().display()
        );
    };
    if cfg.relays_default.is_empty() {
        bail!("RELAYS_DEFAULT is empty");
    }
    let keys = profile.keys()?;
    let pool = WsPool::new(cfg.tor_socks.clone(), cfg.fetch_timeout);
    let publisher = Publisher::new(Arc::new(pool), cfg.relays_default.clone());
    let published = match action {
        PublishAction::Note { content } => Some(publisher.note(&keys, &content).await?),
        PublishAction::Metadata { json } => {
            let metadata: Value = serde_json::from_str(&json).context("parsing metadata")?;
            Some(publisher.metadata(&keys, &metadata).await?)
        }
        PublishAction::Follow { npub } => Some(publisher.follow(&keys, &npub).await?),
        PublishAction::Unfollow { npub } => publisher.unfollow(&keys, &npub).await?,
        PublishAction::React {
            event_id,
            author,
            content,
        } => Some(
            publisher
                .react(&keys, &event_id, &author, content.as_deref())
                .await?,
        ),
        PublishAction::Repost { event_json } => {
            let original: Event = serde_json::from_str(&event_json).context("parsing event")?;
            original.verify()?;
            Some(publisher.repost(&keys, &original).await?)
        }
    };
    if let Some((event, report)) = published {
        print_published(&event, &report)?;
    }
    Ok(())
}

fn print_published(event: &Event, report: &PublishReport) -> anyhow::Result<()> {
    let out = json!({"id": event.id, "report": report});
    println!("{}", serde_json::to_string(&out)?);
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let profile_store = config::env_dir(path).join("profiles.json");
    let mut content = String::new();
    content.push_str("BIND_HTTP=127.0.0.1:7777\n");
    content.push_str(&format!("CACHE_TTL_SECS={}\n", cache::DEFAULT_TTL.as_secs()));
    content.push_str(&format!(
        "FETCH_TIMEOUT_SECS={}\n",
        relay::DEFAULT_TIMEOUT.as_secs()
    ));
    content.push_str("RELAYS_DEFAULT=wss://relay.damus.io\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str(&format!(
        "PROFILE_STORE={}\n",
        profile_store.to_string_lossy()
    ));
    content.push_str("LOG_FORMAT=compact\n");
    fs::write(env_path, content)?;
    Ok(())
}

/// Install the global subscriber. Logs go to stderr so command output on
/// stdout stays machine readable.
fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relaycache=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    if let Err(e) = installed {
        eprintln!("tracing already initialised: {e}");
    }
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    ensure_env_file(&cli.env)?;
    let format = Settings::from_env(&cli.env)
        .map(|cfg| cfg.log_format)
        .unwrap_or(LogFormat::Compact);
    init_tracing(format);
    run(cli).await
}
