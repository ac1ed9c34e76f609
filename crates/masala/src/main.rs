use std::{net::IpAddr, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use dht::{DEFAULT_REALM, DhtBuilder, DhtConfig, DhtTunables, Id20, LocalRecord};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Parser)]
#[command(version, author, about)]
struct Opts {
    /// The loglevel. RUST_LOG overrides it.
    #[arg(value_enum, short = 'v', long = "log-level")]
    log_level: Option<LogLevel>,

    /// UDP address to listen on [default: [::]:8337]
    #[arg(long = "listen-addr")]
    listen_addr: Option<SocketAddr>,

    /// host:port of a node to join through. Can be repeated.
    #[arg(long = "bootstrap")]
    bootstrap: Vec<String>,

    #[arg(long = "realm", default_value = DEFAULT_REALM)]
    realm: String,

    /// Where the host identity is kept [default: in the user cache dir]
    #[arg(long = "identity-file")]
    identity_file: Option<PathBuf>,

    /// Use this node id instead of the one derived from the identity file.
    #[arg(long = "node-id")]
    node_id: Option<Id20>,

    /// Announce a name, optionally with the address to serve, e.g.
    /// "printer.p2p" or "printer.p2p=192.0.2.7". Can be repeated.
    #[arg(long = "announce")]
    announce: Vec<String>,

    /// Look a name up, print the address and exit.
    #[arg(long = "lookup")]
    lookup: Option<String>,

    /// How long to let the routing table fill before --lookup, e.g. 3s.
    #[arg(long = "lookup-warmup", default_value = "3s", value_parser = parse_duration::parse)]
    lookup_warmup: Duration,

    /// How often local names are announced again, e.g. 5m.
    #[arg(long = "announce-interval", value_parser = parse_duration::parse)]
    announce_interval: Option<Duration>,

    /// How long other nodes keep our announces, e.g. 30m.
    #[arg(long = "announce-ttl", value_parser = parse_duration::parse)]
    announce_ttl: Option<Duration>,
}

fn init_logging(opts: &Opts) -> anyhow::Result<()> {
    let default_rust_log = match opts.log_level.as_ref() {
        Some(level) => match level {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        },
        None => "info",
    };
    let stderr_filter = match std::env::var("RUST_LOG").ok() {
        Some(rust_log) => EnvFilter::builder()
            .parse(&rust_log)
            .context("can't parse RUST_LOG")?,
        None => EnvFilter::builder()
            .parse(default_rust_log)
            .context("can't parse default log level")?,
    };

    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_filter(stderr_filter))
        .try_init()
        .context("can't init logging")?;
    Ok(())
}

fn parse_announce(realm: &str, value: &str) -> anyhow::Result<LocalRecord> {
    let (name, addr) = match value.split_once('=') {
        Some((name, addr)) => {
            let addr: IpAddr = addr
                .parse()
                .with_context(|| format!("invalid address in {value:?}"))?;
            (name, Some(addr))
        }
        None => (value, None),
    };
    LocalRecord::new(Some(realm), name, addr).with_context(|| format!("can't announce {value:?}"))
}

fn dht_config(opts: &Opts, cancellation_token: CancellationToken) -> anyhow::Result<DhtConfig> {
    let records = opts
        .announce
        .iter()
        .map(|a| parse_announce(&opts.realm, a))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let identity_file = match (&opts.identity_file, opts.node_id) {
        (Some(path), _) => Some(path.clone()),
        (None, Some(_)) => None,
        (None, None) => Some(dht::default_identity_path()?),
    };

    let defaults = DhtTunables::default();
    let tunables = DhtTunables {
        announce_interval: opts.announce_interval.unwrap_or(defaults.announce_interval),
        announce_ttl: opts.announce_ttl.unwrap_or(defaults.announce_ttl),
        ..defaults
    };
    tunables.validate()?;

    Ok(DhtConfig {
        node_id: opts.node_id,
        identity_file,
        listen_addr: opts.listen_addr,
        bootstrap_addrs: (!opts.bootstrap.is_empty()).then(|| opts.bootstrap.clone()),
        realm: Some(opts.realm.clone()),
        records,
        tunables,
        cancellation_token: Some(cancellation_token),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    init_logging(&opts)?;

    let token = CancellationToken::new();
    let config = dht_config(&opts, token.clone())?;
    let dht = DhtBuilder::with_config(config)
        .await
        .context("error starting DHT")?;
    info!(id = ?dht.id(), listen_addr = ?dht.listen_addr(), "DHT running");

    if let Some(name) = opts.lookup.as_deref() {
        tokio::time::sleep(opts.lookup_warmup).await;
        let result = dht.lookup_name(name)?.wait().await;
        token.cancel();
        match result {
            Some(addr) => {
                println!("{addr}");
                return Ok(());
            }
            None => bail!("{name} not found"),
        }
    }

    let mut stats_interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            r = tokio::signal::ctrl_c() => {
                r.context("error waiting for ctrl-c")?;
                info!("received ctrl-c, shutting down");
                break;
            }
            _ = token.cancelled() => {
                warn!("DHT stopped");
                break;
            }
            _ = stats_interval.tick() => {
                info!(stats = ?dht.stats(), "DHT stats");
            }
        }
    }
    token.cancel();
    Ok(())
}
