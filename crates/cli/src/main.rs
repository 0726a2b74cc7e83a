use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use nswatch_core::{AggregatedEvent, ChangeKind, ResourceView, WatchConfig, WatchError, ALL_NAMESPACES};
use nswatch_fanin::WatchAggregator;
use nswatch_kubehub::{KubeTransport, ResourceTransformer};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "nswatchctl", version, about = "Watch one resource kind across many namespaces")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Reconnection attempts per namespace before giving up
    #[arg(long, global = true)]
    max_reconnect_attempts: Option<u32>,

    /// First reconnection delay in milliseconds
    #[arg(long, global = true)]
    reconnect_base_delay_ms: Option<u64>,

    /// Growth factor applied to the delay per attempt
    #[arg(long, global = true)]
    reconnect_backoff_multiplier: Option<f64>,

    /// Ceiling for a single reconnection delay in milliseconds
    #[arg(long, global = true)]
    reconnect_max_delay_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch objects of a GVK in the given namespaces and print events
    Watch {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        gvk: String,
        /// Comma-separated namespaces to watch
        #[arg(long = "ns", value_delimiter = ',')]
        namespaces: Vec<String>,
        /// Watch the whole collection instead of individual namespaces
        #[arg(short = 'A', long = "all-namespaces", action = ArgAction::SetTrue, conflicts_with = "namespaces")]
        all_namespaces: bool,
        /// Read namespace sets from stdin (one comma-separated list per line)
        #[arg(long = "follow-stdin", action = ArgAction::SetTrue)]
        follow_stdin: bool,
    },
    /// Print the effective reconnection settings
    Config,
}

fn init_tracing() {
    let env = std::env::var("NSWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("NSWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid NSWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

/// Env-derived defaults with command line flags on top.
fn effective_config(cli: &Cli) -> WatchConfig {
    let mut cfg = WatchConfig::from_env();
    if let Some(n) = cli.max_reconnect_attempts { cfg.max_reconnect_attempts = n; }
    if let Some(ms) = cli.reconnect_base_delay_ms { cfg.reconnect_base_delay = Duration::from_millis(ms); }
    if let Some(m) = cli.reconnect_backoff_multiplier.filter(|m| m.is_finite() && *m > 0.0) { cfg.reconnect_backoff_multiplier = m; }
    if let Some(ms) = cli.reconnect_max_delay_ms { cfg.reconnect_max_delay = Some(Duration::from_millis(ms)); }
    cfg
}

fn parse_namespace_line(line: &str) -> Vec<String> {
    line.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

enum Line {
    Event(AggregatedEvent<ResourceView>),
    Error(WatchError, String),
}

fn print_line(output: Output, line: &Line) -> Result<()> {
    match (output, line) {
        (Output::Json, Line::Event(ev)) => println!("{}", serde_json::to_string(ev)?),
        (Output::Json, Line::Error(err, ns)) => {
            println!("{}", serde_json::json!({ "namespace": ns, "error": err, "message": err.to_string() }))
        }
        (Output::Human, Line::Event(ev)) => {
            let sign = match ev.event.kind {
                ChangeKind::Added => '+',
                ChangeKind::Modified => '~',
                ChangeKind::Deleted => '-',
            };
            let r = &ev.event.resource;
            let key = match r.namespace.as_deref() {
                Some(ns) => format!("{}/{}", ns, r.name),
                None => r.name.clone(),
            };
            let lag_ms = (chrono::Utc::now() - ev.received_at).num_milliseconds();
            println!("{} {} [{}] rv={} uid={} lag_ms={}", sign, key, ev.namespace, r.resource_version.as_deref().unwrap_or("-"), uuid::Uuid::from_bytes(r.uid), lag_ms);
        }
        (Output::Human, Line::Error(err, ns)) => println!("! [{}] {}", ns, err),
    }
    Ok(())
}

async fn run_watch(output: Output, cfg: WatchConfig, gvk: String, namespaces: Vec<String>, all_namespaces: bool, follow_stdin: bool) -> Result<()> {
    let initial = if all_namespaces { vec![ALL_NAMESPACES.to_string()] } else { namespaces };
    if initial.is_empty() && !follow_stdin {
        return Err(anyhow!("no namespaces given (use --ns, --all-namespaces or --follow-stdin)"));
    }
    let transport = KubeTransport::for_gvk(&gvk).await?;
    if !transport.namespaced() && !all_namespaces {
        warn!(gvk = %gvk, "kind is cluster-scoped; each namespace entry watches the whole collection");
    }
    let agg: WatchAggregator<ResourceView> = WatchAggregator::new(Arc::new(transport), Arc::new(ResourceTransformer::default()), cfg);

    let (tx, mut rx) = mpsc::unbounded_channel::<Line>();
    {
        let tx = tx.clone();
        agg.on_event(move |ev| {
            tx.send(Line::Event(ev.clone())).map_err(|_| anyhow!("output closed"))
        });
    }
    agg.on_error(move |err, ns| {
        tx.send(Line::Error(err.clone(), ns.to_string())).map_err(|_| anyhow!("output closed"))
    });

    if !initial.is_empty() {
        agg.start_watching(initial).await?;
    }
    info!(gvk = %gvk, namespaces = ?agg.watched_namespaces(), active = agg.active_watch_count(), "watch running");

    let mut stdin_lines = follow_stdin.then(|| BufReader::new(tokio::io::stdin()).lines());
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("interrupt received; stopping");
                break;
            }
            maybe = rx.recv() => {
                match maybe {
                    Some(line) => print_line(output, &line)?,
                    None => break,
                }
            }
            next = async {
                match stdin_lines.as_mut() {
                    Some(lines) => lines.next_line().await,
                    None => std::future::pending().await,
                }
            } => {
                match next {
                    Ok(Some(line)) => {
                        let set = parse_namespace_line(&line);
                        info!(namespaces = ?set, "namespace set from stdin");
                        agg.update_namespaces(set).await?;
                    }
                    Ok(None) => {
                        info!("stdin closed; keeping current namespaces");
                        stdin_lines = None;
                    }
                    Err(e) => {
                        error!(error = %e, "reading stdin failed");
                        stdin_lines = None;
                    }
                }
            }
        }
    }
    agg.stop_all();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = effective_config(&cli);

    match cli.command {
        Commands::Watch { gvk, namespaces, all_namespaces, follow_stdin } => {
            info!(gvk = %gvk, namespaces = ?namespaces, all_namespaces, follow_stdin, "watch invoked");
            run_watch(cli.output, cfg, gvk, namespaces, all_namespaces, follow_stdin).await?;
        }
        Commands::Config => println!("{}", serde_json::to_string_pretty(&cfg)?),
    }
    Ok(())
}
