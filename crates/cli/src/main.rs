use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use kmirror_api::{Mirror, MirrorConfig, ResourceKind, INDEX_OWNER};
use kmirror_core::{key_of, DynamicObject, ListOptions, SharedObject};
use kmirror_kubehub::{EventHandler, KubeListWatch, LoggingHandler};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kmirrorctl", version, about = "Mirror a Kubernetes resource kind in memory and query it")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Restrict the mirror to one namespace (all namespaces by default)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Label selector passed to list and watch
    #[arg(short = 'l', long = "label-selector", global = true)]
    label_selector: Option<String>,

    /// Forced relist period in seconds (0 disables)
    #[arg(long = "resync-secs", global = true, env = "KMIRROR_RESYNC_SECS")]
    resync_secs: Option<u64>,

    /// How long to wait for the first full list
    #[arg(long = "sync-timeout-secs", global = true, env = "KMIRROR_SYNC_TIMEOUT_SECS")]
    sync_timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// Mirror a kind and list its objects
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        gvk: String,
    },
    /// Mirror a kind and print one object by key ("ns/name" or "name")
    Get { gvk: String, key: String },
    /// Mirror a kind and list objects owned by "ns/owner"
    Owned { gvk: String, owner: String },
    /// Mirror a kind and print +/~/- per change until Ctrl-C
    Watch { gvk: String },
}

fn init_tracing() {
    let env = std::env::var("KMIRROR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KMIRROR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KMIRROR_METRICS_ADDR; expected host:port");
        }
    }
}

/// Prints one line per change as the mirror applies it.
struct PrintHandler;

impl PrintHandler {
    fn line(sign: char, obj: &DynamicObject) {
        println!("{} {}", sign, key_of(obj).unwrap_or_else(|| "<unnamed>".into()));
    }
}

impl EventHandler for PrintHandler {
    fn on_add(&self, obj: &DynamicObject) -> Result<()> {
        Self::line('+', obj);
        Ok(())
    }

    fn on_update(&self, _old: &DynamicObject, new: &DynamicObject) -> Result<()> {
        Self::line('~', new);
        Ok(())
    }

    fn on_delete(&self, obj: &DynamicObject) -> Result<()> {
        Self::line('-', obj);
        Ok(())
    }
}

async fn build_mirror(cli: &Cli, gvk: &str, handler: Arc<dyn EventHandler>) -> Result<Mirror> {
    let client = kube::Client::try_default().await.context("building kube client")?;
    let (source, ar) = KubeListWatch::for_gvk(client, gvk, cli.namespace.as_deref()).await?;
    let mut config = MirrorConfig::from_env();
    if let Some(secs) = cli.resync_secs {
        config.resync_secs = secs;
    }
    if let Some(secs) = cli.sync_timeout_secs {
        config.sync_timeout_secs = secs;
    }
    let mut options = ListOptions::default();
    if let Some(sel) = &cli.label_selector {
        options = options.labels(sel);
    }
    let mut mirror = Mirror::new(config);
    mirror.register(ResourceKind::new(gvk, Arc::new(source)).shape(ar).handler(handler).options(options))?;
    Ok(mirror)
}

/// Start a quiet mirror for `gvk` and wait for its first list.
async fn synced_mirror(cli: &Cli, gvk: &str, cancel: &CancellationToken) -> Result<Mirror> {
    let mirror = build_mirror(cli, gvk, Arc::new(LoggingHandler)).await?;
    let timeout = mirror.config().sync_timeout();
    let report = mirror.start_and_wait_until_synced(cancel, timeout).await?;
    if !report.all_synced() {
        warn!(gvk = %gvk, "printing a partial view; kind did not sync in time");
    }
    Ok(mirror)
}

fn render_age(obj: &DynamicObject) -> String {
    let Some(ts) = obj.metadata.creation_timestamp.as_ref() else { return "-".to_string() };
    let mut secs = (Utc::now() - ts.0).num_seconds().max(0);
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}

fn print_objects(output: Output, mut items: Vec<SharedObject>) -> Result<()> {
    items.sort_by_key(|o| key_of(o));
    match output {
        Output::Human => {
            println!("{:<20} {:<40} AGE", "NAMESPACE", "NAME");
            for o in &items {
                let ns = o.metadata.namespace.as_deref().filter(|s| !s.is_empty()).unwrap_or("-");
                let name = o.metadata.name.as_deref().unwrap_or("");
                println!("{:<20} {:<40} {}", ns, name, render_age(o));
            }
        }
        Output::Json => {
            let objs: Vec<&DynamicObject> = items.iter().map(|o| o.as_ref()).collect();
            println!("{}", serde_json::to_string_pretty(&objs)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    match &cli.command {
        Commands::Discover => {
            let client = kube::Client::try_default().await.context("building kube client")?;
            let resources = kmirror_kubehub::discover(client).await?;
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        println!("{:<50} {}", r.gvk_key(), scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::Ls { gvk } => {
            info!(gvk = %gvk, ns = ?cli.namespace, "ls invoked");
            let mirror = synced_mirror(&cli, gvk, &cancel).await?;
            let items = match cli.namespace.as_deref() {
                Some(ns) => mirror.list_namespaced(gvk, ns),
                None => mirror.list(gvk),
            };
            print_objects(cli.output, items)?;
            mirror.shutdown().await;
        }
        Commands::Get { gvk, key } => {
            let mirror = synced_mirror(&cli, gvk, &cancel).await?;
            let found = mirror.get_by_key(gvk, key);
            mirror.shutdown().await;
            let Some(obj) = found else { bail!("{} {} not found", gvk, key) };
            println!("{}", serde_json::to_string_pretty(obj.as_ref())?);
        }
        Commands::Owned { gvk, owner } => {
            let mirror = synced_mirror(&cli, gvk, &cancel).await?;
            let items = mirror.index_lookup(gvk, INDEX_OWNER, owner)?;
            print_objects(cli.output, items)?;
            mirror.shutdown().await;
        }
        Commands::Watch { gvk } => {
            info!(gvk = %gvk, ns = ?cli.namespace, "watch invoked");
            let mirror = build_mirror(&cli, gvk, Arc::new(PrintHandler)).await?;
            mirror.start(&cancel)?;
            signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("Ctrl-C received; shutting down");
            cancel.cancel();
            mirror.shutdown().await;
        }
    }

    Ok(())
}
