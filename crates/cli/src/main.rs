use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kinwatch::{StatusChangeRecord, TreeView, Watcher, WatcherConfig};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kinwatchctl", version, about = "Watch Deployment and Pod status changes")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Restrict to one namespace (default: all namespaces)
    #[arg(long = "ns", global = true, env = "KINWATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Path to a kubeconfig (default: in-cluster or $KUBECONFIG)
    #[arg(long = "kubeconfig", global = true, env = "KINWATCH_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    #[arg(long = "deployment-workers", global = true)]
    deployment_workers: Option<usize>,

    #[arg(long = "pod-workers", global = true)]
    pod_workers: Option<usize>,

    /// Keep a Deployment whose last Pod disappears instead of reporting it deleted
    #[arg(long = "no-infer-deletion", global = true, action = ArgAction::SetTrue)]
    no_infer_deletion: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Only { All, Deployment, Pod }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream status change records until interrupted
    Watch {
        #[arg(long = "kind", value_enum, default_value_t = Only::All)]
        kind: Only,
    },
    /// Print the Deployment/Pod hierarchy once the caches settle
    Tree {
        /// Seconds to let the initial events drain before printing
        #[arg(long = "settle", default_value_t = 5)]
        settle: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("KINWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KINWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KINWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

fn config(cli: &Cli) -> WatcherConfig {
    let mut cfg = WatcherConfig::from_env();
    if cli.namespace.is_some() {
        cfg.namespace = cli.namespace.clone();
    }
    if let Some(n) = cli.deployment_workers {
        cfg.deployment_workers = n;
    }
    if let Some(n) = cli.pod_workers {
        cfg.pod_workers = n;
    }
    if cli.no_infer_deletion {
        cfg.infer_deployment_deletion = false;
    }
    cfg
}

fn print_record(output: Output, rec: &StatusChangeRecord) {
    match output {
        Output::Human => {
            let parent = rec.parent_key.as_ref().map(|p| format!(" <- {p}")).unwrap_or_default();
            let reason = if rec.reason.is_empty() { String::new() } else { format!(" ({})", rec.reason.replace('\n', "; ")) };
            println!("{} {:<10} {}{} {}{}", rec.observed_at.format("%H:%M:%S"), rec.kind, rec.key, parent, rec.status, reason);
        }
        Output::Json => match serde_json::to_string(rec) {
            Ok(s) => println!("{s}"),
            Err(e) => warn!(error = %e, "failed to encode record"),
        },
    }
}

fn print_tree(nodes: &[TreeView], depth: usize) {
    for n in nodes {
        let reason = if n.reason.is_empty() { String::new() } else { format!(" ({})", n.reason.replace('\n', "; ")) };
        println!("{}{} {} {}{}", "  ".repeat(depth), n.kind, n.key, n.status, reason);
        print_tree(&n.children, depth + 1);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = config(&cli);
    let client = kinwatch_kubehub::client(cli.kubeconfig.as_deref()).await?;
    let watcher = Watcher::connect(client, cfg).await?;

    match cli.command {
        Commands::Watch { kind } => {
            let output = cli.output;
            if matches!(kind, Only::All | Only::Deployment) {
                watcher.add_deployment_callback(move |r| print_record(output, r));
            }
            if matches!(kind, Only::All | Only::Pod) {
                watcher.add_pod_callback(move |r| print_record(output, r));
            }
            info!(kinds = ?kind, "watching; ctrl-c to stop");
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
        }
        Commands::Tree { settle } => {
            tokio::time::sleep(Duration::from_secs(settle)).await;
            let tree = watcher.tree();
            match cli.output {
                Output::Human => print_tree(&tree, 0),
                Output::Json => println!("{}", serde_json::to_string_pretty(&tree)?),
            }
            info!(roots = tree.len(), nodes = watcher.cache().len(), "tree printed");
        }
    }

    watcher.close();
    watcher.wait().await;
    Ok(())
}
