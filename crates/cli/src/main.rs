use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use recon_api::{Client, DEFAULT_SOCKET_PATH};
use recon_core::now_ms;
use recon_core::prelude::*;
use recon_runtime::ControllerStatus;
use recon_store::State;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "reconctl", version, about = "Recon operator CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Daemon socket
    #[arg(long = "socket-path", env = "RECON_SOCKET_PATH", global = true, default_value = DEFAULT_SOCKET_PATH)]
    socket_path: PathBuf,

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
    /// Show one resource, addressed as namespace/type/id
    Get { resource: ResourceRef },
    /// List resources of one type in a namespace
    List {
        namespace: String,
        #[arg(value_name = "TYPE")]
        kind: String,
        /// Label selector, e.g. "app=web,tier!=db"
        #[arg(short = 'l', long = "selector", default_value = "")]
        selector: LabelSelector,
    },
    /// Create a resource
    Create {
        resource: ResourceRef,
        /// Spec as a JSON document
        #[arg(long = "spec", default_value = "{}")]
        spec: String,
        /// Label as key=value (repeatable)
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
        /// Finalizer (repeatable)
        #[arg(long = "finalizer")]
        finalizers: Vec<String>,
    },
    /// Replace a resource's spec and merge labels, guarded by its version
    Update {
        resource: ResourceRef,
        #[arg(long = "expected-version")]
        expected_version: Version,
        #[arg(long = "spec")]
        spec: Option<String>,
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
    },
    /// Destroy a resource (tombstones it while finalizers remain)
    Destroy {
        resource: ResourceRef,
        #[arg(long = "expected-version")]
        expected_version: Version,
    },
    /// Stream changes for one type in a namespace until Ctrl-C
    Watch {
        namespace: String,
        #[arg(value_name = "TYPE")]
        kind: String,
        /// Only this id
        #[arg(long = "id")]
        id: Option<String>,
        #[arg(short = 'l', long = "selector", default_value = "")]
        selector: LabelSelector,
        /// Replay current state first
        #[arg(long = "bootstrap", action = ArgAction::SetTrue)]
        bootstrap: bool,
        /// Resume after this version (with --id) or collection bookmark
        #[arg(long = "from-version")]
        from_version: Option<u64>,
    },
    /// Show registered controllers and their health
    Controllers,
}

fn init_tracing() {
    let env = std::env::var("RECON_LOG").unwrap_or_else(|_| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got {s:?}")),
    }
}

fn parse_spec(raw: &str) -> Result<serde_json::Value> { serde_json::from_str(raw).context("--spec is not valid JSON") }

fn render_age(created_ms: i64) -> String {
    if created_ms <= 0 {
        return "-".to_string();
    }
    let mut secs = ((now_ms() - created_ms).max(0) / 1000) as u64;
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

fn event_mark(kind: EventKind) -> char {
    match kind {
        EventKind::Bootstrap => '=',
        EventKind::Created => '+',
        EventKind::Updated => '~',
        EventKind::Destroyed => '-',
    }
}

fn print_table(items: &[Resource]) {
    println!("{:<40} {:>8} {:<13} {}", "NAMESPACE/TYPE/ID", "VERSION", "PHASE", "AGE");
    for r in items {
        let m = &r.metadata;
        println!("{:<40} {:>8} {:<13} {}", m.reference().to_string(), m.version, m.phase.to_string(), render_age(m.created_ms));
    }
}

fn print_controllers(list: &[ControllerStatus]) {
    println!(
        "{:<24} {:<8} {:<9} {:>6} {:>8} {:>10} {:>8} {:<6}",
        "NAME", "STATE", "HEALTH", "QUEUE", "INFLIGHT", "RECONCILES", "FAILURES", "REMOTE"
    );
    for s in list {
        println!(
            "{:<24} {:<8} {:<9} {:>6} {:>8} {:>10} {:>8} {:<6}",
            s.name,
            s.state.to_string(),
            s.health.to_string(),
            s.queue_depth,
            s.in_flight,
            s.reconciles,
            s.failures,
            if s.remote { "yes" } else { "no" }
        );
        for c in &s.conditions {
            println!("  ! {} failed {} times: {}", c.resource, c.failures, c.message);
        }
    }
}

fn emit<T: serde::Serialize>(output: Output, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    match output {
        Output::Human => human(value),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let client = Client::connect(&cli.socket_path)
        .await
        .with_context(|| format!("connecting to {}", cli.socket_path.display()))?;
    let out = cli.output;

    match cli.command {
        Commands::Get { resource } => {
            let r = client.get(&resource).await?;
            emit(out, &r, |r| print_table(std::slice::from_ref(r)))?;
        }
        Commands::List { namespace, kind, selector } => {
            let items = client.list(&namespace, &kind, &selector).await?;
            emit(out, &items, |items| print_table(items))?;
        }
        Commands::Create { resource, spec, labels, finalizers } => {
            let mut r = Resource::new(resource.namespace, resource.kind, resource.id, parse_spec(&spec)?);
            for (k, v) in labels {
                r = r.with_label(k, v);
            }
            for f in finalizers {
                r = r.with_finalizer(f);
            }
            let created = client.create(r).await?;
            info!(resource = %created.reference(), "create ok");
            emit(out, &created, |r| print_table(std::slice::from_ref(r)))?;
        }
        Commands::Update { resource, expected_version, spec, labels } => {
            let mut next = client.get(&resource).await?;
            if let Some(spec) = spec {
                next.spec = parse_spec(&spec)?;
            }
            next.metadata.labels.extend(labels);
            let updated = client.update(next, expected_version).await?;
            emit(out, &updated, |r| print_table(std::slice::from_ref(r)))?;
        }
        Commands::Destroy { resource, expected_version } => {
            let outcome = client.destroy(&resource, expected_version).await?;
            emit(out, &outcome, |o| match o {
                DestroyOutcome::Destroyed(r) => println!("destroyed {} at version {}", r.reference(), r.version()),
                DestroyOutcome::TearingDown(r) => {
                    println!("tearing down {}; waiting on finalizers: {}", r.reference(), r.metadata.finalizers.join(", "))
                }
            })?;
        }
        Commands::Watch { namespace, kind, id, selector, bootstrap, from_version } => {
            let opts = WatchOptions { id, selector, bootstrap, from_version };
            let mut stream = client.watch(&namespace, &kind, opts).await?;
            loop {
                tokio::select! {
                    next = stream.next() => match next {
                        Some(Ok(ev)) => match out {
                            Output::Human => println!("{} {} v{} @{}", event_mark(ev.kind), ev.resource.reference(), ev.version(), ev.bookmark),
                            Output::Json => println!("{}", serde_json::to_string(&ev)?),
                        },
                        Some(Err(e)) => return Err(e).context("watch failed"),
                        None => {
                            warn!("watch ended by the daemon");
                            break;
                        }
                    },
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; closing watch");
                        break;
                    }
                }
            }
        }
        Commands::Controllers => {
            let list = client.controllers().await?;
            emit(out, &list, |l| print_controllers(l))?;
        }
    }
    Ok(())
}
