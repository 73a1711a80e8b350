use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kubeward_api::{services, sync_wait_from_env, ClusterConfig, ClusterHub, KubeSensor};
use kubeward_core::{Ack, ObjectIdentity, Params, ResourceKind};
use kubeward_kinds::{daemon_set_json, EntityView};
use kubeward_kubehub::{ApiClient, KubeApiClient, MockCluster};
use kubeward_store::{EntityChange, EntityHandle};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kubewardctl", version, about = "Kubernetes objects as health entities")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Restrict to one namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Run against a seeded in-memory cluster instead of the current kube context
    #[arg(long = "mock", global = true, action = ArgAction::SetTrue, env = "KUBEWARD_MOCK")]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Supported kinds and their services
    Kinds,
    /// List entities of a kind after the initial sync
    Ls {
        /// Kind, e.g. "DaemonSet", "ds" or "apps/v1/Deployment"
        kind: String,
    },
    /// Print entity changes for a kind until Ctrl-C
    Watch {
        kind: String,
    },
    /// Set a container image
    SetImage {
        kind: String,
        /// "namespace/name", or "name" with --ns
        target: String,
        #[arg(long)]
        container: String,
        #[arg(long)]
        image: String,
    },
    /// Scale a Deployment
    Scale {
        target: String,
        #[arg(long)]
        replicas: i64,
    },
    /// Invoke any service by name, e.g. `call ds kube-system/proxy set_image_daemon_set -p container=proxy -p image=v2`
    Call {
        kind: String,
        target: String,
        service: String,
        /// key=value, repeatable
        #[arg(short = 'p', long = "param")]
        params: Vec<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("KUBEWARD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KUBEWARD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KUBEWARD_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_kind(s: &str) -> Result<ResourceKind> {
    ResourceKind::from_str(s).map_err(|e| anyhow!(e))
}

fn parse_target(kind: ResourceKind, target: &str, ns: Option<&str>) -> Result<ObjectIdentity> {
    match target.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Ok(ObjectIdentity::new(kind, ns, name)),
        Some(_) => bail!("invalid target {:?}; expected namespace/name", target),
        None => Ok(ObjectIdentity::new(kind, ns.unwrap_or("default"), target)),
    }
}

fn parse_params(pairs: &[String]) -> Result<Params> {
    let mut out = Params::new();
    for p in pairs {
        let (k, v) = p.split_once('=').ok_or_else(|| anyhow!("invalid param {:?}; expected key=value", p))?;
        out.insert(k.trim().to_string(), serde_json::Value::from(v));
    }
    Ok(out)
}

async fn connect(mock: bool) -> Result<Arc<dyn ApiClient>> {
    if mock {
        let cluster: Arc<dyn ApiClient> = seeded_mock()?;
        return Ok(cluster);
    }
    let cfg = ClusterConfig::from_env();
    let client = KubeApiClient::try_default().await?.with_watch_timeout(cfg.watch.watch_timeout_secs);
    Ok(Arc::new(client))
}

fn seeded_mock() -> Result<Arc<MockCluster>> {
    let cluster = MockCluster::new();
    cluster.apply(ResourceKind::DaemonSet, daemon_set_json("kube-system", "kube-proxy", "", 3, 3))?;
    cluster.apply(ResourceKind::DaemonSet, daemon_set_json("monitoring", "node-exporter", "", 3, 2))?;
    cluster.apply(
        ResourceKind::Deployment,
        serde_json::json!({
            "metadata": { "name": "web", "namespace": "default", "creationTimestamp": "2024-05-01T10:00:00Z" },
            "spec": { "replicas": 2, "template": { "spec": { "containers": [ { "name": "app", "image": "nginx:1.25" } ] } } },
            "status": { "availableReplicas": 2, "readyReplicas": 2, "updatedReplicas": 2 }
        }),
    )?;
    Ok(cluster)
}

fn summary(s: &KubeSensor) -> String {
    let attrs = s.extra_attributes();
    let pair = |a: &str, b: &str| format!("{}/{}", attrs.get(a).cloned().unwrap_or_default(), attrs.get(b).cloned().unwrap_or_default());
    match s.kind() {
        ResourceKind::DaemonSet => pair("pods_available", "current_pods_scheduled"),
        ResourceKind::Deployment => pair("available_replicas", "replicas"),
    }
}

fn print_ack(output: Output, ack: &Ack) -> Result<()> {
    match output {
        Output::Human => match &ack.resource_version {
            Some(rv) => println!("accepted (resourceVersion {})", rv),
            None => println!("accepted"),
        },
        Output::Json => println!("{}", serde_json::to_string_pretty(ack)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.clone();

    match cli.command {
        Commands::Kinds => {
            match cli.output {
                Output::Human => {
                    for kind in ResourceKind::ALL {
                        println!("{}", kind.gvk_key());
                        for s in services(kind) {
                            let schema: Vec<String> = s.schema.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
                            println!("  {} ({})", s.service, schema.join(", "));
                        }
                    }
                }
                Output::Json => {
                    let all: Vec<_> = ResourceKind::ALL
                        .iter()
                        .map(|k| serde_json::json!({ "kind": k.gvk_key(), "services": services(*k) }))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&all)?);
                }
            }
        }
        Commands::Ls { kind } => {
            let kind = parse_kind(&kind)?;
            info!(kind = %kind, ns = ?ns, "ls invoked");
            let hub = ClusterHub::new(connect(cli.mock).await?, ClusterConfig::from_env().with_namespace(ns));
            let (tx, mut rx) = mpsc::unbounded_channel::<Vec<KubeSensor>>();
            let wait = sync_wait_from_env();
            tokio::time::timeout(wait, hub.start_listener(kind, move |batch| { let _ = tx.send(batch); }, |_: Arc<EntityHandle>| {}, KubeSensor::new))
                .await
                .with_context(|| format!("{} not synced within {:?}", kind, wait))??;
            let mut sensors = Vec::new();
            while let Ok(batch) = rx.try_recv() {
                sensors.extend(batch);
            }

            match cli.output {
                Output::Human => {
                    println!("{:<16} {:<28} {:<6} {:<8} {}", "NAMESPACE", "NAME", "OK", "READY", "AGE");
                    for s in sensors.iter() {
                        let snap = s.handle().snapshot();
                        println!("{:<16} {:<28} {:<6} {:<8} {}", snap.identity.namespace, snap.identity.name, s.state(), summary(s), render_age(snap.creation_ts));
                    }
                }
                Output::Json => {
                    let rows: Vec<_> = sensors
                        .iter()
                        .map(|s| serde_json::json!({ "entity_id": s.entity_id(), "state": s.state(), "icon": s.icon(), "attributes": s.extra_attributes() }))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
            hub.shutdown().await;
        }
        Commands::Watch { kind } => {
            let kind = parse_kind(&kind)?;
            info!(kind = %kind, ns = ?ns, "watch invoked");
            let hub = ClusterHub::new(connect(cli.mock).await?, ClusterConfig::from_env().with_namespace(ns));
            let (tx, mut rx) = mpsc::unbounded_channel::<EntityChange>();
            let observer = move |change: &EntityChange| {
                let _ = tx.send(change.clone());
            };
            hub.subscribe(kind, Arc::new(observer));

            let outcome = loop {
                tokio::select! {
                    maybe = rx.recv() => {
                        let Some(change) = maybe else { break Ok(()) };
                        if let EntityChange::Failed { kind, message } = &change {
                            break Err(anyhow!("{} watch failed: {}", kind, message));
                        }
                        print_change(cli.output, &change)?;
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break Ok(());
                    }
                }
            };
            hub.shutdown().await;
            outcome?;
        }
        Commands::SetImage { kind, target, container, image } => {
            let kind = parse_kind(&kind)?;
            let id = parse_target(kind, &target, ns.as_deref())?;
            let hub = ClusterHub::new(connect(cli.mock).await?, ClusterConfig::from_env());
            let mut params = Params::new();
            params.insert("container".to_string(), container.into());
            params.insert("image".to_string(), image.into());
            let ack = hub
                .dispatch(kubeward_core::MutationRequest::new(id.clone(), "set_image", params))
                .await
                .with_context(|| format!("set_image on {}", id))?;
            print_ack(cli.output, &ack)?;
        }
        Commands::Scale { target, replicas } => {
            let id = parse_target(ResourceKind::Deployment, &target, ns.as_deref())?;
            let hub = ClusterHub::new(connect(cli.mock).await?, ClusterConfig::from_env());
            let mut params = Params::new();
            params.insert("replicas".to_string(), replicas.into());
            let ack = hub
                .dispatch(kubeward_core::MutationRequest::new(id.clone(), "scale", params))
                .await
                .with_context(|| format!("scale on {}", id))?;
            print_ack(cli.output, &ack)?;
        }
        Commands::Call { kind, target, service, params } => {
            let kind = parse_kind(&kind)?;
            let id = parse_target(kind, &target, ns.as_deref())?;
            let params = parse_params(&params)?;
            let hub = ClusterHub::new(connect(cli.mock).await?, ClusterConfig::from_env());
            let ack = hub.call_service(id.clone(), &service, params).await.with_context(|| format!("{} on {}", service, id))?;
            print_ack(cli.output, &ack)?;
        }
    }

    Ok(())
}

fn print_change(output: Output, change: &EntityChange) -> Result<()> {
    let (mark, handle) = match change {
        EntityChange::Created(h) => ("+", h),
        EntityChange::Updated(h) => ("~", h),
        EntityChange::Retired(h) => ("-", h),
        EntityChange::Synced(kind) => {
            if output == Output::Human {
                eprintln!("# {} synced", kind);
            }
            return Ok(());
        }
        EntityChange::Failed { .. } => return Ok(()),
    };
    match output {
        Output::Human => println!("{} {} {} {}", mark, handle.identity(), handle.state(), handle.icon()),
        Output::Json => {
            let line = serde_json::json!({ "change": mark, "entity_id": handle.entity_id(), "state": handle.state(), "attributes": handle.extra_attributes() });
            println!("{}", serde_json::to_string(&line)?);
        }
    }
    Ok(())
}

fn render_age(creation_ts: i64) -> String {
    if creation_ts <= 0 { return "-".to_string(); }
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
    let mut secs = (now - creation_ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
