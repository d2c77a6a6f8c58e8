use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tracing::{info, warn};
use vcsync_core::config::DEFAULT_PRIORITY_CLASS_CEILING;
use vcsync_core::{Identity, SyncConfig, TenantConfig};
use vcsync_dispatch::SyncDriver;
use vcsync_kubehub::KubeStore;
use vcsync_store::ObjectStore;
use vcsync_syncer::resources::builtin;
use vcsync_syncer::Reconciler;

#[derive(Parser, Debug)]
#[command(name = "vcsyncd", version, about = "Sync cluster-scoped objects between a virtual cluster and its host")]
struct Cli {
    #[command(flatten)]
    sync: SyncArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct SyncArgs {
    /// Host namespace the virtual cluster runs in
    #[arg(long = "host-namespace", env = "VCSYNC_HOST_NAMESPACE", global = true, default_value = "vcluster")]
    host_namespace: String,

    /// Per-instance suffix appended to every translated name
    #[arg(long = "suffix", env = "VCSYNC_SUFFIX", global = true, default_value = "vcluster")]
    suffix: String,

    #[arg(long = "sync-priority-classes", env = "VCSYNC_SYNC_PRIORITY_CLASSES", global = true, default_value_t = true, action = clap::ArgAction::Set)]
    sync_priority_classes: bool,

    #[arg(long = "sync-storage-classes", env = "VCSYNC_SYNC_STORAGE_CLASSES", global = true, default_value_t = false, action = clap::ArgAction::Set)]
    sync_storage_classes: bool,

    /// Highest priority value a tenant may set on the host
    #[arg(long = "priority-class-ceiling", env = "VCSYNC_PRIORITY_CLASS_CEILING", global = true, default_value_t = DEFAULT_PRIORITY_CLASS_CEILING)]
    priority_class_ceiling: i64,

    #[arg(long = "workers", env = "VCSYNC_WORKERS", global = true, default_value_t = 4)]
    workers: usize,

    /// Per store call deadline, in seconds
    #[arg(long = "op-timeout", env = "VCSYNC_OP_TIMEOUT_SECS", global = true, default_value_t = 10)]
    op_timeout_secs: u64,

    /// Full relist interval in seconds; 0 disables periodic resync
    #[arg(long = "resync-period", env = "VCSYNC_RESYNC_PERIOD_SECS", global = true, default_value_t = 300)]
    resync_period_secs: u64,

    /// First retry delay after a transient failure, in milliseconds
    #[arg(long = "backoff-initial", env = "VCSYNC_BACKOFF_INITIAL_MS", global = true, default_value_t = 1000)]
    backoff_initial_ms: u64,

    /// Retry delay cap, in seconds
    #[arg(long = "backoff-max", env = "VCSYNC_BACKOFF_MAX_SECS", global = true, default_value_t = 300)]
    backoff_max_secs: u64,

    /// Consecutive transient failures before an identity is reported as persistent
    #[arg(long = "persistent-after", env = "VCSYNC_PERSISTENT_AFTER", global = true, default_value_t = 10)]
    persistent_after: u32,
}

impl SyncArgs {
    fn to_config(&self) -> SyncConfig {
        let mut cfg = SyncConfig::new(TenantConfig::new(self.host_namespace.clone(), self.suffix.clone()));
        cfg.sync_priority_classes = self.sync_priority_classes;
        cfg.sync_storage_classes = self.sync_storage_classes;
        cfg.priority_class_ceiling = self.priority_class_ceiling;
        cfg.workers = self.workers;
        cfg.op_timeout = Duration::from_secs(self.op_timeout_secs);
        cfg.resync_period = Duration::from_secs(self.resync_period_secs);
        cfg.backoff_initial = Duration::from_millis(self.backoff_initial_ms);
        cfg.backoff_max = Duration::from_secs(self.backoff_max_secs);
        cfg.persistent_after = self.persistent_after;
        cfg
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the syncer until interrupted
    Run {
        /// Kubeconfig of the virtual cluster
        #[arg(long = "virtual-kubeconfig", env = "VCSYNC_VIRTUAL_KUBECONFIG")]
        virtual_kubeconfig: PathBuf,
    },
    /// Print the host object a virtual object maps to
    Translate {
        /// Kind key, e.g. "scheduling.k8s.io/v1/PriorityClass", or just the kind
        kind: String,
        name: String,
        /// Virtual namespace (namespaced kinds only)
        #[arg(long = "ns")]
        namespace: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("VCSYNC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VCSYNC_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid VCSYNC_METRICS_ADDR; expected host:port");
        }
    }
}

async fn virtual_client(path: &PathBuf) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path).with_context(|| format!("reading {}", path.display()))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    Ok(Client::try_from(config)?)
}

async fn run(cfg: SyncConfig, virtual_kubeconfig: PathBuf) -> Result<()> {
    let (mappers, syncers) = builtin(&cfg)?;
    let kinds: Vec<_> = syncers.kinds().cloned().collect();
    info!(
        host_namespace = %cfg.tenant.host_namespace,
        suffix = %cfg.tenant.suffix,
        kinds = kinds.len(),
        "starting"
    );

    let host_client = Client::try_default().await.context("host cluster client")?;
    let virtual_client = virtual_client(&virtual_kubeconfig).await.context("virtual cluster client")?;
    let host = KubeStore::connect(host_client, &kinds).await.context("host discovery")?;
    let virt = KubeStore::connect(virtual_client, &kinds).await.context("virtual discovery")?;
    host.start_watchers(Some(&cfg.tenant.host_namespace));
    virt.start_watchers(None);

    let virt: Arc<dyn ObjectStore> = Arc::new(virt);
    let host: Arc<dyn ObjectStore> = Arc::new(host);
    let reconciler = Arc::new(Reconciler::new(virt, host, Arc::new(mappers), Arc::new(syncers), cfg.op_timeout));
    let driver = Arc::new(SyncDriver::new(reconciler, &cfg));
    driver
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "ctrl-c handler failed; shutting down");
            }
        })
        .await?;
    info!("stopped");
    Ok(())
}

fn translate(cfg: &SyncConfig, kind: &str, name: &str, namespace: Option<&str>) -> Result<()> {
    let (mappers, _) = builtin(cfg)?;
    let kind = mappers
        .kinds()
        .find(|k| k.gvk_key() == kind || k.kind.eq_ignore_ascii_case(kind))
        .cloned()
        .ok_or_else(|| anyhow!("unknown kind {kind}"))?;
    let mapper = mappers.resolve(&kind)?;
    let identity = Identity::new(kind, namespace, name);
    let key = mapper.virtual_to_host(&identity);
    let out = serde_json::json!({
        "virtual": identity.to_string(),
        "host": { "namespace": key.namespace, "name": key.name },
        "policy": if mapper.is_mirror() { "mirror" } else { "translate" },
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = cli.sync.to_config();
    cfg.validate()?;

    match cli.command {
        Commands::Run { virtual_kubeconfig } => run(cfg, virtual_kubeconfig).await,
        Commands::Translate { kind, name, namespace } => translate(&cfg, &kind, &name, namespace.as_deref()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> SyncConfig {
        let cli = Cli::try_parse_from(args).unwrap();
        cli.sync.to_config()
    }

    #[test]
    fn defaults_match_sync_config() {
        let cfg = parse(&["vcsyncd", "translate", "PriorityClass", "gold"]);
        let base = SyncConfig::new(TenantConfig::new("vcluster", "vcluster"));
        assert_eq!(cfg.backoff_initial, base.backoff_initial);
        assert_eq!(cfg.backoff_max, base.backoff_max);
        assert_eq!(cfg.persistent_after, base.persistent_after);
        assert_eq!(cfg.op_timeout, base.op_timeout);
        cfg.validate().unwrap();
    }

    #[test]
    fn retry_flags_reach_the_config() {
        let cfg = parse(&[
            "vcsyncd",
            "--backoff-initial",
            "50",
            "--backoff-max",
            "30",
            "--persistent-after",
            "3",
            "translate",
            "PriorityClass",
            "gold",
        ]);
        assert_eq!(cfg.backoff_initial, Duration::from_millis(50));
        assert_eq!(cfg.backoff_max, Duration::from_secs(30));
        assert_eq!(cfg.persistent_after, 3);
    }

    #[test]
    fn backoff_initial_above_max_is_rejected() {
        let cfg = parse(&["vcsyncd", "--backoff-initial", "5000", "--backoff-max", "1", "translate", "PriorityClass", "gold"]);
        assert!(cfg.validate().is_err());
    }
}
