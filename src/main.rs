//! KIT Operator
//!
//! Runs the controllers for ControlPlane, AutoScalingGroup and NatGateway
//! objects against either a Kubernetes API server or, in standalone mode,
//! an in-memory object store.

use clap::Parser;
use kube::CustomResourceExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kit_operator::{
    default_controllers, AutoScalingConfig, AutoScalingGroup, BackoffConfig, CloudClients,
    ControlPlane, Error, InMemoryCloud, InMemoryStore, KubeStore, Manager, Metrics, NatGateway,
    ObjectStoreRef, OperatorConfig, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// KIT Operator - provisions Kubernetes control plane infrastructure
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Override the metrics server port
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Webhook port, accepted for compatibility; no webhooks are served
    #[arg(long, env = "WEBHOOK_PORT", default_value = "9443")]
    webhook_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Shorthand for --log-level debug
    #[arg(long, short, env = "VERBOSE")]
    verbose: bool,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Concurrent reconcile workers
    #[arg(long, env = "WORKERS", default_value = "4")]
    workers: usize,

    /// Seconds before a converged object is verified again
    #[arg(long, env = "RESYNC_INTERVAL", default_value = "300")]
    resync_interval_secs: u64,

    /// Seconds before an object waiting on a dependency is retried
    #[arg(long, env = "WAITING_REQUEUE", default_value = "5")]
    waiting_requeue_secs: u64,

    /// Timeout in seconds for each cloud call
    #[arg(long, env = "CALL_TIMEOUT", default_value = "30")]
    call_timeout_secs: u64,

    /// First retry delay in seconds after a failed pass
    #[arg(long, env = "BACKOFF_INITIAL", default_value = "1")]
    backoff_initial_secs: u64,

    /// Upper bound in seconds on the retry delay
    #[arg(long, env = "BACKOFF_MAX", default_value = "300")]
    backoff_max_secs: u64,

    /// Minimum size of created autoscaling groups
    #[arg(long, env = "ASG_MIN_SIZE", default_value = "1")]
    asg_min_size: u32,

    /// Maximum size of created autoscaling groups
    #[arg(long, env = "ASG_MAX_SIZE", default_value = "4")]
    asg_max_size: u32,

    /// Only watch this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Leader election lease name; the lease itself is held by the deployment
    #[arg(long, env = "LEADER_ELECTION_ID", default_value = "kit-leader-election")]
    leader_election_id: String,

    /// Namespace of the leader election lease
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE", default_value = "kit")]
    leader_election_namespace: String,

    /// Run in standalone mode (no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Reconcile cluster objects against the in-process simulated cloud.
    /// Statuses then describe resources that vanish on restart; for
    /// development clusters only.
    #[arg(long, env = "ALLOW_SIMULATED_CLOUD")]
    allow_simulated_cloud: bool,

    /// Print the CustomResourceDefinitions as YAML and exit
    #[arg(long)]
    print_crds: bool,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            workers: self.workers,
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            waiting_requeue: Duration::from_secs(self.waiting_requeue_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            backoff: BackoffConfig {
                initial_interval: Duration::from_secs(self.backoff_initial_secs),
                max_interval: Duration::from_secs(self.backoff_max_secs),
                ..BackoffConfig::default()
            },
            auto_scaling: AutoScalingConfig {
                min_size: self.asg_min_size,
                max_size: self.asg_max_size,
            },
        }
    }

    /// The simulated provider is the only one built in. Outside standalone
    /// mode it needs an explicit opt-in.
    fn cloud_clients(&self) -> Result<CloudClients> {
        if !self.standalone && !self.allow_simulated_cloud {
            return Err(Error::Configuration(
                "no cloud provider is available for cluster mode; run with --standalone \
                 or opt in to the simulated provider with --allow-simulated-cloud"
                    .into(),
            ));
        }
        Ok(CloudClients::simulated(Arc::new(InMemoryCloud::default())))
    }

    fn metrics_addr(&self) -> Result<SocketAddr> {
        let mut addr: SocketAddr = self
            .metrics_addr
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid metrics address: {}", e)))?;
        if let Some(port) = self.metrics_port {
            addr.set_port(port);
        }
        Ok(addr)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crds {
        return print_crds();
    }

    init_logging(&args)?;

    let config = args.operator_config();
    config.validate()?;
    let cloud = args.cloud_clients()?;

    info!("Starting KIT Operator");
    info!("  Version: {}", kit_operator::VERSION);
    info!("  Workers: {}", config.workers);
    info!("  Standalone mode: {}", args.standalone);
    info!(
        "  Leader election: {}/{}",
        args.leader_election_namespace, args.leader_election_id
    );
    info!("  Webhook port: {} (unused)", args.webhook_port);

    let stop = CancellationToken::new();
    let ready = Arc::new(AtomicBool::new(false));
    let metrics = Metrics::new()?;

    // Start health server
    let health_addr: SocketAddr = args
        .health_addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid health server address: {}", e)))?;
    let health_ready = ready.clone();
    let health_stop = stop.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_ready, health_stop).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr()?;
    let server_metrics = metrics.clone();
    let metrics_stop = stop.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, server_metrics, metrics_stop).await {
            error!("Metrics server error: {}", e);
        }
    });

    if !args.standalone {
        warn!("Cluster objects are reconciled against the simulated cloud provider");
    }

    // Choose the object store and its change feed
    let (store, watch_source): (ObjectStoreRef, WatchSource) = if args.standalone {
        let store = Arc::new(InMemoryStore::new());
        (store.clone() as ObjectStoreRef, WatchSource::Memory(store))
    } else {
        let client = kube::Client::try_default().await?;
        let store = KubeStore::new(client, args.namespace.clone());
        (Arc::new(store.clone()) as ObjectStoreRef, WatchSource::Kube(store))
    };

    let controllers = default_controllers(store.clone(), &cloud, &config);
    let runnable = Manager::new(store, config)
        .with_metrics(metrics)
        .register_controllers(controllers)?;

    let watchers = match watch_source {
        WatchSource::Memory(store) => vec![store.spawn_forwarder(runnable.queue(), stop.clone())],
        WatchSource::Kube(store) => store.spawn_watchers(runnable.queue(), stop.clone()),
    };

    let signal_stop = stop.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_stop.cancel();
    });

    ready.store(true, Ordering::Relaxed);
    runnable.start(stop).await?;

    for watcher in watchers {
        if let Err(e) = watcher.await {
            warn!("Watcher exited abnormally: {}", e);
        }
    }

    info!("Operator shutdown complete");
    Ok(())
}

/// Where change notifications come from
enum WatchSource {
    Memory(Arc<InMemoryStore>),
    Kube(KubeStore),
}

fn print_crds() -> Result<()> {
    let crds = [ControlPlane::crd(), AutoScalingGroup::crd(), NatGateway::crd()];
    for crd in crds {
        let yaml = serde_yaml::to_string(&crd)
            .map_err(|e| Error::Internal(format!("Failed to render CRD: {}", e)))?;
        println!("---\n{}", yaml);
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    };

    let directive = |d: &str| {
        d.parse::<Directive>()
            .map_err(|e| Error::Configuration(format!("Invalid log directive {}: {}", d, e)))
    };
    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(directive("hyper=warn")?)
        .add_directive(directive("kube=info")?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn respond(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(
    addr: SocketAddr,
    ready: Arc<AtomicBool>,
    stop: CancellationToken,
) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::Relaxed);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "ok"),
                        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Health server bind error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr, metrics: Metrics, stop: CancellationToken) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok(text) => {
                                let mut response = respond(StatusCode::OK, text);
                                response.headers_mut().insert(
                                    hyper::header::CONTENT_TYPE,
                                    hyper::header::HeaderValue::from_static(
                                        "text/plain; version=0.0.4",
                                    ),
                                );
                                response
                            }
                            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        },
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Metrics server bind error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_mode_requires_a_cloud_provider() {
        let args = Args::parse_from(["kit-operator"]);
        let err = args.cloud_clients().err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_simulated_cloud_is_allowed_when_requested() {
        assert!(Args::parse_from(["kit-operator", "--standalone"])
            .cloud_clients()
            .is_ok());
        assert!(Args::parse_from(["kit-operator", "--allow-simulated-cloud"])
            .cloud_clients()
            .is_ok());
    }

    #[test]
    fn test_metrics_port_overrides_address() {
        let args = Args::parse_from(["kit-operator", "--metrics-port", "9090"]);
        assert_eq!(args.metrics_addr().unwrap().port(), 9090);
    }
}
