//! Operator configuration
//!
//! Flags are parsed once at start into an immutable [`OperatorConfig`].
//! Every flag has an environment fallback so the operator can be configured
//! from its Deployment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args};

use pao_common::{Error, LeaseConfig, WatchScope, NODE_TUNING_NAMESPACE};
use pao_profile::controller::DEFAULT_RESYNC_PERIOD;
use pao_rollout::VerifierConfig;

/// Default port of the HTTPS webhook server
pub const DEFAULT_WEBHOOK_PORT: u16 = 4343;

/// Default directory holding the webhook serving certificate
pub const DEFAULT_CERT_DIR: &str = "/apiserver.local.config/certificates";

/// Serving certificate file name inside the cert directory
pub const CERT_FILE: &str = "apiserver.crt";

/// Serving key file name inside the cert directory
pub const KEY_FILE: &str = "apiserver.key";

/// Default namespace of the operator and its Lease
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "openshift-performance-addon-operator";

/// Flags of the `run` mode
#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Duration non-leaders wait before trying to take over the lease
    #[arg(long, env = "LEASE_DURATION", default_value = "137s", value_parser = humantime::parse_duration)]
    pub lease_duration: Duration,

    /// Time the leader keeps retrying renewal before giving up leadership
    #[arg(long, env = "RENEW_DEADLINE", default_value = "107s", value_parser = humantime::parse_duration)]
    pub renew_deadline: Duration,

    /// Interval between lease acquire/renew attempts
    #[arg(long, env = "RETRY_PERIOD", default_value = "26s", value_parser = humantime::parse_duration)]
    pub retry_period: Duration,

    /// Elect a single active instance (disable for single-replica setups only)
    #[arg(long, env = "ENABLE_LEADER_ELECTION", default_value_t = true, action = ArgAction::Set)]
    pub enable_leader_election: bool,

    /// Namespaces in which namespaced children are observed and written
    #[arg(
        long = "watch-namespace",
        env = "WATCH_NAMESPACE",
        value_delimiter = ',',
        default_value = NODE_TUNING_NAMESPACE
    )]
    pub watch_namespaces: Vec<String>,

    /// Address of the Prometheus metrics listener
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8383")]
    pub metrics_addr: SocketAddr,

    /// Port of the HTTPS webhook server
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = DEFAULT_WEBHOOK_PORT)]
    pub webhook_port: u16,

    /// Directory containing apiserver.crt and apiserver.key
    #[arg(long, env = "WEBHOOK_CERT_DIR", default_value = DEFAULT_CERT_DIR)]
    pub cert_dir: PathBuf,

    /// Service fronting the webhook, wired into the CRD conversion config
    #[arg(long, env = "WEBHOOK_SERVICE")]
    pub webhook_service: Option<String>,

    /// PEM CA bundle the API server uses to verify the webhook
    #[arg(long, env = "WEBHOOK_CA_FILE")]
    pub webhook_ca_file: Option<PathBuf>,

    /// Install or update the PerformanceProfile CRD on start
    #[arg(long, env = "INSTALL_CRDS", default_value_t = true, action = ArgAction::Set)]
    pub install_crds: bool,

    /// Lease holder identity
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// Namespace of the operator, where the lease lives
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = DEFAULT_OPERATOR_NAMESPACE)]
    pub operator_namespace: String,

    /// Rollout budget per node of a pool
    #[arg(long, env = "PER_NODE_BUDGET", default_value = "20m", value_parser = humantime::parse_duration)]
    pub per_node_budget: Duration,

    /// Resync period of converged profiles
    #[arg(long, env = "RESYNC_PERIOD", default_value = "10m", value_parser = humantime::parse_duration)]
    pub resync_period: Duration,
}

/// Settings of a running operator, fixed at start
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Lease holder identity
    pub identity: String,
    /// Namespace of the lease
    pub operator_namespace: String,
    /// Whether leader election is enabled
    pub leader_election: bool,
    /// Lease timing
    pub lease: LeaseConfig,
    /// Observed namespaces
    pub scope: WatchScope,
    /// Metrics listener
    pub metrics_addr: SocketAddr,
    /// Webhook listener
    pub webhook_addr: SocketAddr,
    /// Serving certificate directory
    pub cert_dir: PathBuf,
    /// Conversion webhook service name
    pub webhook_service: Option<String>,
    /// CA bundle file for the conversion webhook
    pub webhook_ca_file: Option<PathBuf>,
    /// Whether to install the CRD
    pub install_crds: bool,
    /// Rollout observation timing
    pub verifier: VerifierConfig,
    /// Resync period
    pub resync_period: Duration,
}

impl OperatorConfig {
    /// Validate flags and resolve the identity
    ///
    /// `hostname` is consulted when no pod name was given.
    pub fn from_args(args: &RunArgs, hostname: Option<String>) -> Result<Self, Error> {
        let lease = LeaseConfig {
            lease_duration: args.lease_duration,
            renew_deadline: args.renew_deadline,
            retry_period: args.retry_period,
        };
        lease.validate()?;

        let identity = args
            .pod_name
            .clone()
            .or(hostname)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::configuration("no identity: set --pod-name or POD_NAME"))?;

        if args.per_node_budget.is_zero() {
            return Err(Error::configuration("--per-node-budget must be positive"));
        }

        let namespaces: Vec<&str> = args
            .watch_namespaces
            .iter()
            .map(|ns| ns.trim())
            .filter(|ns| !ns.is_empty())
            .collect();
        if namespaces.is_empty() {
            return Err(Error::configuration("at least one --watch-namespace is required"));
        }

        Ok(Self {
            identity,
            operator_namespace: args.operator_namespace.clone(),
            leader_election: args.enable_leader_election,
            lease,
            scope: WatchScope::new(namespaces),
            metrics_addr: args.metrics_addr,
            webhook_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.webhook_port),
            cert_dir: args.cert_dir.clone(),
            webhook_service: args.webhook_service.clone(),
            webhook_ca_file: args.webhook_ca_file.clone(),
            install_crds: args.install_crds,
            verifier: VerifierConfig {
                per_node_budget: args.per_node_budget,
                ..VerifierConfig::default()
            },
            resync_period: if args.resync_period.is_zero() {
                DEFAULT_RESYNC_PERIOD
            } else {
                args.resync_period
            },
        })
    }
}

/// Hostname of this machine, from `HOSTNAME` or `/etc/hostname`
pub fn hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
