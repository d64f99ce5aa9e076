//! Performance profile operator - node performance tuning for machine config pools

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pao_common::crd::ConditionStatus;
use pao_common::leader_election::{KubeLeaseStore, LeaderElector, LEADER_LEASE_NAME};
use pao_common::{component_name, LeadershipStatus, SystemClock};
use pao_operator::config::{hostname, OperatorConfig, RunArgs};
use pao_operator::controller_runner::build_profile_controller;
use pao_operator::render::{print_manifests, render_document, write_manifests};
use pao_operator::startup::{
    ensure_crds_installed, profile_crd, shutdown_on_signal, start_metrics_exporter,
    ConversionWebhook,
};
use pao_operator::webhook::{self, WebhookState};
use pao_profile::controller::Context;
use pao_profile::VersionRegistry;
use pao_rollout::{KubePoolClient, RolloutRequest, RolloutVerifier, VerifierConfig};

/// Performance profile operator - renders PerformanceProfiles into node
/// tuning and waits for machine config pools to roll them out
#[derive(Parser, Debug)]
#[command(name = "performance-operator", version, about, long_about = None)]
struct Cli {
    /// Print the PerformanceProfile CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator (default mode)
    ///
    /// Serves the conversion and validation webhooks on every replica and
    /// reconciles profiles on the elected leader.
    Run,

    /// Render the children of a profile without a cluster
    Render(RenderArgs),

    /// Wait until a pool has rolled out a profile's machine config
    AwaitRollout(AwaitRolloutArgs),
}

#[derive(Args, Debug)]
struct RenderArgs {
    /// Profile manifest (YAML or JSON, any served version)
    #[arg(long)]
    profile: PathBuf,

    /// Write one file per child here instead of printing to stdout
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct AwaitRolloutArgs {
    /// Label selecting the pool, `key=value` (repeatable)
    #[arg(long = "pool-selector", value_parser = parse_label, required = true)]
    pool_selector: Vec<(String, String)>,

    /// Profile whose machine config is awaited
    #[arg(long)]
    profile: String,

    /// Pool condition to wait for
    #[arg(long, default_value = "Updated")]
    condition: String,

    /// Desired condition status
    #[arg(long, default_value = "True")]
    status: ConditionStatus,

    /// Do not wait for the pool to reference the machine config first
    #[arg(long)]
    skip_pickup: bool,

    /// Time allowed per node of the pool
    #[arg(long, default_value = "20m", value_parser = humantime::parse_duration)]
    per_node_budget: Duration,

    /// Interval between polls
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    poll_interval: Duration,

    /// Time allowed for the pool to reference the machine config
    #[arg(long, default_value = "10m", value_parser = humantime::parse_duration)]
    pickup_timeout: Duration,
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    let (key, value) = s.split_once('=').unwrap_or((s, ""));
    if key.trim().is_empty() {
        return Err(format!("invalid label {s:?}, expected key=value"));
    }
    Ok((key.trim().to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install the aws-lc-rs crypto provider: {:?}. \
             The webhook server cannot serve TLS without it.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let registry = VersionRegistry::new();

    if cli.crd {
        let crd = serde_yaml::to_string(&profile_crd(&registry, None)?)
            .context("failed to serialize CRD")?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Run) | None => run_operator(&cli.run, registry).await,
        Some(Commands::Render(args)) => run_render(&args, &registry),
        Some(Commands::AwaitRollout(args)) => run_await_rollout(args).await,
    }
}

/// Logs go to stderr so `render` output stays clean on stdout
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn conversion_webhook(config: &OperatorConfig) -> anyhow::Result<Option<ConversionWebhook>> {
    let Some(service) = &config.webhook_service else {
        return Ok(None);
    };
    let ca_bundle = match &config.webhook_ca_file {
        Some(path) => Some(
            std::fs::read(path)
                .with_context(|| format!("failed to read CA bundle {}", path.display()))?,
        ),
        None => None,
    };
    Ok(Some(ConversionWebhook {
        service: service.clone(),
        namespace: config.operator_namespace.clone(),
        port: 443,
        ca_bundle,
    }))
}

/// Run the operator until SIGTERM/Ctrl+C
///
/// Webhooks serve on every replica. The controller runs everywhere too but
/// only the lease holder writes; followers keep their queue until promoted.
async fn run_operator(args: &RunArgs, registry: VersionRegistry) -> anyhow::Result<()> {
    let config = OperatorConfig::from_args(args, hostname())?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        identity = %config.identity,
        leader_election = config.leader_election,
        "Performance profile operator starting..."
    );

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    start_metrics_exporter(config.metrics_addr)?;

    let registry = Arc::new(registry);
    if config.install_crds {
        let webhook = conversion_webhook(&config)?;
        ensure_crds_installed(&client, &registry, webhook.as_ref()).await?;
    }

    let shutdown = CancellationToken::new();
    shutdown_on_signal(shutdown.clone());

    let webhook_task = {
        let state = Arc::new(WebhookState::new(registry.clone()));
        let addr = config.webhook_addr;
        let cert_dir = config.cert_dir.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = webhook::serve(addr, &cert_dir, state, token).await {
                tracing::error!(error = ?e, "Webhook server failed");
            }
        })
    };

    let (leadership, elector_task) = if config.leader_election {
        let store = Arc::new(KubeLeaseStore::new(
            client.clone(),
            &config.operator_namespace,
            LEADER_LEASE_NAME,
        ));
        let elector = Arc::new(LeaderElector::new(
            store,
            LEADER_LEASE_NAME,
            &config.operator_namespace,
            &config.identity,
            config.lease,
            Arc::new(SystemClock),
        ));
        let status = elector.status();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { elector.run(token).await });
        (status, Some(task))
    } else {
        tracing::warn!("Leader election disabled, acting as the only instance");
        (LeadershipStatus::always(), None)
    };

    let verifier = RolloutVerifier::new(
        Arc::new(KubePoolClient::new(client.clone())),
        config.verifier,
    );
    let ctx = Arc::new(
        Context::builder(client.clone())
            .leadership(leadership)
            .scope(config.scope.clone())
            .retry_period(config.lease.retry_period)
            .resync_period(config.resync_period)
            .verifier(Some(Arc::new(verifier)))
            .with_metrics()
            .build(),
    );

    tracing::info!("Starting controllers...");
    build_profile_controller(client, ctx, &config.scope).await;
    tracing::info!("Profile controller completed");

    // Releases the lease and stops the webhook server
    shutdown.cancel();
    if let Some(task) = elector_task {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Leader elector task failed");
        }
    }
    if let Err(e) = webhook_task.await {
        tracing::warn!(error = %e, "Webhook task failed");
    }

    tracing::info!("Performance profile operator shutting down");
    Ok(())
}

fn run_render(args: &RenderArgs, registry: &VersionRegistry) -> anyhow::Result<()> {
    let document = std::fs::read_to_string(&args.profile)
        .with_context(|| format!("failed to read {}", args.profile.display()))?;
    let manifests = render_document(registry, &document)?;

    match &args.output_dir {
        Some(dir) => {
            for path in write_manifests(dir, &manifests)? {
                println!("{}", path.display());
            }
        }
        None => print_manifests(&mut std::io::stdout().lock(), &manifests)?,
    }
    Ok(())
}

async fn run_await_rollout(args: AwaitRolloutArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let verifier = RolloutVerifier::new(
        Arc::new(KubePoolClient::new(client)),
        VerifierConfig {
            per_node_budget: args.per_node_budget,
            poll_interval: args.poll_interval,
            pickup_timeout: args.pickup_timeout,
        },
    );

    let request = RolloutRequest {
        pool_selector: args.pool_selector.into_iter().collect(),
        machine_config: component_name(&args.profile),
        condition_type: args.condition,
        desired: args.status,
        skip_pickup: args.skip_pickup,
    };

    let cancel = CancellationToken::new();
    shutdown_on_signal(cancel.clone());

    let reached = verifier.await_rollout(&request, &cancel).await?;
    println!(
        "pool {} reached {}={} after {} (timeout {}, {} nodes)",
        reached.pool,
        request.condition_type,
        request.desired,
        humantime::format_duration(reached.elapsed),
        humantime::format_duration(reached.timeout),
        reached.node_count
    );
    Ok(())
}
