//! Cordon CLI - sandbox network lifecycle driver
//!
//! Provides commands for:
//! - Provisioning a reservation's network (prepare)
//! - Removing everything a reservation created (cleanup)
//! - Reporting what currently exists (status)
//!
//! Binary: cordon

use std::path::PathBuf;

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cordon_orchestrator::{
    ActionRequest, CancellationToken, Dispatcher, ReservationContext, ResourceGateways, Settings,
    topology,
};

/// Cordon - reservation network orchestration
#[derive(Parser)]
#[command(name = "cordon")]
#[command(about = "Provision and tear down reservation sandbox networks", long_about = None)]
struct Cli {
    /// Reservation the invocation acts on behalf of
    #[arg(long, env = "CORDON_RESERVATION_ID")]
    reservation_id: String,

    /// Requesting user, recorded on created resources
    #[arg(long)]
    owner: Option<String>,

    /// Blueprint the reservation was created from
    #[arg(long)]
    blueprint: Option<String>,

    /// Logical domain the reservation belongs to
    #[arg(long)]
    domain: Option<String>,

    /// AWS region, overriding configuration
    #[arg(long)]
    region: Option<String>,

    /// Path to a JSON settings file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the reservation's network and subnets
    Prepare {
        /// JSON file holding a full action batch
        #[arg(long, conflicts_with_all = ["cidr", "subnet"])]
        request: Option<PathBuf>,

        /// CIDR for the reservation VPC
        #[arg(long)]
        cidr: Option<String>,

        /// Subnet as CIDR[:alias][:public|private]; repeatable
        #[arg(long)]
        subnet: Vec<String>,
    },

    /// Remove everything the reservation ever created
    Cleanup,

    /// Report the reservation's current network topology
    Status,
}

/// Parse one `--subnet` flag. The CIDR comes first; the remaining
/// segments are an optional alias and an optional `public`/`private`
/// visibility marker, in either order.
fn parse_subnet_flag(raw: &str) -> anyhow::Result<ActionRequest> {
    let mut segments = raw.split(':');
    let cidr = segments
        .next()
        .filter(|s| !s.is_empty())
        .with_context(|| format!("subnet flag {raw:?} is missing a CIDR"))?
        .to_string();

    let mut alias = None;
    let mut is_public = false;
    for segment in segments {
        match segment {
            "public" => is_public = true,
            "private" => is_public = false,
            "" => bail!("subnet flag {raw:?} has an empty segment"),
            other if alias.is_none() => alias = Some(other.to_string()),
            other => bail!("subnet flag {raw:?} has more than one alias ({other:?})"),
        }
    }

    Ok(ActionRequest::PrepareSubnet {
        action_id: uuid::Uuid::new_v4().to_string(),
        alias: alias.unwrap_or_else(|| cidr.clone()),
        cidr,
        is_public,
    })
}

fn prepare_requests(
    request: Option<&PathBuf>,
    cidr: Option<&str>,
    subnets: &[String],
) -> anyhow::Result<Vec<ActionRequest>> {
    if let Some(path) = request {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read request file {}", path.display()))?;
        let requests: Vec<ActionRequest> = serde_json::from_str(&raw)
            .with_context(|| format!("request file {} is not a valid action batch", path.display()))?;
        if requests.is_empty() {
            bail!("request file {} holds no actions", path.display());
        }
        return Ok(requests);
    }

    let mut requests = vec![ActionRequest::PrepareNetwork {
        action_id: uuid::Uuid::new_v4().to_string(),
        cidr: cidr.map(str::to_string),
    }];
    for raw in subnets {
        requests.push(parse_subnet_flag(raw)?);
    }
    Ok(requests)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging: human-readable on stderr, daily rolling file
    // for audit. The guard must outlive the run so buffered lines flush.
    let file_appender = tracing_appender::rolling::daily("logs", "cordon.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cordon=info,cordon_orchestrator=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::from_env(),
    };
    if let Some(region) = &cli.region {
        settings.region = region.clone();
    }

    let ctx = ReservationContext::new(&cli.reservation_id)
        .with_owner(cli.owner.unwrap_or_default())
        .with_blueprint(cli.blueprint.unwrap_or_default())
        .with_domain(cli.domain.unwrap_or_default());

    let aws = aws_config::from_env()
        .region(aws_types::region::Region::new(settings.region.clone()))
        .load()
        .await;
    let gateways = ResourceGateways::aws(&aws, &settings);

    // Ctrl-C requests cooperative cancellation; the running phase
    // completes and the next checkpoint aborts.
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling at the next phase boundary");
            signal_token.cancel();
        }
    });

    let requests = match &cli.command {
        Commands::Prepare {
            request,
            cidr,
            subnet,
        } => prepare_requests(request.as_ref(), cidr.as_deref(), subnet)?,
        Commands::Cleanup => vec![ActionRequest::Cleanup {
            action_id: uuid::Uuid::new_v4().to_string(),
        }],
        Commands::Status => {
            let topology = topology::reconstruct(&gateways, &ctx).await?;
            match topology {
                Some(topology) => {
                    println!("{}", serde_json::to_string_pretty(&topology)?);
                    return Ok(());
                }
                None => bail!("no network exists for reservation {}", ctx.reservation_id),
            }
        }
    };

    let results = Dispatcher::new(gateways, settings, token)
        .execute(&ctx, &requests)
        .await;
    println!("{}", serde_json::to_string_pretty(&results)?);

    let failures = results.iter().filter(|r| !r.success).count();
    if failures > 0 {
        bail!("{failures} of {} action(s) failed", results.len());
    }
    Ok(())
}
