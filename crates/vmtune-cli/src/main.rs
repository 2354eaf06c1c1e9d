use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vmtune_api::{ApiResponse, ErrorTranslator};
use vmtune_compute::InstanceRepository;
use vmtune_core::{
    ControlPlaneConfig, HostRef, ImageRef, InstanceId, Operation, RequestContext, ResourceKind,
};

mod fleet;

use fleet::{Fleet, Plane};

/// Live vCPU and memory reconfiguration against a simulated fleet
#[derive(Parser)]
#[command(name = "vmtune")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Fleet description (TOML)
    #[arg(short, long, global = true, default_value = "fleet.toml")]
    fleet: PathBuf,

    /// Control-plane config overriding the fleet's [control] section
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Calling user
    #[arg(long, global = true, default_value = "admin")]
    user: String,

    /// Calling project
    #[arg(long, global = true, default_value = "p1")]
    project: String,

    /// Caller role (repeatable)
    #[arg(long = "role", global = true, default_values_t = vec!["admin".to_string()])]
    roles: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print vCPUs and memory of an instance
    Show {
        /// Instance id
        instance: String,
    },

    /// Hotplug vCPUs
    SetVcpus {
        /// Instance id
        instance: String,
        /// Target vCPU count
        vcpus: u64,
    },

    /// Hottune memory
    SetMem {
        /// Instance id
        instance: String,
        /// Target memory in MiB
        mem: u64,
    },

    /// Resize a running instance to another flavor
    LiveResize {
        /// Instance id
        instance: String,
        /// Target flavor id
        #[arg(long)]
        flavor: String,
        /// Image the instance was built from
        #[arg(long)]
        image: Option<String>,
    },

    /// Move an instance to another host
    Migrate {
        /// Instance id
        instance: String,
        /// Destination host
        #[arg(long)]
        destination: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut fleet = Fleet::load(&cli.fleet)?;
    if let Some(path) = &cli.config {
        fleet.control = ControlPlaneConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?;
    }
    let plane = fleet.build()?;
    let ctx = RequestContext::new(cli.user.as_str(), cli.project.as_str()).with_roles(cli.roles.iter());

    let (instance, succeeded) = run(&plane, ctx, cli.command).await?;

    plane.api.quiesce(&instance).await;
    let record = plane.repo.get(&instance).await.ok();
    println!("{}", serde_json::to_string_pretty(&json!({ "final": record }))?);

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

async fn run(plane: &Plane, ctx: RequestContext, command: Commands) -> Result<(InstanceId, bool)> {
    match command {
        Commands::Show { instance } => {
            let id = InstanceId::from(instance);
            let mut ok = true;
            for kind in [ResourceKind::Vcpus, ResourceKind::Memory] {
                let response = plane.api.endpoint(kind).read(&ctx, &id).await;
                ok &= response.status.is_success();
                print_response(&response)?;
            }
            Ok((id, ok))
        }
        Commands::SetVcpus { instance, vcpus } => {
            let id = InstanceId::from(instance);
            let body = json!({ "setVcpus": { "vcpus": vcpus } });
            let ok = act(plane, &ctx, &id, ResourceKind::Vcpus, &body).await?;
            Ok((id, ok))
        }
        Commands::SetMem { instance, mem } => {
            let id = InstanceId::from(instance);
            let body = json!({ "setMem": { "mem": mem } });
            let ok = act(plane, &ctx, &id, ResourceKind::Memory, &body).await?;
            Ok((id, ok))
        }
        Commands::LiveResize {
            instance,
            flavor,
            image,
        } => {
            let id = InstanceId::from(instance);
            if !authorized(plane, &ctx, Operation::LiveResize).await? {
                return Ok((id, false));
            }
            let flavor = plane.flavor(&flavor)?;
            let reservation = match plane.conductor.reserve_for_flavor(&id, &flavor).await {
                Ok(reservation) => reservation,
                Err(e) => {
                    print_response(&ErrorTranslator::new().translate(&e))?;
                    return Ok((id, false));
                }
            };
            let outcome = plane
                .conductor
                .live_resize(ctx, image.map(ImageRef::from), id.clone(), flavor, Some(reservation))
                .await;
            Ok((id, report_task(outcome)?))
        }
        Commands::Migrate {
            instance,
            destination,
        } => {
            let id = InstanceId::from(instance);
            if !authorized(plane, &ctx, Operation::Migrate).await? {
                return Ok((id, false));
            }
            let outcome = plane
                .conductor
                .migrate(ctx, id.clone(), HostRef::from(destination))
                .await;
            Ok((id, report_task(outcome)?))
        }
    }
}

/// Policy check for commands that bypass the endpoints
async fn authorized(plane: &Plane, ctx: &RequestContext, operation: Operation) -> Result<bool> {
    match plane.authz.authorize(ctx, operation.policy_alias()).await {
        Ok(()) => Ok(true),
        Err(e) => {
            print_response(&ErrorTranslator::new().translate(&e))?;
            Ok(false)
        }
    }
}

async fn act(
    plane: &Plane,
    ctx: &RequestContext,
    id: &InstanceId,
    kind: ResourceKind,
    body: &Value,
) -> Result<bool> {
    let response = plane.api.endpoint(kind).action(ctx, id, body).await;
    print_response(&response)?;
    Ok(response.status.is_success())
}

fn report_task<T: serde::Serialize>(
    outcome: std::result::Result<T, vmtune_conductor::TaskError>,
) -> Result<bool> {
    match outcome {
        Ok(summary) => {
            println!("{}", serde_json::to_string_pretty(&json!({ "task": summary }))?);
            Ok(true)
        }
        Err(e) => {
            print_response(&ErrorTranslator::new().translate_task(&e))?;
            Ok(false)
        }
    }
}

fn print_response(response: &ApiResponse) -> Result<()> {
    let rendered = json!({ "code": response.code(), "body": response.body });
    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
