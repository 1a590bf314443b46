use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use rudder_actuator::{EventRecorder, HandlerRegistry, ResourceActuator};
use rudder_core::{Constraint, DeliveryConfig, EngineEvent, Resolver, ResourceKind};
use rudder_diff::ResourceDiff;
use rudder_persist::{
    ArtifactRepository, EventLog, InMemoryArtifactRepository, InMemoryConstraintStateRepository,
    InMemoryDiffFingerprintRepository, InMemoryEventLog, InMemoryFeatureRolloutRepository,
    InMemoryHealthRepository, InMemoryPauseRepository, InMemoryUnhappyVetoRepository,
    SqliteEventLog,
};
use rudder_promotion::{
    AllowedTimesEvaluator, DependsOnEvaluator, EnvironmentPromotionChecker,
    ManualJudgementEvaluator,
};
use rudder_rollout::{DependentEnvironmentFinder, RolloutAwareResolver};
use rudder_scheduler::{CheckScheduler, ConfigCache, SchedulerConfig};
use rudder_veto::{PauseVeto, UnhappyVeto, UnhealthyVeto, VetoEnforcer};

mod sim;
use sim::{CloudStateLookup, InProcessTaskLauncher, LaunchTemplateFeature, SimulatedCloud, SimulatedHandler};

#[derive(Parser, Debug)]
#[command(name = "rudderctl", version, about = "Rudder delivery-config CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value = "human")]
    output: Output,

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
    /// Parse a delivery config and report structural problems
    Validate {
        /// Path to the delivery config YAML
        file: PathBuf,
    },
    /// Show what a check cycle would change, without actuating
    Diff {
        /// Path to the delivery config YAML
        file: PathBuf,
        /// JSON file of current states keyed by resource id (default: nothing exists)
        #[arg(long = "state")]
        state: Option<PathBuf>,
    },
    /// Run the reconciliation loop against a simulated cloud
    Run {
        /// Path to the delivery config YAML
        file: PathBuf,
        /// SQLite event-log path (default: in-memory, or RUDDER_DB_PATH)
        #[arg(long = "db")]
        db: Option<String>,
        /// Register an artifact version at startup, e.g. fnord=1.0.0
        #[arg(long = "seed-version")]
        seed_versions: Vec<String>,
        /// Run a single tick and exit
        #[arg(long = "once", action = ArgAction::SetTrue)]
        once: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("RUDDER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RUDDER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid RUDDER_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_config(path: &PathBuf) -> Result<DeliveryConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut config: DeliveryConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    // resource-level service accounts default to the config's
    let account = config.service_account.clone();
    for env in &mut config.environments {
        for resource in &mut env.resources {
            if resource.metadata.service_account.is_empty() {
                resource.metadata.service_account = account.clone();
            }
        }
    }
    Ok(config)
}

fn validate(config: &DeliveryConfig) -> Vec<String> {
    let mut problems = Vec::new();
    let mut seen_ids = std::collections::BTreeSet::new();
    for resource in config.resources() {
        if !seen_ids.insert(resource.id().as_str().to_string()) {
            problems.push(format!("duplicate resource id {}", resource.id()));
        }
        if resource.application() != config.application {
            problems.push(format!(
                "resource {} belongs to application {:?}, config is {:?}",
                resource.id(),
                resource.application(),
                config.application
            ));
        }
    }
    let mut seen_refs = std::collections::BTreeSet::new();
    for artifact in &config.artifacts {
        if !seen_refs.insert(artifact.reference.as_str()) {
            problems.push(format!("duplicate artifact reference {:?}", artifact.reference));
        }
    }
    for env in &config.environments {
        if let Some(Constraint::DependsOn { environment }) = env.constraint("depends-on") {
            if environment == &env.name {
                problems.push(format!("environment {:?} depends on itself", env.name));
            } else if config.environment_named(environment).is_none() {
                problems.push(format!(
                    "environment {:?} depends on undeclared environment {:?}",
                    env.name, environment
                ));
            }
        }
    }
    problems
}

fn print_event(event: &EngineEvent, output: Output) {
    match output {
        Output::Json => {
            if let Ok(line) = serde_json::to_string(event) {
                println!("{line}");
            }
        }
        Output::Human => match event {
            EngineEvent::Resource(e) => println!("{}  {}  {}", e.timestamp, e.id, e.data.name()),
            EngineEvent::ArtifactVersionApproved { environment, version, artifact_name, .. } => {
                println!("approved {artifact_name} {version} -> {environment}")
            }
            EngineEvent::FeatureRolloutAttempted { feature, resource } => {
                println!("rollout attempted: {feature} on {resource}")
            }
            EngineEvent::FeatureRolloutFailed { feature, resource } => {
                println!("rollout failed: {feature} on {resource}")
            }
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file } => {
            let config = load_config(&file)?;
            let problems = validate(&config);
            match cli.output {
                Output::Json => println!(
                    "{}",
                    serde_json::json!({
                        "name": config.name,
                        "application": config.application,
                        "artifacts": config.artifacts.len(),
                        "environments": config.environments.len(),
                        "resources": config.resources().count(),
                        "problems": problems,
                    })
                ),
                Output::Human => {
                    println!(
                        "{}: {} artifact(s), {} environment(s), {} resource(s)",
                        config.name,
                        config.artifacts.len(),
                        config.environments.len(),
                        config.resources().count()
                    );
                    for p in &problems {
                        eprintln!("problem: {p}");
                    }
                }
            }
            if !problems.is_empty() {
                bail!("{} problem(s) found in {}", problems.len(), config.name);
            }
        }
        Commands::Diff { file, state } => {
            let config = load_config(&file)?;
            let states: std::collections::BTreeMap<String, serde_json::Value> = match state {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
                }
                None => Default::default(),
            };
            let mut report = Vec::new();
            for resource in config.resources() {
                let current = states.get(resource.id().as_str()).cloned();
                let diff = ResourceDiff::new(resource.spec.clone(), current);
                report.push((resource.id().clone(), diff));
            }
            match cli.output {
                Output::Json => {
                    let body: serde_json::Map<String, serde_json::Value> = report
                        .iter()
                        .map(|(id, diff)| (id.to_string(), diff.to_delta_json()))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&body)?);
                }
                Output::Human => {
                    for (id, diff) in &report {
                        if diff.current().is_none() {
                            println!("{id}: missing (would create)");
                        } else if diff.has_changes() {
                            let summary = diff.summary();
                            println!(
                                "{id}: {} change(s) in [{}]",
                                summary.total(),
                                diff.affected_root_properties().join(", ")
                            );
                        } else {
                            println!("{id}: in sync");
                        }
                    }
                }
            }
        }
        Commands::Run { file, db, seed_versions, once } => {
            let config = load_config(&file)?;
            let problems = validate(&config);
            if !problems.is_empty() {
                for p in &problems {
                    eprintln!("problem: {p}");
                }
                bail!("refusing to run an invalid config");
            }
            run(config, db, seed_versions, once, cli.output).await?;
        }
    }
    Ok(())
}

async fn run(
    config: DeliveryConfig,
    db: Option<String>,
    seed_versions: Vec<String>,
    once: bool,
    output: Output,
) -> Result<()> {
    let log: Arc<dyn EventLog> = match db {
        Some(path) => Arc::new(SqliteEventLog::open(&path)?),
        None if std::env::var("RUDDER_DB_PATH").is_ok() => Arc::new(SqliteEventLog::open_default()?),
        None => Arc::new(InMemoryEventLog::new()),
    };
    let recorder = EventRecorder::new(log.clone());
    let mut events = recorder.subscribe();

    let artifacts = Arc::new(InMemoryArtifactRepository::new());
    for seed in &seed_versions {
        let Some((reference, version)) = seed.split_once('=') else {
            bail!("invalid --seed-version {seed:?}, expected reference=version");
        };
        let artifact = config
            .matching_artifact_by_reference(reference)
            .with_context(|| format!("no artifact with reference {reference:?}"))?;
        artifacts.register_version(artifact, version).await?;
        info!(reference, version, "seeded artifact version");
    }

    let cloud = Arc::new(SimulatedCloud::new());
    let launcher = Arc::new(InProcessTaskLauncher::new());
    let mut handlers = HandlerRegistry::new();
    let mut kinds: Vec<ResourceKind> = config.resources().map(|r| r.kind.clone()).collect();
    kinds.sort_by_key(|k| k.to_string());
    kinds.dedup();
    for kind in kinds {
        handlers.register(Arc::new(SimulatedHandler::new(kind, cloud.clone(), launcher.clone())));
    }

    let fingerprints = Arc::new(InMemoryDiffFingerprintRepository::new());
    let enforcer = VetoEnforcer::new(vec![
        Arc::new(PauseVeto::new(Arc::new(InMemoryPauseRepository::new()))),
        Arc::new(UnhealthyVeto::new(Arc::new(InMemoryHealthRepository::new()))),
        Arc::new(UnhappyVeto::with_defaults(
            fingerprints.clone(),
            Arc::new(InMemoryUnhappyVetoRepository::new()),
        )),
    ]);

    let rollout = RolloutAwareResolver::new(
        LaunchTemplateFeature,
        Arc::new(InMemoryFeatureRolloutRepository::new()),
        DependentEnvironmentFinder::new(log.clone()),
        Arc::new(CloudStateLookup(cloud.clone())),
        recorder.clone(),
    );
    let resolvers: Vec<Arc<dyn Resolver>> = vec![Arc::new(rollout)];

    let actuator = Arc::new(ResourceActuator::new(
        handlers,
        resolvers,
        enforcer,
        recorder.clone(),
        log.clone(),
        fingerprints,
    ));
    let promotion = Arc::new(EnvironmentPromotionChecker::new(
        artifacts.clone(),
        vec![
            Arc::new(ManualJudgementEvaluator::new(Arc::new(InMemoryConstraintStateRepository::new()))),
            Arc::new(DependsOnEvaluator::new(artifacts)),
            Arc::new(AllowedTimesEvaluator::new()),
        ],
        recorder,
    ));

    let configs = Arc::new(ConfigCache::new());
    configs.replace(vec![config]);
    let scheduler = CheckScheduler::new(actuator, promotion, configs, SchedulerConfig::from_env());

    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event, output),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event printer lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    if once {
        scheduler.tick().await;
    } else {
        let (tx, rx) = tokio::sync::watch::channel(false);
        let loop_handle = tokio::spawn(async move { scheduler.run(rx).await });
        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        let _ = tx.send(true);
        loop_handle.await?;
    }
    drop(printer);
    Ok(())
}
