use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rust_apisweep::client::{build_client, ClientConfig, PoolConfig};
use rust_apisweep::config::{ConfigError, SuiteConfig, YamlDuration};
use rust_apisweep::errors::FatalError;
use rust_apisweep::executor::{HttpExecutor, RetryPolicy};
use rust_apisweep::metrics::{gather_metrics_string, register_metrics, start_metrics_server};
use rust_apisweep::prober::{NetworkProber, ProbeTarget};
use rust_apisweep::prompts::{PromptSource, PromptSourceError};
use rust_apisweep::report::{format_history, format_level_table, render_sweep};
use rust_apisweep::scheduler::{
    RunLabels, SweepAborted, SweepPlan, SweepScheduler, SweepStatus,
};
use rust_apisweep::shutdown;
use rust_apisweep::store::{JsonFileStore, ResultStore, StoreError};
use rust_apisweep::template::{substitute, ApiProfile, TemplateVars};
use rust_apisweep::utils::{parse_duration_string, parse_key_value};

const DEFAULT_PROMPT_FILE: &str = "data/prompts.jsonl";
const EXIT_CONFIG: i32 = 1;
const EXIT_FATAL: i32 = 2;
const EXIT_CANCELLED: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "rust_apisweep")]
#[command(author, version, about = "Concurrency sweep load tester for HTTP inference APIs", long_about = None)]
struct Cli {
    /// YAML file with API and test profiles
    #[arg(long, global = true, default_value = "config/config.yaml")]
    config: PathBuf,

    /// Directory holding saved run results
    #[arg(long, global = true, default_value = "results")]
    results_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a concurrency sweep
    Test(TestArgs),
    /// Hold one concurrency level for a fixed duration
    Stress(StressArgs),
    /// Print a saved run
    Report { run_id: String },
    /// List saved runs, newest first
    History {
        #[arg(long, short, default_value_t = 10)]
        limit: usize,
    },
    /// List configured API and test profiles
    ListConfigs,
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// API profile name
    #[arg(long, short)]
    api: String,

    #[arg(long, short = 'k', env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Endpoint name within the profile (defaults to the first one)
    #[arg(long, short)]
    endpoint: Option<String>,

    /// Azure resource name
    #[arg(long)]
    resource_name: Option<String>,

    /// Azure deployment name
    #[arg(long)]
    deployment_name: Option<String>,

    /// Extra template variable, key=value (repeatable)
    #[arg(long = "var", value_parser = parse_key_value)]
    vars: Vec<(String, String)>,

    /// Prompt file (.jsonl, .csv or plain text)
    #[arg(long)]
    prompts: Option<PathBuf>,

    /// Serve Prometheus metrics on this port while running
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Disable the network prober
    #[arg(long)]
    no_monitoring: bool,

    #[arg(long, env = "SKIP_TLS_VERIFY")]
    skip_tls_verify: bool,

    /// DNS override: hostname:ip:port
    #[arg(long, env = "RESOLVE_TARGET_ADDR")]
    resolve: Option<String>,
}

#[derive(Args, Debug)]
struct TestArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Test profile name
    #[arg(long, short, default_value = "default")]
    test: String,

    /// Override concurrency levels, e.g. 1,5,10
    #[arg(long, value_delimiter = ',')]
    concurrent_levels: Option<Vec<u32>>,

    #[arg(long)]
    requests_per_level: Option<usize>,

    /// Per-request timeout, e.g. 30 or 30s
    #[arg(long)]
    timeout: Option<String>,

    #[arg(long)]
    retry_count: Option<u32>,

    #[arg(long)]
    ramp_up_time: Option<String>,

    #[arg(long)]
    cool_down_time: Option<String>,
}

#[derive(Args, Debug)]
struct StressArgs {
    #[command(flatten)]
    target: TargetArgs,

    #[arg(long, short = 'c', default_value_t = 50)]
    max_concurrent: u32,

    /// How long to hold the level, e.g. 300, 5m
    #[arg(long, short, default_value = "5m")]
    duration: String,

    #[arg(long, default_value = "30s")]
    timeout: String,

    #[arg(long, default_value_t = 0)]
    retry_count: u32,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Prompts(#[from] PromptSourceError),

    #[error(transparent)]
    Fatal(#[from] FatalError),

    #[error(transparent)]
    Aborted(#[from] SweepAborted),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) | CliError::Prompts(_) => EXIT_CONFIG,
            CliError::Fatal(FatalError::Config(_) | FatalError::Prompts(_)) => EXIT_CONFIG,
            CliError::Store(StoreError::NotFound(_) | StoreError::InvalidRunId(_)) => EXIT_CONFIG,
            CliError::Fatal(_) | CliError::Aborted(_) | CliError::Store(_) => EXIT_FATAL,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    init_tracing();
    register_metrics()?;

    match run(cli).await {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(error = %e, "Run failed");
            eprintln!("Error: {}", e);
            if let CliError::Aborted(aborted) = &e {
                if !aborted.completed_levels.is_empty() {
                    eprintln!("Levels completed before the abort:");
                    eprint!("{}", format_level_table(&aborted.completed_levels));
                }
            }
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli) -> Result<i32, CliError> {
    let store = JsonFileStore::new(&cli.results_dir);

    match cli.command {
        Command::Test(args) => {
            let suite = SuiteConfig::from_file(&cli.config)?;
            run_test(&suite, &store, args).await
        }
        Command::Stress(args) => {
            let suite = SuiteConfig::from_file(&cli.config)?;
            run_stress(&suite, &store, args).await
        }
        Command::Report { run_id } => {
            let result = store.load(&run_id).await?;
            print!("{}", render_sweep(&result));
            Ok(0)
        }
        Command::History { limit } => {
            let runs = store.list(limit).await?;
            print!("{}", format_history(&runs));
            Ok(0)
        }
        Command::ListConfigs => {
            let suite = SuiteConfig::from_file(&cli.config)?;
            print_configs(&suite);
            Ok(0)
        }
    }
}

fn print_configs(suite: &SuiteConfig) {
    println!("API profiles:");
    for (key, profile) in &suite.api_configs {
        let endpoints: Vec<&str> = profile.endpoints.keys().map(String::as_str).collect();
        println!(
            "  {:<16} {} ({}) endpoints: {}",
            key,
            profile.name,
            profile.base_url,
            endpoints.join(", ")
        );
    }
    println!("\nTest profiles:");
    for (key, test) in &suite.test_configs {
        println!("  {:<16} {}", key, test.name);
        println!("    levels: {:?}", test.concurrent_levels);
        println!("    requests per level: {}", test.requests_per_level);
    }
}

fn duration_arg(field: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration_string(value)
        .map_err(|e| ConfigError::Validation(format!("{}: {}", field, e)))
}

async fn run_test(
    suite: &SuiteConfig,
    store: &JsonFileStore,
    args: TestArgs,
) -> Result<i32, CliError> {
    let mut test = suite.test(&args.test)?.clone();
    if let Some(levels) = args.concurrent_levels {
        test.concurrent_levels = levels;
    }
    if let Some(requests) = args.requests_per_level {
        test.requests_per_level = requests;
    }
    if let Some(timeout) = args.timeout {
        test.timeout = YamlDuration::String(timeout);
    }
    if let Some(retries) = args.retry_count {
        test.retry_count = retries;
    }
    if let Some(ramp_up) = args.ramp_up_time {
        test.ramp_up_time = YamlDuration::String(ramp_up);
    }
    if let Some(cool_down) = args.cool_down_time {
        test.cool_down_time = YamlDuration::String(cool_down);
    }
    let plan = test.to_plan()?;

    let max_level = plan.levels.iter().copied().max().unwrap_or(1);
    execute(
        suite,
        store,
        &args.target,
        &args.test,
        SweepPlan::from(&plan),
        plan.timeout,
        plan.retry,
        max_level,
    )
    .await
}

async fn run_stress(
    suite: &SuiteConfig,
    store: &JsonFileStore,
    args: StressArgs,
) -> Result<i32, CliError> {
    if args.max_concurrent == 0 {
        return Err(ConfigError::Validation("max_concurrent must be at least 1".to_string()).into());
    }
    let duration = duration_arg("duration", &args.duration)?;
    let timeout = duration_arg("timeout", &args.timeout)?;
    let retry = RetryPolicy {
        max_retries: args.retry_count,
        ..RetryPolicy::default()
    };

    execute(
        suite,
        store,
        &args.target,
        "stress",
        SweepPlan::stress(args.max_concurrent, duration, Duration::ZERO),
        timeout,
        retry,
        args.max_concurrent,
    )
    .await
}

fn template_vars(target: &TargetArgs) -> TemplateVars {
    let mut vars: TemplateVars = target.vars.iter().cloned().collect();
    if let Some(key) = &target.api_key {
        vars.insert("api_key".to_string(), key.clone());
    }
    if let Some(name) = &target.resource_name {
        vars.insert("resource_name".to_string(), name.clone());
    }
    if let Some(name) = &target.deployment_name {
        vars.insert("deployment_name".to_string(), name.clone());
    }
    vars
}

fn load_prompts(suite: &SuiteConfig, target: &TargetArgs) -> Result<PromptSource, PromptSourceError> {
    let path = target
        .prompts
        .clone()
        .or_else(|| suite.data.prompt_file.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PROMPT_FILE));
    let prompts = PromptSource::from_file(&path)?;
    info!(path = %path.display(), count = prompts.len(), "Loaded prompts");
    Ok(prompts)
}

fn resolve_endpoint(profile: &ApiProfile, requested: Option<&str>) -> Result<String, ConfigError> {
    match requested {
        Some(name) if profile.endpoints.contains_key(name) => Ok(name.to_string()),
        Some(name) => Err(ConfigError::Validation(format!(
            "Profile '{}' has no endpoint '{}'",
            profile.name, name
        ))),
        None => profile.endpoints.keys().next().cloned().ok_or_else(|| {
            ConfigError::Validation(format!("Profile '{}' defines no endpoints", profile.name))
        }),
    }
}

fn build_prober(
    suite: &SuiteConfig,
    profile: &ApiProfile,
    target: &TargetArgs,
    vars: &TemplateVars,
) -> Result<Option<NetworkProber>, CliError> {
    if target.no_monitoring || !suite.monitoring.enabled {
        return Ok(None);
    }
    let (interval, timeout) = suite.probe_timing()?;
    let fallback = substitute(
        profile.health_url.as_deref().unwrap_or(&profile.base_url),
        vars,
    )
    .map_err(FatalError::from)?;
    let probe_target = ProbeTarget::resolve(
        suite.monitoring.method,
        suite.monitoring.target.as_deref(),
        &fallback,
    )?;
    Ok(Some(NetworkProber::new(probe_target, interval, timeout)?))
}

fn spawn_metrics_server(port: u16) -> Arc<Mutex<prometheus::Registry>> {
    let registry = Arc::new(Mutex::new(prometheus::default_registry().clone()));
    let server_registry = registry.clone();
    tokio::spawn(async move {
        start_metrics_server(port, server_registry).await;
    });
    registry
}

#[allow(clippy::too_many_arguments)]
async fn execute(
    suite: &SuiteConfig,
    store: &JsonFileStore,
    target: &TargetArgs,
    test_name: &str,
    plan: SweepPlan,
    timeout: Duration,
    retry: RetryPolicy,
    max_level: u32,
) -> Result<i32, CliError> {
    let profile = Arc::new(suite.api(&target.api)?.clone());
    let endpoint = resolve_endpoint(&profile, target.endpoint.as_deref())?;
    let prompts = load_prompts(suite, target)?;

    let client = build_client(&ClientConfig {
        skip_tls_verify: target.skip_tls_verify,
        resolve_target_addr: target.resolve.clone(),
        pool: PoolConfig::for_max_level(max_level),
    })?;
    let vars = template_vars(target);
    let prober = build_prober(suite, &profile, target, &vars)?;
    let executor = HttpExecutor::new(client, profile.clone(), &endpoint, vars, timeout, retry)?;
    let registry = target.metrics_port.map(spawn_metrics_server);

    let (shutdown, signal) = shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, cancelling sweep");
            shutdown.trigger();
        }
    });

    info!(
        api = %target.api,
        endpoint = %endpoint,
        url = %executor.url(),
        levels = ?plan.levels(),
        timeout_ms = timeout.as_millis() as u64,
        max_retries = retry.max_retries,
        "Sweep configured"
    );

    let labels = RunLabels {
        api_name: target.api.clone(),
        test_name: test_name.to_string(),
        endpoint,
    };
    let mut scheduler = SweepScheduler::new(Arc::new(executor), prompts, plan, labels)
        .with_analysis(suite.analysis)
        .with_shutdown(signal);
    if let Some(prober) = prober {
        scheduler = scheduler.with_prober(prober);
    }

    let result = scheduler.run().await?;

    store.save(&result).await?;
    print!("{}", render_sweep(&result));
    println!(
        "\nSaved run {} to {}",
        result.run_id,
        store_path(store.dir(), &result.run_id).display()
    );

    if let Some(registry) = registry {
        info!("Final metrics:\n{}", gather_metrics_string(&registry));
    }

    Ok(match result.status {
        SweepStatus::Completed => 0,
        SweepStatus::Cancelled => EXIT_CANCELLED,
    })
}

fn store_path(dir: &Path, run_id: &str) -> PathBuf {
    dir.join(format!("{}.json", run_id))
}
