//! Orderflow CLI Entry Point
//!
//! Loads workflow definitions, creates work orders and waits for them.
//!
//! # Usage
//!
//! ```bash
//! # Load a workflow and run one order of it
//! orderflow nightly.yaml
//!
//! # Request three orders partitioned by REGION
//! orderflow nightly.yaml --create workflow://nightly --param REGION=emea --count 3
//!
//! # Persist definitions and orders
//! orderflow nightly.yaml --state-dir /var/lib/orderflow
//!
//! # Dry run mode (preview commands)
//! orderflow nightly.yaml --dry-run
//! ```

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use colored::Colorize;
use log::{error, info, warn};

use orderflow::{load_workflow, EngineConfig, WorkOrderScheduler, WorkOrderStatus};
use orderflow::{APP_NAME, VERSION};

/// Context label recorded on orders created from the command line.
const DEFAULT_CONTEXT: &str = "cli";

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    workflow_paths: Vec<String>,
    config_path: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    create: Vec<String>,
    params: HashMap<String, String>,
    count: usize,
    context: String,
    dry_run: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workflow_paths: Vec::new(),
            config_path: None,
            state_dir: None,
            working_dir: None,
            create: Vec::new(),
            params: HashMap::new(),
            count: 1,
            context: DEFAULT_CONTEXT.to_string(),
            dry_run: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Work Order Orchestration Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: orderflow [OPTIONS] <WORKFLOW_FILE>...");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>...  Workflow definitions to load (YAML or JSON)");
    println!();
    println!("Options:");
    println!("  --create URI        Create work orders for URI (repeatable, URI#step");
    println!("                      starts at a given step). Defaults to every loaded workflow");
    println!("  --param KEY=VALUE   Work order parameter (repeatable)");
    println!("  --count N           Orders to request per URI (default: 1)");
    println!("  --context NAME      Context label for created orders (default: {})", DEFAULT_CONTEXT);
    println!("  --config PATH       Engine configuration file");
    println!("  --state-dir PATH    Persist definitions and orders under PATH");
    println!("  --working-dir PATH  Working directory for step commands");
    println!("  --dry-run           Preview commands without execution");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  orderflow nightly.yaml");
    println!("  orderflow nightly.yaml --create workflow://nightly --param REGION=emea --count 3");
    println!("  orderflow nightly.yaml --state-dir /var/lib/orderflow");
}

fn next_value<'a>(args: &'a [String], i: &mut usize, option: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires an argument", option))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => {
                config.dry_run = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--config" => {
                config.config_path = Some(PathBuf::from(next_value(args, &mut i, arg)?));
            }
            "--state-dir" => {
                config.state_dir = Some(PathBuf::from(next_value(args, &mut i, arg)?));
            }
            "--working-dir" => {
                config.working_dir = Some(PathBuf::from(next_value(args, &mut i, arg)?));
            }
            "--create" => {
                config.create.push(next_value(args, &mut i, arg)?.to_string());
            }
            "--context" => {
                config.context = next_value(args, &mut i, arg)?.to_string();
            }
            "--param" => {
                let pair = next_value(args, &mut i, arg)?;
                let (key, value) = pair
                    .split_once('=')
                    .filter(|(key, _)| !key.trim().is_empty())
                    .ok_or_else(|| format!("Invalid parameter (expected KEY=VALUE): {}", pair))?;
                config.params.insert(key.trim().to_string(), value.to_string());
            }
            "--count" => {
                let value = next_value(args, &mut i, arg)?;
                config.count = value
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| format!("Invalid count value: {}", value))?;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                config.workflow_paths.push(arg.clone());
            }
        }
        i += 1;
    }

    if config.workflow_paths.is_empty() && config.create.is_empty() {
        return Err("No workflow file or --create URI given".to_string());
    }

    Ok(config)
}

/// Validates the working directory.
fn check_working_directory(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if !dir.exists() {
        return Err(format!("Working directory does not exist: {}", dir.display()).into());
    }

    if !dir.is_dir() {
        return Err(format!("Path is not a directory: {}", dir.display()).into());
    }

    info!("Working directory: {}", dir.display());
    Ok(())
}

/// Merges the configuration file with command-line overrides.
fn engine_config(config: &Config) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut engine = match &config.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    if config.state_dir.is_some() {
        engine.state_dir = config.state_dir.clone();
    }
    if config.working_dir.is_some() {
        engine.working_dir = config.working_dir.clone();
    }
    engine.dry_run |= config.dry_run;

    Ok(engine)
}

fn colored_status(status: WorkOrderStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        WorkOrderStatus::Finished => text.green(),
        WorkOrderStatus::Error => text.red(),
        WorkOrderStatus::Pending | WorkOrderStatus::Running => text.yellow(),
    }
}

/// Main application entry point. Returns false if any order ended in ERROR.
async fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    let engine = engine_config(&config)?;

    if engine.dry_run {
        info!("Mode: DRY RUN (commands will not execute)");
        println!();
    }
    if let Some(dir) = &engine.working_dir {
        check_working_directory(dir)?;
    }
    if let Some(dir) = &engine.state_dir {
        info!("State directory: {}", dir.display());
    }

    let scheduler = WorkOrderScheduler::from_config(&engine)?;

    // Load workflows
    let mut loaded = Vec::new();
    for path in &config.workflow_paths {
        info!("Loading workflow: {}", path);
        let workflow = load_workflow(path).map_err(|e| {
            error!("Failed to load workflow: {}", e);
            format!("Could not load workflow from '{}': {}", path, e)
        })?;

        info!(
            "Workflow {} loaded: {} steps, semaphore {}",
            workflow.workflow_uri,
            workflow.len(),
            workflow.semaphore_type
        );
        loaded.push(workflow.workflow_uri.clone());
        scheduler.put_workflow(workflow)?;
    }

    let targets = if config.create.is_empty() {
        loaded
    } else {
        config.create.clone()
    };

    // Create work orders
    let mut created = Vec::new();
    for target in &targets {
        for _ in 0..config.count {
            let response = scheduler
                .create_work_order(target, config.params.clone(), &config.context)
                .await?;

            match response.uri {
                Some(uri) if response.is_created => {
                    println!("{} {}", "created".green(), uri);
                    created.push(uri);
                }
                _ => {
                    let reason = response.message.unwrap_or_default();
                    println!("{} {}: {}", "denied".yellow(), target, reason);
                }
            }
        }
    }

    if created.is_empty() {
        warn!("No work orders were created");
        return Ok(true);
    }

    println!();
    info!("Waiting for {} work order(s)...", created.len());

    // Wait for every order to reach a terminal status
    let mut all_finished = true;
    for uri in &created {
        let order = scheduler
            .wait_for_completion(uri, engine.poll_interval())
            .await?;

        let steps = order.history.len();
        match &order.error {
            Some(reason) => {
                all_finished = false;
                println!("{} {} ({} steps): {}", colored_status(order.status), uri, steps, reason);
            }
            None => println!("{} {} ({} steps)", colored_status(order.status), uri, steps),
        }
    }

    Ok(all_finished)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
