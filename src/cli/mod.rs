//! CLI subcommands: init, validate, preview, up, destroy, outputs, status, graph, schema.

use crate::components::stack;
use crate::core::error::InfraError;
use crate::core::executor::{self, UpConfig};
use crate::core::graph::ResourceGraph;
use crate::core::{parser, resolver, state, types};
use crate::provider::memory::MemoryProvider;
use clap::Subcommand;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new stack file and state directory
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate stack.yaml and compose the resource graph
    Validate {
        /// Path to stack.yaml
        #[arg(short, long, default_value = "stack.yaml")]
        file: PathBuf,
    },

    /// Show what `up` would do (diff declared vs recorded)
    Preview {
        /// Path to stack.yaml
        #[arg(short, long, default_value = "stack.yaml")]
        file: PathBuf,

        /// Treat every resource as changed
        #[arg(long)]
        force: bool,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Converge the stack to its declaration
    Up {
        /// Path to stack.yaml
        #[arg(short, long, default_value = "stack.yaml")]
        file: PathBuf,

        /// Re-apply every resource even when its inputs are unchanged
        #[arg(long)]
        force: bool,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Delete every recorded resource in reverse apply order
    Destroy {
        /// Path to stack.yaml
        #[arg(short, long, default_value = "stack.yaml")]
        file: PathBuf,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Print the stack outputs recorded by the last `up`
    Outputs {
        /// Path to stack.yaml
        #[arg(short, long, default_value = "stack.yaml")]
        file: PathBuf,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Print as JSON instead of YAML
        #[arg(long)]
        json: bool,
    },

    /// Show recorded state from lock files
    Status {
        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Only show this stack
        #[arg(short, long)]
        stack: Option<String>,
    },

    /// Print the ownership tree and execution order
    Graph {
        /// Path to stack.yaml
        #[arg(short, long, default_value = "stack.yaml")]
        file: PathBuf,
    },

    /// Print the JSON Schema of stack.yaml
    Schema,
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Preview {
            file,
            force,
            state_dir,
        } => cmd_preview(&file, &state_dir, force),
        Commands::Up {
            file,
            force,
            state_dir,
        } => cmd_up(&file, &state_dir, force),
        Commands::Destroy { file, state_dir } => cmd_destroy(&file, &state_dir),
        Commands::Outputs {
            file,
            state_dir,
            json,
        } => cmd_outputs(&file, &state_dir, json),
        Commands::Status { state_dir, stack } => cmd_status(&state_dir, stack.as_deref()),
        Commands::Graph { file } => cmd_graph(&file),
        Commands::Schema => cmd_schema(),
    }
}

fn err(e: InfraError) -> String {
    e.to_string()
}

const STACK_TEMPLATE: &str = r#"project: air-tek
stack: dev
description: "Air-Tek web stack"
region: us-east-1

config:
  network:name: dev
  network:vpcRange: 10.1.0.0/16

tagging:
  standard_tags: true
  prefix: air-tek

policy:
  event_log: true
"#;

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join("stack.yaml");
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).map_err(|e| format!("cannot create state dir: {}", e))?;
    std::fs::write(&config_path, STACK_TEMPLATE)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;

    println!("Initialized stack at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

/// Parse and validate a stack file, printing every finding.
fn parse_and_validate(file: &Path) -> Result<types::StackConfig, String> {
    let config = parser::parse_config_file(file).map_err(err)?;
    let errors = parser::validate_config(&config);
    if errors.is_empty() {
        return Ok(config);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err(format!("{} validation error(s)", errors.len()))
}

/// The in-memory control plane, rehydrated from the stack's lock if one exists.
fn provider_for(config: &types::StackConfig, state_dir: &Path) -> Result<MemoryProvider, String> {
    Ok(match state::load_lock(state_dir, &config.stack).map_err(err)? {
        Some(lock) => MemoryProvider::from_lock(&config.region, &lock),
        None => MemoryProvider::new(&config.region),
    })
}

fn compose(config: &types::StackConfig, provider: &MemoryProvider) -> Result<ResourceGraph, String> {
    stack::compose(config, provider).map_err(err)
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let provider = MemoryProvider::new(&config.region);
    let graph = compose(&config, &provider)?;
    resolver::build_execution_order(&graph).map_err(err)?;
    println!(
        "OK: {}/{} ({} resources, {} outputs)",
        config.project,
        config.stack,
        graph.len(),
        graph.outputs().len()
    );
    Ok(())
}

fn cmd_preview(file: &Path, state_dir: &Path, force: bool) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let provider = provider_for(&config, state_dir)?;
    let graph = compose(&config, &provider)?;
    let cfg = UpConfig {
        config: &config,
        state_dir,
        provider: &provider,
        force,
    };
    let plan = executor::preview(&cfg, &graph).map_err(err)?;
    print_plan(&plan);
    Ok(())
}

/// Display a plan to stdout.
fn print_plan(plan: &types::ExecutionPlan) {
    println!("Previewing: {} ({} changes)", plan.stack, plan.changes.len());
    println!();

    let mut current_parent: Option<&types::Urn> = None;
    for change in &plan.changes {
        if change.parent.as_ref() != current_parent {
            current_parent = change.parent.as_ref();
            if let Some(parent) = current_parent {
                println!("{}:", parent);
            }
        }
        let symbol = match change.action {
            types::PlanAction::Create => "+",
            types::PlanAction::Update => "~",
            types::PlanAction::Read => "<",
            types::PlanAction::Destroy => "-",
            types::PlanAction::NoOp => " ",
        };
        println!("  {} {}", symbol, change.description);
    }

    println!();
    println!(
        "Preview: {} to add, {} to change, {} to destroy, {} to read, {} unchanged.",
        plan.to_create, plan.to_update, plan.to_destroy, plan.to_read, plan.unchanged
    );
}

fn cmd_up(file: &Path, state_dir: &Path, force: bool) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let provider = provider_for(&config, state_dir)?;
    let graph = compose(&config, &provider)?;
    let cfg = UpConfig {
        config: &config,
        state_dir,
        provider: &provider,
        force,
    };

    let result = executor::up(&cfg, &graph).map_err(err)?;
    println!(
        "{}: {} created, {} updated, {} unchanged, {} deleted ({:.1}s)",
        result.stack,
        result.resources_created,
        result.resources_updated,
        result.resources_unchanged,
        result.resources_deleted,
        result.total_duration.as_secs_f64()
    );
    println!();
    println!("Outputs:");
    for (name, value) in &result.outputs {
        println!("  {}: {}", name, display_value(value));
    }
    Ok(())
}

fn cmd_destroy(file: &Path, state_dir: &Path) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let provider = provider_for(&config, state_dir)?;
    let cfg = UpConfig {
        config: &config,
        state_dir,
        provider: &provider,
        force: false,
    };
    let result = executor::destroy(&cfg).map_err(err)?;
    println!(
        "{}: {} deleted ({:.1}s)",
        result.stack,
        result.resources_deleted,
        result.total_duration.as_secs_f64()
    );
    Ok(())
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn cmd_outputs(file: &Path, state_dir: &Path, json: bool) -> Result<(), String> {
    let config = parser::parse_config_file(file).map_err(err)?;
    let outputs = executor::outputs(state_dir, &config.stack).map_err(err)?;
    let rendered = if json {
        serde_json::to_string_pretty(&outputs).map_err(|e| e.to_string())?
    } else {
        serde_yaml_ng::to_string(&outputs).map_err(|e| e.to_string())?
    };
    println!("{}", rendered.trim_end());
    Ok(())
}

fn cmd_status(state_dir: &Path, stack_filter: Option<&str>) -> Result<(), String> {
    let entries = std::fs::read_dir(state_dir)
        .map_err(|e| format!("cannot read state dir {}: {}", state_dir.display(), e))?;

    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| stack_filter.is_none_or(|f| f == name))
        .collect();
    names.sort();

    let mut found = false;
    for name in names {
        let Some(lock) = state::load_lock(state_dir, &name).map_err(err)? else {
            continue;
        };
        found = true;
        println!("Stack: {}/{}", lock.project, lock.stack);
        println!("  Generated: {}", lock.generated_at);
        println!("  Generator: {}", lock.generator);
        println!("  Resources: {}", lock.resources.len());

        for (urn, rl) in &lock.resources {
            let duration = rl
                .duration_seconds
                .map(|d| format!(" ({:.2}s)", d))
                .unwrap_or_default();
            println!("    {}: {}{}", urn, rl.status, duration);
        }
        println!();
    }

    if !found {
        println!("No state found. Run `airtek up` first.");
    }

    Ok(())
}

fn print_tree(graph: &ResourceGraph, parent: Option<&types::Urn>, depth: usize) {
    for decl in graph.children(parent) {
        let label = decl.type_token.as_deref().unwrap_or(decl.kind.token());
        println!("{}{} ({})", "  ".repeat(depth), decl.name, label);
        if decl.kind.is_component() {
            print_tree(graph, Some(&decl.urn), depth + 1);
        }
    }
}

fn cmd_graph(file: &Path) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let provider = MemoryProvider::new(&config.region);
    let graph = compose(&config, &provider)?;
    let order = resolver::build_execution_order(&graph).map_err(err)?;

    println!("Ownership:");
    print_tree(&graph, None, 1);
    println!();
    println!("Execution order:");
    for (i, urn) in order.iter().enumerate() {
        println!("  {:>3}. {}", i + 1, urn);
    }
    Ok(())
}

fn cmd_schema() -> Result<(), String> {
    let schema = schemars::schema_for!(types::StackConfig);
    let json = serde_json::to_string_pretty(&schema).map_err(|e| e.to_string())?;
    println!("{}", json);
    Ok(())
}
