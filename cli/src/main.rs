//! Command-line front end for the Overseer engine.

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use clap::Subcommand;
use overseer_core::AgentDefinition;
use overseer_core::AgentScope;
use overseer_core::Details;
use overseer_core::Engine;
use overseer_core::EngineConfig;
use overseer_core::ExecutionRequest;
use overseer_core::FsAgentStore;
use overseer_core::FsSkillResolver;
use overseer_core::ManageAction;
use overseer_core::ManageOutcome;
use overseer_core::OnUpdate;
use overseer_core::RequestMode;
use overseer_core::RunOverrides;
use overseer_core::SkillSpec;
use overseer_core::StoreScope;
use overseer_core::TaskSpec;
use overseer_core::ThinkingLevel;
use overseer_core::manage::AgentPatch;
use overseer_core::request::OutputSpec;
use overseer_core::request::chain_steps_from_value;
use overseer_core::store::find_project_root;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "overseer", about = "Subagent orchestration for the pi coding agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a single agent on a task.
    Run {
        agent: String,
        task: String,
        /// Override the agent's model.
        #[arg(long)]
        model: Option<String>,
        /// Skill override (repeatable). `--no-skills` disables.
        #[arg(long = "skill")]
        skills: Vec<String>,
        #[arg(long)]
        no_skills: bool,
        /// Output file override; `--no-output` disables the output file.
        #[arg(long)]
        output: Option<String>,
        #[arg(long)]
        no_output: bool,
        /// Run detached; poll status from disk.
        #[arg(long = "async")]
        background: bool,
        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Fan out tasks from a JSON file: `[{"agent": "...", "task": "..."}]`.
    Parallel {
        spec: PathBuf,
        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Run a chain from a JSON file of steps.
    Chain {
        spec: PathBuf,
        /// Initial task substituted for `{task}` in step templates.
        #[arg(long)]
        task: Option<String>,
        /// Persistent chain directory (exempt from the startup sweep).
        #[arg(long)]
        chain_dir: Option<PathBuf>,
        #[arg(long = "async")]
        background: bool,
        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Manage stored agents.
    Agents {
        #[command(subcommand)]
        action: AgentsCommand,
    },

    /// Background worker entry point (spawned by the engine).
    #[command(hide = true)]
    Worker { input: PathBuf },
}

#[derive(Debug, Subcommand)]
enum AgentsCommand {
    List {
        #[arg(long, default_value = "both")]
        scope: String,
    },
    Get {
        name: String,
        #[arg(long, default_value = "both")]
        scope: String,
    },
    Create {
        name: String,
        #[arg(long)]
        model: String,
        #[arg(long, default_value = "")]
        prompt: String,
        #[arg(long)]
        thinking: Option<String>,
        #[arg(long, default_value = "user")]
        scope: String,
    },
    Update {
        name: String,
        #[arg(long)]
        rename: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        prompt: Option<String>,
        /// Pass an empty string to clear.
        #[arg(long)]
        output: Option<String>,
        #[arg(long, default_value = "user")]
        scope: String,
    },
    Delete {
        name: String,
        #[arg(long, default_value = "user")]
        scope: String,
    },
}

fn agent_scope(raw: &str) -> Result<AgentScope> {
    match raw {
        "user" => Ok(AgentScope::User),
        "project" => Ok(AgentScope::Project),
        "both" => Ok(AgentScope::Both),
        other => bail!("unknown scope: {other} (expected user, project, or both)"),
    }
}

fn store_scope(raw: &str) -> Result<StoreScope> {
    match raw {
        "user" => Ok(StoreScope::User),
        "project" => Ok(StoreScope::Project),
        other => bail!("unknown scope: {other} (expected user or project)"),
    }
}

fn thinking_level(raw: &str) -> Result<ThinkingLevel> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .with_context(|| format!("unknown thinking level: {raw}"))
}

fn build_engine(cwd: &std::path::Path) -> Engine {
    let store = FsAgentStore::discover(cwd);
    let user_root = dirs_root();
    let skills = FsSkillResolver::new(user_root, find_project_root(cwd));
    Engine::new(
        EngineConfig::new(cwd.to_path_buf()),
        Arc::new(store),
        Arc::new(skills),
    )
}

fn dirs_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".overseer")
}

fn print_details(details: &Details) {
    if let Some(id) = &details.async_id {
        println!("background run started: {id}");
        if let Some(dir) = &details.async_dir {
            println!("status: {}", dir.join("status.json").display());
        }
        return;
    }
    for note in &details.notes {
        eprintln!("note: {note}");
    }
    for result in &details.results {
        for warning in &result.warnings {
            eprintln!("warning [{}]: {warning}", result.agent);
        }
    }
    println!("{}", details.output);
    if !details.succeeded() {
        std::process::exit(1);
    }
}

fn print_outcome(outcome: &ManageOutcome) {
    for warning in &outcome.warnings {
        eprintln!("warning: {warning}");
    }
    if outcome.agents.is_empty() {
        println!("{}", outcome.message);
    } else {
        for agent in &outcome.agents {
            println!("{}  {}  [{:?}]", agent.name, agent.model, agent.source);
        }
    }
}

fn progress_printer() -> OnUpdate {
    Arc::new(|details: &Details| {
        if let Some(progress) = &details.progress {
            let line: Vec<String> = progress
                .iter()
                .map(|p| format!("{}:{:?}({} tools)", p.agent, p.state, p.tool_count))
                .collect();
            eprint!("\r{}", line.join("  "));
        }
    })
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Worker { input } => {
            overseer_core::background::worker::run_worker(&input)
                .await
                .context("background worker failed")?;
            Ok(())
        }

        Command::Run {
            agent,
            task,
            model,
            skills,
            no_skills,
            output,
            no_output,
            background,
            cwd,
        } => {
            let cwd = effective_cwd(cwd)?;
            let engine = build_engine(&cwd);
            engine.start();

            let overrides = RunOverrides {
                model,
                skills: if no_skills {
                    SkillSpec::Disabled
                } else if skills.is_empty() {
                    SkillSpec::Inherit
                } else {
                    SkillSpec::Explicit(skills)
                },
                output: if no_output {
                    OutputSpec::Disabled
                } else {
                    output.map_or(OutputSpec::Inherit, OutputSpec::Path)
                },
                reads: None,
                progress: None,
            };
            let mut request = ExecutionRequest::new(RequestMode::Single {
                agent,
                task,
                overrides,
            });
            request.cwd = Some(cwd);
            request.background = background;

            let details = execute(&engine, request, background).await?;
            print_details(&details);
            engine.shutdown();
            Ok(())
        }

        Command::Parallel { spec, cwd } => {
            let cwd = effective_cwd(cwd)?;
            let engine = build_engine(&cwd);
            engine.start();

            let text = std::fs::read_to_string(&spec)
                .with_context(|| format!("cannot read {}", spec.display()))?;
            let value: serde_json::Value = serde_json::from_str(&text)?;
            let serde_json::Value::Array(items) = value else {
                bail!("parallel spec must be a JSON array of {{agent, task}} objects");
            };
            let mut tasks = Vec::with_capacity(items.len());
            for item in &items {
                let agent = item
                    .get("agent")
                    .and_then(|v| v.as_str())
                    .context("task entry is missing an agent")?;
                let task = item
                    .get("task")
                    .and_then(|v| v.as_str())
                    .context("task entry is missing a task")?;
                tasks.push(TaskSpec {
                    agent: agent.to_string(),
                    task: task.to_string(),
                    overrides: RunOverrides::default(),
                });
            }

            let mut request = ExecutionRequest::parallel(tasks);
            request.cwd = Some(cwd);
            let details = execute(&engine, request, false).await?;
            print_details(&details);
            engine.shutdown();
            Ok(())
        }

        Command::Chain {
            spec,
            task,
            chain_dir,
            background,
            cwd,
        } => {
            let cwd = effective_cwd(cwd)?;
            let engine = build_engine(&cwd);
            engine.start();

            let text = std::fs::read_to_string(&spec)
                .with_context(|| format!("cannot read {}", spec.display()))?;
            let value: serde_json::Value = serde_json::from_str(&text)?;
            let steps = chain_steps_from_value(&value)?;

            let mut request = ExecutionRequest::chain(steps, task);
            request.cwd = Some(cwd);
            request.chain_dir = chain_dir;
            request.background = background;
            let details = execute(&engine, request, background).await?;
            print_details(&details);
            engine.shutdown();
            Ok(())
        }

        Command::Agents { action } => {
            let cwd = effective_cwd(None)?;
            let engine = build_engine(&cwd);
            let manage_action = match action {
                AgentsCommand::List { scope } => ManageAction::List {
                    scope: agent_scope(&scope)?,
                },
                AgentsCommand::Get { name, scope } => ManageAction::Get {
                    name,
                    scope: agent_scope(&scope)?,
                },
                AgentsCommand::Create {
                    name,
                    model,
                    prompt,
                    thinking,
                    scope,
                } => {
                    let mut agent = AgentDefinition::new(name, model);
                    agent.system_prompt = prompt;
                    if let Some(level) = thinking {
                        agent.thinking = thinking_level(&level)?;
                    }
                    ManageAction::Create {
                        agent,
                        scope: store_scope(&scope)?,
                    }
                }
                AgentsCommand::Update {
                    name,
                    rename,
                    model,
                    prompt,
                    output,
                    scope,
                } => ManageAction::Update {
                    name,
                    patch: AgentPatch {
                        name: rename,
                        model,
                        system_prompt: prompt,
                        output,
                        ..AgentPatch::default()
                    },
                    scope: store_scope(&scope)?,
                },
                AgentsCommand::Delete { name, scope } => ManageAction::Delete {
                    name,
                    scope: store_scope(&scope)?,
                },
            };
            let outcome = engine.manage(manage_action, &[])?;
            print_outcome(&outcome);
            Ok(())
        }
    }
}

async fn execute(engine: &Engine, request: ExecutionRequest, background: bool) -> Result<Details> {
    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let on_update = (!background).then(progress_printer);
    let details = engine.execute(request, on_update, cancel).await?;
    if !background {
        // Terminate the progress line before the final output.
        eprintln!();
    }
    Ok(details)
}

fn effective_cwd(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => std::env::current_dir().context("cannot determine the current directory"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the async runtime")?
        .block_on(run(cli))
}
