//! Binary entry point: a thin shell dispatching to `ralph_core`.

use std::io::{BufRead, Write as _};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use ralph_core::cli::{Cli, Command};
use ralph_core::config::RalphConfig;
use ralph_core::loop_runner::{LoopConfig, LoopRunner, LoopStatus};
use ralph_core::prd;
use ralph_core::registry::{SessionRegistry, SessionStatus};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let result = dispatch(cli).await;
    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("ralph: {e:#}");
            std::process::exit(2);
        }
    }
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        None | Some(Command::Status { task: None }) => cmd_status_all().await,
        Some(Command::Run {
            task_dir,
            max_iterations,
            agent,
            model,
            yes,
            prompt,
            foreground,
        }) => {
            cmd_run(
                task_dir.unwrap_or_else(|| PathBuf::from(".")),
                max_iterations,
                agent,
                model,
                yes,
                prompt,
                foreground,
            )
            .await
        }
        Some(Command::Status { task: Some(task) }) => cmd_status_one(&task).await,
        Some(Command::Stop { task }) => cmd_control(&task, "stop").await,
        Some(Command::Checkpoint { task }) => cmd_control(&task, "checkpoint").await,
        Some(Command::Attach { task }) => cmd_attach(&task).await,
        Some(Command::Clean) => cmd_clean().await,
        Some(Command::Init) => cmd_init().await,
    }
}

async fn cmd_run(
    task_dir: PathBuf,
    max_iterations: u32,
    agent: Option<String>,
    model: Option<String>,
    yes: bool,
    prompt: Option<PathBuf>,
    foreground: bool,
) -> Result<i32> {
    if !task_dir.join(prd::make_prd_filename()).exists() {
        bail!(
            "no prd.json found in {:?}; run `ralph init` first",
            task_dir
        );
    }

    if !yes && !foreground {
        print!("Start loop for {:?}? [y/N] ", task_dir);
        std::io::stdout().flush().ok();
        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer).ok();
        if !answer.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(2);
        }
    }

    if !foreground {
        return spawn_background(&task_dir, max_iterations, agent.as_deref(), model.as_deref(), prompt.as_deref());
    }

    let config = RalphConfig::load();
    let resolved_prompt = RalphConfig::resolve_prompt_template(prompt.as_deref());
    let registry = SessionRegistry::open(&RalphConfig::registry_db_path())
        .context("opening session registry")?;

    let loop_config = LoopConfig {
        task_dir,
        max_iterations,
        preferred_agent: agent,
        model,
        prompt_template_path: resolved_prompt,
        config,
        non_interactive: true,
    };

    let runner = LoopRunner::new(loop_config, registry);
    let status = runner.run().await?;
    Ok(exit_code_for(&status))
}

fn exit_code_for(status: &LoopStatus) -> i32 {
    match status {
        LoopStatus::Completed => 0,
        LoopStatus::Stopped | LoopStatus::Checkpointed { .. } => 1,
        LoopStatus::Failed { .. } => 1,
        LoopStatus::Iterating => 2,
    }
}

fn spawn_background(
    task_dir: &Path,
    max_iterations: u32,
    agent: Option<&str>,
    model: Option<&str>,
    prompt: Option<&Path>,
) -> Result<i32> {
    let exe = std::env::current_exe().context("resolving current executable")?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("run")
        .arg(task_dir)
        .arg("--max-iterations")
        .arg(max_iterations.to_string())
        .arg("--yes")
        .arg("--foreground");
    if let Some(agent) = agent {
        command.arg("--agent").arg(agent);
    }
    if let Some(model) = model {
        command.arg("--model").arg(model);
    }
    if let Some(prompt) = prompt {
        command.arg("--prompt").arg(prompt);
    }
    command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    let child = command.spawn().context("spawning background loop")?;
    println!("Started loop in background (pid {})", child.id());
    Ok(0)
}

async fn cmd_status_all() -> Result<i32> {
    let registry = SessionRegistry::open(&RalphConfig::registry_db_path())?;
    let sessions = registry.list()?;
    if sessions.is_empty() {
        println!("No known sessions.");
        return Ok(0);
    }
    println!("{:<24} {:<12} {:<10} {:<10}", "TASK", "STATUS", "ITERATION", "AGENT");
    for s in sessions {
        println!(
            "{:<24} {:<12} {:<10} {:<10}",
            s.task_name,
            s.status.as_str(),
            format!("{}/{}", s.current_iteration, s.max_iterations),
            s.agent,
        );
    }
    Ok(0)
}

async fn cmd_status_one(task: &str) -> Result<i32> {
    let registry = SessionRegistry::open(&RalphConfig::registry_db_path())?;
    let record = registry.get(task)?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(0)
}

async fn cmd_control(task: &str, method: &str) -> Result<i32> {
    let registry = SessionRegistry::open(&RalphConfig::registry_db_path())?;
    let record = registry.get(task)?;
    if record.status != SessionStatus::Running {
        bail!("session {task:?} is not running (status: {})", record.status.as_str());
    }

    let stream = UnixStream::connect(&record.socket_path)
        .await
        .with_context(|| format!("connecting to {}", record.socket_path))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = serde_json::json!({"jsonrpc": "2.0", "method": method, "id": 1});
    write_half.write_all(request.to_string().as_bytes()).await?;
    write_half.write_all(b"\n").await?;

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    println!("{}", line.trim());
    Ok(0)
}

async fn cmd_attach(task: &str) -> Result<i32> {
    let registry = SessionRegistry::open(&RalphConfig::registry_db_path())?;
    let record = registry.get(task)?;

    let stream = UnixStream::connect(&record.socket_path)
        .await
        .with_context(|| format!("connecting to {}", record.socket_path))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let enable = serde_json::json!({"jsonrpc": "2.0", "method": "set_interactive_mode", "params": {"enabled": true}, "id": 1});
    write_half.write_all(enable.to_string().as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    let mut ack = String::new();
    reader.read_line(&mut ack).await?;

    let subscribe = serde_json::json!({"jsonrpc": "2.0", "method": "subscribe", "params": {"events": ["*"]}, "id": 2});
    write_half.write_all(subscribe.to_string().as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    ack.clear();
    reader.read_line(&mut ack).await?;

    println!("Attached to {task}. Type input and press Enter; Ctrl+D to detach.");

    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
    let mut incoming = String::new();
    loop {
        tokio::select! {
            line = stdin_lines.next_line() => {
                match line? {
                    Some(text) => {
                        let request = serde_json::json!({
                            "jsonrpc": "2.0", "method": "write_pty",
                            "params": {"data": format!("{text}\n")}, "id": 3
                        });
                        write_half.write_all(request.to_string().as_bytes()).await?;
                        write_half.write_all(b"\n").await?;
                    }
                    None => break,
                }
            }
            read = reader.read_line(&mut incoming) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                print!("{incoming}");
                std::io::stdout().flush().ok();
                incoming.clear();
            }
        }
    }
    Ok(0)
}

async fn cmd_clean() -> Result<i32> {
    let registry = SessionRegistry::open(&RalphConfig::registry_db_path())?;
    let removed = registry.clean()?;
    println!("Marked {removed} orphaned session(s) as failed.");
    Ok(0)
}

async fn cmd_init() -> Result<i32> {
    let task_dir = PathBuf::from(".");
    let prd_path = task_dir.join(prd::make_prd_filename());
    if prd_path.exists() {
        bail!("prd.json already exists in this directory");
    }

    let starter = serde_json::json!({
        "schemaVersion": "2.0",
        "project": "new-project",
        "taskDir": ".",
        "branchName": "ralph/new-project",
        "type": "feature",
        "description": "Describe what this loop should build.",
        "autoMerge": false,
        "userStories": [
            {
                "id": "US-001",
                "title": "Replace this with your first story",
                "priority": 1,
                "acceptanceCriteria": [
                    {"description": "Replace this with a concrete, checkable criterion.", "passes": false}
                ]
            }
        ]
    });
    std::fs::write(&prd_path, serde_json::to_string_pretty(&starter)?)?;

    let prompt_path = task_dir.join("prompt.md");
    if !prompt_path.exists() {
        std::fs::write(
            &prompt_path,
            "You are working autonomously against the PRD in this directory. \
             Pick the next eligible story, implement it, update its `passes` \
             field, and when every story passes emit `<promise>COMPLETE</promise>`.\n",
        )?;
    }

    println!("Wrote prd.json and prompt.md. Edit them, then run `ralph run`.");
    Ok(0)
}
