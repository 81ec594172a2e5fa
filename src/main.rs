//! stepwise - 计划执行器
//!
//! 用法：`stepwise <plan.json> [--config <file>] [--auto-approve]`
//! 读取计划、装配引擎并执行；需要审批的步骤在终端询问 y/N，Ctrl-C 协作式取消。

use std::path::PathBuf;

use anyhow::{bail, Context};
use stepwise::config::load_config;
use stepwise::core::{
    task_from_plan_text, ChannelApproval, EngineBuilder, EventSink, ExecutionEvent, TaskSession,
};
use tokio::io::{AsyncBufReadExt, BufReader};

struct Args {
    plan: PathBuf,
    config: Option<PathBuf>,
    auto_approve: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut plan = None;
    let mut config = None;
    let mut auto_approve = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                config = Some(PathBuf::from(
                    args.next().context("--config requires a path")?,
                ))
            }
            "--auto-approve" => auto_approve = true,
            "-h" | "--help" => {
                println!("usage: stepwise <plan.json> [--config <file>] [--auto-approve]");
                std::process::exit(0);
            }
            other if plan.is_none() => plan = Some(PathBuf::from(other)),
            other => bail!("unexpected argument: {}", other),
        }
    }
    Ok(Args {
        plan: plan.context("missing plan file (usage: stepwise <plan.json>)")?,
        config,
        auto_approve,
    })
}

fn log_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::StepStart { step_id, title, .. } => {
            tracing::info!(step_id = %step_id, "started: {}", title)
        }
        ExecutionEvent::StepComplete { step_id, result, attempts, .. } => {
            tracing::info!(step_id = %step_id, attempts, "done: {}", result.message)
        }
        ExecutionEvent::StepError { step_id, error, attempts, .. } => {
            tracing::warn!(step_id = %step_id, attempts, "failed: {}", error)
        }
        ExecutionEvent::TaskProgress { completed, skipped, total, .. } => {
            tracing::info!("progress {}/{} ({} skipped)", completed + skipped, total, skipped)
        }
        other => tracing::debug!(event = other.name(), payload = %serde_json::to_string(other).unwrap_or_default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stepwise::observability::init();
    let args = parse_args()?;

    let config = load_config(args.config.clone()).context("Failed to load config")?;
    let raw = std::fs::read_to_string(&args.plan)
        .with_context(|| format!("Failed to read plan {}", args.plan.display()))?;
    let goal = args
        .plan
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let task = task_from_plan_text(&raw, &goal);

    let workspace = match &config.app.workspace_root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("Failed to resolve working directory")?,
    };
    let engine = EngineBuilder::new(config, workspace)
        .build()
        .context("Failed to build execution engine")?;

    let (events, mut event_rx) = EventSink::channel();
    let mut session = TaskSession::new().with_events(events);
    if !args.auto_approve {
        let (gate, mut requests) = ChannelApproval::channel();
        session = session.with_approval(gate);
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(request) = requests.recv().await {
                println!("\nApproval required: {}", request.impact_summary);
                println!("Approve step '{}'? [y/N] ", request.step_title);
                let answer = lines.next_line().await.ok().flatten().unwrap_or_default();
                request.respond(matches!(answer.trim(), "y" | "Y" | "yes"));
            }
        });
    }

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            log_event(&event);
        }
    });

    let control = session.control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling after current step");
            control.cancel();
        }
    });

    let done = engine.execute_task(task, &session).await;
    println!("{}", serde_json::to_string_pretty(&done)?);
    Ok(())
}
