mod cli;

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use osa_runtime::bus::Event;
use osa_runtime::session::SessionOptions;
use osa_runtime::turn::{TurnOutcome, TurnRequest};
use osa_runtime::Runtime;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("osa=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = osa_domain::config::Config::load();
    let runtime = osa_runtime::bootstrap::bootstrap(config).await;

    match cli.command {
        Command::Run {
            message,
            session,
            provider,
            model,
        } => run_once(&runtime, message, session, provider, model).await,
        Command::Chat { session } => chat(&runtime, session).await,
        Command::Status => {
            print_status(&runtime);
            Ok(())
        }
        Command::Trigger { id, payload } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload must be valid JSON")?;
            runtime.scheduler.fire_trigger(&id, payload).await?;
            println!("trigger '{id}' fired");
            Ok(())
        }
    }
}

async fn run_once(
    runtime: &Runtime,
    message: String,
    session: Option<String>,
    provider: Option<String>,
    model: Option<String>,
) -> anyhow::Result<()> {
    let outcome = runtime.manager.create(SessionOptions {
        session_id: session,
        channel: Some("cli".into()),
        ..Default::default()
    });
    let handle = runtime
        .manager
        .get(outcome.session_id())
        .context("session vanished")?;

    let printed = spawn_token_printer(runtime, outcome.session_id());
    let result = handle
        .process_message(TurnRequest {
            message,
            provider,
            model,
            skip_plan: false,
        })
        .await?;
    finish_output(&printed, &result.outcome);
    Ok(())
}

async fn chat(runtime: &Runtime, session: Option<String>) -> anyhow::Result<()> {
    let outcome = runtime.manager.create(SessionOptions {
        session_id: session,
        channel: Some("cli".into()),
        ..Default::default()
    });
    let session_id = outcome.session_id().to_string();
    let handle = runtime
        .manager
        .get(&session_id)
        .context("session vanished")?;

    println!("osa chat — session {session_id} (exit with ctrl-d)");
    let mut editor = rustyline::DefaultEditor::new()?;
    let mut pending_plan: Option<String> = None;
    // One printer for the whole session; the flag resets per turn.
    let printed = spawn_token_printer(runtime, &session_id);

    loop {
        let line = match editor.readline("you> ") {
            Ok(line) => line,
            Err(rustyline::error::ReadlineError::Interrupted) => continue,
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }
        let _ = editor.add_history_entry(&line);

        // A pending plan turns "yes" into an approved re-run.
        let (message, skip_plan) = match (&pending_plan, line.as_str()) {
            (Some(original), "yes" | "y" | "approve") => (original.clone(), true),
            _ => (line.clone(), false),
        };
        pending_plan = None;

        printed.store(false, Ordering::SeqCst);
        match handle
            .process_message(TurnRequest {
                message: message.clone(),
                skip_plan,
                ..Default::default()
            })
            .await
        {
            Ok(result) => {
                if let TurnOutcome::Plan(_) = &result.outcome {
                    pending_plan = Some(message);
                }
                finish_output(&printed, &result.outcome);
                if pending_plan.is_some() {
                    println!("(plan mode: reply 'yes' to execute)");
                }
            }
            Err(e) => eprintln!("error: {e}"),
        }
    }

    runtime.manager.close(&session_id).await;
    Ok(())
}

/// Print streamed tokens for one session as they arrive; returns a flag
/// recording whether anything was printed this turn.
fn spawn_token_printer(runtime: &Runtime, session_id: &str) -> Arc<AtomicBool> {
    let printed = Arc::new(AtomicBool::new(false));
    let flag = printed.clone();
    let mut rx = runtime.state.bus.subscribe();
    let session_id = session_id.to_string();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if let Event::StreamingToken {
                session_id: sid,
                text,
            } = event
            {
                if sid == session_id {
                    flag.store(true, Ordering::SeqCst);
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
            }
        }
    });
    printed
}

/// After a turn: newline-terminate streamed output, or print the whole
/// reply when nothing streamed (noise acks, plans, error replies).
fn finish_output(printed: &Arc<AtomicBool>, outcome: &TurnOutcome) {
    if printed.load(Ordering::SeqCst) {
        println!();
    } else {
        println!("{}", outcome.text());
    }
}

fn print_status(runtime: &Runtime) {
    let registry = runtime.state.router.registry();
    println!("providers ({}):", registry.len());
    for id in registry.preferred_order() {
        println!("  - {id}");
    }
    for err in registry.init_errors() {
        println!("  ! {} failed to initialize: {}", err.provider_id, err.error);
    }
    println!("fallback chain: {}", runtime.state.router.chain().join(" -> "));

    let budget = runtime.state.budget.status();
    println!(
        "budget: daily ${:.2} / ${:.2}, monthly ${:.2} / ${:.2}",
        budget.daily_spent_usd,
        budget.daily_limit_usd,
        budget.monthly_spent_usd,
        budget.monthly_limit_usd
    );

    if runtime.state.treasury.enabled() {
        let t = runtime.state.treasury.status();
        println!(
            "treasury: balance ${:.2}, reserved ${:.2}, available ${:.2}",
            t.balance_usd, t.reserved_usd, t.available_usd
        );
    }

    println!("tools: {}", runtime.state.tools.len());
    println!("skills: {}", runtime.state.skills.len());
    println!("sessions: {}", runtime.manager.list().len());
}
