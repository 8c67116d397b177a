// crates/taskcli/src/main.rs

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::time::Duration;
use taskcore::{ExecutionEvent, TaskContext, TaskInputs, TaskMessage, TaskOutcome, TaskState};
use taskruntime::{Execution, Flow, FlowRuntime, RuntimeConfig};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taskflow")]
#[command(about = "Concurrent task flow executor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the built-in demonstration flows
    Demo {
        /// Which flow to run
        #[arg(short, long, value_enum, default_value_t = Scenario::All)]
        scenario: Scenario,

        /// Print execution events as JSON lines
        #[arg(long)]
        json: bool,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// f1 -> (f2, f3) -> f4 with a request in the context
    Diamond,
    /// Same graph without a request: f1 fails and the flow halts
    Halt,
    /// A fail-through task panics, its dependents still run
    Panic,
    All,
}

impl Scenario {
    fn name(&self) -> &'static str {
        match self {
            Scenario::Diamond => "diamond",
            Scenario::Halt => "halt",
            Scenario::Panic => "panic",
            Scenario::All => "all",
        }
    }
}

/// Request-scoped data carried through every task of a flow
struct FlowData {
    request: Option<Request>,
    processor_id: String,
}

struct Request {
    src_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            scenario,
            json,
            verbose,
        } => {
            let level = if verbose { "debug" } else { "info" };
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
                )
                .init();

            let runtime = FlowRuntime::with_config(RuntimeConfig::default());
            if matches!(scenario, Scenario::Diamond | Scenario::All) {
                run_scenario(&runtime, Scenario::Diamond, json).await?;
            }
            if matches!(scenario, Scenario::Halt | Scenario::All) {
                run_scenario(&runtime, Scenario::Halt, json).await?;
            }
            if matches!(scenario, Scenario::Panic | Scenario::All) {
                run_scenario(&runtime, Scenario::Panic, json).await?;
            }
        }
    }

    Ok(())
}

async fn run_scenario(runtime: &FlowRuntime, scenario: Scenario, json: bool) -> Result<()> {
    println!("🚀 Flow: {}", scenario.name());
    let mut events = runtime.subscribe_events();
    let listener = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let done = matches!(event, ExecutionEvent::RunCompleted { .. });
            if json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::warn!("Could not serialize event: {}", e),
                }
            } else {
                print_event(&event);
            }
            if done {
                break;
            }
        }
    });

    let Some((flow, data)) = build(runtime, scenario) else {
        listener.abort();
        return Ok(());
    };
    let execution = flow.execute(data).await?;

    if let Err(e) = listener.await {
        tracing::warn!("Event listener stopped: {}", e);
    }
    if !json {
        print_summary(&execution);
    }
    Ok(())
}

/// The flow and context for one scenario; `All` is not a single flow.
fn build(runtime: &FlowRuntime, scenario: Scenario) -> Option<(Flow<FlowData>, FlowData)> {
    let built = match scenario {
        Scenario::Diamond => (
            diamond(runtime),
            FlowData {
                request: Some(Request {
                    src_id: "1".to_string(),
                }),
                processor_id: "Flow1".to_string(),
            },
        ),
        Scenario::Halt => (
            diamond(runtime),
            FlowData {
                request: None,
                processor_id: "Flow2".to_string(),
            },
        ),
        Scenario::Panic => (
            runtime
                .flow::<FlowData>()
                .register("f_err", true, &[], f_err)
                .register("f3", false, &["f_err"], f3)
                .register("f4", false, &["f_err", "f3"], f4),
            FlowData {
                request: None,
                processor_id: "Flow3".to_string(),
            },
        ),
        Scenario::All => return None,
    };
    Some(built)
}

fn diamond(runtime: &FlowRuntime) -> Flow<FlowData> {
    runtime
        .flow::<FlowData>()
        .register("f1", false, &[], f1)
        .register("f2", false, &["f1"], f2)
        .register("f3", false, &["f1"], f3)
        .register("f4", false, &["f2", "f3"], f4)
}

async fn f1(ctx: TaskContext<FlowData>, _: TaskInputs) -> TaskOutcome {
    let data = ctx.data();
    let Some(request) = &data.request else {
        return TaskOutcome::err((), format!("{} has no request", data.processor_id));
    };
    ctx.events.info(format!("srcID: {}", request.src_id));
    sleep(Duration::from_millis(25)).await;
    TaskOutcome::ok("f1")
}

async fn f2(ctx: TaskContext<FlowData>, inputs: TaskInputs) -> TaskOutcome {
    ctx.events.info(format!("started with {} inputs", inputs.len()));
    sleep(Duration::from_millis(50)).await;
    TaskOutcome::ok("some results")
}

async fn f3(_: TaskContext<FlowData>, _: TaskInputs) -> TaskOutcome {
    sleep(Duration::from_millis(75)).await;
    TaskOutcome::ok(())
}

async fn f4(ctx: TaskContext<FlowData>, inputs: TaskInputs) -> TaskOutcome {
    for (name, value) in inputs.iter() {
        ctx.events.info(format!("{} = {}", name, value));
    }
    sleep(Duration::from_millis(100)).await;
    TaskOutcome::ok("f4 end")
}

async fn f_err(_: TaskContext<FlowData>, _: TaskInputs) -> TaskOutcome {
    sleep(Duration::from_millis(100)).await;
    panic!("test")
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::RunStarted { tasks, .. } => {
            println!("▶️  Flow started ({} tasks)", tasks);
        }
        ExecutionEvent::TaskStarted { task, .. } => {
            println!("  ⚡ Starting task: {}", task);
        }
        ExecutionEvent::TaskCompleted {
            task, duration_ms, ..
        } => {
            println!("  ✅ Task {} completed in {}ms", task, duration_ms);
        }
        ExecutionEvent::TaskFailed {
            task,
            status_code,
            error,
            ..
        } => {
            let error = error.as_deref().unwrap_or("no error");
            println!("  ❌ Task {} failed (code {}): {}", task, status_code, error);
        }
        ExecutionEvent::TaskPanicked { task, message, .. } => {
            println!("  💥 Task {} panicked: {}", task, message);
        }
        ExecutionEvent::TaskSkipped { task, .. } => {
            println!("  ⏭️  Task {} skipped", task);
        }
        ExecutionEvent::TaskMessage { task, message, .. } => match message {
            TaskMessage::Info { message } => println!("     ℹ️  [{}] {}", task, message),
            TaskMessage::Warning { message } => println!("     ⚠️  [{}] {}", task, message),
            TaskMessage::Progress { percent, message } => match message {
                Some(msg) => println!("     📊 [{}] {}% - {}", task, percent, msg),
                None => println!("     📊 [{}] {}%", task, percent),
            },
            TaskMessage::Data { key, value } => println!("     📤 [{}] {} = {}", task, key, value),
        },
        ExecutionEvent::RunCompleted {
            success,
            duration_ms,
            ..
        } => {
            if *success {
                println!("✨ Flow completed successfully in {}ms", duration_ms);
            } else {
                println!("💥 Flow halted after {}ms", duration_ms);
            }
        }
    }
}

fn print_summary(execution: &Execution) {
    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", execution.execution_id);
    match &execution.error {
        Some(e) => println!("   Error: {}", e),
        None => println!("   Error: none"),
    }

    let mut names: Vec<_> = execution.records.keys().collect();
    names.sort();
    for name in names {
        let record = &execution.records[name];
        let result = execution.results.get(name).cloned().unwrap_or_default();
        print!(
            "   {} [{}] code={} {}ms result={}",
            name, record.state, record.status_code, record.duration_ms, result
        );
        if record.state == TaskState::Panicked {
            println!(" (panicked)");
        } else if let Some(e) = &record.error {
            println!(" error={}", e);
        } else {
            println!();
        }
    }
    println!();
}
