use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use cmd_callback::commands::report::{delete_report_line, DeleteReporter};
use cmd_callback::commands::{CmdCallback, Handle, LoopPolicy};
use cmd_callback::config::Config;
use cmd_callback::error::CmdError;
use cmd_callback::service::{Behavior, LocalService, Session};
use cmd_callback::transport::Request;
use cmd_callback::utils;

#[derive(Parser)]
#[command(
    name = "cmd-callback",
    version,
    about = "Submit a command and wait for its completion callback"
)]
struct AppCli {
    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Number of waits before giving up
    #[arg(long, global = true)]
    attempts: Option<u32>,

    /// Length of each wait in milliseconds
    #[arg(long, global = true)]
    interval_ms: Option<u64>,

    /// Service behavior: normal, stall or lose
    #[arg(long, global = true, value_parser = parse_behavior)]
    behavior: Option<Behavior>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Delete one object
    Delete {
        #[arg(long = "type", default_value = "/Image")]
        target_type: String,
        #[arg(long, default_value_t = 1)]
        id: i64,
        /// Report from a finished hook instead of reading the response after the loop
        #[arg(long, default_value_t = false)]
        report: bool,
    },
    /// Move one object to another group
    Chgrp {
        #[arg(long = "type", default_value = "/Image")]
        target_type: String,
        #[arg(long, default_value_t = 1)]
        id: i64,
        #[arg(long)]
        group: String,
    },
}

fn parse_behavior(s: &str) -> Result<Behavior, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| format!("unknown behavior '{s}' (expected normal, stall or lose)"))
}

async fn run(session: &dyn Session, request: Request, report: bool, policy: LoopPolicy) -> Result<()> {
    let handle = session.submit(request).await.context("submitting command")?;
    let cb = if report {
        CmdCallback::with_hooks(handle.clone(), true, DeleteReporter::new(std::io::stdout())).await?
    } else {
        CmdCallback::new(handle.clone(), true).await?
    };

    match cb.wait_with(policy).await {
        Ok(()) => {
            if cb.is_cancelled() {
                println!("Cancelled");
            } else if !report {
                if let Some(rsp) = cb.response() {
                    println!("{}", delete_report_line(&rsp).unwrap_or_else(|| rsp.to_string()));
                }
            }
        }
        Err(CmdError::LockTimeout { .. }) => {
            println!(
                "Not finished in {} seconds. Cancelling...",
                policy.deadline().as_secs_f64()
            );
            if !handle.cancel().await.context("cancelling command")? {
                println!("ERROR: Failed to cancel");
            }
        }
        Err(CmdError::Server(err)) => {
            error!(error = %err, "command outcome unknown");
        }
        Err(other) => return Err(other.into()),
    }

    cb.close();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init("info");

    let args = AppCli::parse();
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => {
            let mut config = Config::default();
            config
                .service
                .objects
                .insert("/Image".to_string(), vec![1, 2, 3]);
            config
        }
    };
    if let Some(attempts) = args.attempts {
        config.loop_policy.max_attempts = attempts;
    }
    if let Some(interval_ms) = args.interval_ms {
        config.loop_policy.interval_ms = interval_ms;
    }
    if let Some(behavior) = args.behavior {
        config.service.behavior = behavior;
    }

    let service = LocalService::from_config(&config.service);
    let (request, report) = match args.command {
        Commands::Delete {
            target_type,
            id,
            report,
        } => (Request::Delete { target_type, id }, report),
        Commands::Chgrp {
            target_type,
            id,
            group,
        } => (
            Request::Chgrp {
                target_type,
                id,
                group,
            },
            false,
        ),
    };

    info!(
        max_attempts = config.loop_policy.max_attempts,
        interval_ms = config.loop_policy.interval_ms,
        "waiting on {:?}",
        request.kind()
    );
    run(&service, request, report, config.loop_policy).await
}
