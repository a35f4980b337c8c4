//! Entry point for the `turnloop` binary.
//!
//! `turnloop [workspace]` starts an interactive REPL against a fresh or
//! resumed session; `turnloop -e "prompt"` runs one prompt and exits.

use clap::Parser;

use turnloop_cli::{execute_once, initialize, run_repl, Args};

fn main() {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
    runtime.block_on(async move {
        if let Err(e) = run(args).await {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    });
}

async fn run(args: Args) -> anyhow::Result<()> {
    let log_level = if args.verbose { "debug" } else { "warn" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("turnloop={log_level}"))),
        )
        .try_init();

    let mut ctx = initialize(&args).await?;

    if let Some(ref prompt) = args.execute {
        execute_once(&mut ctx, prompt, args.json).await
    } else {
        run_repl(&mut ctx, args.json).await
    }
}
