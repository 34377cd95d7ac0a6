use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Arg, ArgAction, ArgMatches, Command};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use rigline_channel::EchoPort;
use rigline_engine::PipelineEngine;
use rigline_types::pipeline::validation::validate_pipeline;
use rigline_types::{Block, BlockCatalog, Pipeline, RunEvent, TerminalReason};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let mut cli = build_cli();
    let matches = cli.clone().get_matches();

    match matches.subcommand() {
        Some(("plan", sub)) => run_plan(sub),
        Some(("rehearse", sub)) => run_rehearse(sub).await,
        _ => {
            cli.print_help()?;
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::INFO)
        .try_init();
}

fn build_cli() -> Command {
    let file_args = [
        Arg::new("pipeline")
            .long("pipeline")
            .short('p')
            .required(true)
            .action(ArgAction::Set)
            .help("Path to a pipeline JSON document"),
        Arg::new("blocks")
            .long("blocks")
            .short('b')
            .required(true)
            .action(ArgAction::Set)
            .help("Path to a block catalog JSON document (array of blocks)"),
    ];
    Command::new("rigline")
        .about("Run device automation pipelines")
        .subcommand(
            Command::new("plan")
                .about("Validate a pipeline and print its execution plan")
                .args(file_args.clone()),
        )
        .subcommand(
            Command::new("rehearse")
                .about("Execute a pipeline offline against the echo port")
                .args(file_args),
        )
}

fn load_inputs(matches: &ArgMatches) -> Result<(Pipeline, BlockCatalog)> {
    let pipeline_path = matches.get_one::<String>("pipeline").expect("required arg");
    let blocks_path = matches.get_one::<String>("blocks").expect("required arg");

    let pipeline_text =
        std::fs::read_to_string(pipeline_path).with_context(|| format!("reading pipeline file '{pipeline_path}'"))?;
    let pipeline: Pipeline =
        serde_json::from_str(&pipeline_text).with_context(|| format!("parsing pipeline file '{pipeline_path}'"))?;

    let blocks_text =
        std::fs::read_to_string(blocks_path).with_context(|| format!("reading block catalog '{blocks_path}'"))?;
    let blocks: Vec<Block> =
        serde_json::from_str(&blocks_text).with_context(|| format!("parsing block catalog '{blocks_path}'"))?;
    let catalog = BlockCatalog::from_blocks(blocks);

    if let Err(errors) = validate_pipeline(&pipeline, &catalog) {
        for error in &errors {
            tracing::error!(target: "rigline", %error, "pipeline validation failed");
        }
        bail!("pipeline '{}' failed validation with {} error(s)", pipeline.name, errors.len());
    }

    Ok((pipeline, catalog))
}

fn run_plan(matches: &ArgMatches) -> Result<()> {
    let (pipeline, catalog) = load_inputs(matches)?;
    let plan = serde_json::json!({
        "pipeline": pipeline.id,
        "name": pipeline.name,
        "rootNodes": pipeline.items.len(),
        "totalSteps": pipeline.total_steps(),
        "catalogBlocks": catalog.blocks.len(),
    });
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

async fn run_rehearse(matches: &ArgMatches) -> Result<()> {
    let (pipeline, catalog) = load_inputs(matches)?;

    let engine = PipelineEngine::new(Arc::new(EchoPort));
    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                RunEvent::LogLine { line } => println!("{line}"),
                RunEvent::Progress { completed, total } => println!("[{completed}/{total}]"),
                RunEvent::Stats { .. } => {}
                RunEvent::Completed { .. } => break,
            }
        }
    });

    let reason = engine.run(&pipeline, &catalog, events_tx, cancel).await?;
    printer.await.context("event printer task")?;

    match reason {
        TerminalReason::Completed | TerminalReason::Stopped => Ok(()),
        TerminalReason::Failed { reason } => bail!("rehearsal failed: {reason}"),
    }
}
