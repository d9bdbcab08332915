use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use atelier_contracts::conversation::{now_millis, Attachment, ConversationLog, Turn};
use atelier_contracts::events::EventWriter;
use atelier_contracts::slots::SlotName;
use atelier_engine::assign::TurnInputs;
use atelier_engine::config::EngineConfig;
use atelier_engine::dispatch::{CapabilityDispatcher, DispatcherRegistry, DryrunDispatcher};
use atelier_engine::planner::build_plan;
use atelier_engine::reference::ReferenceKind;
use atelier_engine::{TurnOutcome, TurnPipeline, TurnRequest, TurnStatus};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "atelier",
    version,
    about = "Resolve, classify and run creative requests against a conversation"
)]
struct Cli {
    /// JSON config file layered over the built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one turn end to end and append it to the conversation.
    Turn(TurnArgs),
    /// Classify a message and show the plan it would produce, without dispatching.
    Classify(RequestArgs),
    /// Resolve the reference a message points at.
    Resolve(RequestArgs),
}

#[derive(Debug, Args)]
struct RequestArgs {
    #[arg(long)]
    conversation: PathBuf,
    #[arg(long)]
    text: String,
    /// Uploaded artifact for a slot, as `slot=url`.
    #[arg(long = "upload", value_parser = parse_slot_pair)]
    uploads: Vec<(SlotName, String)>,
    /// Preset selection for a slot, as `slot=value`.
    #[arg(long = "preset", value_parser = parse_slot_pair)]
    presets: Vec<(SlotName, String)>,
    /// Explicit reference payload: a timestamp, an artifact URL or a JSON object.
    #[arg(long)]
    reference: Option<String>,
}

#[derive(Debug, Args)]
struct TurnArgs {
    #[command(flatten)]
    request: RequestArgs,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Registered dispatcher to use instead of the configured default.
    #[arg(long)]
    dispatcher: Option<String>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("atelier error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = EngineConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Turn(args) => run_turn(&config, args),
        Command::Classify(args) => run_classify(&config, &args),
        Command::Resolve(args) => run_resolve(&config, &args),
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "atelier=debug,warn" } else { "atelier=info,warn" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // A second init (tests) is not an error worth reporting.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose)
                .compact(),
        )
        .try_init();
}

fn parse_slot_pair(raw: &str) -> Result<(SlotName, String), String> {
    let (slot, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected slot=value, got {raw:?}"))?;
    let slot = SlotName::parse(slot)
        .ok_or_else(|| format!("unknown slot {slot:?}; expected subject, style or palette"))?;
    let value = value.trim();
    if value.is_empty() {
        return Err(format!("empty value for slot {}", slot.as_str()));
    }
    Ok((slot, value.to_string()))
}

impl RequestArgs {
    fn to_request(&self) -> TurnRequest {
        let mut inputs = TurnInputs::default();
        for (slot, url) in &self.uploads {
            inputs = inputs.with_upload(*slot, url.clone());
        }
        for (slot, value) in &self.presets {
            inputs = inputs.with_preset(*slot, value.clone());
        }
        let request = TurnRequest::new(self.text.clone()).with_inputs(inputs);
        match self.reference.as_deref().map(str::trim) {
            Some(payload) if !payload.is_empty() => request.with_reference(payload),
            _ => request,
        }
    }
}

fn run_turn(config: &EngineConfig, args: TurnArgs) -> Result<i32> {
    let mut log = ConversationLog::load(&args.request.conversation);
    let events = match &args.events {
        Some(path) => EventWriter::new(path, log.conversation_id.clone()),
        None => EventWriter::disabled(log.conversation_id.clone()),
    };
    let dispatcher = select_dispatcher(config, args.dispatcher.as_deref())?;
    let outcome = execute_turn(config, &mut log, &args.request.to_request(), dispatcher, events)?;
    log.save()
        .with_context(|| format!("saving conversation {}", log.path.display()))?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(match outcome.status {
        TurnStatus::Completed | TurnStatus::Conversational => 0,
        TurnStatus::Partial | TurnStatus::Failed => 2,
    })
}

fn select_dispatcher(
    config: &EngineConfig,
    name: Option<&str>,
) -> Result<Arc<dyn CapabilityDispatcher>> {
    let registry = DispatcherRegistry::from_config(&config.dispatch)?;
    match name {
        Some(name) => registry.get(name).ok_or_else(|| {
            anyhow!(
                "unknown dispatcher {name:?}; registered: {}",
                registry.names().join(", ")
            )
        }),
        None => registry.default_for(&config.dispatch),
    }
}

/// Runs the turn and records it on `log`: the user turn, the assistant turn
/// carrying any artifacts, and the execution record.
fn execute_turn(
    config: &EngineConfig,
    log: &mut ConversationLog,
    request: &TurnRequest,
    dispatcher: Arc<dyn CapabilityDispatcher>,
    events: EventWriter,
) -> Result<TurnOutcome> {
    let pipeline = TurnPipeline::from_config(config, dispatcher, events)?;
    let history = log.history();
    let asked_at = now_millis();
    let outcome = pipeline.run_turn(request, &history);
    info!(status = ?outcome.status, steps = outcome.results.len(), "turn finished");

    log.append_turn(user_turn(request, &outcome, asked_at));
    if outcome.status != TurnStatus::Conversational {
        let mut reply = Turn::assistant(outcome.explanation.clone(), now_millis().max(asked_at + 1));
        for url in outcome.artifacts() {
            reply = reply.with_attachment(Attachment::new(url));
        }
        if let Some(operation) = outcome.last_operation() {
            reply = reply.with_operation(operation);
        }
        log.append_turn(reply);
    }
    log.record_outcome(asked_at, serde_json::to_value(&outcome)?);
    Ok(outcome)
}

fn user_turn(request: &TurnRequest, outcome: &TurnOutcome, timestamp: i64) -> Turn {
    let mut turn = Turn::user(request.text.clone(), timestamp);
    for (slot, url) in &request.inputs.uploads {
        turn = turn.with_attachment(Attachment::with_role(url.clone(), *slot));
    }
    for (slot, value) in &request.inputs.presets {
        turn = turn.with_attachment(Attachment::with_role(value.clone(), *slot));
    }
    if outcome.reference.kind == ReferenceKind::Explicit {
        if let Some(anchor) = outcome.reference.anchor_timestamp {
            turn = turn.with_reference(anchor);
        }
    }
    turn
}

fn run_classify(config: &EngineConfig, args: &RequestArgs) -> Result<i32> {
    let pipeline = inspection_pipeline(config)?;
    let history = ConversationLog::load(&args.conversation).history();
    let request = args.to_request();
    let reference = pipeline.resolve_reference(&request, &history);
    let (classification, assignment) = pipeline.classify(&request, &history, &reference);
    let plan = build_plan(&classification, &assignment);
    let report = json!({
        "reference": reference,
        "classification": classification,
        "assignment": assignment,
        "plan": plan,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(0)
}

fn run_resolve(config: &EngineConfig, args: &RequestArgs) -> Result<i32> {
    let pipeline = inspection_pipeline(config)?;
    let history = ConversationLog::load(&args.conversation).history();
    let reference = pipeline.resolve_reference(&args.to_request(), &history);
    debug!(kind = ?reference.kind, chain_length = reference.chain_length, "reference resolved");
    println!("{}", serde_json::to_string_pretty(&reference)?);
    Ok(0)
}

/// Inspection commands never dispatch, so they always get the dryrun backend.
fn inspection_pipeline(config: &EngineConfig) -> Result<TurnPipeline> {
    TurnPipeline::from_config(config, Arc::new(DryrunDispatcher), EventWriter::disabled("inspect"))
}
