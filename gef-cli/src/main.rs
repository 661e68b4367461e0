//! `gef` — verification front-end over a GEF ledger: verify, stats, emit,
//! and keygen subcommands. Pure consumer of `gef-core`; never writes a
//! new ledger entry except via `emit`, and never mutates an existing one.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use gef_core::{Ed25519KeyManager, Ledger, LedgerOptions, Replay};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Print a fatal error (with its full `anyhow` context chain) unless
/// `quiet`, and return the contract exit code for "error" — `2`.
fn fatal(err: anyhow::Error, quiet: bool) -> ExitCode {
    if !quiet {
        eprintln!("error: {err:#}");
    }
    ExitCode::from(2)
}

/// Verification and operator tooling for the GuardClaw Evidence Format.
#[derive(Parser)]
#[command(name = "gef", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a ledger file and report chain/signature/schema validity.
    Verify(VerifyArgs),
    /// Report the writer-side snapshot of a ledger without a full replay.
    Stats(StatsArgs),
    /// Append one entry to a ledger, signing with a given key file.
    Emit(EmitArgs),
    /// Generate a new Ed25519 key pair and write the seed to a file.
    Keygen(KeygenArgs),
}

#[derive(Args)]
struct VerifyArgs {
    /// Path to the ledger JSONL file.
    ledger_path: PathBuf,
    /// Output shape.
    #[arg(long, value_enum, default_value_t = OutputFormat::Human)]
    format: OutputFormat,
    /// Write the full audit report as JSON to this path.
    #[arg(long)]
    export: Option<PathBuf>,
    /// Suppress output; exit code only.
    #[arg(long)]
    quiet: bool,
    /// Verify only entries with START <= sequence < END, e.g. `10:20`.
    #[arg(long, value_parser = parse_range)]
    range: Option<(u64, u64)>,
    /// Filter to one agent.
    #[arg(long)]
    agent: Option<String>,
    /// Disable ANSI escapes in human output.
    #[arg(long)]
    no_color: bool,
    /// Force sequential signature verification.
    #[arg(long)]
    no_parallel: bool,
}

#[derive(Args)]
struct StatsArgs {
    /// Path to the ledger JSONL file.
    ledger_path: PathBuf,
}

#[derive(Args)]
struct EmitArgs {
    /// Path to the ledger JSONL file.
    ledger_path: PathBuf,
    /// Path to the hex-encoded Ed25519 seed file.
    #[arg(long)]
    key: PathBuf,
    /// Logical agent id to attribute the entry to.
    #[arg(long)]
    agent: String,
    /// Record type, from the closed vocabulary.
    #[arg(long)]
    record_type: String,
    /// Payload as a JSON object, e.g. `'{"step": 1}'`.
    #[arg(long, default_value = "{}")]
    payload: String,
    /// Skip fsync after the append, trading durability for throughput.
    #[arg(long)]
    no_fsync: bool,
}

#[derive(Args)]
struct KeygenArgs {
    /// Path to write the hex-encoded seed to.
    out: PathBuf,
}

#[derive(Copy, Clone, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Compact,
}

fn parse_range(s: &str) -> Result<(u64, u64), String> {
    let (start, end) = s
        .split_once(':')
        .ok_or_else(|| format!("range must be START:END, got '{s}'"))?;
    let start: u64 = start.parse().map_err(|_| format!("invalid start '{start}'"))?;
    let end: u64 = end.parse().map_err(|_| format!("invalid end '{end}'"))?;
    Ok((start, end))
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("gef: failed to install tracing subscriber");
    }

    let cli = Cli::parse();
    match cli.command {
        Command::Verify(args) => run_verify(args),
        Command::Stats(args) => run_stats(&args),
        Command::Emit(args) => run_emit(&args),
        Command::Keygen(args) => run_keygen(&args),
    }
}

fn run_verify(args: VerifyArgs) -> ExitCode {
    let mut replay = Replay::new(!args.no_parallel, args.quiet);

    if let Err(e) = replay
        .load(&args.ledger_path)
        .with_context(|| format!("failed to load ledger {}", args.ledger_path.display()))
    {
        error!(error = %e, "gef verify: failed to load ledger");
        return fatal(e, args.quiet);
    }

    let chain_head_hash = gef_core::head_hash(replay.envelopes().iter().max_by_key(|e| e.sequence));
    let chain_head_sequence = replay.envelopes().last().map(|e| e.sequence);

    if let Some(agent) = args.agent.as_deref() {
        replay.retain(|e| e.agent_id == agent);
    }
    if let Some((start, end)) = args.range {
        replay.retain(|e| e.sequence >= start && e.sequence < end);
    }

    let summary = match &args.export {
        Some(path) => match replay
            .export_json(path)
            .with_context(|| format!("failed to write export {}", path.display()))
        {
            Ok(summary) => summary,
            Err(e) => {
                error!(error = %e, "gef verify: failed to write export");
                return fatal(e, args.quiet);
            }
        },
        None => replay.verify(),
    };

    if !args.quiet {
        print_summary(&summary, args.format, chain_head_hash.as_str(), chain_head_sequence, args.no_color);
    }

    if summary.chain_valid {
        ExitCode::from(0)
    } else {
        ExitCode::from(1)
    }
}

fn print_summary(
    summary: &gef_core::ReplaySummary,
    format: OutputFormat,
    chain_head_hash: &str,
    chain_head_sequence: Option<u64>,
    no_color: bool,
) {
    match format {
        OutputFormat::Json => {
            let report = serde_json::json!({
                "chain_valid": summary.chain_valid,
                "total_entries": summary.total_entries,
                "valid_signatures": summary.valid_signatures,
                "invalid_signatures": summary.invalid_signatures,
                "gef_version": summary.gef_version,
                "agents_seen": summary.agents_seen,
                "record_type_counts": summary.record_type_counts,
                "chain_head_hash": chain_head_hash,
                "chain_head_sequence": chain_head_sequence,
                "violations": summary.violations.iter().map(|v| serde_json::json!({
                    "at_sequence": v.at_sequence,
                    "record_id": v.record_id,
                    "violation_type": v.violation_type.as_str(),
                    "detail": v.detail,
                })).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&report).expect("report is valid JSON"));
        }
        OutputFormat::Compact => {
            println!(
                "valid={} entries={} sigs_ok={} sigs_bad={} violations={} head={}",
                summary.chain_valid,
                summary.total_entries,
                summary.valid_signatures,
                summary.invalid_signatures,
                summary.violations.len(),
                &chain_head_hash[..12.min(chain_head_hash.len())],
            );
        }
        OutputFormat::Human => {
            let (ok, bad) = if no_color { ("OK", "FAIL") } else { ("\x1b[32mOK\x1b[0m", "\x1b[31mFAIL\x1b[0m") };
            println!(
                "ledger {}: {} entries, {} valid signatures, {} invalid, {} violations",
                if summary.chain_valid { ok } else { bad },
                summary.total_entries,
                summary.valid_signatures,
                summary.invalid_signatures,
                summary.violations.len(),
            );
            for v in &summary.violations {
                println!("  [{}] sequence={} record_id={} — {}", v.violation_type.as_str(), v.at_sequence, v.record_id, v.detail);
            }
            println!("chain head: {chain_head_hash} (sequence {chain_head_sequence:?})");
        }
    }
}

fn run_stats(args: &StatsArgs) -> ExitCode {
    if !args.ledger_path.exists() {
        return fatal(
            anyhow::anyhow!("ledger file not found: {}", args.ledger_path.display()),
            false,
        );
    }
    let mut replay = Replay::new(false, true);
    if let Err(e) = replay
        .load(&args.ledger_path)
        .with_context(|| format!("failed to load ledger {}", args.ledger_path.display()))
    {
        return fatal(e, false);
    }
    let last = replay.envelopes().last();
    let report = serde_json::json!({
        "agent_id": last.map(|e| e.agent_id.clone()),
        "next_sequence": last.map(|e| e.sequence + 1).unwrap_or(0),
        "last_record_id": last.map(|e| e.record_id.clone()),
        "last_causal_hash": gef_core::head_hash(last),
        "gef_version": last.map(|e| e.gef_version.clone()),
        "total_entries": replay.envelopes().len(),
    });
    println!("{}", serde_json::to_string_pretty(&report).expect("report is valid JSON"));
    ExitCode::from(0)
}

fn run_emit(args: &EmitArgs) -> ExitCode {
    let key = match Ed25519KeyManager::from_file(&args.key)
        .with_context(|| format!("failed to load key {}", args.key.display()))
    {
        Ok(key) => key,
        Err(e) => return fatal(e, false),
    };
    let payload: serde_json::Value = match serde_json::from_str(&args.payload)
        .with_context(|| format!("--payload is not valid JSON: '{}'", args.payload))
    {
        Ok(v) => v,
        Err(e) => return fatal(e, false),
    };

    let ledger = Ledger::open(
        key,
        args.agent.clone(),
        &args.ledger_path,
        LedgerOptions { fsync: !args.no_fsync },
    );

    match ledger
        .emit(&args.record_type, payload, None)
        .context("failed to append envelope")
    {
        Ok(env) => {
            info!(record_id = %env.record_id, sequence = env.sequence, "gef emit: appended");
            println!("{}", serde_json::to_string(&env).expect("envelope is valid JSON"));
            ExitCode::from(0)
        }
        Err(e) => fatal(e, false),
    }
}

fn run_keygen(args: &KeygenArgs) -> ExitCode {
    let key = Ed25519KeyManager::generate();
    if let Err(e) = key
        .save(&args.out)
        .with_context(|| format!("failed to write key to {}", args.out.display()))
    {
        return fatal(e, false);
    }
    println!("public_key_hex: {}", key.public_key_hex());
    println!("wrote seed to {}", args.out.display());
    ExitCode::from(0)
}
