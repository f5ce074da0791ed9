//! Ledger RTC CLI Application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ledger_rtc_core::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// JSON configuration file; missing fields take their defaults
    #[arg(short, long, env = "LEDGER_RTC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a call between two local parties over an in-process ledger
    Demo {
        /// Kind of call to place
        #[arg(long, value_enum, default_value = "voice")]
        call_type: CliCallType,

        /// Seconds to keep the call up once connected
        #[arg(long, default_value = "5")]
        hold_secs: u64,

        /// Seconds to wait for each negotiation step
        #[arg(long, default_value = "30")]
        step_timeout_secs: u64,
    },

    /// Print the effective configuration as JSON
    Config,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliCallType {
    Voice,
    Video,
}

impl From<CliCallType> for CallType {
    fn from(value: CliCallType) -> Self {
        match value {
            CliCallType::Voice => CallType::Voice,
            CliCallType::Video => CallType::Video,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ledger_rtc=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => LedgerRtcConfig::from_json_file(path)?,
        None => LedgerRtcConfig::default(),
    };

    match cli.command {
        Commands::Demo {
            call_type,
            hold_secs,
            step_timeout_secs,
        } => {
            run_demo(
                config,
                call_type.into(),
                Duration::from_secs(hold_secs),
                Duration::from_secs(step_timeout_secs),
            )
            .await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn run_demo(
    config: LedgerRtcConfig,
    call_type: CallType,
    hold: Duration,
    step_timeout: Duration,
) -> Result<()> {
    let ledger = InMemoryLedger::new();
    let alice = Address::new("0xa11ce");
    let bob = Address::new("0xb0b");
    let alice_profile = ledger.register_profile(alice.clone(), "alice");
    let bob_profile = ledger.register_profile(bob.clone(), "bob");

    let caller = party(&ledger, alice, &config)?;
    let callee = party(&ledger, bob.clone(), &config)?;

    let mut incoming = callee.subscribe_incoming();
    callee.start();

    println!("📞 alice calling bob ({call_type})...");
    let session_id = caller
        .initiate_call(&alice_profile, &bob, &bob_profile, call_type)
        .await?;
    println!("   Session: {session_id}");

    let call = tokio::time::timeout(step_timeout, incoming.recv())
        .await
        .context("bob never saw the call")??;
    println!(
        "🔔 bob sees a call from {}",
        call.caller_name.as_deref().unwrap_or("unknown caller")
    );

    callee.answer_incoming(call_type).await?;
    println!("✅ bob answered");

    let mut caller_state = caller.watch_state();
    let mut callee_state = callee.watch_state();
    tokio::time::timeout(step_timeout, async {
        let caller_up = caller_state.wait_for(|s| is_connected(s));
        let callee_up = callee_state.wait_for(|s| is_connected(s));
        let (caller_up, callee_up) = tokio::join!(caller_up, callee_up);
        caller_up.map(|_| ()).and(callee_up.map(|_| ()))
    })
    .await
    .context("peers never connected")??;
    println!("🔗 connected, holding for {}s", hold.as_secs());

    let deadline = tokio::time::sleep(hold);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            changed = caller_state.changed() => {
                if changed.is_err() {
                    break;
                }
                log_state("alice", &caller_state.borrow_and_update());
            }
            changed = callee_state.changed() => {
                if changed.is_err() {
                    break;
                }
                log_state("bob", &callee_state.borrow_and_update());
            }
        }
    }

    caller.shutdown().await;
    callee.shutdown().await;
    println!("📞 Call ended");
    Ok(())
}

fn party(
    ledger: &InMemoryLedger,
    address: Address,
    config: &LedgerRtcConfig,
) -> Result<LedgerRtcService> {
    let service = LedgerRtcService::builder(
        Arc::new(ledger.executor(address)),
        Arc::new(ledger.clone()),
        Arc::new(ledger.clone()),
    )
    .with_config(config.clone())
    .build()?;
    Ok(service)
}

fn is_connected(state: &ProjectedState) -> bool {
    state.call.as_ref().is_some_and(|call| call.is_connected)
}

fn log_state(party: &str, state: &ProjectedState) {
    match &state.call {
        Some(call) => tracing::info!(
            party,
            connection = %call.connection_phase,
            active = call.is_call_active,
            audio_muted = call.is_local_audio_muted,
            video_muted = call.is_local_video_muted,
            error = ?call.error,
            "Call state"
        ),
        None => tracing::info!(party, error = ?state.error, "No call"),
    }
}
