use std::fs;
use std::path::PathBuf;

use clap::{Parser as ClapParser, Subcommand as ClapSubcommand};
use eyre::{Context, bail};
use stepex_common::types::MinimalExecutionPayload;
use stepex_vm::{
    trace::{TraceConfig, generate},
    witness::{TraceWitness, verify_step},
};
use tracing::info;

use crate::http::HttpSource;

pub const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");

#[derive(ClapParser)]
#[command(
    name = "stepex",
    version = VERSION_STRING,
    about = "Interactive fraud-proof generator for EVM block execution"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Subcommand,
}

#[derive(ClapSubcommand)]
pub enum Subcommand {
    /// Generate the step trace and witness for a payload.
    Gen {
        /// Witness JSON output file.
        output: PathBuf,
        /// API endpoint serving trie nodes, code and headers by hash.
        api: String,
        /// MinimalExecutionPayload as JSON.
        payload: PathBuf,
        /// Abort generation past this many steps.
        #[arg(long, default_value_t = 10_000)]
        step_limit: usize,
    },
    /// Extract the witness of a single step out of a trace witness.
    StepWitness {
        /// Trace witness JSON produced by `gen`.
        trace: PathBuf,
        /// Single-step witness output file.
        output: PathBuf,
        /// Step index.
        index: usize,
    },
    /// Re-run one step against the witness databases and check the produced
    /// root against the recorded trace.
    Verify {
        /// Trace witness JSON produced by `gen`.
        trace: PathBuf,
        /// MinimalExecutionPayload as JSON.
        payload: PathBuf,
        /// Step index.
        index: usize,
    },
}

pub fn run(cli: Cli) -> eyre::Result<()> {
    match cli.command {
        Subcommand::Gen {
            output,
            api,
            payload,
            step_limit,
        } => {
            let payload = load_payload(&payload)?;
            info!(
                block = payload.block_number,
                transactions = payload.transactions.len(),
                "generating trace"
            );

            let source = HttpSource::new(api);
            let config = TraceConfig {
                step_limit,
                capture: true,
            };
            let trace = generate(Box::new(source), payload, config)?;
            info!(steps = trace.len(), "trace complete");

            let witness = TraceWitness::from_trace(&trace);
            fs::write(&output, serde_json::to_vec(&witness)?)
                .wrap_err("writing witness output")?;
            info!(file = %output.display(), "witness written");
            Ok(())
        }
        Subcommand::StepWitness {
            trace,
            output,
            index,
        } => {
            let witness = load_witness(&trace)?;
            let step_witness = witness.step_witness(index)?;
            fs::write(&output, serde_json::to_vec(&step_witness)?)
                .wrap_err("writing step witness")?;
            info!(step = index, file = %output.display(), "step witness written");
            Ok(())
        }
        Subcommand::Verify {
            trace,
            payload,
            index,
        } => {
            let witness = load_witness(&trace)?;
            let payload = load_payload(&payload)?;
            if verify_step(&witness, payload, index)? {
                info!(step = index, "step verified");
                Ok(())
            } else {
                bail!("step {index} does not reproduce the recorded root");
            }
        }
    }
}

fn load_payload(path: &PathBuf) -> eyre::Result<MinimalExecutionPayload> {
    let raw = fs::read(path).wrap_err("reading payload file")?;
    serde_json::from_slice(&raw).wrap_err("decoding payload JSON")
}

fn load_witness(path: &PathBuf) -> eyre::Result<TraceWitness> {
    let raw = fs::read(path).wrap_err("reading trace witness")?;
    serde_json::from_slice(&raw).wrap_err("decoding trace witness JSON")
}
