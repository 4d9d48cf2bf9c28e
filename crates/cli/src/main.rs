//! `chainstore` command line
//!
//! - `fetch [indexer]`: download logs up to the reorg margin
//! - `backfill [block-cap]`: replay downloaded logs into the store
//! - `tail`: follow the chain head live
//! - `dump` / `load`: move store contents between backends
//!
//! Logging goes to stderr and honors `RUST_LOG` (default `info`).

mod commands;
mod deployment;
mod rpc;

use std::process;

use chainstore_core::Error;
use tracing_subscriber::{fmt, EnvFilter};

use commands::build_cli;

fn main() {
    let matches = build_cli().get_matches();
    init_tracing();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(commands::run(&matches)) {
        report(&err);
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Print the error chain, preceded by the handler payload when there is one.
fn report(err: &anyhow::Error) {
    if let Some(payload) = err.downcast_ref::<Error>().and_then(Error::structured) {
        match serde_json::to_string_pretty(payload) {
            Ok(json) => eprintln!("{}", json),
            Err(e) => eprintln!("(failed to serialize handler context: {})", e),
        }
    }
    eprintln!("Error: {:#}", err);
}
