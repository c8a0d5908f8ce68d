//! `tinycrab-server` — the per-agent HTTP server binary.
//!
//! Launched by the supervisor as a detached subprocess; reads the API key
//! from stdin per the handoff protocol, binds loopback, and serves until a
//! termination signal or `POST /stop`.

use std::process::ExitCode;

use clap::Parser;

use tinycrab::server::AgentServerArgs;

#[tokio::main]
async fn main() -> ExitCode {
    let args = AgentServerArgs::parse();
    tinycrab::logging::init();

    match tinycrab::server::run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tinycrab-server: {e}");
            ExitCode::FAILURE
        }
    }
}
