//! The per-connection worker of a qrexec-style remote execution agent (§1).
//!
//! Bridges one vchan to one local child's stdio (or, in service-connect mode, to caller-supplied
//! descriptors with no child at all), from dispatch to teardown, then exits with the outcome's
//! exit code.

mod config;
mod dispatcher;
mod error;
mod frame;
mod handshake;
mod multiplexer;
mod process;
mod session;
mod signals;
mod vchan;

use anyhow::Result;

fn main() -> Result<()> {
    let plumbing = signals::install()?;
    let request = config::parse()?;

    match dispatcher::dispatch(request, &plumbing) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("qrexec-agent-io: {e:#}");
            std::process::exit(1);
        }
    }
}
