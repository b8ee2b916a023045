//! Configuration (CLI + environment, §1/§6).
//!
//! logging and configuration loading are named out of scope (§1) for the *subsystem* that owns
//! authentication and request parsing (the privileged control daemon); this worker binary still
//! needs to know which vchan to open and what to run, so it takes that over `clap`, the way the
//! teacher resolves settings, minus the TOML-file tier: this worker is spawned per-connection by
//! its control daemon with everything it needs on the command line, never run interactively.

use crate::dispatcher::{DispatchKind, Request};
use crate::handshake::MINIMUM_SUPPORTED_VERSION;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::os::fd::RawFd;

/// Protocol version this worker advertises in its own `HELLO` (§4.1). Overridable so a deployment
/// can pin to an older wire format without a rebuild.
pub const CURRENT_PROTOCOL_VERSION: u32 = 3;

const ENV_PROTOCOL_VERSION: &str = "QREXEC_AGENT_PROTOCOL_VERSION";
const ENV_BUFFER_SIZE: &str = "QREXEC_AGENT_BUFFER_SIZE";

#[derive(Debug, Parser)]
#[command(name = "qrexec-agent-io", about = "Per-connection vchan<->stdio bridge")]
pub struct Cli {
    #[command(flatten)]
    pub peer: PeerArgs,

    #[command(subcommand)]
    pub kind: CliKind,
}

#[derive(Debug, Args)]
pub struct PeerArgs {
    /// Domain ID of the peer on the other end of the vchan.
    #[arg(long)]
    pub domain: u16,

    /// Vchan port number agreed with the peer out of band.
    #[arg(long)]
    pub port: i32,

    /// Vchan ring size in each direction. 0 selects the 64 KiB default; must otherwise be a power
    /// of two. Falls back to `QREXEC_AGENT_BUFFER_SIZE` when not given.
    #[arg(long, env = ENV_BUFFER_SIZE, default_value_t = 0)]
    pub buffer_size: usize,

    /// Protocol version this worker advertises during the handshake. Falls back to
    /// `QREXEC_AGENT_PROTOCOL_VERSION` when not given.
    #[arg(long, env = ENV_PROTOCOL_VERSION, default_value_t = CURRENT_PROTOCOL_VERSION)]
    pub protocol_version: u32,
}

#[derive(Debug, Subcommand)]
pub enum CliKind {
    /// Detached spawn; no I/O bridge (§4.4).
    JustExec {
        /// `user:command` to run.
        cmdline: String,
    },
    /// Spawn `cmdline` and bridge its stdio over the vchan (§4.2).
    ExecCmdline {
        /// `user:command` to run.
        cmdline: String,
    },
    /// Bridge three already-open descriptors over the vchan; no spawn (§4.2).
    ServiceConnect {
        #[arg(long)]
        stdin_fd: RawFd,
        #[arg(long)]
        stdout_fd: RawFd,
        #[arg(long)]
        stderr_fd: RawFd,
    },
}

/// Converts the parsed CLI into a dispatcher [`Request`].
///
/// # Errors
///
/// Returns an error if the negotiated protocol floor constant cannot be satisfied trivially (kept
/// as a `Result` so future validation here has somewhere to report failure without reshaping the
/// call site).
pub fn build_request(cli: Cli) -> Result<Request> {
    if cli.peer.protocol_version < MINIMUM_SUPPORTED_VERSION {
        anyhow::bail!(
            "configured protocol version {} is below the minimum supported version {}",
            cli.peer.protocol_version,
            MINIMUM_SUPPORTED_VERSION
        );
    }
    let kind = match cli.kind {
        CliKind::JustExec { cmdline } => DispatchKind::JustExec { cmdline },
        CliKind::ExecCmdline { cmdline } => DispatchKind::ExecCmdline { cmdline },
        CliKind::ServiceConnect {
            stdin_fd,
            stdout_fd,
            stderr_fd,
        } => DispatchKind::ServiceConnect {
            stdin_fd,
            stdout_fd,
            stderr_fd,
        },
    };
    Ok(Request {
        kind,
        domain: cli.peer.domain,
        port: cli.peer.port,
        buffer_size: cli.peer.buffer_size,
        protocol_version: cli.peer.protocol_version,
    })
}

/// Parses `std::env::args()` into a [`Request`], the entry point `main` calls.
///
/// # Errors
///
/// Returns an error if argument parsing fails or the protocol version is below the floor.
pub fn parse() -> Result<Request> {
    let cli = Cli::try_parse().context("Error parsing command-line arguments")?;
    build_request(cli)
}
