mod bootstrap;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use latchkey_agent::{Agent, AskpassConfirmer, Confirmer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    // Harden the process before any key material can exist.
    bootstrap::secure_bootstrap();

    let options = Options::parse();

    if options.takeover {
        terminate_prior_agent();
    }

    let confirmer: Option<Arc<dyn Confirmer>> = match &options.askpass {
        Some(program) => Some(Arc::new(AskpassConfirmer::new(program))),
        None => {
            tracing::warn!(
                "no askpass program configured; confirm-constrained keys will refuse to sign"
            );
            None
        }
    };

    let socket = options.socket.clone();
    let agent = Agent::new(&socket, confirmer);
    let listener = agent.bind().context("bind agent endpoint")?;
    tracing::info!(socket = %socket.display(), "latchkeyd ready");

    let serving = tokio::spawn(agent.serve(listener));
    tokio::select! {
        joined = serving => match joined {
            Ok(result) => result?,
            Err(e) => anyhow::bail!("listener task failed: {e}"),
        },
        _ = shutdown_signal() => {
            tracing::info!("received shutdown signal, exiting");
        }
    }

    // Leave no stale socket behind; the next start then binds cleanly.
    let _ = std::fs::remove_file(&socket);
    Ok(())
}

/// Daemon configuration from argv and the environment.
#[derive(Debug)]
struct Options {
    /// Socket path: `--socket` or `SSH_AUTH_SOCK`.
    socket: PathBuf,
    /// Confirmation prompt program: `--askpass` or `SSH_ASKPASS`.
    askpass: Option<PathBuf>,
    /// Terminate the agent named by `SSH_AGENT_PID` before binding.
    takeover: bool,
}

impl Options {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut socket: Option<PathBuf> = None;
        let mut askpass: Option<PathBuf> = None;
        let mut takeover = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--socket" | "-s" => {
                    let Some(path) = args.get(i + 1) else {
                        eprintln!("error: --socket requires a path argument");
                        std::process::exit(2);
                    };
                    socket = Some(PathBuf::from(path));
                    i += 1;
                }
                "--askpass" => {
                    let Some(program) = args.get(i + 1) else {
                        eprintln!("error: --askpass requires a program argument");
                        std::process::exit(2);
                    };
                    askpass = Some(PathBuf::from(program));
                    i += 1;
                }
                "--takeover" => takeover = true,
                "--help" | "-h" => {
                    eprintln!("Usage: latchkeyd [--socket <path>] [--askpass <program>] [--takeover]");
                    eprintln!();
                    eprintln!("Options:");
                    eprintln!("  -s, --socket <path>     Agent socket path (default: $SSH_AUTH_SOCK)");
                    eprintln!("      --askpass <program> Confirmation prompt program (default: $SSH_ASKPASS)");
                    eprintln!("      --takeover          Terminate the agent in $SSH_AGENT_PID before binding");
                    eprintln!("  -h, --help              Show this help message");
                    std::process::exit(0);
                }
                other => {
                    if let Some(path) = other.strip_prefix("--socket=") {
                        socket = Some(PathBuf::from(path));
                    } else if let Some(program) = other.strip_prefix("--askpass=") {
                        askpass = Some(PathBuf::from(program));
                    } else {
                        eprintln!("error: unknown argument '{other}'");
                        std::process::exit(2);
                    }
                }
            }
            i += 1;
        }

        let socket = socket
            .or_else(|| std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from))
            .unwrap_or_else(|| {
                eprintln!("error: no socket path; set SSH_AUTH_SOCK or pass --socket <path>");
                std::process::exit(2);
            });

        let askpass = askpass.or_else(|| {
            std::env::var_os("SSH_ASKPASS")
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        });

        Self {
            socket,
            askpass,
            takeover,
        }
    }
}

/// Ask the agent instance named by `SSH_AGENT_PID` to exit so its socket
/// can be taken over.  Best-effort: a missing or unparsable PID is logged
/// and ignored.
fn terminate_prior_agent() {
    let Some(value) = std::env::var_os("SSH_AGENT_PID") else {
        tracing::debug!("SSH_AGENT_PID not set; nothing to take over");
        return;
    };
    let Some(pid) = value.to_str().and_then(|v| v.trim().parse::<i32>().ok()) else {
        tracing::warn!(value = ?value, "SSH_AGENT_PID is not a valid PID; ignoring");
        return;
    };
    if pid <= 1 {
        tracing::warn!(pid, "refusing to signal reserved PID");
        return;
    }

    // SAFETY: kill with a plain PID and signal number has no preconditions.
    let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
    if ret == 0 {
        tracing::info!(pid, "sent SIGTERM to prior agent");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!(pid, "could not signal prior agent: {err}");
    }
}

/// Wait for ctrl-c (SIGINT) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("failed to register SIGTERM handler: {e}, falling back to SIGINT only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
