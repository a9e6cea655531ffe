//! Agent socket listener.
//!
//! Binds the Unix socket, recovers from stale socket files left behind by a
//! crashed instance, and hands every accepted connection to its own task
//! over the shared [`AgentState`].

use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::UnixListener;
use tracing::{debug, info};

use crate::confirm::Confirmer;
use crate::session::serve_connection;
use crate::{AgentState, SharedState};

/// Top-level agent: shared state plus the socket it listens on.
pub struct Agent {
    state: SharedState,
    confirmer: Option<Arc<dyn Confirmer>>,
    socket_path: PathBuf,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("socket_path", &self.socket_path)
            .field("confirmer", &self.confirmer.is_some())
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Create an agent with an empty, unlocked state.
    ///
    /// `confirmer` handles approval prompts for confirm-constrained keys;
    /// without one, signing with such keys is always denied.
    pub fn new(socket_path: impl Into<PathBuf>, confirmer: Option<Arc<dyn Confirmer>>) -> Self {
        Self {
            state: AgentState::shared(),
            confirmer,
            socket_path: socket_path.into(),
        }
    }

    /// Handle to the shared state, for embedding and tests.
    pub fn state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the agent socket, clearing a stale socket file if necessary.
    ///
    /// Must be called from within a tokio runtime.  Binding fails if a live
    /// agent already answers on the path; a leftover socket nobody listens
    /// on is removed and the bind retried.
    pub fn bind(&self) -> anyhow::Result<UnixListener> {
        let path = &self.socket_path;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create socket directory {parent:?}"))?;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
                .with_context(|| format!("chmod 0700 {parent:?}"))?;
        }

        let listener = match UnixListener::bind(path) {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                // Probe before clobbering: a connect that succeeds means a
                // live agent owns the path and we must not displace it.
                if std::os::unix::net::UnixStream::connect(path).is_ok() {
                    anyhow::bail!("another agent is already listening on {path:?}");
                }
                info!(path = %path.display(), "removing stale agent socket");
                std::fs::remove_file(path)
                    .with_context(|| format!("remove stale socket {path:?}"))?;
                UnixListener::bind(path)
                    .with_context(|| format!("bind agent socket {path:?} after cleanup"))?
            }
            Err(e) => {
                return Err(e).with_context(|| format!("bind agent socket {path:?}"));
            }
        };

        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("chmod 0600 {path:?}"))?;

        Ok(listener)
    }

    /// Accept connections forever, one task per connection.
    pub async fn serve(self, listener: UnixListener) -> anyhow::Result<()> {
        let mut next_conn: u64 = 0;
        loop {
            let (stream, _addr) = listener
                .accept()
                .await
                .context("accept on agent socket")?;
            let conn = next_conn;
            next_conn += 1;
            debug!(conn, "accepted connection");

            let state = Arc::clone(&self.state);
            let confirmer = self.confirmer.clone();
            tokio::spawn(async move {
                serve_connection(stream, state, confirmer, conn).await;
            });
        }
    }

    /// Bind and serve in one call.
    pub async fn listen(self) -> anyhow::Result<()> {
        let listener = self.bind()?;
        info!(socket = %self.socket_path.display(), "agent listening");
        self.serve(listener).await
    }
}
