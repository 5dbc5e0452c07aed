//! Unix domain socket server for accepting caller connections.
//!
//! Listens on the relay socket and spawns a [`super::session`] task for
//! each accepted connection. Socket hygiene (stale file removal, owner-only
//! permissions, path length limits) matches the platform's expectations for
//! per-user daemons.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

use super::session::{self, SessionCtx};

/// Unix domain socket server for the relay.
///
/// Binds a `UnixListener` and runs an accept loop; each connection gets an
/// independent session task sharing the injected [`SessionCtx`].
#[derive(Debug)]
pub struct RelayServer {
    /// Path to the socket file (for cleanup).
    socket_path: PathBuf,
    /// Handle to the accept loop task.
    accept_handle: JoinHandle<()>,
}

impl RelayServer {
    /// Start the relay server at the given path.
    ///
    /// Removes any stale socket file, binds the listener, sets permissions
    /// to 0600, and spawns the accept loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub fn start(socket_path: PathBuf, ctx: SessionCtx) -> Result<Self> {
        // sun_path is 104 bytes on macOS, 108 on Linux; use the conservative
        // limit so the same config works on both.
        const MAX_SOCKET_PATH: usize = 104;
        let path_len = socket_path.as_os_str().len();
        if path_len >= MAX_SOCKET_PATH {
            anyhow::bail!(
                "socket path too long ({path_len} bytes, max {}): {}",
                MAX_SOCKET_PATH - 1,
                socket_path.display()
            );
        }

        // Remove stale socket file if it exists
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).with_context(|| {
                format!("failed to remove stale socket: {}", socket_path.display())
            })?;
        }

        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = std::os::unix::net::UnixListener::bind(&socket_path)
            .with_context(|| format!("failed to bind socket: {}", socket_path.display()))?;

        // Owner-only permissions (0600): callers must be the same user.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&socket_path, perms)?;
        }

        // Convert std listener to tokio async listener
        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;

        log::info!("[Relay] listening on {}", socket_path.display());

        let path_clone = socket_path.clone();
        let accept_handle = tokio::spawn(Self::accept_loop(listener, ctx, path_clone));

        Ok(Self { socket_path, accept_handle })
    }

    /// Accept loop — runs as a tokio task.
    async fn accept_loop(listener: UnixListener, ctx: SessionCtx, socket_path: PathBuf) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let session_id = generate_session_id();
                    log::info!("[Relay] caller connected: {session_id}");
                    tokio::spawn(session::run(stream, session_id, ctx.clone()));
                }
                Err(e) => {
                    // Socket file removed means the server is shutting down.
                    if !socket_path.exists() {
                        log::info!("[Relay] socket file removed, stopping accept loop");
                        break;
                    }
                    log::error!("[Relay] accept error: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Stop the server and remove the socket file.
    pub fn shutdown(self) {
        self.accept_handle.abort();
        let _ = std::fs::remove_file(&self.socket_path);
    }

    /// Path to the socket file.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

/// Generate a unique session ID using a monotonic counter + random suffix.
fn generate_session_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let rand: u16 = rand::random();
    format!("caller:{seq:x}{rand:04x}")
}
