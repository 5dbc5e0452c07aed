//! Host service discovery and process launch.
//!
//! The host service is registered the way browser native messaging hosts
//! are: a JSON manifest named after the host (`com.coder.sail.json`) in one
//! of the browser's `NativeMessagingHosts` directories, whose `path` field
//! points at the executable. Resolving the manifest rather than hard-coding
//! a binary path keeps "not registered" and "failed to spawn" distinguishable,
//! which callers need for actionable guidance.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::error::RelayError;

/// Duplex stdio of a launched host, plus the child handle when the
/// transport is a real process (kept for kill-on-dispose).
pub struct HostIo {
    /// Host's stdout — the broker reads framed messages from here.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Host's stdin — the broker writes framed messages here.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// The spawned process, absent for in-memory test transports.
    pub child: Option<Child>,
}

impl std::fmt::Debug for HostIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostIo")
            .field("child", &self.child.as_ref().and_then(Child::id))
            .finish_non_exhaustive()
    }
}

/// Seam between the channel and whatever provides the host transport.
///
/// Production uses [`NativeHostLauncher`]; tests substitute in-memory
/// duplex pipes so the channel logic is exercised without a child process.
#[async_trait]
pub trait HostLauncher: Send + Sync {
    /// Start (or otherwise obtain) the host transport.
    async fn launch(&self) -> Result<HostIo, RelayError>;
}

/// Native messaging host manifest — only the fields the broker needs.
#[derive(Debug, Deserialize)]
struct HostManifest {
    path: PathBuf,
}

/// Launcher that resolves the host manifest and spawns the host binary
/// with piped stdio.
#[derive(Debug, Clone)]
pub struct NativeHostLauncher {
    host_name: String,
    manifest_dirs: Vec<PathBuf>,
}

impl NativeHostLauncher {
    /// Launcher for `host_name`, searching `manifest_dirs` in order.
    pub fn new(host_name: impl Into<String>, manifest_dirs: Vec<PathBuf>) -> Self {
        Self { host_name: host_name.into(), manifest_dirs }
    }

    /// Launcher searching the platform's default manifest directories.
    pub fn with_default_dirs(host_name: impl Into<String>) -> Self {
        Self::new(host_name, default_manifest_dirs())
    }

    /// Find the first directory containing the host manifest and parse it.
    fn resolve_manifest(&self) -> Result<HostManifest, RelayError> {
        let file_name = format!("{}.json", self.host_name);
        for dir in &self.manifest_dirs {
            let candidate = dir.join(&file_name);
            if !candidate.is_file() {
                continue;
            }
            let raw = std::fs::read(&candidate).map_err(|e| {
                RelayError::unavailable(format!(
                    "failed to read host manifest {}: {e}",
                    candidate.display()
                ))
            })?;
            let manifest: HostManifest = serde_json::from_slice(&raw).map_err(|e| {
                RelayError::unavailable(format!(
                    "invalid host manifest {}: {e}",
                    candidate.display()
                ))
            })?;
            log::debug!(
                "[Native] resolved host manifest {} -> {}",
                candidate.display(),
                manifest.path.display()
            );
            return Ok(manifest);
        }

        Err(RelayError::unavailable(format!(
            "native host \"{}\" is not registered; install sail and run its \
             chrome-ext-install command to register the host manifest",
            self.host_name
        )))
    }
}

#[async_trait]
impl HostLauncher for NativeHostLauncher {
    async fn launch(&self) -> Result<HostIo, RelayError> {
        let manifest = self.resolve_manifest()?;

        let mut child = Command::new(&manifest.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RelayError::unavailable(format!(
                    "failed to start host binary {}: {e}",
                    manifest.path.display()
                ))
            })?;

        // Piped stdio is always present after a successful spawn.
        let writer = child.stdin.take().ok_or_else(|| {
            RelayError::unavailable("host process has no stdin".to_string())
        })?;
        let reader = child.stdout.take().ok_or_else(|| {
            RelayError::unavailable("host process has no stdout".to_string())
        })?;

        log::info!(
            "[Native] launched host {} (pid {:?})",
            manifest.path.display(),
            child.id()
        );

        Ok(HostIo {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: Some(child),
        })
    }
}

/// Platform directories browsers consult for native messaging host
/// manifests, most specific browser first.
pub fn default_manifest_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let Some(home) = dirs::home_dir() else {
        return dirs;
    };

    #[cfg(target_os = "macos")]
    {
        let app_support = home.join("Library/Application Support");
        dirs.push(app_support.join("Google/Chrome/NativeMessagingHosts"));
        dirs.push(app_support.join("Google/Chrome Canary/NativeMessagingHosts"));
        dirs.push(app_support.join("Chromium/NativeMessagingHosts"));
    }

    #[cfg(not(target_os = "macos"))]
    {
        let config = home.join(".config");
        dirs.push(config.join("google-chrome/NativeMessagingHosts"));
        dirs.push(config.join("google-chrome-beta/NativeMessagingHosts"));
        dirs.push(config.join("google-chrome-unstable/NativeMessagingHosts"));
        dirs.push(config.join("chromium/NativeMessagingHosts"));
    }

    dirs
}
