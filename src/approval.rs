//! Host approval gate.
//!
//! Before the router launches anything for a new origin, the origin's
//! hostname must pass the allow-list. The list lives outside the core
//! (config UI territory); the router only ever consults it through the
//! [`ApprovalGate`] trait as a yes/no check. The file-backed
//! [`HostAllowList`] here makes the daemon runnable and gives the `approve`
//! / `hosts` CLI commands something to edit — its storage format is not a
//! contract.
//!
//! Matching rules: hostnames compare case-insensitively, and an entry with
//! a leading dot means "this domain and all of its subdomains", so
//! `.github.com` approves both `github.com` and `gist.github.com`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

/// Hosts approved out of the box. Only the big public code hosts belong
/// here.
pub const DEFAULT_APPROVED_HOSTS: &[&str] = &[".github.com", ".gitlab.com"];

/// Yes/no gate consulted by the router before a launch is allowed.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// Whether `hostname` is approved.
    async fn is_approved(&self, hostname: &str) -> bool;

    /// Record `hostname` as approved.
    async fn approve(&self, hostname: &str) -> Result<()>;
}

/// Does `entry` approve `host`? Both must already be lowercased.
fn entry_matches(entry: &str, host: &str) -> bool {
    if let Some(apex) = entry.strip_prefix('.') {
        host == apex || host.ends_with(entry)
    } else {
        host == entry
    }
}

/// Allow-list of approved hostnames, optionally persisted as a JSON array.
pub struct HostAllowList {
    path: Option<PathBuf>,
    hosts: RwLock<Vec<String>>,
}

impl std::fmt::Debug for HostAllowList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostAllowList")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl HostAllowList {
    /// In-memory list seeded with the defaults; nothing is persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            hosts: RwLock::new(
                DEFAULT_APPROVED_HOSTS.iter().map(ToString::to_string).collect(),
            ),
        }
    }

    /// List backed by a JSON file. A missing or unreadable file falls back
    /// to the defaults (same behavior as storage with no key set).
    pub fn load(path: PathBuf) -> Self {
        let hosts = match std::fs::read(&path) {
            Ok(raw) => match serde_json::from_slice::<Vec<String>>(&raw) {
                Ok(hosts) => hosts,
                Err(e) => {
                    log::warn!(
                        "[Approval] ignoring malformed allow-list {}: {e}",
                        path.display()
                    );
                    DEFAULT_APPROVED_HOSTS.iter().map(ToString::to_string).collect()
                }
            },
            Err(_) => DEFAULT_APPROVED_HOSTS.iter().map(ToString::to_string).collect(),
        };
        Self { path: Some(path), hosts: RwLock::new(hosts) }
    }

    /// Snapshot of the current entries.
    pub async fn entries(&self) -> Vec<String> {
        self.hosts.read().await.clone()
    }

    fn persist(&self, hosts: &[String]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create allow-list dir: {}", parent.display()))?;
        }
        let raw = serde_json::to_vec_pretty(hosts).context("serialize allow-list")?;
        std::fs::write(path, raw)
            .with_context(|| format!("write allow-list: {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl ApprovalGate for HostAllowList {
    async fn is_approved(&self, hostname: &str) -> bool {
        let host = hostname.to_lowercase();
        let hosts = self.hosts.read().await;
        hosts
            .iter()
            .any(|entry| entry_matches(&entry.to_lowercase(), &host))
    }

    async fn approve(&self, hostname: &str) -> Result<()> {
        let host = hostname.to_lowercase();
        let mut hosts = self.hosts.write().await;
        if hosts.iter().any(|h| h.to_lowercase() == host) {
            return Ok(());
        }
        hosts.push(host.clone());
        self.persist(&hosts)?;
        log::info!("[Approval] approved host {host}");
        Ok(())
    }
}
