//! Cross-process ticket locks backed by a pluggable lease store.
//!
//! Multiple coordinator instances may poll the same tracker; the lease is the
//! sole cross-instance coordination primitive. A lease records who acquired
//! the ticket and when. Leases older than the staleness threshold are treated
//! as abandoned (crashed holder) and may be overwritten by anyone.
//!
//! Failure posture is conservative: if the store cannot be read or written,
//! `is_locked` reports contention and `try_acquire`/`release` report failure.
//! The coordinator never proceeds against a lock it cannot positively confirm
//! it owns.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Leases older than this are considered abandoned.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(3600);

/// Ownership record persisted per ticket id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub pid: u32,
    /// Acquisition time, unix seconds. Staleness is measured from here —
    /// leases are not renewed during a long attempt.
    pub acquired_at: u64,
}

/// Time source, injectable so staleness is testable without real waiting.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Backing store for leases, one entry per ticket id.
pub trait LeaseStore: Send + Sync {
    fn load(&self, ticket_id: &str) -> Result<Option<Lease>>;
    fn store(&self, ticket_id: &str, lease: &Lease) -> Result<()>;
    fn remove(&self, ticket_id: &str) -> Result<()>;
}

/// Filesystem store: `<root>/<ticket_id>.lock`, JSON-serialized lease.
pub struct FsLeaseStore {
    root: PathBuf,
}

impl FsLeaseStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create lock directory {}", root.display()))?;
        Ok(Self { root })
    }

    fn path_for(&self, ticket_id: &str) -> PathBuf {
        self.root.join(format!("{ticket_id}.lock"))
    }
}

impl LeaseStore for FsLeaseStore {
    fn load(&self, ticket_id: &str) -> Result<Option<Lease>> {
        let path = self.path_for(ticket_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read lease {}", path.display()))
            }
        };
        let lease = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse lease {}", path.display()))?;
        Ok(Some(lease))
    }

    fn store(&self, ticket_id: &str, lease: &Lease) -> Result<()> {
        let path = self.path_for(ticket_id);
        let bytes = serde_json::to_vec(lease).context("failed to serialize lease")?;
        std::fs::write(&path, bytes)
            .with_context(|| format!("failed to write lease {}", path.display()))
    }

    fn remove(&self, ticket_id: &str) -> Result<()> {
        let path = self.path_for(ticket_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove lease {}", path.display())),
        }
    }
}

/// Mutual exclusion keyed by ticket id, for one owning instance.
pub struct LockManager {
    store: Box<dyn LeaseStore>,
    clock: Box<dyn Clock>,
    owner: String,
    pid: u32,
    staleness: Duration,
}

impl LockManager {
    pub fn new(store: Box<dyn LeaseStore>, owner: impl Into<String>, staleness: Duration) -> Self {
        Self {
            store,
            clock: Box::new(SystemClock),
            owner: owner.into(),
            pid: std::process::id(),
            staleness,
        }
    }

    /// Replace the time source. Tests inject a fake clock here.
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn is_stale(&self, lease: &Lease) -> bool {
        self.clock.now_unix().saturating_sub(lease.acquired_at) >= self.staleness.as_secs()
    }

    fn is_ours(&self, lease: &Lease) -> bool {
        lease.owner == self.owner && lease.pid == self.pid
    }

    /// True iff a live lease exists that belongs to someone else.
    ///
    /// A stale lease does not count as locked; an unreadable lease does.
    pub fn is_locked(&self, ticket_id: &str) -> bool {
        match self.store.load(ticket_id) {
            Ok(None) => false,
            Ok(Some(lease)) => {
                if self.is_stale(&lease) {
                    info!(ticket = ticket_id, "found stale lock, treating as unlocked");
                    false
                } else if self.is_ours(&lease) {
                    false
                } else {
                    info!(
                        ticket = ticket_id,
                        owner = %lease.owner,
                        pid = lease.pid,
                        acquired_at = lease.acquired_at,
                        "ticket is locked by another instance"
                    );
                    true
                }
            }
            Err(e) => {
                error!(ticket = ticket_id, error = %e, "failed to read lock lease, assuming contention");
                true
            }
        }
    }

    /// Acquire the ticket for this instance.
    ///
    /// Fails only when a live lease with a different owner exists or the
    /// store is unusable. Stale leases are overwritten; re-acquiring our own
    /// lease refreshes its timestamp.
    pub fn try_acquire(&self, ticket_id: &str) -> bool {
        if self.is_locked(ticket_id) {
            return false;
        }

        let lease = Lease {
            owner: self.owner.clone(),
            pid: self.pid,
            acquired_at: self.clock.now_unix(),
        };
        match self.store.store(ticket_id, &lease) {
            Ok(()) => {
                info!(ticket = ticket_id, "acquired ticket lock");
                true
            }
            Err(e) => {
                error!(ticket = ticket_id, error = %e, "failed to persist lock lease");
                false
            }
        }
    }

    /// Release the ticket, but only if the lease is ours.
    ///
    /// A missing lease counts as already released. A foreign or unreadable
    /// lease is left untouched and reported as a failed release.
    pub fn release(&self, ticket_id: &str) -> bool {
        match self.store.load(ticket_id) {
            Ok(None) => true,
            Ok(Some(lease)) if self.is_ours(&lease) => match self.store.remove(ticket_id) {
                Ok(()) => {
                    info!(ticket = ticket_id, "released ticket lock");
                    true
                }
                Err(e) => {
                    error!(ticket = ticket_id, error = %e, "failed to remove lock lease");
                    false
                }
            },
            Ok(Some(lease)) => {
                warn!(
                    ticket = ticket_id,
                    owner = %lease.owner,
                    pid = lease.pid,
                    "lock is owned by another instance, not releasing"
                );
                false
            }
            Err(e) => {
                error!(ticket = ticket_id, error = %e, "failed to read lock lease, not releasing");
                false
            }
        }
    }
}
