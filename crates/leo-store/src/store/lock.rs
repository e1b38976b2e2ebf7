//! Lease-based mutual exclusion on a backend lock object.
//!
//! Acquisition is a conditional create of the lock object; a stale lease
//! (expired holder) is taken over with a conditional update against the
//! holder's ETag. While held, a background task renews the lease on a timer
//! shorter than half the lease duration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use object_store::path::Path;
use object_store::{Error as ObjectStoreError, ObjectStore};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::metadata::now_ticks;
use crate::store::layout::{get_json, map_backend_err, put_json_conditional, CommitMode};
use crate::Result;

#[derive(Debug, Serialize, Deserialize)]
struct LockDoc {
    owner: String,
    expires: i64,
}

/// A held lock. Renewed automatically until [`release`] is called.
///
/// Dropping an unreleased lease stops renewal and deletes the lock object on
/// a best-effort basis; prefer calling [`release`].
///
/// [`release`]: LockLease::release
pub struct LockLease {
    store: Arc<dyn ObjectStore>,
    path: Path,
    released: Arc<AtomicBool>,
    renewal: JoinHandle<()>,
}

impl LockLease {
    /// Release the lease and delete the lock object. Idempotent.
    pub async fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.renewal.abort();
        match self.store.delete(&self.path).await {
            Ok(()) | Err(ObjectStoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(map_backend_err(&self.path, e)),
        }
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.renewal.abort();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let store = Arc::clone(&self.store);
                let path = self.path.clone();
                handle.spawn(async move {
                    let _ = store.delete(&path).await;
                });
            }
        }
    }
}

impl std::fmt::Debug for LockLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockLease")
            .field("path", &self.path.as_ref())
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

/// Try to acquire the lock at `path`. `Ok(None)` when another owner holds an
/// unexpired lease.
pub(crate) async fn acquire(
    store: Arc<dyn ObjectStore>,
    path: Path,
    lease: Duration,
    renew: Duration,
) -> Result<Option<LockLease>> {
    let owner = format!("{:016x}", rand::random::<u64>());
    let doc = LockDoc {
        owner: owner.clone(),
        expires: now_ticks() + lease.as_micros() as i64,
    };

    let etag = match put_json_conditional(&store, &path, &doc, &CommitMode::Create).await? {
        Some(etag) => Some(etag),
        None => try_take_over_stale(&store, &path, &doc).await?,
    };
    let Some(etag) = etag else {
        debug!("lock at {} is held elsewhere", path);
        return Ok(None);
    };

    let released = Arc::new(AtomicBool::new(false));
    let renewal = tokio::spawn(renew_loop(
        Arc::clone(&store),
        path.clone(),
        owner,
        etag,
        lease,
        renew,
        Arc::clone(&released),
    ));
    Ok(Some(LockLease {
        store,
        path,
        released,
        renewal,
    }))
}

/// The create failed, so an object exists. If its lease has expired, replace
/// it conditionally against the holder's ETag.
async fn try_take_over_stale(
    store: &Arc<dyn ObjectStore>,
    path: &Path,
    doc: &LockDoc,
) -> Result<Option<String>> {
    let Some((existing, etag)) = get_json::<LockDoc>(store, path).await? else {
        // Vanished between create and read; the releasing owner wins this round.
        return Ok(None);
    };
    if existing.expires >= now_ticks() {
        return Ok(None);
    }
    let Some(etag) = etag else {
        return Ok(None);
    };
    put_json_conditional(store, path, doc, &CommitMode::IfMatch(etag)).await
}

async fn renew_loop(
    store: Arc<dyn ObjectStore>,
    path: Path,
    owner: String,
    mut etag: String,
    lease: Duration,
    renew: Duration,
    released: Arc<AtomicBool>,
) {
    let mut interval = tokio::time::interval(renew);
    interval.tick().await;
    loop {
        interval.tick().await;
        if released.load(Ordering::SeqCst) {
            return;
        }
        let doc = LockDoc {
            owner: owner.clone(),
            expires: now_ticks() + lease.as_micros() as i64,
        };
        match put_json_conditional(&store, &path, &doc, &CommitMode::IfMatch(etag.clone())).await {
            Ok(Some(next)) => etag = next,
            Ok(None) => {
                warn!("lock at {} was taken over, stopping renewal", path);
                return;
            }
            Err(err) => {
                warn!("lock renewal at {} failed: {err}", path);
                return;
            }
        }
    }
}
