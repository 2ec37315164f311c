//! Background loop that drains locally-stored attachments back into the
//! primary object store. Runs on a timer (via [`Scheduler`]) rather than
//! holding content in memory between attempts — every pass re-reads from
//! disk.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use log::{info, warn};

use crate::storage::local::LocalStore;
use crate::storage::primary::PrimaryStore;

/// Per-path attempt counters for the local→primary drain. Mutated only by
/// the reconciler loop and the upload path, both serialized through this
/// mutex, per the design's shared-state note on the retry-queue map.
pub struct Reconciler {
    local: LocalStore,
    attempts: Mutex<HashMap<PathBuf, u32>>,
    /// Paths that exhausted `max_retries`. Excluded from every later pass so
    /// a permanently-unuploadable attachment isn't retried forever; it stays
    /// on disk until the retention sweep removes it.
    given_up: Mutex<HashSet<PathBuf>>,
    max_retries: u32,
}

impl Reconciler {
    pub fn new(local: LocalStore, max_retries: u32) -> Self {
        Reconciler {
            local,
            attempts: Mutex::new(HashMap::new()),
            given_up: Mutex::new(HashSet::new()),
            max_retries,
        }
    }

    /// Runs one drain pass: for each pending local item not already given
    /// up on, re-reads it from disk and attempts a primary upload. On
    /// success both files are unlinked. On repeated failure past
    /// `max_retries`, the item is dropped from the retry set (left on disk
    /// for retention to clean up later) rather than retried forever.
    pub async fn run_once(&self, primary: &PrimaryStore) -> anyhow::Result<()> {
        let pending = self.retryable_pending()?;
        if pending.is_empty() {
            return Ok(());
        }

        info!("reconciler: draining {} locally-stored attachment(s)", pending.len());

        for path in pending {
            let attempt_count = {
                let mut attempts = self.attempts.lock().unwrap();
                let count = attempts.entry(path.clone()).or_insert(0);
                *count += 1;
                *count
            };

            let attachment = match self.local.read(&path) {
                Ok(a) => a,
                Err(e) => {
                    warn!("reconciler: failed to read {}: {e:#}", path.display());
                    continue;
                }
            };

            match primary.upload(&attachment.original_name, &attachment.content_type, attachment.bytes).await {
                Ok(_url) => {
                    if let Err(e) = self.local.remove(&path) {
                        warn!("reconciler: drained {} but failed to unlink: {e:#}", path.display());
                    }
                    self.attempts.lock().unwrap().remove(&path);
                }
                Err(e) => {
                    if attempt_count >= self.max_retries {
                        warn!(
                            "reconciler: giving up on {} after {} attempts: {e:#}",
                            path.display(),
                            attempt_count
                        );
                        self.attempts.lock().unwrap().remove(&path);
                        self.given_up.lock().unwrap().insert(path.clone());
                    } else {
                        warn!("reconciler: attempt {attempt_count} for {} failed: {e:#}", path.display());
                    }
                }
            }
        }

        Ok(())
    }

    /// Every on-disk pending path minus the ones already given up on.
    fn retryable_pending(&self) -> anyhow::Result<Vec<PathBuf>> {
        let given_up = self.given_up.lock().unwrap();
        Ok(self.local.pending()?.into_iter().filter(|p| !given_up.contains(p)).collect())
    }

    /// True when nothing is pending drain, letting the caller skip a pass.
    /// A given-up item no longer counts as pending work: it stays on disk,
    /// but nothing will retry it until retention removes it.
    pub fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.retryable_pending()?.is_empty())
    }
}
