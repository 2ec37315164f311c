//! Attachment storage tier: primary object-store upload with a local-disk
//! fallback and a background reconciler that drains the fallback back into
//! the primary store.

pub mod local;
pub mod primary;
pub mod reconciler;

use std::sync::Arc;

use log::{error, warn};

use crate::config::Config;
use crate::model::StoredAttachment;
use crate::scheduler::Scheduler;
use local::LocalStore;
use primary::PrimaryStore;
use reconciler::Reconciler;

/// Facade combining the primary/local backends and exposing the one
/// operation the ingestion pipeline needs: commit one attachment.
pub struct AttachmentStore {
    primary: Option<Arc<PrimaryStore>>,
    local: LocalStore,
    max_file_size: usize,
}

impl AttachmentStore {
    pub async fn new(config: Arc<Config>) -> Self {
        let primary = PrimaryStore::new(&config).await.map(Arc::new);
        let local = LocalStore::open(&config.local_storage_path, config.local_storage_encryption_key)
            .expect("local attachment storage directory must be creatable");

        AttachmentStore {
            primary,
            local,
            max_file_size: config.max_file_size,
        }
    }

    /// Stores one attachment. The size-cap skip rule is enforced by the
    /// caller (the MIME parser) before this is ever invoked, since a
    /// skipped attachment never touches either backend.
    pub async fn store(&self, filename: &str, content_type: &str, bytes: Vec<u8>) -> StoredAttachment {
        if bytes.len() > self.max_file_size {
            return StoredAttachment::Skipped {
                reason: "File size exceeds maximum allowed".to_string(),
            };
        }

        if let Some(primary) = &self.primary {
            match primary.upload(filename, content_type, bytes.clone()).await {
                Ok(url) => return StoredAttachment::Object { url },
                Err(e) => {
                    warn!("primary store upload failed for {filename}, falling back to local disk: {e:#}");
                }
            }
        }

        match self.local.save(filename, content_type, &bytes) {
            Ok((path, attachment_id)) => StoredAttachment::Local {
                path: path.to_string_lossy().to_string(),
                attachment_id,
                note: "Temporarily stored locally, will be uploaded to S3 when available".to_string(),
            },
            Err(e) => {
                error!("local fallback write failed for {filename}: {e:#}");
                StoredAttachment::Failed { error: e.to_string() }
            }
        }
    }

    /// Starts the hourly retention sweep and the reconciliation loop on the
    /// given scheduler. A no-op when the primary store isn't configured,
    /// since nothing would ever be uploaded anyway. Reuses the `PrimaryStore`
    /// built in `new` rather than loading the AWS config a second time.
    pub async fn spawn_background_tasks(self: &Arc<Self>, config: Arc<Config>, scheduler: Arc<Scheduler>) {
        let retention = std::time::Duration::from_secs(config.local_storage_retention_hours * 3600);
        let local_for_retention = self.local.clone();
        scheduler.every(std::time::Duration::from_secs(3600), move || {
            let local = local_for_retention.clone();
            async move {
                match local.sweep_expired(retention) {
                    Ok(0) => {}
                    Ok(n) => log::info!("retention sweep removed {n} expired local attachment(s)"),
                    Err(e) => log::warn!("retention sweep failed: {e:#}"),
                }
            }
        });

        if let Some(primary) = self.primary.clone() {
            let local_for_reconciler = self.local.clone();
            let reconciler = Arc::new(Reconciler::new(local_for_reconciler, config.s3_max_retries));
            scheduler.every(config.s3_retry_interval, move || {
                let reconciler = reconciler.clone();
                let primary = primary.clone();
                async move {
                    match reconciler.is_empty() {
                        Ok(true) => {}
                        _ => {
                            if let Err(e) = reconciler.run_once(&primary).await {
                                log::warn!("reconciliation pass failed: {e:#}");
                            }
                        }
                    }
                }
            });
        }
    }
}
