//! Periodic certificate expiry sweep
//!
//! Expiry is time-driven, so it is evaluated on its own schedule and never
//! mutates state in the middle of an apply. Expirations feed into the next
//! render through a normal apply intent.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::apply::ApplyIntent;
use crate::error::StoreError;
use crate::model::EntityId;
use crate::queue::ChangeQueue;
use crate::store::EntityStore;

pub struct CertificateSweeper {
    store: Arc<dyn EntityStore>,
    queue: Arc<ChangeQueue>,
    interval: Duration,
}

impl CertificateSweeper {
    pub fn new(store: Arc<dyn EntityStore>, queue: Arc<ChangeQueue>, interval: Duration) -> Self {
        Self {
            store,
            queue,
            interval,
        }
    }

    /// Expire due certificates and request an apply if any changed
    pub fn sweep_once(&self, now: DateTime<Utc>) -> Result<Vec<EntityId>, StoreError> {
        let committed = self.store.expire_certificates(now)?;
        if !committed.value.is_empty() {
            info!(certificates = ?committed.value, "Certificates expired");
            self.queue
                .enqueue(ApplyIntent::new(committed.revision, "certificate expiry"));
        }
        Ok(committed.value)
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Certificate sweep started");

        loop {
            if let Err(e) = self.sweep_once(Utc::now()) {
                warn!(error = %e, "Certificate sweep failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        info!("Certificate sweep shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::ApplyCoordinator;
    use crate::config::{NginxConfig, RenderOptions};
    use crate::db::Database;
    use crate::model::{CertificateDraft, CertificateStatus, EntityDraft};
    use crate::process::ProcessController;
    use crate::validate::Validator;

    fn sweeper(db: Arc<Database>) -> CertificateSweeper {
        let nginx = NginxConfig {
            test_command: "true {config}".to_string(),
            reload_command: "true".to_string(),
            pid_file: None,
            status_url: None,
            ..Default::default()
        };
        let coordinator = ApplyCoordinator::new(
            db.clone(),
            Validator::new(&nginx).unwrap(),
            ProcessController::new(&nginx).unwrap(),
            RenderOptions::default(),
            std::env::temp_dir().join("balancer-studio-sweep-unused.conf"),
        );
        let queue = ChangeQueue::new(coordinator, Duration::from_millis(10));
        CertificateSweeper::new(db, queue, Duration::from_secs(60))
    }

    fn certificate(expires_at: DateTime<Utc>) -> EntityDraft {
        EntityDraft::Certificate(CertificateDraft {
            name: "site".into(),
            provider: "custom".into(),
            domain_name: "site.example.com".into(),
            alt_names: Vec::new(),
            expires_at,
            status: CertificateStatus::Active,
        })
    }

    #[test]
    fn test_sweep_enqueues_only_on_change() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let now = Utc::now();
        let id = db
            .create(certificate(now - chrono::Duration::minutes(5)))
            .unwrap()
            .value
            .id();
        db.create(certificate(now + chrono::Duration::days(5))).unwrap();

        let sweeper = sweeper(db);
        assert_eq!(sweeper.sweep_once(now).unwrap(), vec![id]);

        let pending = sweeper.queue.pending().unwrap();
        assert_eq!(pending.reason, "certificate expiry");
        assert_eq!(pending.revision, 3);

        assert!(sweeper.sweep_once(now).unwrap().is_empty());
        assert_eq!(sweeper.queue.stats().enqueued, 1);
    }
}
