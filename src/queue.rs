use crate::domain::{PendingRecharge, PendingStatus, ServiceKind};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Durable per-service auxiliary queue (spec §4.3). A single writer per service is guaranteed by
/// the distributed lock, so the store itself needs no internal locking.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn append(&self, item: PendingRecharge) -> eyre::Result<()>;
    async fn update(
        &self,
        id: Uuid,
        mutator: Box<dyn FnOnce(&mut PendingRecharge) + Send>,
    ) -> eyre::Result<()>;
    async fn remove(&self, id: Uuid) -> eyre::Result<()>;
    async fn snapshot(&self) -> eyre::Result<Vec<PendingRecharge>>;
}

/// One JSON file per service, written with the teacher's write-to-tmp-then-rename discipline.
pub struct FileQueueStore {
    path: PathBuf,
    service: ServiceKind,
    state: tokio::sync::Mutex<Vec<PendingRecharge>>,
}

impl FileQueueStore {
    /// Loads (or quarantines-and-starts-fresh) the queue file for `service` under `dir`.
    pub fn load_or_quarantine(dir: impl AsRef<Path>, service: ServiceKind) -> eyre::Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(format!("{}.json", service.queue_file_stem()));

        let items = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<Vec<PendingRecharge>>(&raw) {
                Ok(items) => items,
                Err(err) => {
                    let quarantined = path.with_extension(format!(
                        "json.corrupt.{}",
                        Utc::now().format("%Y%m%dT%H%M%S")
                    ));
                    std::fs::rename(&path, &quarantined).ok();
                    tracing::error!(
                        service = %service,
                        quarantined = %quarantined.display(),
                        error = %err,
                        "queue file corrupted at startup; quarantined and starting empty"
                    );
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        Ok(Self {
            path,
            service,
            state: tokio::sync::Mutex::new(items),
        })
    }

    fn flush(&self, items: &[PendingRecharge]) -> eyre::Result<()> {
        let json = serde_json::to_string_pretty(items)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        if let Err(err) = std::fs::rename(&tmp, &self.path) {
            if cfg!(windows) {
                std::fs::remove_file(&self.path).ok();
                std::fs::rename(&tmp, &self.path)?;
            } else {
                return Err(err.into());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn append(&self, item: PendingRecharge) -> eyre::Result<()> {
        let mut guard = self.state.lock().await;
        guard.push(item);
        // Must be durable before the caller's provider-success is acknowledged upstream (§4.3).
        self.flush(&guard)?;
        Ok(())
    }

    async fn update(
        &self,
        id: Uuid,
        mutator: Box<dyn FnOnce(&mut PendingRecharge) + Send>,
    ) -> eyre::Result<()> {
        let mut guard = self.state.lock().await;
        if let Some(item) = guard.iter_mut().find(|i| i.id == id) {
            mutator(item);
        }
        self.flush(&guard)?;
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> eyre::Result<()> {
        let mut guard = self.state.lock().await;
        guard.retain(|i| i.id != id);
        self.flush(&guard)?;
        Ok(())
    }

    async fn snapshot(&self) -> eyre::Result<Vec<PendingRecharge>> {
        let guard = self.state.lock().await;
        Ok(guard.clone())
    }
}

pub fn needs_recovery(item: &PendingRecharge) -> bool {
    matches!(
        item.status,
        PendingStatus::WebserviceSuccessPendingDb
            | PendingStatus::DbInsertionFailedPendingRecovery
            | PendingStatus::DbVerificationFailed
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Device, NoteContext};
    use serde_json::json;

    fn sample_item() -> PendingRecharge {
        PendingRecharge {
            id: Uuid::new_v4(),
            service: ServiceKind::Gps,
            sim: "5551230000".into(),
            provider_name: "p1".into(),
            unit_amount: rust_decimal::Decimal::new(1000, 2),
            days_of_validity: 8,
            folio: Some("F1".into()),
            trans_id: Some("T1".into()),
            final_balance: None,
            minutes_since_last_report: Some(20),
            raw: json!({}),
            device: Device {
                sim: "5551230000".into(),
                service: ServiceKind::Gps,
                description: "unit 1".into(),
                company: "acme".into(),
                hardware_id: "hw1".into(),
                device_id: 1,
                expiry: None,
                last_report: None,
                active: true,
                company_active: true,
            },
            note_context: NoteContext {
                current_index: 0,
                total_to_recharge: 1,
                grace_count: 0,
                total_candidates: 1,
            },
            status: PendingStatus::WebserviceSuccessPendingDb,
            attempts: 0,
            created_at: Utc::now(),
            last_touched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_then_snapshot_then_remove_round_trips() {
        let dir = tempdir();
        let store = FileQueueStore::load_or_quarantine(&dir, ServiceKind::Gps).unwrap();
        let item = sample_item();
        let id = item.id;
        store.append(item).await.unwrap();

        let snap = store.snapshot().await.unwrap();
        assert_eq!(snap.len(), 1);

        store.remove(id).await.unwrap();
        let snap = store.snapshot().await.unwrap();
        assert!(snap.is_empty());
    }

    #[tokio::test]
    async fn corrupted_file_is_quarantined_and_process_continues() {
        let dir = tempdir();
        std::fs::write(dir.join("gps.json"), "not valid json{{{").unwrap();
        let store = FileQueueStore::load_or_quarantine(&dir, ServiceKind::Gps).unwrap();
        let snap = store.snapshot().await.unwrap();
        assert!(snap.is_empty());
        let quarantined = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains("corrupt"));
        assert!(quarantined);
    }

    fn tempdir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("recharge-queue-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&p).unwrap();
        p
    }
}
