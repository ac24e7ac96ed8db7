use super::{pending_chains, SagaEvent, SagaPersistence, SagaSnapshot};
use crate::core::{Result, SagaError};
use crate::transaction::ExecuteStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

const EVENT_LOG: &str = "saga_event.jsonl";
const SNAPSHOT_LOG: &str = "saga_snapshot.jsonl";

/// Lines of the snapshot log. Status changes are appended rather than
/// rewritten in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum SnapshotRecord {
    Persist {
        snapshot: SagaSnapshot,
    },
    Status {
        transaction_id: String,
        snapshot_id: u64,
        status: ExecuteStatus,
    },
}

#[derive(Debug)]
struct Sequences {
    next_event_id: u64,
    next_snapshot_row_id: u64,
}

/// JSON-lines event and snapshot log in one directory.
///
/// Every append is flushed and synced before `offer` returns.
#[derive(Debug)]
pub struct FileSagaPersistence {
    dir: PathBuf,
    sequences: Mutex<Sequences>,
}

impl FileSagaPersistence {
    pub async fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| SagaError::Io(format!("create saga log directory: {}", err)))?;

        let store = Self {
            dir,
            sequences: Mutex::new(Sequences {
                next_event_id: 1,
                next_snapshot_row_id: 1,
            }),
        };

        let last_event = store.read_events().await?.iter().map(|e| e.id).max().unwrap_or(0);
        let last_snapshot = store
            .read_snapshot_records()
            .await?
            .iter()
            .filter_map(|record| match record {
                SnapshotRecord::Persist { snapshot } => Some(snapshot.id),
                SnapshotRecord::Status { .. } => None,
            })
            .max()
            .unwrap_or(0);
        {
            let mut sequences = store.sequences.lock().await;
            sequences.next_event_id = last_event + 1;
            sequences.next_snapshot_row_id = last_snapshot + 1;
        }

        Ok(store)
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    fn event_path(&self) -> PathBuf {
        self.dir.join(EVENT_LOG)
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_LOG)
    }

    async fn append_line(path: &Path, line: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|err| SagaError::Io(format!("open {}: {}", path.display(), err)))?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn read_lines(path: &Path) -> Result<Vec<String>> {
        if !fs::try_exists(path).await? {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .await
            .map_err(|err| SagaError::Io(format!("open {}: {}", path.display(), err)))?;

        let mut lines = BufReader::new(file).lines();
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            out.push(line);
        }
        Ok(out)
    }

    async fn read_events(&self) -> Result<Vec<SagaEvent>> {
        Self::read_lines(&self.event_path())
            .await?
            .iter()
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|err| SagaError::Serialization(format!("parse saga event: {}", err)))
            })
            .collect()
    }

    async fn read_snapshot_records(&self) -> Result<Vec<SnapshotRecord>> {
        Self::read_lines(&self.snapshot_path())
            .await?
            .iter()
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|err| SagaError::Serialization(format!("parse saga snapshot: {}", err)))
            })
            .collect()
    }

    /// Replace the snapshot log in one rename.
    async fn rewrite_snapshot_log(&self, records: Vec<SnapshotRecord>) -> Result<()> {
        let dir = self.dir.clone();
        let target = self.snapshot_path();
        let mut body = String::new();
        for record in &records {
            body.push_str(&serde_json::to_string(record)?);
            body.push('\n');
        }

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
            temp.write_all(body.as_bytes())?;
            temp.as_file().sync_all()?;
            temp.persist(&target)
                .map_err(|err| SagaError::Io(format!("replace snapshot log: {}", err)))?;
            Ok(())
        })
        .await
        .map_err(|err| SagaError::Io(format!("snapshot log rewrite task: {}", err)))?
    }
}

#[async_trait]
impl SagaPersistence for FileSagaPersistence {
    async fn offer(&self, mut event: SagaEvent) -> Result<()> {
        let mut sequences = self.sequences.lock().await;
        event.id = sequences.next_event_id;
        Self::append_line(&self.event_path(), &serde_json::to_string(&event)?).await?;
        sequences.next_event_id += 1;
        Ok(())
    }

    async fn find_pending_saga_events(&self) -> Result<BTreeMap<String, Vec<SagaEvent>>> {
        let _sequences = self.sequences.lock().await;
        let events = self.read_events().await?;
        Ok(pending_chains(events.iter()))
    }

    async fn persist_snapshot(&self, mut snapshot: SagaSnapshot) -> Result<()> {
        let mut sequences = self.sequences.lock().await;
        snapshot.id = sequences.next_snapshot_row_id;
        let record = SnapshotRecord::Persist { snapshot };
        Self::append_line(&self.snapshot_path(), &serde_json::to_string(&record)?).await?;
        sequences.next_snapshot_row_id += 1;
        Ok(())
    }

    async fn update_snapshot_status(
        &self,
        transaction_id: &str,
        snapshot_id: u64,
        status: ExecuteStatus,
    ) -> Result<()> {
        let _sequences = self.sequences.lock().await;
        let record = SnapshotRecord::Status {
            transaction_id: transaction_id.to_string(),
            snapshot_id,
            status,
        };
        Self::append_line(&self.snapshot_path(), &serde_json::to_string(&record)?).await
    }

    async fn find_snapshots(&self, transaction_id: &str) -> Result<Vec<SagaSnapshot>> {
        let _sequences = self.sequences.lock().await;
        let mut snapshots: Vec<SagaSnapshot> = Vec::new();
        for record in self.read_snapshot_records().await? {
            match record {
                SnapshotRecord::Persist { snapshot } if snapshot.transaction_id == transaction_id => {
                    snapshots.push(snapshot);
                }
                SnapshotRecord::Status {
                    transaction_id: tx,
                    snapshot_id,
                    status,
                } if tx == transaction_id => {
                    for snapshot in snapshots.iter_mut().filter(|s| s.snapshot_id == snapshot_id) {
                        snapshot.execute_status = status;
                    }
                }
                _ => {}
            }
        }
        Ok(snapshots)
    }

    async fn clean_snapshots(&self, transaction_id: &str) -> Result<()> {
        let _sequences = self.sequences.lock().await;
        let records = self.read_snapshot_records().await?;
        let before = records.len();
        let kept: Vec<SnapshotRecord> = records
            .into_iter()
            .filter(|record| match record {
                SnapshotRecord::Persist { snapshot } => snapshot.transaction_id != transaction_id,
                SnapshotRecord::Status { transaction_id: tx, .. } => tx != transaction_id,
            })
            .collect();

        if kept.len() == before {
            return Ok(());
        }
        self.rewrite_snapshot_log(kept).await
    }
}
