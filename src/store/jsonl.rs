//! File-backed store
//!
//! Layout of the store directory:
//! - `snapshots.jsonl`: one yield sample per line
//! - `rebalances.jsonl`: insert and status-update events
//! - `performance.jsonl`: one aggregate row per agent cycle
//! - `aggregates/<agent>.json`: latest aggregate of one agent
//! - `locks/<agent>.lock`: cycle lease of one agent
//!
//! Several processes may share a directory. Journals are only ever
//! appended to, and every handle replays the lines other handles appended
//! since its last read before it answers or writes. Aggregates live in one
//! file per agent, so agents never rewrite each other's state.
//!
//! Every write reaches the file before the in-memory view changes, so a
//! record that a caller saw as persisted survives a restart. A line torn by
//! a crash mid-append is dropped when the store is next opened.

use super::{CycleLease, Store, StoreState};
use crate::config::Network;
use crate::model::{
    AgentPerformanceAggregate, NetworkYieldSample, RebalanceRecord, StatusUpdate, TimeWindow,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::warn;

const SNAPSHOTS_FILE: &str = "snapshots.jsonl";
const REBALANCES_FILE: &str = "rebalances.jsonl";
const PERFORMANCE_FILE: &str = "performance.jsonl";
const JOURNALS: [&str; 3] = [SNAPSHOTS_FILE, REBALANCES_FILE, PERFORMANCE_FILE];
const AGGREGATES_DIR: &str = "aggregates";
const LOCKS_DIR: &str = "locks";

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum RebalanceEvent {
    Insert {
        record: RebalanceRecord,
    },
    Update {
        transaction_ref: String,
        update: StatusUpdate,
    },
}

/// Tables rebuilt from the journals, plus how far each journal was read
#[derive(Debug, Default)]
struct Replica {
    tables: StoreState,
    offsets: [u64; 3],
}

#[derive(Debug)]
pub struct JsonlStore {
    dir: PathBuf,
    replica: Mutex<Replica>,
}

impl JsonlStore {
    /// Open (or create) a store directory and replay its history
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(AGGREGATES_DIR)).await?;
        fs::create_dir_all(dir.join(LOCKS_DIR)).await?;

        for journal in JOURNALS {
            repair_tail(&dir.join(journal)).await?;
        }

        let store = Self {
            dir,
            replica: Mutex::new(Replica::default()),
        };
        {
            let mut replica = store.replica.lock().await;
            store.catch_up(&mut replica).await?;
        }

        tracing::info!(dir = %store.dir.display(), "Opened JSONL store");
        Ok(store)
    }

    /// Apply every complete line appended since the last read
    async fn catch_up(&self, replica: &mut Replica) -> Result<()> {
        for (index, journal) in JOURNALS.into_iter().enumerate() {
            let (lines, offset) =
                read_new_lines(&self.dir.join(journal), replica.offsets[index]).await?;
            for line in lines {
                apply_line(&mut replica.tables, journal, &line)?;
            }
            replica.offsets[index] = offset;
        }
        Ok(())
    }

    async fn append(&self, file: &str, value: &impl Serialize) -> Result<()> {
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))
            .await
            .map_err(|e| Error::Persistence(format!("open {}: {}", file, e)))?;
        handle
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Persistence(format!("write {}: {}", file, e)))?;
        handle
            .flush()
            .await
            .map_err(|e| Error::Persistence(format!("flush {}: {}", file, e)))?;
        Ok(())
    }

    fn aggregate_path(&self, agent_id: &str) -> PathBuf {
        self.dir
            .join(AGGREGATES_DIR)
            .join(format!("{}.json", file_stem(agent_id)))
    }

    fn lock_path(&self, agent_id: &str) -> PathBuf {
        self.dir
            .join(LOCKS_DIR)
            .join(format!("{}.lock", file_stem(agent_id)))
    }

    /// Temporary sibling of `path`, unique to this write
    fn scratch_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()))
    }

    /// Replace `path` with `content` in one rename
    async fn replace_file(path: &Path, content: &[u8]) -> Result<()> {
        let tmp = Self::scratch_path(path);
        fs::write(&tmp, content)
            .await
            .map_err(|e| Error::Persistence(format!("write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| Error::Persistence(format!("replace {}: {}", path.display(), e)))?;
        Ok(())
    }

    async fn read_lease(path: &Path) -> Result<Option<CycleLease>> {
        match fs::read(path).await {
            Ok(content) => Ok(serde_json::from_slice(&content).ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Persistence(format!("read {}: {}", path.display(), e))),
        }
    }

    /// Create `path` holding `content`, failing if it already exists
    async fn create_exclusive(path: &Path, content: &[u8]) -> Result<bool> {
        let tmp = Self::scratch_path(path);
        fs::write(&tmp, content)
            .await
            .map_err(|e| Error::Persistence(format!("write {}: {}", tmp.display(), e)))?;
        let linked = fs::hard_link(&tmp, path).await;
        let _ = fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::Persistence(format!("lock {}: {}", path.display(), e))),
        }
    }
}

/// File name for an agent id: URL form encoding keeps it inside one directory
fn file_stem(agent_id: &str) -> String {
    url::form_urlencoded::byte_serialize(agent_id.as_bytes()).collect()
}

fn apply_line(tables: &mut StoreState, journal: &str, line: &str) -> Result<()> {
    match journal {
        SNAPSHOTS_FILE => tables.insert_snapshot(serde_json::from_str(line)?),
        PERFORMANCE_FILE => tables.insert_performance(serde_json::from_str(line)?),
        _ => {
            let applied = match serde_json::from_str::<RebalanceEvent>(line)? {
                RebalanceEvent::Insert { record } => tables.insert_rebalance(record),
                RebalanceEvent::Update {
                    transaction_ref,
                    update,
                } => tables.update_status(&transaction_ref, update).map(|_| ()),
            };
            if let Err(e) = applied {
                warn!(error = %e, "Skipping conflicting rebalance event");
            }
        }
    }
    Ok(())
}

/// Complete lines after `offset`, and the offset just past the last of them
async fn read_new_lines(path: &Path, offset: u64) -> Result<(Vec<String>, u64)> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok((Vec::new(), offset)),
        Err(e) => return Err(e.into()),
    };
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;

    // A line without its newline is still being written by another handle.
    let Some(end) = buf.iter().rposition(|b| *b == b'\n') else {
        return Ok((Vec::new(), offset));
    };
    let text = std::str::from_utf8(&buf[..=end])
        .map_err(|e| Error::Persistence(format!("{}: {}", path.display(), e)))?;
    let lines = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect();
    Ok((lines, offset + end as u64 + 1))
}

/// Drop a final line left incomplete or unparseable by a crash mid-append
async fn repair_tail(path: &Path) -> Result<()> {
    let content = match fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let mut keep = content.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    if keep > 0 {
        let start = content[..keep - 1]
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |i| i + 1);
        let last = &content[start..keep - 1];
        if serde_json::from_slice::<serde_json::Value>(last).is_err() {
            keep = start;
        }
    }
    if keep == content.len() {
        return Ok(());
    }

    warn!(
        file = %path.display(),
        dropped = %String::from_utf8_lossy(&content[keep..]),
        "Dropping torn journal line"
    );
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(keep as u64).await?;
    file.sync_all().await?;
    Ok(())
}

#[async_trait]
impl Store for JsonlStore {
    async fn insert_snapshot(&self, sample: &NetworkYieldSample) -> Result<()> {
        let mut replica = self.replica.lock().await;
        self.append(SNAPSHOTS_FILE, sample).await?;
        self.catch_up(&mut replica).await
    }

    async fn insert_rebalance(&self, record: &RebalanceRecord) -> Result<()> {
        let mut replica = self.replica.lock().await;
        self.catch_up(&mut replica).await?;
        replica.tables.check_new_ref(&record.transaction_ref)?;
        self.append(
            REBALANCES_FILE,
            &RebalanceEvent::Insert {
                record: record.clone(),
            },
        )
        .await?;
        self.catch_up(&mut replica).await
    }

    async fn update_status(
        &self,
        transaction_ref: &str,
        update: StatusUpdate,
    ) -> Result<RebalanceRecord> {
        let mut replica = self.replica.lock().await;
        self.catch_up(&mut replica).await?;
        replica.tables.preview_update(transaction_ref, &update)?;
        self.append(
            REBALANCES_FILE,
            &RebalanceEvent::Update {
                transaction_ref: transaction_ref.to_string(),
                update,
            },
        )
        .await?;
        self.catch_up(&mut replica).await?;
        replica
            .tables
            .get_rebalance(transaction_ref)
            .ok_or_else(|| Error::NotFound(format!("rebalance {}", transaction_ref)))
    }

    async fn upsert_aggregate(&self, aggregate: &AgentPerformanceAggregate) -> Result<()> {
        let content = serde_json::to_vec_pretty(aggregate)?;
        Self::replace_file(&self.aggregate_path(&aggregate.agent_id), &content).await
    }

    async fn get_aggregate(&self, agent_id: &str) -> Result<Option<AgentPerformanceAggregate>> {
        match fs::read(self.aggregate_path(agent_id)).await {
            Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn aggregates(&self) -> Result<Vec<AgentPerformanceAggregate>> {
        let mut entries = fs::read_dir(self.dir.join(AGGREGATES_DIR)).await?;
        let mut all = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            let content = fs::read(entry.path()).await?;
            all.push(serde_json::from_slice::<AgentPerformanceAggregate>(&content)?);
        }
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(all)
    }

    async fn insert_performance(&self, aggregate: &AgentPerformanceAggregate) -> Result<()> {
        let mut replica = self.replica.lock().await;
        self.append(PERFORMANCE_FILE, aggregate).await?;
        self.catch_up(&mut replica).await
    }

    async fn performance_history(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<AgentPerformanceAggregate>> {
        let mut replica = self.replica.lock().await;
        self.catch_up(&mut replica).await?;
        Ok(replica.tables.performance_history(agent_id, limit))
    }

    async fn get_rebalance(&self, transaction_ref: &str) -> Result<Option<RebalanceRecord>> {
        let mut replica = self.replica.lock().await;
        self.catch_up(&mut replica).await?;
        Ok(replica.tables.get_rebalance(transaction_ref))
    }

    async fn rebalances(
        &self,
        agent_id: &str,
        window: TimeWindow,
    ) -> Result<Vec<RebalanceRecord>> {
        let mut replica = self.replica.lock().await;
        self.catch_up(&mut replica).await?;
        Ok(replica.tables.rebalances(agent_id, window))
    }

    async fn all_rebalances(&self, window: TimeWindow) -> Result<Vec<RebalanceRecord>> {
        let mut replica = self.replica.lock().await;
        self.catch_up(&mut replica).await?;
        Ok(replica.tables.all_rebalances(window))
    }

    async fn snapshots(
        &self,
        network: Option<Network>,
        window: TimeWindow,
    ) -> Result<Vec<NetworkYieldSample>> {
        let mut replica = self.replica.lock().await;
        self.catch_up(&mut replica).await?;
        Ok(replica.tables.snapshots(network, window))
    }

    async fn acquire_cycle_lease(&self, lease: &CycleLease) -> Result<bool> {
        let path = self.lock_path(&lease.agent_id);
        let content = serde_json::to_vec(lease)?;

        for _ in 0..2 {
            if Self::create_exclusive(&path, &content).await? {
                return Ok(true);
            }
            match Self::read_lease(&path).await? {
                Some(held) if held.owner == lease.owner => {
                    Self::replace_file(&path, &content).await?;
                    return Ok(true);
                }
                Some(held) if !held.yields_to(&lease.owner, Utc::now()) => return Ok(false),
                // Breaking a stale lease is not atomic; leases only go stale
                // when their holder died mid-cycle.
                stale => {
                    warn!(
                        agent_id = %lease.agent_id,
                        holder = ?stale.map(|held| held.owner),
                        "Breaking stale cycle lease"
                    );
                    match fs::remove_file(&path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Ok(false)
    }

    async fn release_cycle_lease(&self, agent_id: &str, owner: &str) -> Result<()> {
        let path = self.lock_path(agent_id);
        if Self::read_lease(&path)
            .await?
            .is_some_and(|held| held.owner == owner)
        {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
