//! Persistent memory stats
//!
//! Samples are queued on a bounded channel and never block the caller: on a
//! full buffer the sample is dropped and counted. A writer task appends them
//! in memory, a save loop persists the whole set with write-then-rename, and
//! a cleanup loop prunes records past the retention window.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stats::VMMemoryStats;
use crate::config::StatsStoreConfig;
use crate::error::{ResultExt, RunnerResult};
use crate::metrics::STATS_DROPPED;

pub const DATA_FILE: &str = "memory_stats.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStatsRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub sandbox_id: String,
    pub max_memory_kib: u64,
    pub balloon_size_kib: u64,
    pub used_kib: u64,
    pub available_kib: u64,
    pub balloon_active: bool,
}

#[derive(Debug, Clone)]
struct RecordInput {
    timestamp: DateTime<Utc>,
    sandbox_id: String,
    max_memory_kib: u64,
    balloon_size_kib: u64,
    used_kib: u64,
    available_kib: u64,
    balloon_active: bool,
}

impl From<&VMMemoryStats> for RecordInput {
    fn from(stats: &VMMemoryStats) -> Self {
        Self {
            timestamp: Utc::now(),
            sandbox_id: stats.sandbox_id.clone(),
            max_memory_kib: stats.max_memory_kib,
            balloon_size_kib: stats.balloon_size_kib,
            used_kib: stats.used_memory_kib(),
            available_kib: stats.mem_available_kib,
            balloon_active: stats.is_balloon_driver_active(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StatsData {
    records: Vec<MemoryStatsRecord>,
    next_id: i64,
    #[serde(default)]
    last_save: Option<DateTime<Utc>>,
}

impl Default for StatsData {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            next_id: 1,
            last_save: None,
        }
    }
}

impl StatsData {
    fn push(&mut self, input: RecordInput) {
        self.records.push(MemoryStatsRecord {
            id: self.next_id,
            timestamp: input.timestamp,
            sandbox_id: input.sandbox_id,
            max_memory_kib: input.max_memory_kib,
            balloon_size_kib: input.balloon_size_kib,
            used_kib: input.used_kib,
            available_kib: input.available_kib,
            balloon_active: input.balloon_active,
        });
        self.next_id += 1;
    }
}

/// File-backed, retention-bounded store of memory samples
pub struct StatsStore {
    config: StatsStoreConfig,
    data_file: PathBuf,
    data: RwLock<StatsData>,
    sender: Mutex<Option<mpsc::Sender<RecordInput>>>,
    receiver: Mutex<Option<mpsc::Receiver<RecordInput>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl StatsStore {
    /// Opens the store, loading existing data if the file is readable
    pub async fn open(config: StatsStoreConfig) -> RunnerResult<Arc<Self>> {
        tokio::fs::create_dir_all(&config.data_path)
            .await
            .with_context(|| format!("failed to create {}", config.data_path.display()))?;
        let data_file = config.data_path.join(DATA_FILE);

        let data = match load(&data_file).await {
            Ok(data) => data,
            Err(e) => {
                warn!(path = %data_file.display(), error = %e, "failed to load stats, starting fresh");
                StatsData::default()
            }
        };

        let (tx, rx) = mpsc::channel(config.write_buffer_size.max(1));
        Ok(Arc::new(Self {
            config,
            data_file,
            data: RwLock::new(data),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Starts the writer, save and cleanup loops. They stop when `token` or
    /// [`StatsStore::close`] cancels them.
    pub fn start(self: &Arc<Self>, token: CancellationToken) {
        let Some(mut rx) = lock(&self.receiver).take() else {
            return;
        };
        let stop = self.shutdown.clone();
        let mut tasks = lock(&self.tasks);

        let store = Arc::clone(self);
        let writer_stop = stop.clone();
        let writer_token = token.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    record = rx.recv() => match record {
                        Some(record) => store.write(record),
                        None => break,
                    },
                    _ = writer_stop.cancelled() => break,
                    _ = writer_token.cancelled() => break,
                }
            }
            while let Ok(record) = rx.try_recv() {
                store.write(record);
            }
            if let Err(e) = store.save().await {
                warn!(error = %e, "final stats save failed");
            }
            debug!("stats writer stopped");
        }));

        let store = Arc::clone(self);
        let save_stop = stop.clone();
        let save_token = token.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.config.save_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.save().await {
                            warn!(error = %e, "failed to save stats");
                        }
                    }
                    _ = save_stop.cancelled() => break,
                    _ = save_token.cancelled() => break,
                }
            }
        }));

        let store = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.config.cleanup_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        store.cleanup();
                    }
                    _ = stop.cancelled() => break,
                    _ = token.cancelled() => break,
                }
            }
        }));

        info!(
            path = %self.data_file.display(),
            retention_days = self.config.retention_days,
            "stats store started"
        );
    }

    /// Queues a sample without blocking; drops it when the buffer is full
    pub fn record_memory_stats(&self, stats: &VMMemoryStats) {
        let sender = lock(&self.sender);
        let Some(tx) = sender.as_ref() else {
            return;
        };
        match tx.try_send(RecordInput::from(stats)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                STATS_DROPPED.inc();
                debug!(sandbox_id = %stats.sandbox_id, "stats write buffer full, dropping sample");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub fn record_batch(&self, stats: &HashMap<String, VMMemoryStats>) {
        for sample in stats.values() {
            self.record_memory_stats(sample);
        }
    }

    fn write(&self, input: RecordInput) {
        self.data
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(input);
    }

    /// Persists all records: write to a temp file, then rename over the data file
    pub async fn save(&self) -> RunnerResult<()> {
        let raw = {
            let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
            data.last_save = Some(Utc::now());
            serde_json::to_vec(&*data)?
        };
        let tmp = self.data_file.with_extension("json.tmp");
        tokio::fs::write(&tmp, &raw).await?;
        tokio::fs::rename(&tmp, &self.data_file).await?;
        Ok(())
    }

    /// Removes records older than the retention window. Returns how many.
    pub fn cleanup(&self) -> usize {
        let cutoff = Utc::now() - ChronoDuration::days(self.config.retention_days);
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let before = data.records.len();
        data.records.retain(|r| r.timestamp > cutoff);
        let removed = before - data.records.len();
        if removed > 0 {
            info!(removed, %cutoff, "pruned old stats records");
        }
        removed
    }

    /// Records in `[from, to]`, optionally for one sandbox only
    pub fn get_memory_stats(
        &self,
        sandbox_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<MemoryStatsRecord> {
        self.read()
            .records
            .iter()
            .filter(|r| r.timestamp >= from && r.timestamp <= to)
            .filter(|r| sandbox_id.map_or(true, |id| r.sandbox_id == id))
            .cloned()
            .collect()
    }

    pub fn get_all_sandbox_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .read()
            .records
            .iter()
            .map(|r| r.sandbox_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Most recent record of every sandbox
    pub fn get_latest_stats(&self) -> HashMap<String, MemoryStatsRecord> {
        let mut latest: HashMap<String, MemoryStatsRecord> = HashMap::new();
        for record in &self.read().records {
            match latest.get(&record.sandbox_id) {
                Some(existing) if existing.timestamp >= record.timestamp => {}
                _ => {
                    latest.insert(record.sandbox_id.clone(), record.clone());
                }
            }
        }
        latest
    }

    pub fn get_stats_count(&self) -> usize {
        self.read().records.len()
    }

    pub fn data_file(&self) -> &Path {
        &self.data_file
    }

    /// Stops accepting samples, drains the queue and saves one last time
    pub async fn close(&self) -> RunnerResult<()> {
        lock(&self.sender).take();
        self.shutdown.cancel();

        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        // Never started: drain here instead of in the writer.
        let receiver = lock(&self.receiver).take();
        if let Some(mut rx) = receiver {
            while let Ok(record) = rx.try_recv() {
                self.write(record);
            }
        }

        self.save().await.context("failed to save stats on close")?;
        info!(records = self.get_stats_count(), "stats store closed");
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StatsData> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }
}

async fn load(path: &Path) -> RunnerResult<StatsData> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(serde_json::from_slice(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StatsData::default()),
        Err(e) => Err(e.into()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_assigns_increasing_ids() {
        let mut data = StatsData::default();
        let stats = VMMemoryStats {
            sandbox_id: "a".into(),
            mem_total_kib: 100,
            mem_available_kib: 40,
            ..Default::default()
        };
        data.push(RecordInput::from(&stats));
        data.push(RecordInput::from(&stats));

        assert_eq!(data.records[0].id, 1);
        assert_eq!(data.records[1].id, 2);
        assert_eq!(data.next_id, 3);
        assert_eq!(data.records[0].used_kib, 60);
        assert!(data.records[0].balloon_active);
    }
}
