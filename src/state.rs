//! Durable, file-backed migration state
//!
//! Everything both stages need to be resumable lives here: named counters,
//! the per-message state cache, job statuses, folder processing markers, and
//! advisory locks. Records are plain files under the `stats/` tree; every
//! mutation is written to a temp file and renamed into place while holding
//! the record's advisory lock, so concurrent workers on one host never lose
//! updates. Readers take no locks; a stale read is acceptable because the
//! target-server search is the second line of defense for dedup.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};

const FOLDERS_DIR: &str = "folders";
const MESSAGE_CACHE_DIR: &str = "message_cache";
const JOBS_DIR: &str = "jobs";
const PROCESSED_DIR: &str = "processed";
const LOCKS_DIR: &str = "locks";

/// Cached per-message outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// Confirmed on the target server
    Uploaded,
    /// Deliberately not uploaded (dedup hit)
    Skipped,
    /// Terminal failure recorded for this message
    Failed,
    /// No record exists
    Unknown,
}

impl MessageState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "uploaded" => Self::Uploaded,
            "skipped" => Self::Skipped,
            "failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// Phase of a single work unit, written at every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Start,
    Uploading,
    Completed,
    Skipped,
    Failed,
}

impl JobPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "start" => Some(Self::Start),
            "uploading" => Some(Self::Uploading),
            "completed" => Some(Self::Completed),
            "skipped" => Some(Self::Skipped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Decoded job record
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub phase: JobPhase,
    pub message: String,
    /// Unix epoch seconds at the last transition
    pub timestamp: i64,
}

/// Per-folder counter snapshot, used by the status stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FolderCounters {
    pub count: u64,
    pub size: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Handle to a held advisory lock
///
/// The on-disk artifact is a file containing the owner's PID, so a crashed
/// owner leaves something the next acquirer can reclaim. Dropping the handle
/// releases the lock.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
}

impl LockHandle {
    /// Release explicitly (equivalent to dropping the handle)
    pub fn release(self) {}
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("failed to remove lock {}: {err}", self.path.display());
        }
    }
}

/// The file-backed store
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
    lock_timeout: Duration,
    lock_poll: Duration,
}

impl StateStore {
    /// Open (and create) the store rooted at `stats/`
    ///
    /// # Errors
    ///
    /// `Internal` if the directory tree cannot be created.
    pub fn open(root: PathBuf, lock_timeout: Duration, lock_poll: Duration) -> AppResult<Self> {
        let store = Self {
            root,
            lock_timeout,
            lock_poll,
        };
        store.create_dirs()?;
        Ok(store)
    }

    fn create_dirs(&self) -> AppResult<()> {
        for sub in [
            FOLDERS_DIR,
            MESSAGE_CACHE_DIR,
            JOBS_DIR,
            PROCESSED_DIR,
            LOCKS_DIR,
        ] {
            fs::create_dir_all(self.root.join(sub))?;
        }
        Ok(())
    }

    // -- counters --

    /// Atomically add `delta` to the named counter and return the new value
    ///
    /// Counter names may be path-like (`folders/Inbox/count`); intermediate
    /// directories are created as needed. The read-modify-write runs under
    /// the counter's advisory lock.
    ///
    /// # Errors
    ///
    /// `LockTimeout` if the counter lock cannot be acquired in time.
    pub async fn increment_counter(&self, name: &str, delta: u64) -> AppResult<u64> {
        let lock = self
            .acquire_lock(&format!("counter_{}", sanitize_component(name)))
            .await?;
        let value = self.read_counter(name).saturating_add(delta);
        write_atomic(&self.counter_path(name), value.to_string().as_bytes())?;
        lock.release();
        Ok(value)
    }

    /// [`increment_counter`](Self::increment_counter) with lock-timeout
    /// retries, logging instead of failing
    ///
    /// Counter updates must never take down a work unit whose real work
    /// already succeeded; a lost increment is logged and reconciled by the
    /// next full run.
    pub async fn bump_counter(&self, name: &str, delta: u64, retries: u32) {
        if delta == 0 {
            return;
        }
        let mut attempt = 0;
        loop {
            match self.increment_counter(name, delta).await {
                Ok(_) => return,
                Err(AppError::LockTimeout(_)) if attempt < retries => {
                    attempt += 1;
                    warn!("counter {name} locked; retry {attempt}/{retries}");
                }
                Err(err) => {
                    warn!("counter {name} update failed: {err}");
                    return;
                }
            }
        }
    }

    /// Current counter value, `0` if the counter does not exist
    pub fn read_counter(&self, name: &str) -> u64 {
        fs::read_to_string(self.counter_path(name))
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0)
    }

    fn counter_path(&self, name: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in name.split('/').filter(|s| !s.is_empty()) {
            path.push(sanitize_component(segment));
        }
        path
    }

    /// Enumerate per-folder counters under `stats/folders/`
    ///
    /// Returns `(folder-relative-path, counters)` pairs sorted by path.
    pub fn folder_stats(&self) -> Vec<(String, FolderCounters)> {
        let mut out = Vec::new();
        let root = self.root.join(FOLDERS_DIR);
        collect_folder_stats(&root, String::new(), &mut out);
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    // -- message state cache --

    /// Record the outcome for `(folder, key)`
    ///
    /// # Errors
    ///
    /// `LockTimeout` if the record lock cannot be acquired in time.
    pub async fn put_message_state(
        &self,
        folder: &str,
        key: &str,
        state: MessageState,
    ) -> AppResult<()> {
        let _lock = self
            .acquire_lock(&format!(
                "state_{}_{}",
                sanitize_component(folder),
                sanitize_component(key)
            ))
            .await?;
        let record = format!("{}:{}", state.as_str(), Utc::now().timestamp());
        write_atomic(&self.message_cache_path(folder, key), record.as_bytes())
    }

    /// Cached outcome for `(folder, key)`, `Unknown` if absent or garbled
    ///
    /// Takes no lock; see the module notes on stale reads.
    pub fn get_message_state(&self, folder: &str, key: &str) -> MessageState {
        let Ok(raw) = fs::read_to_string(self.message_cache_path(folder, key)) else {
            return MessageState::Unknown;
        };
        match raw.trim().split_once(':') {
            Some((state, _timestamp)) => MessageState::parse(state),
            None => MessageState::Unknown,
        }
    }

    fn message_cache_path(&self, folder: &str, key: &str) -> PathBuf {
        self.root.join(MESSAGE_CACHE_DIR).join(format!(
            "{}_{}",
            sanitize_component(folder),
            sanitize_component(key)
        ))
    }

    // -- job status --

    /// Write the current phase of a work unit
    pub fn mark_job_status(&self, job_id: &str, phase: JobPhase, message: &str) -> AppResult<()> {
        let record = format!("{}:{}:{}", phase.as_str(), message, Utc::now().timestamp());
        write_atomic(&self.job_path(job_id), record.as_bytes())
    }

    /// IDs of all recorded jobs, in directory order
    pub fn job_ids(&self) -> Vec<String> {
        fs::read_dir(self.root.join(JOBS_DIR))
            .map(|entries| {
                entries
                    .flatten()
                    .filter_map(|e| {
                        e.file_name()
                            .to_string_lossy()
                            .strip_prefix("job_")
                            .map(str::to_owned)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Read back a job record, `None` if absent or garbled
    pub fn read_job_status(&self, job_id: &str) -> Option<JobStatus> {
        let raw = fs::read_to_string(self.job_path(job_id)).ok()?;
        let raw = raw.trim();
        let (phase, rest) = raw.split_once(':')?;
        let (message, timestamp) = rest.rsplit_once(':')?;
        Some(JobStatus {
            phase: JobPhase::parse(phase)?,
            message: message.to_owned(),
            timestamp: timestamp.parse().ok()?,
        })
    }

    fn job_path(&self, job_id: &str) -> PathBuf {
        self.root
            .join(JOBS_DIR)
            .join(format!("job_{}", sanitize_component(job_id)))
    }

    // -- folder markers --

    /// Permanently mark a folder as fully processed
    pub fn mark_folder_processed(&self, folder: &str) -> AppResult<()> {
        write_atomic(
            &self.processed_path(folder, false),
            Utc::now().timestamp().to_string().as_bytes(),
        )
    }

    pub fn is_folder_processed(&self, folder: &str) -> bool {
        self.processed_path(folder, false).exists()
    }

    /// Drop an in-progress marker for the folder
    pub fn start_folder_processing(&self, folder: &str) -> AppResult<()> {
        debug!("folder processing started: {folder}");
        write_atomic(
            &self.processed_path(folder, true),
            Utc::now().timestamp().to_string().as_bytes(),
        )
    }

    /// Remove the in-progress marker
    pub fn complete_folder_processing(&self, folder: &str) -> AppResult<()> {
        debug!("folder processing completed: {folder}");
        let path = self.processed_path(folder, true);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn is_folder_being_processed(&self, folder: &str) -> bool {
        self.processed_path(folder, true).exists()
    }

    /// Number of folders carrying the processed marker
    pub fn processed_folder_count(&self) -> usize {
        fs::read_dir(self.root.join(PROCESSED_DIR))
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| !e.file_name().to_string_lossy().ends_with(".active"))
                    .count()
            })
            .unwrap_or(0)
    }

    fn processed_path(&self, folder: &str, active: bool) -> PathBuf {
        let name = sanitize_component(folder);
        let name = if active { format!("{name}.active") } else { name };
        self.root.join(PROCESSED_DIR).join(name)
    }

    // -- locks --

    /// Acquire the named advisory lock, polling until the timeout
    ///
    /// The lock file holds the owner's PID. A lock whose owner is no longer
    /// a live process is reclaimed on the spot and acquisition retried.
    ///
    /// # Errors
    ///
    /// `LockTimeout` once the configured wait elapses.
    pub async fn acquire_lock(&self, name: &str) -> AppResult<LockHandle> {
        let path = self
            .root
            .join(LOCKS_DIR)
            .join(format!("{}.lock", sanitize_component(name)));
        let deadline = Instant::now() + self.lock_timeout;

        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    file.write_all(std::process::id().to_string().as_bytes())?;
                    return Ok(LockHandle { path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    let owner = fs::read_to_string(&path)
                        .ok()
                        .and_then(|raw| raw.trim().parse::<u32>().ok());
                    match owner {
                        Some(pid) if process_exists(pid) => {}
                        _ => {
                            warn!("reclaiming stale lock '{name}' (owner {owner:?} not running)");
                            let _ = fs::remove_file(&path);
                            continue;
                        }
                    }
                    if Instant::now() >= deadline {
                        return Err(AppError::LockTimeout(format!(
                            "lock '{name}' held by pid {owner:?} after {:?}",
                            self.lock_timeout
                        )));
                    }
                    tokio::time::sleep(self.lock_poll).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    // -- reset --

    /// Remove all counters, caches, markers, and locks
    ///
    /// Idempotent. The driver only invokes this while no stage is running.
    pub fn reset(&self) -> AppResult<()> {
        for sub in [
            FOLDERS_DIR,
            MESSAGE_CACHE_DIR,
            JOBS_DIR,
            PROCESSED_DIR,
            LOCKS_DIR,
        ] {
            let dir = self.root.join(sub);
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        // top-level counter files
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    fs::remove_file(entry.path())?;
                }
            }
        }
        self.create_dirs()
    }
}

/// Replace every filesystem-hostile character with `_`
fn sanitize_component(raw: &str) -> String {
    static UNSAFE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._@-]").expect("static pattern compiles"));
    UNSAFE.replace_all(raw, "_").into_owned()
}

/// Write via temp file + rename in the destination directory
fn write_atomic(path: &Path, contents: &[u8]) -> AppResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| AppError::Internal(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.persist(path)
        .map_err(|e| AppError::Internal(format!("persist {}: {}", path.display(), e.error)))?;
    Ok(())
}

fn collect_folder_stats(dir: &Path, prefix: String, out: &mut Vec<(String, FolderCounters)>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let mut counters = FolderCounters::default();
    let mut has_counters = false;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            let child_prefix = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            collect_folder_stats(&entry.path(), child_prefix, out);
        } else {
            let value: u64 = fs::read_to_string(entry.path())
                .ok()
                .and_then(|raw| raw.trim().parse().ok())
                .unwrap_or(0);
            match name.as_str() {
                "count" => counters.count = value,
                "size" => counters.size = value,
                "skipped" => counters.skipped = value,
                "failed" => counters.failed = value,
                _ => continue,
            }
            has_counters = true;
        }
    }
    if has_counters && !prefix.is_empty() {
        out.push((prefix, counters));
    }
}

/// Whether a process with the given PID is currently alive
///
/// `kill(pid, 0)` probes for existence without sending a signal. The raw
/// declaration avoids pulling in libc for a single call.
#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    unsafe extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    unsafe { kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{JobPhase, MessageState, StateStore};

    fn store(dir: &std::path::Path) -> StateStore {
        StateStore::open(
            dir.join("stats"),
            Duration::from_millis(300),
            Duration::from_millis(20),
        )
        .expect("store opens")
    }

    #[tokio::test]
    async fn counters_accumulate_and_default_to_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());

        assert_eq!(store.read_counter("total_messages"), 0);
        store.increment_counter("total_messages", 1).await.expect("inc");
        store.increment_counter("total_messages", 2).await.expect("inc");
        assert_eq!(store.read_counter("total_messages"), 3);

        store
            .increment_counter("folders/Inbox/count", 1)
            .await
            .expect("inc nested");
        store
            .increment_counter("folders/Inbox/size", 2048)
            .await
            .expect("inc nested");
        assert_eq!(store.read_counter("folders/Inbox/count"), 1);

        let stats = store.folder_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].0, "Inbox");
        assert_eq!(stats[0].1.count, 1);
        assert_eq!(stats[0].1.size, 2048);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_increments_lose_no_updates() {
        let dir = tempfile::tempdir().expect("tempdir");
        // generous lock timeout: the point is lost updates, not contention
        let store = StateStore::open(
            dir.path().join("stats"),
            Duration::from_secs(5),
            Duration::from_millis(5),
        )
        .expect("store opens");

        let mut handles = Vec::new();
        for _ in 0..2 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    store
                        .increment_counter("total_messages", 1)
                        .await
                        .expect("increment");
                }
            }));
        }
        for handle in handles {
            handle.await.expect("worker");
        }
        assert_eq!(store.read_counter("total_messages"), 20);
    }

    #[tokio::test]
    async fn message_state_round_trips_and_defaults_unknown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());

        assert_eq!(
            store.get_message_state("Inbox", "abc@x"),
            MessageState::Unknown
        );
        store
            .put_message_state("Inbox", "abc@x", MessageState::Uploaded)
            .await
            .expect("put");
        assert_eq!(
            store.get_message_state("Inbox", "abc@x"),
            MessageState::Uploaded
        );
        // a key with hostile characters maps to the same record consistently
        store
            .put_message_state("A/B", "id with spaces/slash", MessageState::Skipped)
            .await
            .expect("put");
        assert_eq!(
            store.get_message_state("A/B", "id with spaces/slash"),
            MessageState::Skipped
        );
    }

    #[test]
    fn job_status_preserves_colons_in_message() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());

        store
            .mark_job_status("42", JobPhase::Failed, "APPEND failed: a007 NO quota")
            .expect("mark");
        let status = store.read_job_status("42").expect("present");
        assert_eq!(status.phase, JobPhase::Failed);
        assert_eq!(status.message, "APPEND failed: a007 NO quota");
        assert!(status.timestamp > 0);
    }

    #[test]
    fn folder_markers_track_lifecycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());

        assert!(!store.is_folder_processed("Inbox/Sub"));
        store.start_folder_processing("Inbox/Sub").expect("start");
        assert!(store.is_folder_being_processed("Inbox/Sub"));
        store.complete_folder_processing("Inbox/Sub").expect("complete");
        assert!(!store.is_folder_being_processed("Inbox/Sub"));
        store.mark_folder_processed("Inbox/Sub").expect("mark");
        assert!(store.is_folder_processed("Inbox/Sub"));
        assert_eq!(store.processed_folder_count(), 1);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());

        let held = store.acquire_lock("counter_total").await.expect("first");
        let err = store
            .acquire_lock("counter_total")
            .await
            .expect_err("second must time out");
        assert!(matches!(err, crate::errors::AppError::LockTimeout(_)));

        held.release();
        store
            .acquire_lock("counter_total")
            .await
            .expect("free after release");
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());

        // a PID far above any real pid_max: the owner cannot be alive
        let lock_path = dir.path().join("stats/locks/counter_total.lock");
        std::fs::write(&lock_path, "2147000000").expect("plant stale lock");

        store
            .acquire_lock("counter_total")
            .await
            .expect("stale owner reclaimed");
    }

    #[tokio::test]
    async fn reset_clears_everything_and_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());

        store.increment_counter("total_messages", 7).await.expect("inc");
        store
            .put_message_state("Inbox", "k", MessageState::Failed)
            .await
            .expect("put");
        store.mark_folder_processed("Inbox").expect("mark");

        store.reset().expect("reset");
        assert_eq!(store.read_counter("total_messages"), 0);
        assert_eq!(store.get_message_state("Inbox", "k"), MessageState::Unknown);
        assert!(!store.is_folder_processed("Inbox"));
        store.reset().expect("reset twice");
    }
}
