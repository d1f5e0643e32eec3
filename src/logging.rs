use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use tracing_subscriber::fmt::MakeWriter;

use crate::task::Upid;
use crate::util::civil_time;

/// Task logs kept per task type.
pub const KEEP_PER_TYPE: usize = 20;

// ── DeferredFileWriter ───────────────────────────────────

/// A `MakeWriter` that initially discards writes, then logs to a file
/// once activated via `handle.set_file(path)`.
///
/// The subscriber is installed before the config (and with it the data
/// directory) is known; file logging is switched on afterwards.
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: Arc<Mutex<Option<File>>>,
}

/// Handle returned by `DeferredFileWriter::new()`; call `set_file` to activate.
#[derive(Clone)]
pub struct DeferredFileHandle {
    inner: Arc<Mutex<Option<File>>>,
}

fn lock(inner: &Mutex<Option<File>>) -> MutexGuard<'_, Option<File>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeferredFileWriter {
    pub fn new() -> (Self, DeferredFileHandle) {
        let inner = Arc::new(Mutex::new(None));
        (
            Self {
                inner: inner.clone(),
            },
            DeferredFileHandle { inner },
        )
    }
}

impl DeferredFileHandle {
    /// Opens `path` in append mode and starts writing to it.
    pub fn set_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *lock(&self.inner) = Some(file);
        Ok(())
    }
}

pub struct DeferredWriter {
    inner: Arc<Mutex<Option<File>>>,
}

impl std::io::Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()), // discard
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

// ── TaskLogger ───────────────────────────────────────────

/// Label used in log filenames: `qmstart-101`, or just `vzdump` for tasks
/// without an object id.
pub fn task_label(upid: &Upid) -> String {
    if upid.id.is_empty() {
        upid.task_type.clone()
    } else {
        format!("{}-{}", upid.task_type, upid.id)
    }
}

/// Copy of a watched task's output on local disk.
///
/// Creates `<timestamp>_<label>_running.log` on construction.
/// `finish(success)` renames it to `_ok.log` or `_failed.log`; `abandon`
/// renames it to `_abandoned.log` when watching stopped before the task did.
pub struct TaskLogger {
    file: File,
    path: PathBuf,
}

impl TaskLogger {
    pub fn new(logs_dir: &Path, upid: &Upid) -> std::io::Result<Self> {
        fs::create_dir_all(logs_dir)?;
        let ts = utc_timestamp();
        let path = logs_dir.join(format!("{ts}_{}_running.log", task_label(upid)));
        let mut file = File::create(&path)?;
        let _ = writeln!(file, "# {upid}");
        Ok(Self { file, path })
    }

    pub fn write_line(&mut self, line: &str) {
        let _ = writeln!(self.file, "{line}");
    }

    pub fn finish(self, success: bool) {
        self.close(if success { "ok" } else { "failed" });
    }

    pub fn abandon(self) {
        self.close("abandoned");
    }

    fn close(self, suffix: &str) {
        let new_name = self
            .path
            .file_name()
            .and_then(|f| f.to_str())
            .map(|f| f.replace("_running.log", &format!("_{suffix}.log")));
        if let Some(name) = new_name {
            let new_path = self.path.with_file_name(name);
            if let Err(e) = fs::rename(&self.path, &new_path) {
                tracing::debug!(
                    path = %self.path.display(),
                    error = %e,
                    "could not finalize task log"
                );
            }
        }
    }
}

// ── Log rotation ─────────────────────────────────────────

/// Delete the oldest finished logs of `task_type`, keeping at most `keep`.
pub fn rotate_logs(logs_dir: &Path, task_type: &str, keep: usize) {
    let matching: Vec<TaskLogEntry> = list_task_logs(logs_dir)
        .into_iter()
        .filter(|e| e.task_type() == task_type)
        .collect();

    if matching.len() > keep {
        for old in &matching[..matching.len() - keep] {
            let _ = fs::remove_file(&old.path);
        }
    }
}

// ── Log listing ──────────────────────────────────────────

/// Metadata parsed from a task log filename.
#[derive(Debug, Clone)]
pub struct TaskLogEntry {
    pub path: PathBuf,
    pub timestamp: String,
    pub label: String,
    pub status: String,
}

impl TaskLogEntry {
    pub fn task_type(&self) -> &str {
        self.label
            .split_once('-')
            .map_or(self.label.as_str(), |(ty, _)| ty)
    }
}

/// All finished task logs in the directory, oldest first.
pub fn list_task_logs(logs_dir: &Path) -> Vec<TaskLogEntry> {
    let Ok(entries) = fs::read_dir(logs_dir) else {
        return Vec::new();
    };

    let mut logs: Vec<TaskLogEntry> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            let fname = path.file_name()?.to_str()?;
            if fname.ends_with("_running.log") {
                return None;
            }
            let stem = fname.strip_suffix(".log")?;
            // <timestamp>_<label>_<status>
            let first = stem.find('_')?;
            let last = stem.rfind('_')?;
            if first == last {
                return None;
            }
            Some(TaskLogEntry {
                timestamp: stem[..first].to_string(),
                label: stem[first + 1..last].to_string(),
                status: stem[last + 1..].to_string(),
                path,
            })
        })
        .collect();

    logs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.path.cmp(&b.path)));
    logs
}

/// The most recent task log, optionally only among failed ones.
pub fn latest_task_log(logs_dir: &Path, failed_only: bool) -> Option<PathBuf> {
    list_task_logs(logs_dir)
        .into_iter()
        .rev()
        .find(|e| !failed_only || e.status == "failed")
        .map(|e| e.path)
}

// ── Timestamp helper ─────────────────────────────────────

/// Current UTC time as `YYYY-MM-DDTHH-MM-SS`, safe for filenames.
pub fn utc_timestamp() -> String {
    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let (y, m, d, hh, mm, ss) = civil_time(secs as i64);
    format!("{y:04}-{m:02}-{d:02}T{hh:02}-{mm:02}-{ss:02}")
}
