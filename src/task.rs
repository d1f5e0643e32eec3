//! Task handles and the watcher that drives them to a terminal result.
//!
//! Every mutating call returns a [`Upid`]. [`watch`] follows the task's log
//! when the server offers one, falls back to bounded status polling when it
//! does not, and always finishes with one authoritative status probe: a log
//! that ends says nothing about the exit status, which the server may record
//! after the last line.
//!
//! Dropping a `watch` future only stops local observation. Nothing is sent
//! to the server and the task keeps running to completion there.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use futures_util::StreamExt;

use crate::api::ClusterApi;
use crate::config::WatchConfig;
use crate::error::PveError;

/// Line the API emits for a task that has produced no output yet.
pub const NO_CONTENT: &str = "no content";

// ── Handle ───────────────────────────────────────────────

/// Unique process id of a server-side task:
/// `UPID:{node}:{pid}:{pstart}:{starttime}:{type}:{id}:{user}:`, numbers in hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Upid {
    raw: String,
    pub node: String,
    pub pid: u32,
    pub pstart: u64,
    pub starttime: i64,
    pub task_type: String,
    pub id: String,
    pub user: String,
}

impl Upid {
    pub fn parse(s: &str) -> Result<Self, PveError> {
        let s = s.trim();
        let malformed = || PveError::invalid(format!("malformed task id '{s}'"));

        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() < 8 || fields[0] != "UPID" || fields[1].is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            raw: s.to_string(),
            node: fields[1].to_string(),
            pid: u32::from_str_radix(fields[2], 16).map_err(|_| malformed())?,
            pstart: u64::from_str_radix(fields[3], 16).map_err(|_| malformed())?,
            starttime: i64::from_str_radix(fields[4], 16).map_err(|_| malformed())?,
            task_type: fields[5].to_string(),
            id: fields[6].to_string(),
            user: fields[7].to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for Upid {
    type Err = PveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Upid::parse(s)
    }
}

impl fmt::Display for Upid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// ── Status ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Stopped { exit_status: String },
}

impl TaskStatus {
    pub fn is_stopped(&self) -> bool {
        matches!(self, TaskStatus::Stopped { .. })
    }

    /// The server's exit message when the task stopped unsuccessfully.
    /// `OK` and `WARNINGS: n` both count as success.
    pub fn failure(&self) -> Option<&str> {
        match self {
            TaskStatus::Stopped { exit_status }
                if exit_status != "OK" && !exit_status.starts_with("WARNINGS") =>
            {
                Some(exit_status)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    Succeeded,
    Failed(String),
}

impl TaskResult {
    /// Turns a failed result into [`PveError::TaskFailed`].
    pub fn into_error(self, upid: &Upid) -> Result<(), PveError> {
        match self {
            TaskResult::Succeeded => Ok(()),
            TaskResult::Failed(message) => Err(PveError::TaskFailed {
                upid: upid.to_string(),
                message,
            }),
        }
    }
}

// ── Watcher ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    /// Upper bound for the polling fallback. The streaming path has no bound
    /// and waits for the server to close the log.
    pub max_wait: Duration,
    pub poll_interval: Duration,
}

impl WatchOptions {
    pub fn from_config(config: &WatchConfig) -> Self {
        Self {
            max_wait: Duration::from_secs(config.max_wait_s),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self::from_config(&WatchConfig::default())
    }
}

/// Follow `upid` until it stops and report how it ended.
///
/// `on_line` receives each non-empty log line as it arrives. Errors from the
/// final status probe are returned; a broken log stream is not an error.
pub async fn watch<A, F>(
    api: &A,
    upid: &Upid,
    opts: &WatchOptions,
    mut on_line: F,
) -> Result<TaskResult, PveError>
where
    A: ClusterApi,
    F: FnMut(&str),
{
    match api.open_task_log(upid).await {
        Ok(mut lines) => {
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => {
                        let line = line.trim_end();
                        if !line.is_empty() && line != NO_CONTENT {
                            on_line(line);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(%upid, error = %e, "task log stream broke off");
                        break;
                    }
                }
            }
        }
        Err(e) => {
            tracing::debug!(%upid, error = %e, "task log unavailable, polling status");
            poll_until_stopped(api, upid, opts).await?;
        }
    }

    let status = api.task_status(upid).await?;
    Ok(match status.failure() {
        Some(message) => TaskResult::Failed(message.to_string()),
        None => TaskResult::Succeeded,
    })
}

/// Poll until the task stops or `max_wait` elapses, whichever comes first.
async fn poll_until_stopped<A: ClusterApi>(
    api: &A,
    upid: &Upid,
    opts: &WatchOptions,
) -> Result<(), PveError> {
    let deadline = tokio::time::Instant::now() + opts.max_wait;
    loop {
        if api.task_status(upid).await?.is_stopped() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::debug!(%upid, "gave up polling after {:?}", opts.max_wait);
            return Ok(());
        }
        tokio::time::sleep(opts.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::{Call, MockCluster};

    const UPID: &str = "UPID:pve1:000ABCDE:0012F3A4:65A1B2C3:qmstart:101:root@pam:";

    fn opts() -> WatchOptions {
        WatchOptions {
            max_wait: Duration::from_millis(50),
            poll_interval: Duration::from_millis(5),
        }
    }

    #[test]
    fn parse_upid_fields() {
        let upid = Upid::parse(UPID).unwrap();
        assert_eq!(upid.node, "pve1");
        assert_eq!(upid.pid, 0x000ABCDE);
        assert_eq!(upid.pstart, 0x0012F3A4);
        assert_eq!(upid.starttime, 0x65A1B2C3);
        assert_eq!(upid.task_type, "qmstart");
        assert_eq!(upid.id, "101");
        assert_eq!(upid.user, "root@pam");
        assert_eq!(upid.to_string(), UPID);
    }

    #[test]
    fn parse_upid_with_empty_id() {
        let upid: Upid = "UPID:pve1:00001234:00005678:65A1B2C3:vzdump::root@pam:"
            .parse()
            .unwrap();
        assert_eq!(upid.task_type, "vzdump");
        assert_eq!(upid.id, "");
    }

    #[test]
    fn parse_upid_rejects_garbage() {
        for bad in ["", "UPID:", "TASK:pve1:1:2:3:x:y:z:", "UPID:pve1:zz:2:3:x:y:z:"] {
            assert!(
                matches!(Upid::parse(bad), Err(PveError::InvalidArgument { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn exit_status_classification() {
        let ok = TaskStatus::Stopped { exit_status: "OK".into() };
        let warn = TaskStatus::Stopped { exit_status: "WARNINGS: 2".into() };
        let bad = TaskStatus::Stopped { exit_status: "unable to find configuration file".into() };
        assert_eq!(ok.failure(), None);
        assert_eq!(warn.failure(), None);
        assert_eq!(bad.failure(), Some("unable to find configuration file"));
        assert_eq!(TaskStatus::Running.failure(), None);
    }

    #[tokio::test]
    async fn streamed_lines_forwarded_then_probed() {
        let upid = Upid::parse(UPID).unwrap();
        let mock = MockCluster::new(&["pve1"])
            .with_task_log(&["starting", "", NO_CONTENT, "TASK OK"])
            .with_task_statuses(vec![TaskStatus::Stopped { exit_status: "OK".into() }]);

        let mut seen = Vec::new();
        let result = watch(&mock, &upid, &opts(), |l| seen.push(l.to_string()))
            .await
            .unwrap();

        assert_eq!(result, TaskResult::Succeeded);
        assert_eq!(seen, vec!["starting", "TASK OK"]);

        let calls = mock.calls();
        let closed = calls.iter().position(|c| *c == Call::LogClosed).unwrap();
        let probe = calls
            .iter()
            .rposition(|c| matches!(c, Call::TaskStatus(_)))
            .unwrap();
        assert!(probe > closed, "final probe must follow stream closure: {calls:?}");
    }

    #[tokio::test]
    async fn stream_end_alone_is_not_success() {
        let upid = Upid::parse(UPID).unwrap();
        let mock = MockCluster::new(&["pve1"])
            .with_task_log(&["TASK ERROR: start failed"])
            .with_task_statuses(vec![TaskStatus::Stopped {
                exit_status: "start failed: QEMU exited with code 1".into(),
            }]);

        let result = watch(&mock, &upid, &opts(), |_| {}).await.unwrap();
        assert_eq!(
            result,
            TaskResult::Failed("start failed: QEMU exited with code 1".into())
        );
    }

    #[tokio::test]
    async fn polls_when_log_unavailable() {
        let upid = Upid::parse(UPID).unwrap();
        let mock = MockCluster::new(&["pve1"]).with_task_statuses(vec![
            TaskStatus::Running,
            TaskStatus::Running,
            TaskStatus::Stopped { exit_status: "OK".into() },
        ]);

        let result = watch(&mock, &upid, &opts(), |_| {}).await.unwrap();
        assert_eq!(result, TaskResult::Succeeded);

        let probes = mock
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::TaskStatus(_)))
            .count();
        // three polls, then the final probe
        assert_eq!(probes, 4);
    }

    #[tokio::test]
    async fn poll_bound_still_ends_with_probe() {
        let upid = Upid::parse(UPID).unwrap();
        // never stops: the last status repeats
        let mock = MockCluster::new(&["pve1"]).with_task_statuses(vec![TaskStatus::Running]);

        let started = std::time::Instant::now();
        let result = watch(&mock, &upid, &opts(), |_| {}).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(result, TaskResult::Succeeded);

        let calls = mock.calls();
        assert!(matches!(calls.last(), Some(Call::TaskStatus(_))));
    }

    #[tokio::test]
    async fn failed_result_maps_to_error() {
        let upid = Upid::parse(UPID).unwrap();
        let err = TaskResult::Failed("boom".into()).into_error(&upid).unwrap_err();
        assert!(matches!(err, PveError::TaskFailed { ref message, .. } if message == "boom"));
        assert!(TaskResult::Succeeded.into_error(&upid).is_ok());
    }
}
