//! Boundary to the cluster management API.
//!
//! Everything above this module talks to the cluster through [`ClusterApi`],
//! passed explicitly into each operation. [`PveClient`] is the HTTP
//! implementation; tests use the in-memory `mock::MockCluster`.

pub mod client;
#[cfg(test)]
pub mod mock;

use std::fmt;

use futures_util::stream::LocalBoxStream;
use reqwest::Method;
use serde::{Deserialize, Deserializer};

use crate::error::PveError;
use crate::task::{TaskStatus, Upid};

pub use client::PveClient;

// ── Guests ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestKind {
    Vm,
    Container,
}

impl GuestKind {
    /// Path segment used by the API (`/nodes/{node}/qemu`, `/nodes/{node}/lxc`).
    pub fn api_segment(self) -> &'static str {
        match self {
            GuestKind::Vm => "qemu",
            GuestKind::Container => "lxc",
        }
    }

    /// Maps the `type` field of a cluster resource.
    pub fn from_resource_type(ty: &str) -> Option<Self> {
        match ty {
            "qemu" => Some(GuestKind::Vm),
            "lxc" => Some(GuestKind::Container),
            _ => None,
        }
    }
}

impl fmt::Display for GuestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestKind::Vm => f.write_str("VM"),
            GuestKind::Container => f.write_str("container"),
        }
    }
}

/// A guest pinned to the node that hosted it when it was located.
///
/// Callers re-locate if the guest may have migrated since.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestRef {
    pub kind: GuestKind,
    pub id: u32,
    pub node: String,
}

impl GuestRef {
    fn segments(&self) -> Vec<String> {
        vec![
            "nodes".into(),
            self.node.clone(),
            self.kind.api_segment().into(),
            self.id.to_string(),
        ]
    }
}

impl fmt::Display for GuestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} on {}", self.kind, self.id, self.node)
    }
}

/// One row of `/nodes/{node}/{qemu,lxc}`.
#[derive(Debug, Clone, Deserialize)]
pub struct GuestSummary {
    #[serde(deserialize_with = "de_u32")]
    pub vmid: u32,
}

/// One row of `/cluster/resources`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, deserialize_with = "de_opt_u32")]
    pub vmid: Option<u32>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
}

impl ClusterResource {
    pub fn kind(&self) -> Option<GuestKind> {
        GuestKind::from_resource_type(&self.resource_type)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuestConfig {
    #[serde(default)]
    pub tags: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub snaptime: Option<i64>,
    #[serde(default)]
    pub parent: Option<String>,
}

// ── Storage ──────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct StorageInfo {
    pub storage: String,
    /// Comma-separated content types, e.g. `"images,backup,iso"`.
    #[serde(default)]
    pub content: String,
}

impl StorageInfo {
    pub fn supports(&self, content_type: &str) -> bool {
        self.content.split(',').any(|c| c.trim() == content_type)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageContentItem {
    pub volid: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub ctime: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_u32")]
    pub vmid: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, deserialize_with = "de_flag")]
    pub protected: bool,
}

// ── Access control ───────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub userid: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "enabled_by_default", deserialize_with = "de_flag")]
    pub enable: bool,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct Group {
    pub groupid: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub users: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AclEntry {
    pub path: String,
    pub roleid: String,
    pub ugid: String,
    #[serde(rename = "type")]
    pub subject_type: String,
    #[serde(default, deserialize_with = "de_flag")]
    pub propagate: bool,
}

// ── Requests ─────────────────────────────────────────────

/// Ordered form/query parameters for a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, String)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl ToString) -> Self {
        self.0.push((key.to_string(), value.to_string()));
        self
    }

    /// Adds `key` only when `value` is non-empty; an omitted key leaves the
    /// server default in place.
    pub fn opt(self, key: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.is_empty() => self.set(key, v),
            _ => self,
        }
    }

    /// Adds `key=1` when `on` is set.
    pub fn flag(self, key: &str, on: bool) -> Self {
        if on { self.set(key, 1) } else { self }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A state-changing call on an existing guest. Each one produces a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
    Shutdown,
    Reboot,
    Suspend,
    Resume,
    Destroy,
    Clone,
    Migrate,
    Snapshot,
    Rollback(String),
    DeleteSnapshot(String),
}

impl Action {
    pub fn method(&self) -> Method {
        match self {
            Action::Destroy | Action::DeleteSnapshot(_) => Method::DELETE,
            _ => Method::POST,
        }
    }

    /// Path segments below `/nodes/{node}/{kind}/{id}`.
    fn tail(&self) -> Vec<String> {
        let status = |s: &str| vec!["status".to_string(), s.to_string()];
        match self {
            Action::Start => status("start"),
            Action::Stop => status("stop"),
            Action::Shutdown => status("shutdown"),
            Action::Reboot => status("reboot"),
            Action::Suspend => status("suspend"),
            Action::Resume => status("resume"),
            Action::Destroy => Vec::new(),
            Action::Clone => vec!["clone".into()],
            Action::Migrate => vec!["migrate".into()],
            Action::Snapshot => vec!["snapshot".into()],
            Action::Rollback(name) => vec!["snapshot".into(), name.clone(), "rollback".into()],
            Action::DeleteSnapshot(name) => vec!["snapshot".into(), name.clone()],
        }
    }

    pub fn path_segments(&self, guest: &GuestRef) -> Vec<String> {
        let mut segments = guest.segments();
        segments.extend(self.tail());
        segments
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Shutdown => "shutdown",
            Action::Reboot => "reboot",
            Action::Suspend => "suspend",
            Action::Resume => "resume",
            Action::Destroy => "destroy",
            Action::Clone => "clone",
            Action::Migrate => "migrate",
            Action::Snapshot => "snapshot",
            Action::Rollback(_) => "rollback",
            Action::DeleteSnapshot(_) => "delsnapshot",
        }
    }
}

/// Lines of a task log, in order. Ends when the server stops producing output.
pub type LogStream<'a> = LocalBoxStream<'a, Result<String, PveError>>;

// ── The collaborator contract ────────────────────────────

#[allow(async_fn_in_trait)] // trait is internal-only
pub trait ClusterApi {
    async fn nodes(&self) -> Result<Vec<String>, PveError>;

    /// `Ok(None)` when `node` answers but does not host guest `id`.
    async fn guest_status(
        &self,
        node: &str,
        kind: GuestKind,
        id: u32,
    ) -> Result<Option<GuestSummary>, PveError>;

    /// Guest rows (`type=vm`) of `/cluster/resources`.
    async fn cluster_resources(&self) -> Result<Vec<ClusterResource>, PveError>;

    async fn submit_action(
        &self,
        guest: &GuestRef,
        action: &Action,
        params: &Params,
    ) -> Result<Upid, PveError>;

    async fn task_status(&self, upid: &Upid) -> Result<TaskStatus, PveError>;

    /// Best effort: fails when the task's output is not available yet.
    async fn open_task_log(&self, upid: &Upid) -> Result<LogStream<'_>, PveError>;

    async fn storages(&self, node: &str) -> Result<Vec<StorageInfo>, PveError>;

    async fn storage_content(
        &self,
        node: &str,
        storage: &str,
    ) -> Result<Vec<StorageContentItem>, PveError>;

    async fn next_id(&self) -> Result<u32, PveError>;

    async fn create_guest(
        &self,
        node: &str,
        kind: GuestKind,
        params: &Params,
    ) -> Result<Upid, PveError>;

    async fn delete_archive(
        &self,
        node: &str,
        storage: &str,
        filename: &str,
    ) -> Result<Upid, PveError>;

    async fn vzdump(&self, node: &str, params: &Params) -> Result<Upid, PveError>;

    async fn snapshots(&self, guest: &GuestRef) -> Result<Vec<Snapshot>, PveError>;

    async fn guest_config(&self, guest: &GuestRef) -> Result<GuestConfig, PveError>;

    async fn update_config(&self, guest: &GuestRef, params: &Params) -> Result<(), PveError>;

    async fn users(&self) -> Result<Vec<User>, PveError>;

    async fn create_user(&self, params: &Params) -> Result<(), PveError>;

    async fn delete_user(&self, userid: &str) -> Result<(), PveError>;

    async fn groups(&self) -> Result<Vec<Group>, PveError>;

    async fn create_group(&self, params: &Params) -> Result<(), PveError>;

    async fn delete_group(&self, groupid: &str) -> Result<(), PveError>;

    async fn acl(&self) -> Result<Vec<AclEntry>, PveError>;

    async fn update_acl(&self, params: &Params) -> Result<(), PveError>;
}

// ── Lenient decoding ─────────────────────────────────────
//
// The API is loose with scalar types: ids arrive as numbers or strings and
// booleans as 0/1.

fn de_u32<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    de_opt_u32(d)?.ok_or_else(|| serde::de::Error::custom("missing numeric id"))
}

fn de_opt_u32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
    use serde_json::Value;
    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("id out of range: {n}"))),
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => s
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid id: '{s}'"))),
        other => Err(serde::de::Error::custom(format!("invalid id: {other}"))),
    }
}

fn de_flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    use serde_json::Value;
    Ok(match Value::deserialize(d)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_i64().is_some_and(|v| v != 0),
        Value::String(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}
