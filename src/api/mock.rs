//! In-memory cluster for unit tests. Records every call in order.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use futures_util::StreamExt;
use futures_util::stream;

use super::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Nodes,
    GuestStatus { node: String, id: u32 },
    ClusterResources,
    Submit { node: String, id: u32, action: String, params: Params },
    TaskStatus(String),
    OpenLog,
    LogClosed,
    Storages(String),
    Content { node: String, storage: String },
    NextId,
    Create { node: String, kind: GuestKind, params: Params },
    DeleteArchive { node: String, storage: String, filename: String },
    Vzdump { node: String, params: Params },
    Snapshots(u32),
    GuestConfig(u32),
    UpdateConfig { id: u32, params: Params },
    Users,
    CreateUser(Params),
    DeleteUser(String),
    Groups,
    CreateGroup(Params),
    DeleteGroup(String),
    Acl,
    UpdateAcl(Params),
}

pub struct MockCluster {
    nodes: Vec<String>,
    guests: Vec<GuestRef>,
    failing_nodes: Vec<String>,
    storages: HashMap<String, Vec<StorageInfo>>,
    content: HashMap<(String, String), Vec<StorageContentItem>>,
    next_id: u32,
    task_log: Option<Vec<String>>,
    statuses: Mutex<VecDeque<TaskStatus>>,
    tags: Mutex<HashMap<u32, String>>,
    snapshots: Vec<Snapshot>,
    calls: Mutex<Vec<Call>>,
    task_seq: Mutex<u32>,
}

impl MockCluster {
    pub fn new(nodes: &[&str]) -> Self {
        Self {
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            guests: Vec::new(),
            failing_nodes: Vec::new(),
            storages: HashMap::new(),
            content: HashMap::new(),
            next_id: 100,
            task_log: None,
            statuses: Mutex::new(VecDeque::new()),
            tags: Mutex::new(HashMap::new()),
            snapshots: Vec::new(),
            calls: Mutex::new(Vec::new()),
            task_seq: Mutex::new(0),
        }
    }

    pub fn with_guest(mut self, node: &str, kind: GuestKind, id: u32) -> Self {
        self.guests.push(GuestRef {
            kind,
            id,
            node: node.to_string(),
        });
        self
    }

    /// Every per-node query against `node` fails with a permission error.
    pub fn with_failing_node(mut self, node: &str) -> Self {
        self.failing_nodes.push(node.to_string());
        self
    }

    pub fn with_storage(mut self, node: &str, storage: &str, content: &str) -> Self {
        self.storages
            .entry(node.to_string())
            .or_default()
            .push(StorageInfo {
                storage: storage.to_string(),
                content: content.to_string(),
            });
        self
    }

    pub fn with_content(
        mut self,
        node: &str,
        storage: &str,
        items: Vec<StorageContentItem>,
    ) -> Self {
        self.content
            .entry((node.to_string(), storage.to_string()))
            .or_default()
            .extend(items);
        self
    }

    pub fn with_next_id(mut self, id: u32) -> Self {
        self.next_id = id;
        self
    }

    pub fn with_task_log(mut self, lines: &[&str]) -> Self {
        self.task_log = Some(lines.iter().map(|l| l.to_string()).collect());
        self
    }

    /// Statuses handed out one per query; the last one repeats.
    pub fn with_task_statuses(self, statuses: Vec<TaskStatus>) -> Self {
        *self.statuses.lock().unwrap() = statuses.into();
        self
    }

    pub fn with_tags(self, id: u32, tags: &str) -> Self {
        self.tags.lock().unwrap().insert(id, tags.to_string());
        self
    }

    pub fn with_snapshot(mut self, name: &str, parent: Option<&str>) -> Self {
        self.snapshots.push(Snapshot {
            name: name.to_string(),
            description: None,
            snaptime: Some(1_704_067_200),
            parent: parent.map(String::from),
        });
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_node(&self, node: &str) -> Result<(), PveError> {
        if self.failing_nodes.iter().any(|n| n == node) {
            return Err(PveError::Api {
                context: format!("GET /nodes/{node}"),
                status: 403,
                message: "Permission check failed".into(),
            });
        }
        if !self.nodes.iter().any(|n| n == node) {
            return Err(PveError::Api {
                context: format!("GET /nodes/{node}"),
                status: 595,
                message: format!("no such cluster node '{node}'"),
            });
        }
        Ok(())
    }

    fn new_upid(&self, node: &str, task_type: &str, id: &str) -> Upid {
        let mut seq = self.task_seq.lock().unwrap();
        *seq += 1;
        Upid::parse(&format!(
            "UPID:{node}:{:08X}:00000001:65A1B2C3:{task_type}:{id}:root@pam:",
            *seq
        ))
        .unwrap()
    }
}

/// Builds a backup content item for `volid`.
pub fn backup_item(volid: &str, vmid: u32, ctime: Option<i64>) -> StorageContentItem {
    StorageContentItem {
        volid: volid.to_string(),
        size: Some(4096),
        ctime,
        vmid: Some(vmid),
        notes: None,
        protected: false,
    }
}

impl ClusterApi for MockCluster {
    async fn nodes(&self) -> Result<Vec<String>, PveError> {
        self.record(Call::Nodes);
        Ok(self.nodes.clone())
    }

    async fn guest_status(
        &self,
        node: &str,
        kind: GuestKind,
        id: u32,
    ) -> Result<Option<GuestSummary>, PveError> {
        self.record(Call::GuestStatus {
            node: node.to_string(),
            id,
        });
        self.check_node(node)?;
        Ok(self
            .guests
            .iter()
            .find(|g| g.node == node && g.kind == kind && g.id == id)
            .map(|g| GuestSummary { vmid: g.id }))
    }

    async fn cluster_resources(&self) -> Result<Vec<ClusterResource>, PveError> {
        self.record(Call::ClusterResources);
        Ok(self
            .guests
            .iter()
            .map(|g| ClusterResource {
                resource_type: g.kind.api_segment().into(),
                vmid: Some(g.id),
                node: Some(g.node.clone()),
                name: None,
                status: Some("running".into()),
                tags: None,
            })
            .collect())
    }

    async fn submit_action(
        &self,
        guest: &GuestRef,
        action: &Action,
        params: &Params,
    ) -> Result<Upid, PveError> {
        self.record(Call::Submit {
            node: guest.node.clone(),
            id: guest.id,
            action: action.name().to_string(),
            params: params.clone(),
        });
        self.check_node(&guest.node)?;
        Ok(self.new_upid(&guest.node, action.name(), &guest.id.to_string()))
    }

    async fn task_status(&self, upid: &Upid) -> Result<TaskStatus, PveError> {
        self.record(Call::TaskStatus(upid.to_string()));
        let mut statuses = self.statuses.lock().unwrap();
        let status = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().cloned()
        };
        Ok(status.unwrap_or(TaskStatus::Stopped {
            exit_status: "OK".into(),
        }))
    }

    async fn open_task_log(&self, upid: &Upid) -> Result<LogStream<'_>, PveError> {
        self.record(Call::OpenLog);
        let Some(lines) = self.task_log.clone() else {
            return Err(PveError::Api {
                context: format!("GET task log {upid}"),
                status: 500,
                message: "unable to open file - No such file or directory".into(),
            });
        };
        let tail = stream::once(async move {
            self.record(Call::LogClosed);
            None
        })
        .filter_map(|end: Option<Result<String, PveError>>| async move { end });
        Ok(stream::iter(lines.into_iter().map(Ok))
            .chain(tail)
            .boxed_local())
    }

    async fn storages(&self, node: &str) -> Result<Vec<StorageInfo>, PveError> {
        self.record(Call::Storages(node.to_string()));
        self.check_node(node)?;
        Ok(self.storages.get(node).cloned().unwrap_or_default())
    }

    async fn storage_content(
        &self,
        node: &str,
        storage: &str,
    ) -> Result<Vec<StorageContentItem>, PveError> {
        self.record(Call::Content {
            node: node.to_string(),
            storage: storage.to_string(),
        });
        self.check_node(node)?;
        self.content
            .get(&(node.to_string(), storage.to_string()))
            .cloned()
            .ok_or_else(|| PveError::Api {
                context: format!("GET /nodes/{node}/storage/{storage}/content"),
                status: 500,
                message: format!("storage '{storage}' does not exist"),
            })
    }

    async fn next_id(&self) -> Result<u32, PveError> {
        self.record(Call::NextId);
        Ok(self.next_id)
    }

    async fn create_guest(
        &self,
        node: &str,
        kind: GuestKind,
        params: &Params,
    ) -> Result<Upid, PveError> {
        self.record(Call::Create {
            node: node.to_string(),
            kind,
            params: params.clone(),
        });
        self.check_node(node)?;
        let vmid = params.get("vmid").unwrap_or_default().to_string();
        if self.guests.iter().any(|g| g.id.to_string() == vmid) {
            return Err(PveError::Api {
                context: format!("POST /nodes/{node}/{}", kind.api_segment()),
                status: 500,
                message: format!("unable to create guest {vmid} - already exists"),
            });
        }
        let task_type = match kind {
            GuestKind::Vm => "qmrestore",
            GuestKind::Container => "vzrestore",
        };
        Ok(self.new_upid(node, task_type, &vmid))
    }

    async fn delete_archive(
        &self,
        node: &str,
        storage: &str,
        filename: &str,
    ) -> Result<Upid, PveError> {
        self.record(Call::DeleteArchive {
            node: node.to_string(),
            storage: storage.to_string(),
            filename: filename.to_string(),
        });
        self.check_node(node)?;
        Ok(self.new_upid(node, "imgdel", ""))
    }

    async fn vzdump(&self, node: &str, params: &Params) -> Result<Upid, PveError> {
        self.record(Call::Vzdump {
            node: node.to_string(),
            params: params.clone(),
        });
        self.check_node(node)?;
        Ok(self.new_upid(node, "vzdump", params.get("vmid").unwrap_or_default()))
    }

    async fn snapshots(&self, guest: &GuestRef) -> Result<Vec<Snapshot>, PveError> {
        self.record(Call::Snapshots(guest.id));
        Ok(self.snapshots.clone())
    }

    async fn guest_config(&self, guest: &GuestRef) -> Result<GuestConfig, PveError> {
        self.record(Call::GuestConfig(guest.id));
        Ok(GuestConfig {
            tags: self.tags.lock().unwrap().get(&guest.id).cloned(),
        })
    }

    async fn update_config(&self, guest: &GuestRef, params: &Params) -> Result<(), PveError> {
        self.record(Call::UpdateConfig {
            id: guest.id,
            params: params.clone(),
        });
        if let Some(tags) = params.get("tags") {
            self.tags.lock().unwrap().insert(guest.id, tags.to_string());
        }
        Ok(())
    }

    async fn users(&self) -> Result<Vec<User>, PveError> {
        self.record(Call::Users);
        Ok(vec![User {
            userid: "root@pam".into(),
            comment: None,
            email: None,
            enable: true,
        }])
    }

    async fn create_user(&self, params: &Params) -> Result<(), PveError> {
        self.record(Call::CreateUser(params.clone()));
        Ok(())
    }

    async fn delete_user(&self, userid: &str) -> Result<(), PveError> {
        self.record(Call::DeleteUser(userid.to_string()));
        Ok(())
    }

    async fn groups(&self) -> Result<Vec<Group>, PveError> {
        self.record(Call::Groups);
        Ok(Vec::new())
    }

    async fn create_group(&self, params: &Params) -> Result<(), PveError> {
        self.record(Call::CreateGroup(params.clone()));
        Ok(())
    }

    async fn delete_group(&self, groupid: &str) -> Result<(), PveError> {
        self.record(Call::DeleteGroup(groupid.to_string()));
        Ok(())
    }

    async fn acl(&self) -> Result<Vec<AclEntry>, PveError> {
        self.record(Call::Acl);
        Ok(Vec::new())
    }

    async fn update_acl(&self, params: &Params) -> Result<(), PveError> {
        self.record(Call::UpdateAcl(params.clone()));
        Ok(())
    }
}
