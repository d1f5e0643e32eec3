//! Operations on existing guests: locate the hosting node, then submit.
//!
//! Everything that changes guest state returns the task unwatched, the same
//! as the backup operations. Tag edits are the exception: they are
//! synchronous config updates.

use crate::allocate;
use crate::api::{Action, ClusterApi, ClusterResource, GuestKind, GuestRef, Params, Snapshot};
use crate::error::PveError;
use crate::locate::locate;
use crate::task::Upid;
use crate::util::{join_tags, parse_tags};

/// Name the API lists for the live state alongside real snapshots.
const CURRENT_STATE: &str = "current";

/// Locate `id` and submit `action` against it.
pub async fn submit<A: ClusterApi>(
    api: &A,
    kind: GuestKind,
    id: u32,
    node_hint: Option<&str>,
    action: Action,
    params: &Params,
) -> Result<(GuestRef, Upid), PveError> {
    let guest = locate(api, kind, id, node_hint).await?;
    tracing::debug!(%guest, action = action.name(), "submitting");
    let upid = api.submit_action(&guest, &action, params).await?;
    Ok((guest, upid))
}

/// Destroy an already located guest. Callers locate first so the
/// confirmation prompt can name the node.
pub async fn destroy<A: ClusterApi>(
    api: &A,
    guest: &GuestRef,
    purge: bool,
) -> Result<Upid, PveError> {
    let params = Params::new().flag("purge", purge);
    tracing::debug!(%guest, purge, "destroying");
    api.submit_action(guest, &Action::Destroy, &params).await
}

// ── Clone ────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CloneOptions {
    /// Id of the copy; `None` or `0` allocates one.
    pub newid: Option<u32>,
    pub name: Option<String>,
    /// Full copy instead of a linked clone.
    pub full: bool,
    /// Node the copy is placed on.
    pub target: Option<String>,
    pub storage: Option<String>,
}

/// Clone `id` and return the id of the copy along with the task.
pub async fn clone_guest<A: ClusterApi>(
    api: &A,
    kind: GuestKind,
    id: u32,
    node_hint: Option<&str>,
    opts: &CloneOptions,
) -> Result<(u32, Upid), PveError> {
    let source = locate(api, kind, id, node_hint).await?;
    let newid = allocate::resolve_new_id(api, opts.newid).await?;
    if newid == id {
        return Err(PveError::invalid(format!("cannot clone {kind} {id} onto itself")));
    }

    let name_key = match kind {
        GuestKind::Vm => "name",
        GuestKind::Container => "hostname",
    };
    let params = Params::new()
        .set("newid", newid)
        .opt(name_key, opts.name.as_deref())
        .flag("full", opts.full)
        .opt("target", opts.target.as_deref())
        .opt("storage", opts.storage.as_deref());

    let upid = api.submit_action(&source, &Action::Clone, &params).await?;
    Ok((newid, upid))
}

// ── Migrate ──────────────────────────────────────────────

/// Move `id` to `target`. `live` is an online migration for VMs and a
/// restart migration for containers.
pub async fn migrate<A: ClusterApi>(
    api: &A,
    kind: GuestKind,
    id: u32,
    node_hint: Option<&str>,
    target: &str,
    live: bool,
) -> Result<(GuestRef, Upid), PveError> {
    if target.is_empty() {
        return Err(PveError::invalid("migration needs a target node"));
    }
    let guest = locate(api, kind, id, node_hint).await?;
    if guest.node == target {
        return Err(PveError::invalid(format!("{guest} is already on {target}")));
    }

    let live_key = match kind {
        GuestKind::Vm => "online",
        GuestKind::Container => "restart",
    };
    let params = Params::new().set("target", target).flag(live_key, live);
    let upid = api.submit_action(&guest, &Action::Migrate, &params).await?;
    Ok((guest, upid))
}

// ── Snapshots ────────────────────────────────────────────

/// Snapshot names: a letter, then letters, digits, `_` or `-`; 2 to 40 chars.
pub fn validate_snapshot_name(name: &str) -> Result<(), PveError> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && (2..=40).contains(&name.len());
    if valid {
        Ok(())
    } else {
        Err(PveError::invalid(format!("invalid snapshot name '{name}'")))
    }
}

pub async fn list_snapshots<A: ClusterApi>(
    api: &A,
    kind: GuestKind,
    id: u32,
    node_hint: Option<&str>,
) -> Result<Vec<Snapshot>, PveError> {
    let guest = locate(api, kind, id, node_hint).await?;
    let mut snapshots: Vec<Snapshot> = api
        .snapshots(&guest)
        .await?
        .into_iter()
        .filter(|s| s.name != CURRENT_STATE)
        .collect();
    snapshots.sort_by_key(|s| s.snaptime.unwrap_or(i64::MAX));
    Ok(snapshots)
}

pub async fn create_snapshot<A: ClusterApi>(
    api: &A,
    kind: GuestKind,
    id: u32,
    node_hint: Option<&str>,
    name: &str,
    description: Option<&str>,
    with_ram: bool,
) -> Result<(GuestRef, Upid), PveError> {
    validate_snapshot_name(name)?;
    if with_ram && kind == GuestKind::Container {
        return Err(PveError::invalid("containers have no RAM state to snapshot"));
    }
    let params = Params::new()
        .set("snapname", name)
        .opt("description", description)
        .flag("vmstate", with_ram);
    submit(api, kind, id, node_hint, Action::Snapshot, &params).await
}

pub async fn rollback_snapshot<A: ClusterApi>(
    api: &A,
    kind: GuestKind,
    id: u32,
    node_hint: Option<&str>,
    name: &str,
) -> Result<(GuestRef, Upid), PveError> {
    validate_snapshot_name(name)?;
    let action = Action::Rollback(name.to_string());
    submit(api, kind, id, node_hint, action, &Params::new()).await
}

pub async fn delete_snapshot<A: ClusterApi>(
    api: &A,
    kind: GuestKind,
    id: u32,
    node_hint: Option<&str>,
    name: &str,
) -> Result<(GuestRef, Upid), PveError> {
    validate_snapshot_name(name)?;
    let action = Action::DeleteSnapshot(name.to_string());
    submit(api, kind, id, node_hint, action, &Params::new()).await
}

// ── Tags ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagEdit {
    Add(Vec<String>),
    Remove(Vec<String>),
    Set(Vec<String>),
}

fn validate_tag(tag: &str) -> Result<(), PveError> {
    let mut chars = tag.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+' | '.'));
    if valid {
        Ok(())
    } else {
        Err(PveError::invalid(format!("invalid tag '{tag}'")))
    }
}

/// Apply `edit` to `current`, returning the sorted, deduplicated result.
pub fn apply_tag_edit(current: &[String], edit: &TagEdit) -> Result<Vec<String>, PveError> {
    let mut tags: Vec<String> = match edit {
        TagEdit::Add(add) => current.iter().chain(add).cloned().collect(),
        TagEdit::Remove(remove) => current
            .iter()
            .filter(|t| !remove.contains(t))
            .cloned()
            .collect(),
        TagEdit::Set(set) => set.clone(),
    };
    for tag in &tags {
        validate_tag(tag)?;
    }
    tags.sort();
    tags.dedup();
    Ok(tags)
}

pub async fn tags<A: ClusterApi>(
    api: &A,
    kind: GuestKind,
    id: u32,
    node_hint: Option<&str>,
) -> Result<Vec<String>, PveError> {
    let guest = locate(api, kind, id, node_hint).await?;
    let config = api.guest_config(&guest).await?;
    Ok(parse_tags(config.tags.as_deref().unwrap_or_default()))
}

/// Rewrite the guest's tag list and return what was written.
pub async fn edit_tags<A: ClusterApi>(
    api: &A,
    kind: GuestKind,
    id: u32,
    node_hint: Option<&str>,
    edit: &TagEdit,
) -> Result<Vec<String>, PveError> {
    let guest = locate(api, kind, id, node_hint).await?;
    let config = api.guest_config(&guest).await?;
    let current = parse_tags(config.tags.as_deref().unwrap_or_default());
    let updated = apply_tag_edit(&current, edit)?;

    if updated == current {
        tracing::debug!(%guest, "tags unchanged");
        return Ok(updated);
    }
    let params = if updated.is_empty() {
        Params::new().set("delete", "tags")
    } else {
        Params::new().set("tags", join_tags(&updated))
    };
    api.update_config(&guest, &params).await?;
    Ok(updated)
}

// ── Listing ──────────────────────────────────────────────

/// Guests known to the cluster, by id.
pub async fn list_guests<A: ClusterApi>(
    api: &A,
    node: Option<&str>,
    kind: Option<GuestKind>,
) -> Result<Vec<ClusterResource>, PveError> {
    let node = node.filter(|n| !n.is_empty());
    let mut guests: Vec<ClusterResource> = api
        .cluster_resources()
        .await?
        .into_iter()
        .filter(|r| match r.kind() {
            Some(k) => kind.is_none_or(|want| want == k),
            None => false,
        })
        .filter(|r| node.is_none_or(|n| r.node.as_deref() == Some(n)))
        .collect();
    guests.sort_by_key(|r| r.vmid);
    Ok(guests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::{Call, MockCluster};

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn submitted(mock: &MockCluster) -> Vec<(String, u32, String, Params)> {
        mock.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Submit {
                    node,
                    id,
                    action,
                    params,
                } => Some((node, id, action, params)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn submit_goes_to_located_node() {
        let mock = MockCluster::new(&["pve1", "pve2"]).with_guest("pve2", GuestKind::Vm, 101);
        let (guest, upid) = submit(&mock, GuestKind::Vm, 101, None, Action::Start, &Params::new())
            .await
            .unwrap();
        assert_eq!(guest.node, "pve2");
        assert_eq!(upid.node, "pve2");
        assert_eq!(upid.task_type, "start");
        let subs = submitted(&mock);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].0, "pve2");
    }

    #[tokio::test]
    async fn missing_guest_submits_nothing() {
        let mock = MockCluster::new(&["pve1"]);
        let err = submit(&mock, GuestKind::Vm, 101, None, Action::Stop, &Params::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PveError::NotFound { .. }));
        assert!(submitted(&mock).is_empty());
    }

    #[tokio::test]
    async fn destroy_with_purge() {
        let mock = MockCluster::new(&["pve1", "pve2"])
            .with_guest("pve2", GuestKind::Container, 102);
        let found = locate(&mock, GuestKind::Container, 102, None).await.unwrap();
        let before = mock.calls().len();

        destroy(&mock, &found, true).await.unwrap();

        // Only the submit itself: the located guest is not looked up again.
        let after = mock.calls();
        assert_eq!(after.len(), before + 1);
        let subs = submitted(&mock);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].0, "pve2");
        assert_eq!(subs[0].2, "destroy");
        assert_eq!(subs[0].3.get("purge"), Some("1"));
    }

    #[tokio::test]
    async fn clone_allocates_missing_id() {
        let mock = MockCluster::new(&["pve1"])
            .with_guest("pve1", GuestKind::Vm, 101)
            .with_next_id(140);
        let opts = CloneOptions {
            name: Some("web-2".into()),
            full: true,
            ..CloneOptions::default()
        };
        let (newid, _) = clone_guest(&mock, GuestKind::Vm, 101, None, &opts).await.unwrap();
        assert_eq!(newid, 140);

        let subs = submitted(&mock);
        let params = &subs[0].3;
        assert_eq!(subs[0].1, 101);
        assert_eq!(params.get("newid"), Some("140"));
        assert_eq!(params.get("name"), Some("web-2"));
        assert_eq!(params.get("full"), Some("1"));
        assert_eq!(params.get("target"), None);
    }

    #[tokio::test]
    async fn clone_container_uses_hostname() {
        let mock = MockCluster::new(&["pve1"]).with_guest("pve1", GuestKind::Container, 102);
        let opts = CloneOptions {
            newid: Some(150),
            name: Some("ct-copy".into()),
            ..CloneOptions::default()
        };
        let (newid, _) = clone_guest(&mock, GuestKind::Container, 102, None, &opts)
            .await
            .unwrap();
        assert_eq!(newid, 150);
        assert!(!mock.calls().contains(&Call::NextId));
        let subs = submitted(&mock);
        assert_eq!(subs[0].3.get("hostname"), Some("ct-copy"));
        assert_eq!(subs[0].3.get("name"), None);
    }

    #[tokio::test]
    async fn migrate_flags_by_kind() {
        let mock = MockCluster::new(&["pve1", "pve2"])
            .with_guest("pve1", GuestKind::Vm, 101)
            .with_guest("pve1", GuestKind::Container, 102);
        migrate(&mock, GuestKind::Vm, 101, None, "pve2", true).await.unwrap();
        migrate(&mock, GuestKind::Container, 102, None, "pve2", true).await.unwrap();
        let subs = submitted(&mock);
        assert_eq!(subs[0].3.get("online"), Some("1"));
        assert_eq!(subs[1].3.get("restart"), Some("1"));
        assert_eq!(subs[1].3.get("target"), Some("pve2"));
    }

    #[tokio::test]
    async fn migrate_to_same_node_rejected() {
        let mock = MockCluster::new(&["pve1"]).with_guest("pve1", GuestKind::Vm, 101);
        let err = migrate(&mock, GuestKind::Vm, 101, None, "pve1", false)
            .await
            .unwrap_err();
        assert!(matches!(err, PveError::InvalidArgument { .. }));
        assert!(submitted(&mock).is_empty());
    }

    #[test]
    fn snapshot_names() {
        validate_snapshot_name("before-upgrade").unwrap();
        validate_snapshot_name("s1").unwrap();
        for bad in ["", "a", "1st", "has space", "dot.ted", &"x".repeat(41)] {
            assert!(validate_snapshot_name(bad).is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn snapshot_listing_hides_current() {
        let mock = MockCluster::new(&["pve1"])
            .with_guest("pve1", GuestKind::Vm, 101)
            .with_snapshot("before-upgrade", None)
            .with_snapshot(CURRENT_STATE, Some("before-upgrade"));
        let snaps = list_snapshots(&mock, GuestKind::Vm, 101, None).await.unwrap();
        let names: Vec<&str> = snaps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["before-upgrade"]);
    }

    #[tokio::test]
    async fn snapshot_task_paths() {
        let mock = MockCluster::new(&["pve1"]).with_guest("pve1", GuestKind::Vm, 101);
        create_snapshot(&mock, GuestKind::Vm, 101, None, "pre", Some("x"), true)
            .await
            .unwrap();
        rollback_snapshot(&mock, GuestKind::Vm, 101, None, "pre").await.unwrap();
        delete_snapshot(&mock, GuestKind::Vm, 101, None, "pre").await.unwrap();
        let actions: Vec<String> = submitted(&mock).into_iter().map(|s| s.2).collect();
        assert_eq!(actions, vec!["snapshot", "rollback", "delsnapshot"]);
        assert_eq!(submitted(&mock)[0].3.get("vmstate"), Some("1"));
    }

    #[tokio::test]
    async fn container_snapshot_without_ram() {
        let mock = MockCluster::new(&["pve1"]).with_guest("pve1", GuestKind::Container, 102);
        let err = create_snapshot(&mock, GuestKind::Container, 102, None, "pre", None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, PveError::InvalidArgument { .. }));
    }

    #[test]
    fn tag_edits() {
        let current = strings(&["db", "prod"]);
        assert_eq!(
            apply_tag_edit(&current, &TagEdit::Add(strings(&["web", "db"]))).unwrap(),
            strings(&["db", "prod", "web"])
        );
        assert_eq!(
            apply_tag_edit(&current, &TagEdit::Remove(strings(&["prod", "nope"]))).unwrap(),
            strings(&["db"])
        );
        assert_eq!(
            apply_tag_edit(&current, &TagEdit::Set(strings(&["z", "a", "z"]))).unwrap(),
            strings(&["a", "z"])
        );
        assert!(apply_tag_edit(&current, &TagEdit::Add(strings(&["-bad"]))).is_err());
    }

    #[tokio::test]
    async fn edit_tags_writes_sorted_list() {
        let mock = MockCluster::new(&["pve1"])
            .with_guest("pve1", GuestKind::Vm, 101)
            .with_tags(101, "prod;db");
        let tags = edit_tags(&mock, GuestKind::Vm, 101, None, &TagEdit::Add(strings(&["web"])))
            .await
            .unwrap();
        assert_eq!(tags, strings(&["db", "prod", "web"]));
        assert!(mock.calls().contains(&Call::UpdateConfig {
            id: 101,
            params: Params::new().set("tags", "db;prod;web"),
        }));
        assert_eq!(
            super::tags(&mock, GuestKind::Vm, 101, None).await.unwrap(),
            strings(&["db", "prod", "web"])
        );
    }

    #[tokio::test]
    async fn unchanged_tags_skip_update() {
        let mock = MockCluster::new(&["pve1"])
            .with_guest("pve1", GuestKind::Vm, 101)
            .with_tags(101, "db");
        edit_tags(&mock, GuestKind::Vm, 101, None, &TagEdit::Add(strings(&["db"])))
            .await
            .unwrap();
        assert!(!mock
            .calls()
            .iter()
            .any(|c| matches!(c, Call::UpdateConfig { .. })));
    }

    #[tokio::test]
    async fn removing_last_tag_deletes_option() {
        let mock = MockCluster::new(&["pve1"])
            .with_guest("pve1", GuestKind::Vm, 101)
            .with_tags(101, "db");
        let tags = edit_tags(&mock, GuestKind::Vm, 101, None, &TagEdit::Remove(strings(&["db"])))
            .await
            .unwrap();
        assert!(tags.is_empty());
        assert!(mock.calls().contains(&Call::UpdateConfig {
            id: 101,
            params: Params::new().set("delete", "tags"),
        }));
    }

    #[tokio::test]
    async fn list_filters_kind_and_node() {
        let mock = MockCluster::new(&["pve1", "pve2"])
            .with_guest("pve2", GuestKind::Vm, 105)
            .with_guest("pve1", GuestKind::Vm, 101)
            .with_guest("pve1", GuestKind::Container, 102);

        let all = list_guests(&mock, None, None).await.unwrap();
        let ids: Vec<Option<u32>> = all.iter().map(|r| r.vmid).collect();
        assert_eq!(ids, vec![Some(101), Some(102), Some(105)]);

        let vms_on_pve1 = list_guests(&mock, Some("pve1"), Some(GuestKind::Vm)).await.unwrap();
        assert_eq!(vms_on_pve1.len(), 1);
        assert_eq!(vms_on_pve1[0].vmid, Some(101));
    }
}
