//! Backup archives: listing across the cluster, creation, deletion and
//! restore into a new or given guest id.
//!
//! Archive type comes from the volume id alone: a `vzdump-lxc-` marker
//! means a container archive, anything else is treated as a VM archive.
//! Restore picks its endpoint from the same rule, so the two must agree.

use std::collections::HashSet;

use futures_util::future::try_join_all;

use crate::allocate;
use crate::api::{ClusterApi, GuestKind, Params, StorageContentItem};
use crate::error::PveError;
use crate::task::Upid;

/// Substring every vzdump archive path carries.
pub const BACKUP_MARKER: &str = "vzdump-";
/// Substring that marks a container archive.
pub const CONTAINER_MARKER: &str = "vzdump-lxc-";

/// Content type a storage must advertise to be searched for archives.
const BACKUP_CONTENT: &str = "backup";

pub fn is_backup_archive(volume_id: &str) -> bool {
    volume_id.contains(BACKUP_MARKER)
}

pub fn archive_kind(volume_id: &str) -> GuestKind {
    if volume_id.contains(CONTAINER_MARKER) {
        GuestKind::Container
    } else {
        GuestKind::Vm
    }
}

/// Storage part of `storage:path`.
pub fn storage_of(volume_id: &str) -> Result<&str, PveError> {
    match volume_id.split_once(':') {
        Some((storage, _)) if !storage.is_empty() => Ok(storage),
        _ => Err(PveError::invalid(format!(
            "volume id '{volume_id}' has no storage prefix"
        ))),
    }
}

/// File name after the `backup/` segment of a volume id.
pub fn archive_filename(volume_id: &str) -> Result<&str, PveError> {
    match volume_id.split_once("backup/") {
        Some((_, name)) if !name.is_empty() => Ok(name),
        _ => Err(PveError::invalid(format!(
            "volume id '{volume_id}' has no backup/ segment"
        ))),
    }
}

/// Guest id encoded in a vzdump file name (`vzdump-qemu-101-...`).
fn vmid_from_volid(volume_id: &str) -> Option<u32> {
    let (_, rest) = volume_id.split_once(BACKUP_MARKER)?;
    let mut parts = rest.split('-');
    let _kind = parts.next()?;
    parts.next()?.parse().ok()
}

// ── Listing ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub volume_id: String,
    pub storage: String,
    /// Node the archive was seen through. Shared storages are visible from
    /// several nodes; this is the first one listed.
    pub node: String,
    pub kind: GuestKind,
    pub size: u64,
    pub created_at: Option<i64>,
    pub vmid: Option<u32>,
    pub notes: Option<String>,
    pub protected: bool,
}

impl BackupEntry {
    fn from_item(node: &str, storage: &str, item: StorageContentItem) -> Self {
        let vmid = item.vmid.or_else(|| vmid_from_volid(&item.volid));
        Self {
            kind: archive_kind(&item.volid),
            storage: storage.to_string(),
            node: node.to_string(),
            size: item.size.unwrap_or(0),
            created_at: item.ctime,
            vmid,
            notes: item.notes.filter(|n| !n.is_empty()),
            protected: item.protected,
            volume_id: item.volid,
        }
    }
}

/// Narrows a listing. Unset fields mean "all".
#[derive(Debug, Clone, Default)]
pub struct BackupFilter {
    pub node: Option<String>,
    pub storage: Option<String>,
    pub vmid: Option<u32>,
}

fn given(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Every backup archive matching `filter`, newest first.
///
/// Each call lists afresh. Any failing node or storage fails the whole
/// listing.
pub async fn list_backups<A: ClusterApi>(
    api: &A,
    filter: &BackupFilter,
) -> Result<Vec<BackupEntry>, PveError> {
    let nodes = match given(&filter.node) {
        Some(node) => vec![node.to_string()],
        None => api.nodes().await?,
    };

    let per_node = try_join_all(nodes.iter().map(|node| backup_storages(api, node, filter))).await?;
    let targets: Vec<(&str, String)> = nodes
        .iter()
        .zip(per_node)
        .flat_map(|(node, storages)| storages.into_iter().map(move |s| (node.as_str(), s)))
        .collect();
    tracing::debug!(targets = targets.len(), "listing backup content");

    let listings = try_join_all(targets.iter().map(|(node, storage)| async move {
        let items = api.storage_content(node, storage).await?;
        Ok::<_, PveError>((*node, storage.as_str(), items))
    }))
    .await?;

    let entries = listings
        .into_iter()
        .flat_map(|(node, storage, items)| {
            items
                .into_iter()
                .filter(|item| is_backup_archive(&item.volid))
                .map(move |item| BackupEntry::from_item(node, storage, item))
        })
        .filter(|entry| filter.vmid.is_none_or(|id| entry.vmid == Some(id)));

    let mut entries = dedup_by_volume(entries);
    sort_newest_first(&mut entries);
    Ok(entries)
}

async fn backup_storages<A: ClusterApi>(
    api: &A,
    node: &str,
    filter: &BackupFilter,
) -> Result<Vec<String>, PveError> {
    if let Some(storage) = given(&filter.storage) {
        return Ok(vec![storage.to_string()]);
    }
    Ok(api
        .storages(node)
        .await?
        .into_iter()
        .filter(|s| s.supports(BACKUP_CONTENT))
        .map(|s| s.storage)
        .collect())
}

/// Keep the first entry seen for each volume id.
pub fn dedup_by_volume(entries: impl IntoIterator<Item = BackupEntry>) -> Vec<BackupEntry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|e| seen.insert(e.volume_id.clone()))
        .collect()
}

/// Newest first; entries without a creation time go last. Stable.
pub fn sort_newest_first(entries: &mut [BackupEntry]) {
    entries.sort_by(|a, b| match (a.created_at, b.created_at) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

// ── Create / delete ──────────────────────────────────────

/// Options passed to vzdump. Empty values leave the server default.
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub storage: Option<String>,
    /// `snapshot`, `suspend` or `stop`.
    pub mode: Option<String>,
    /// `0`, `gzip`, `lzo` or `zstd`.
    pub compress: Option<String>,
    /// Bandwidth limit in KiB/s.
    pub bwlimit_kib: Option<u64>,
    pub notes: Option<String>,
    pub protected: bool,
}

/// Start a backup of `vmid`. The task is returned unwatched.
///
/// Without a node the guest must be registered in the cluster: it is looked
/// up in the cluster resource list, not by scanning nodes.
pub async fn create_backup<A: ClusterApi>(
    api: &A,
    vmid: u32,
    node: Option<&str>,
    opts: &BackupOptions,
) -> Result<Upid, PveError> {
    if vmid == 0 {
        return Err(PveError::invalid("guest id must be positive"));
    }

    let node = match node.filter(|n| !n.is_empty()) {
        Some(node) => node.to_string(),
        None => api
            .cluster_resources()
            .await?
            .into_iter()
            .find(|r| r.kind().is_some() && r.vmid == Some(vmid))
            .and_then(|r| r.node)
            .ok_or_else(|| {
                PveError::not_found(format!(
                    "guest {vmid} in the cluster resource list (pass --node for unregistered guests)"
                ))
            })?,
    };

    let params = Params::new()
        .set("vmid", vmid)
        .opt("storage", opts.storage.as_deref())
        .opt("mode", opts.mode.as_deref())
        .opt("compress", opts.compress.as_deref())
        .opt("notes-template", opts.notes.as_deref())
        .flag("protected", opts.protected);
    let params = match opts.bwlimit_kib {
        Some(kib) => params.set("bwlimit", kib),
        None => params,
    };

    tracing::debug!(vmid, %node, "submitting backup");
    api.vzdump(&node, &params).await
}

/// Delete the archive `volume_id` through `node`. The storage defaults to
/// the volume id's prefix.
pub async fn delete_backup<A: ClusterApi>(
    api: &A,
    node: &str,
    volume_id: &str,
    storage: Option<&str>,
) -> Result<Upid, PveError> {
    let storage = match storage.filter(|s| !s.is_empty()) {
        Some(s) => s,
        None => storage_of(volume_id)?,
    };
    let filename = archive_filename(volume_id)?;
    api.delete_archive(node, storage, filename).await
}

// ── Restore ──────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Target id; `None` or `0` allocates one.
    pub vmid: Option<u32>,
    /// VM name or container hostname.
    pub name: Option<String>,
    /// Storage for the restored disks.
    pub storage: Option<String>,
}

/// Restore `volume_id` on `node` and return the id used with the task.
///
/// An id that is already taken is not checked for; the server's conflict
/// error comes back as is.
pub async fn restore_backup<A: ClusterApi>(
    api: &A,
    node: &str,
    volume_id: &str,
    opts: &RestoreOptions,
) -> Result<(u32, Upid), PveError> {
    let vmid = allocate::resolve_new_id(api, opts.vmid).await?;
    let kind = archive_kind(volume_id);

    let params = match kind {
        GuestKind::Container => Params::new()
            .set("vmid", vmid)
            .set("ostemplate", volume_id)
            .flag("restore", true)
            .opt("storage", opts.storage.as_deref())
            .opt("hostname", opts.name.as_deref()),
        GuestKind::Vm => Params::new()
            .set("vmid", vmid)
            .set("archive", volume_id)
            .opt("storage", opts.storage.as_deref())
            .opt("name", opts.name.as_deref()),
    };

    tracing::debug!(vmid, %kind, %node, %volume_id, "submitting restore");
    let upid = api.create_guest(node, kind, &params).await?;
    Ok((vmid, upid))
}
