use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "pvectl",
    version,
    about = "Drive a Proxmox VE cluster: guests, snapshots, backups, access control"
)]
pub struct Cli {
    /// Path to config file [default: ~/.config/pvectl/config.toml]
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Show task output as it scrolls by and debug logs on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only show the final result of a task
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Auto)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Interactive on a terminal, plain otherwise
    Auto,
    Interactive,
    Plain,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List cluster nodes
    Nodes,

    /// List guests known to the cluster
    List {
        /// Only guests on this node
        #[arg(long)]
        node: Option<String>,

        /// Only VMs or only containers
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
    },

    /// Manage a virtual machine
    Vm {
        #[command(subcommand)]
        action: GuestCommand,
    },

    /// Manage a container
    Ct {
        #[command(subcommand)]
        action: GuestCommand,
    },

    /// Print the next free guest id
    Nextid,

    /// List, create, delete and restore backups
    Backup {
        #[command(subcommand)]
        action: BackupCommand,
    },

    /// Inspect or follow a task by its UPID
    Task {
        #[command(subcommand)]
        action: TaskCommand,
    },

    /// Manage users
    User {
        #[command(subcommand)]
        action: UserCommand,
    },

    /// Manage groups
    Group {
        #[command(subcommand)]
        action: GroupCommand,
    },

    /// Manage access control entries
    Acl {
        #[command(subcommand)]
        action: AclCommand,
    },

    /// Show logs of watched tasks
    Log {
        /// Show the most recent failed task log
        #[arg(long)]
        failed: bool,

        /// List all task logs
        #[arg(long)]
        all: bool,

        /// Show pvectl's own debug trace instead
        #[arg(long)]
        trace: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum KindArg {
    Vm,
    Ct,
}

/// Guest id plus optional node; without a node every node is searched.
#[derive(Args, Debug, Clone)]
pub struct Target {
    /// Guest id
    pub id: u32,

    /// Node hosting the guest (skips the cluster-wide search)
    #[arg(long)]
    pub node: Option<String>,
}

#[derive(Args, Debug, Clone, Copy)]
pub struct Detach {
    /// Print the task id and return without waiting for the task
    #[arg(long)]
    pub detach: bool,
}

#[derive(Subcommand, Debug)]
pub enum GuestCommand {
    /// Start the guest
    Start {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        detach: Detach,
    },

    /// Stop the guest immediately
    Stop {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        detach: Detach,
    },

    /// Ask the guest OS to shut down
    Shutdown {
        #[command(flatten)]
        target: Target,

        /// Seconds to wait before giving up
        #[arg(long)]
        timeout: Option<u32>,

        /// Stop the guest if it has not shut down after the timeout
        #[arg(long)]
        force: bool,

        #[command(flatten)]
        detach: Detach,
    },

    /// Reboot the guest
    Reboot {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        detach: Detach,
    },

    /// Suspend the guest
    Suspend {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        detach: Detach,
    },

    /// Resume a suspended guest
    Resume {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        detach: Detach,
    },

    /// Delete the guest and its disks
    Destroy {
        #[command(flatten)]
        target: Target,

        /// Also remove the guest from backup jobs, replication and HA
        #[arg(long)]
        purge: bool,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,

        #[command(flatten)]
        detach: Detach,
    },

    /// Copy the guest under a new id
    Clone {
        #[command(flatten)]
        target: Target,

        /// Id of the copy (next free id when omitted)
        #[arg(long)]
        newid: Option<u32>,

        /// Name (VM) or hostname (container) of the copy
        #[arg(long)]
        name: Option<String>,

        /// Full copy instead of a linked clone
        #[arg(long)]
        full: bool,

        /// Node to place the copy on
        #[arg(long = "target")]
        target_node: Option<String>,

        /// Storage for the copy's disks
        #[arg(long)]
        storage: Option<String>,

        #[command(flatten)]
        detach: Detach,
    },

    /// Move the guest to another node
    Migrate {
        #[command(flatten)]
        target: Target,

        /// Destination node
        #[arg(long = "target")]
        to: String,

        /// Live migration (VMs) or restart migration (containers)
        #[arg(long)]
        online: bool,

        #[command(flatten)]
        detach: Detach,
    },

    /// Manage snapshots
    Snapshot {
        #[command(subcommand)]
        action: SnapshotCommand,
    },

    /// Manage tags
    Tags {
        #[command(subcommand)]
        action: TagsCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommand {
    /// List snapshots
    List {
        #[command(flatten)]
        target: Target,
    },

    /// Take a snapshot
    Create {
        #[command(flatten)]
        target: Target,

        /// Snapshot name
        name: String,

        #[arg(long)]
        description: Option<String>,

        /// Include RAM state (VMs only)
        #[arg(long)]
        ram: bool,

        #[command(flatten)]
        detach: Detach,
    },

    /// Roll back to a snapshot
    Rollback {
        #[command(flatten)]
        target: Target,

        name: String,

        #[command(flatten)]
        detach: Detach,
    },

    /// Delete a snapshot
    Delete {
        #[command(flatten)]
        target: Target,

        name: String,

        #[command(flatten)]
        detach: Detach,
    },
}

#[derive(Subcommand, Debug)]
pub enum TagsCommand {
    /// Show tags
    List {
        #[command(flatten)]
        target: Target,
    },

    /// Add tags
    Add {
        #[command(flatten)]
        target: Target,
        #[arg(required = true)]
        tags: Vec<String>,
    },

    /// Remove tags
    Remove {
        #[command(flatten)]
        target: Target,
        #[arg(required = true)]
        tags: Vec<String>,
    },

    /// Replace all tags (none clears them)
    Set {
        #[command(flatten)]
        target: Target,
        tags: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum BackupCommand {
    /// List backup archives, newest first
    List {
        /// Only this node (default: every node)
        #[arg(long)]
        node: Option<String>,

        /// Only this storage (default: every backup-capable storage)
        #[arg(long)]
        storage: Option<String>,

        /// Only archives of this guest
        #[arg(long)]
        vmid: Option<u32>,
    },

    /// Back up a guest
    Create {
        /// Guest id
        vmid: u32,

        /// Node hosting the guest (required for guests not registered in the cluster)
        #[arg(long)]
        node: Option<String>,

        /// Target storage
        #[arg(long)]
        storage: Option<String>,

        /// snapshot, suspend or stop
        #[arg(long)]
        mode: Option<String>,

        /// 0, gzip, lzo or zstd
        #[arg(long)]
        compress: Option<String>,

        /// Bandwidth limit per second, e.g. 50M
        #[arg(long)]
        bwlimit: Option<String>,

        /// Notes template for the archive
        #[arg(long)]
        notes: Option<String>,

        /// Protect the archive from pruning
        #[arg(long)]
        protected: bool,

        #[command(flatten)]
        detach: Detach,
    },

    /// Delete a backup archive
    Delete {
        /// Volume id, e.g. local:backup/vzdump-qemu-101-2024_01_01-00_00_00.vma.zst
        volid: String,

        /// Node to delete through
        #[arg(long)]
        node: String,

        /// Storage (default: the volume id's prefix)
        #[arg(long)]
        storage: Option<String>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,

        #[command(flatten)]
        detach: Detach,
    },

    /// Restore an archive into a new guest
    Restore {
        /// Volume id of the archive
        volid: String,

        /// Node to restore on
        #[arg(long)]
        node: String,

        /// Id of the restored guest (next free id when omitted)
        #[arg(long)]
        vmid: Option<u32>,

        /// Name (VM) or hostname (container)
        #[arg(long)]
        name: Option<String>,

        /// Storage for the restored disks
        #[arg(long)]
        storage: Option<String>,

        #[command(flatten)]
        detach: Detach,
    },
}

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
    /// Show a task's current status
    Status { upid: String },

    /// Follow a task until it finishes
    Watch { upid: String },
}

#[derive(Subcommand, Debug)]
pub enum UserCommand {
    List,

    Add {
        /// user@realm
        userid: String,

        #[arg(long)]
        password: Option<String>,

        #[arg(long)]
        email: Option<String>,

        #[arg(long)]
        comment: Option<String>,

        /// Groups to join (repeatable)
        #[arg(long = "group")]
        groups: Vec<String>,
    },

    Delete {
        userid: String,

        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum GroupCommand {
    List,

    Add {
        groupid: String,

        #[arg(long)]
        comment: Option<String>,
    },

    Delete {
        groupid: String,

        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false, id = "subject")]
pub struct AclSubject {
    /// User the entry applies to
    #[arg(long)]
    pub user: Option<String>,

    /// Group the entry applies to
    #[arg(long)]
    pub group: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum AclCommand {
    List,

    /// Grant a role on a path
    Grant {
        /// ACL path, e.g. /vms/101
        path: String,

        /// Role, e.g. PVEVMUser
        role: String,

        #[command(flatten)]
        subject: AclSubject,

        /// Do not apply to child paths
        #[arg(long)]
        no_propagate: bool,
    },

    /// Revoke a role on a path
    Revoke {
        path: String,

        role: String,

        #[command(flatten)]
        subject: AclSubject,
    },
}
