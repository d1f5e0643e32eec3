use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use clap::Parser;
use console::style;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use pvectl::access::{self, AclChange, NewUser, Subject};
use pvectl::api::{Action, ClusterApi, GuestKind, Params, PveClient};
use pvectl::backup::{self, BackupFilter, BackupOptions, RestoreOptions};
use pvectl::cli::{
    AclCommand, AclSubject, BackupCommand, Cli, Command, GroupCommand, GuestCommand, KindArg,
    OutputFormat, SnapshotCommand, TagsCommand, TaskCommand, UserCommand,
};
use pvectl::error::PveError;
use pvectl::guest::{self, CloneOptions, TagEdit};
use pvectl::locate::locate;
use pvectl::logging;
use pvectl::progress::{OutputMode, TaskProgress};
use pvectl::task::{self, TaskResult, TaskStatus, Upid, WatchOptions};
use pvectl::util::{format_size, format_timestamp, parse_size, parse_tags};
use pvectl::{allocate, config, paths};

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let output_format = resolve_output_format(&cli.output);
    let mode = resolve_output_mode(&output_format, cli.verbose, cli.quiet);

    // Terminal layer: suppress tracing while a spinner owns the terminal;
    // interleaved stderr lines break indicatif's redraws.
    let terminal_filter = match mode {
        OutputMode::Verbose => EnvFilter::new("debug"),
        OutputMode::Normal | OutputMode::Quiet | OutputMode::Silent => EnvFilter::new("off"),
        OutputMode::Plain => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pvectl=info")),
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: always captures pvectl=debug, discards until activated
    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("pvectl=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    let logs_dir = paths::logs_dir();

    // Local logs need neither config nor cluster
    if let Command::Log { failed, all, trace } = cli.command {
        return handle_log_command(&logs_dir, failed, all, trace, &output_format);
    }

    let config_path = cli.config.clone().unwrap_or_else(paths::config_path);
    let cfg = config::load_config(&config_path)?;

    if let Err(e) = file_handle.set_file(&paths::trace_log_path()) {
        tracing::debug!(error = %e, "file logging disabled");
    }

    let watch = WatchOptions::from_config(&cfg.watch);
    let api = PveClient::connect(&cfg.cluster, watch.poll_interval).await?;

    let ctx = Ctx {
        api: &api,
        format: output_format,
        mode,
        watch,
        logs_dir,
    };

    match cli.command {
        Command::Log { .. } => unreachable!(),
        Command::Nodes => {
            let mut nodes = api.nodes().await?;
            nodes.sort();
            if ctx.json() {
                emit_json(&nodes)?;
            } else {
                for node in &nodes {
                    println!("{node}");
                }
            }
        }
        Command::List { node, kind } => {
            let guests = guest::list_guests(&api, node.as_deref(), kind.map(guest_kind)).await?;
            let rows: Vec<GuestJson> = guests
                .into_iter()
                .filter_map(|r| {
                    Some(GuestJson {
                        vmid: r.vmid?,
                        kind: r.kind()?.api_segment().to_string(),
                        node: r.node.unwrap_or_default(),
                        name: r.name.unwrap_or_default(),
                        status: r.status.unwrap_or_default(),
                        tags: parse_tags(r.tags.as_deref().unwrap_or_default()),
                    })
                })
                .collect();
            if ctx.json() {
                emit_json(&rows)?;
            } else if rows.is_empty() {
                println!("No guests found.");
            } else {
                println!(
                    "{:>6}  {:<5} {:<12} {:<10} {:<24} TAGS",
                    "ID", "KIND", "NODE", "STATUS", "NAME"
                );
                for g in &rows {
                    println!(
                        "{:>6}  {:<5} {:<12} {:<10} {:<24} {}",
                        g.vmid,
                        g.kind,
                        g.node,
                        status_word(&g.status),
                        g.name,
                        g.tags.join(",")
                    );
                }
            }
        }
        Command::Vm { action } => run_guest(&ctx, GuestKind::Vm, action).await?,
        Command::Ct { action } => run_guest(&ctx, GuestKind::Container, action).await?,
        Command::Nextid => {
            let vmid = allocate::next_id(&api).await?;
            if ctx.json() {
                emit_json(&NextIdJson { vmid })?;
            } else {
                println!("{vmid}");
            }
        }
        Command::Backup { action } => run_backup(&ctx, action).await?,
        Command::Task { action } => match action {
            TaskCommand::Status { upid } => {
                let upid = Upid::parse(&upid)?;
                let status = api.task_status(&upid).await?;
                let (word, exit_status) = match &status {
                    TaskStatus::Running => ("running", None),
                    TaskStatus::Stopped { exit_status } => {
                        let word = if status.failure().is_some() { "failed" } else { "ok" };
                        (word, Some(exit_status.clone()))
                    }
                };
                if ctx.json() {
                    emit_json(&TaskStatusJson {
                        upid: upid.to_string(),
                        node: upid.node.clone(),
                        task_type: upid.task_type.clone(),
                        status: word.to_string(),
                        exit_status,
                    })?;
                } else {
                    println!("{upid}");
                    println!("  node:   {}", upid.node);
                    println!("  type:   {}", upid.task_type);
                    println!("  user:   {}", upid.user);
                    println!("  start:  {}", format_timestamp(upid.starttime));
                    match exit_status {
                        Some(exit) => println!("  status: {} ({exit})", status_word(word)),
                        None => println!("  status: {}", status_word(word)),
                    }
                }
            }
            TaskCommand::Watch { upid } => {
                let upid = Upid::parse(&upid)?;
                let label = format!("{} {}", upid.task_type, upid.id);
                ctx.conclude(upid, label.trim(), false, None).await?;
            }
        },
        Command::User { action } => run_user(&ctx, action).await?,
        Command::Group { action } => run_group(&ctx, action).await?,
        Command::Acl { action } => run_acl(&ctx, action).await?,
    }

    Ok(())
}

// ── Task following ──────────────────────────────────────────────────

struct Ctx<'a> {
    api: &'a PveClient,
    format: OutputFormat,
    mode: OutputMode,
    watch: WatchOptions,
    logs_dir: PathBuf,
}

impl Ctx<'_> {
    fn json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Report a submitted task: print its id when detached, otherwise follow
    /// it to the end. A failed task becomes an error.
    async fn conclude(
        &self,
        upid: Upid,
        label: &str,
        detach: bool,
        vmid: Option<u32>,
    ) -> Result<(), PveError> {
        if detach {
            if self.json() {
                emit_json(&TaskJson::new(&upid, "submitted", None, vmid))?;
            } else {
                if let Some(id) = vmid {
                    println!("id: {id}");
                }
                println!("{upid}");
            }
            return Ok(());
        }

        let result = self.follow(&upid, label).await?;
        if self.json() {
            let (status, message) = match &result {
                TaskResult::Succeeded => ("ok", None),
                TaskResult::Failed(m) => ("failed", Some(m.clone())),
            };
            emit_json(&TaskJson::new(&upid, status, message, vmid))?;
        } else if let (TaskResult::Succeeded, Some(id)) = (&result, vmid) {
            println!("id: {id}");
        }
        result.into_error(&upid)
    }

    /// Watch `upid` with a spinner, copying its output into a local task log.
    ///
    /// Ctrl+C stops watching only; the task keeps running on the server.
    async fn follow(&self, upid: &Upid, label: &str) -> Result<TaskResult, PveError> {
        let mut logger = match logging::TaskLogger::new(&self.logs_dir, upid) {
            Ok(logger) => Some(logger),
            Err(e) => {
                tracing::debug!(error = %e, "task log disabled");
                None
            }
        };
        let mut progress = TaskProgress::new(label, self.mode);

        let outcome = {
            let watching = task::watch(self.api, upid, &self.watch, |line| {
                progress.log(line);
                if let Some(logger) = logger.as_mut() {
                    logger.write_line(line);
                }
            });
            tokio::select! {
                result = watching => Some(result),
                _ = tokio::signal::ctrl_c() => None,
            }
        };

        match outcome {
            None => {
                progress.abandon(&format!(
                    "stopped watching; {upid} keeps running on the server"
                ));
                self.close_abandoned(logger, upid);
                Err(PveError::Cancelled)
            }
            Some(Err(e)) => {
                progress.abandon(&format!("lost track of {upid}"));
                self.close_abandoned(logger, upid);
                Err(e)
            }
            Some(Ok(result)) => {
                let ok = result == TaskResult::Succeeded;
                let message = match &result {
                    TaskResult::Succeeded => label.to_string(),
                    TaskResult::Failed(m) => format!("{label}: {m}"),
                };
                progress.finish(ok, &message);
                if let Some(logger) = logger {
                    logger.finish(ok);
                    logging::rotate_logs(&self.logs_dir, &upid.task_type, logging::KEEP_PER_TYPE);
                }
                Ok(result)
            }
        }
    }

    fn close_abandoned(&self, logger: Option<logging::TaskLogger>, upid: &Upid) {
        if let Some(logger) = logger {
            logger.abandon();
            logging::rotate_logs(&self.logs_dir, &upid.task_type, logging::KEEP_PER_TYPE);
        }
    }
}

// ── Guests ──────────────────────────────────────────────────────────

fn guest_kind(arg: KindArg) -> GuestKind {
    match arg {
        KindArg::Vm => GuestKind::Vm,
        KindArg::Ct => GuestKind::Container,
    }
}

async fn run_guest(ctx: &Ctx<'_>, kind: GuestKind, action: GuestCommand) -> Result<(), PveError> {
    let api = ctx.api;
    let (action, target, params, detach) = match action {
        GuestCommand::Start { target, detach } => (Action::Start, target, Params::new(), detach),
        GuestCommand::Stop { target, detach } => (Action::Stop, target, Params::new(), detach),
        GuestCommand::Reboot { target, detach } => (Action::Reboot, target, Params::new(), detach),
        GuestCommand::Suspend { target, detach } => {
            (Action::Suspend, target, Params::new(), detach)
        }
        GuestCommand::Resume { target, detach } => (Action::Resume, target, Params::new(), detach),
        GuestCommand::Shutdown {
            target,
            timeout,
            force,
            detach,
        } => {
            let params = Params::new().flag("forceStop", force);
            let params = match timeout {
                Some(t) => params.set("timeout", t),
                None => params,
            };
            (Action::Shutdown, target, params, detach)
        }
        GuestCommand::Destroy {
            target,
            purge,
            yes,
            detach,
        } => {
            let found = locate(api, kind, target.id, target.node.as_deref()).await?;
            confirm(&format!("Destroy {found} and all its disks?"), yes)?;
            let upid = guest::destroy(api, &found, purge).await?;
            let label = format!("destroy {found}");
            return ctx.conclude(upid, &label, detach.detach, None).await;
        }
        GuestCommand::Clone {
            target,
            newid,
            name,
            full,
            target_node,
            storage,
            detach,
        } => {
            let opts = CloneOptions {
                newid,
                name,
                full,
                target: target_node,
                storage,
            };
            let (newid, upid) =
                guest::clone_guest(api, kind, target.id, target.node.as_deref(), &opts).await?;
            let label = format!("clone {kind} {} to {newid}", target.id);
            return ctx.conclude(upid, &label, detach.detach, Some(newid)).await;
        }
        GuestCommand::Migrate {
            target,
            to,
            online,
            detach,
        } => {
            let (guest, upid) =
                guest::migrate(api, kind, target.id, target.node.as_deref(), &to, online).await?;
            let label = format!("migrate {guest} to {to}");
            return ctx.conclude(upid, &label, detach.detach, None).await;
        }
        GuestCommand::Snapshot { action } => return run_snapshot(ctx, kind, action).await,
        GuestCommand::Tags { action } => return run_tags(ctx, kind, action).await,
    };

    let (found, upid) =
        guest::submit(api, kind, target.id, target.node.as_deref(), action.clone(), &params)
            .await?;
    let label = format!("{} {found}", action.name());
    ctx.conclude(upid, &label, detach.detach, None).await
}

async fn run_snapshot(
    ctx: &Ctx<'_>,
    kind: GuestKind,
    action: SnapshotCommand,
) -> Result<(), PveError> {
    let api = ctx.api;
    match action {
        SnapshotCommand::List { target } => {
            let snaps =
                guest::list_snapshots(api, kind, target.id, target.node.as_deref()).await?;
            let rows: Vec<SnapshotJson> = snaps
                .into_iter()
                .map(|s| SnapshotJson {
                    name: s.name,
                    description: s.description.filter(|d| !d.is_empty()),
                    snaptime: s.snaptime,
                    parent: s.parent,
                })
                .collect();
            if ctx.json() {
                emit_json(&rows)?;
            } else if rows.is_empty() {
                println!("No snapshots.");
            } else {
                println!("{:<24} {:<20} {:<24} DESCRIPTION", "NAME", "TAKEN", "PARENT");
                for s in &rows {
                    println!(
                        "{:<24} {:<20} {:<24} {}",
                        s.name,
                        s.snaptime.map(format_timestamp).unwrap_or_default(),
                        s.parent.as_deref().unwrap_or("-"),
                        s.description.as_deref().unwrap_or_default().trim()
                    );
                }
            }
            Ok(())
        }
        SnapshotCommand::Create {
            target,
            name,
            description,
            ram,
            detach,
        } => {
            let (guest, upid) = guest::create_snapshot(
                api,
                kind,
                target.id,
                target.node.as_deref(),
                &name,
                description.as_deref(),
                ram,
            )
            .await?;
            let label = format!("snapshot {guest} as {name}");
            ctx.conclude(upid, &label, detach.detach, None).await
        }
        SnapshotCommand::Rollback {
            target,
            name,
            detach,
        } => {
            let (guest, upid) =
                guest::rollback_snapshot(api, kind, target.id, target.node.as_deref(), &name)
                    .await?;
            let label = format!("roll back {guest} to {name}");
            ctx.conclude(upid, &label, detach.detach, None).await
        }
        SnapshotCommand::Delete {
            target,
            name,
            detach,
        } => {
            let (guest, upid) =
                guest::delete_snapshot(api, kind, target.id, target.node.as_deref(), &name)
                    .await?;
            let label = format!("delete snapshot {name} of {guest}");
            ctx.conclude(upid, &label, detach.detach, None).await
        }
    }
}

async fn run_tags(ctx: &Ctx<'_>, kind: GuestKind, action: TagsCommand) -> Result<(), PveError> {
    let api = ctx.api;
    let (target, tags) = match action {
        TagsCommand::List { target } => {
            let tags = guest::tags(api, kind, target.id, target.node.as_deref()).await?;
            (target, tags)
        }
        TagsCommand::Add { target, tags } => {
            let edit = TagEdit::Add(split_tag_args(&tags));
            let tags =
                guest::edit_tags(api, kind, target.id, target.node.as_deref(), &edit).await?;
            (target, tags)
        }
        TagsCommand::Remove { target, tags } => {
            let edit = TagEdit::Remove(split_tag_args(&tags));
            let tags =
                guest::edit_tags(api, kind, target.id, target.node.as_deref(), &edit).await?;
            (target, tags)
        }
        TagsCommand::Set { target, tags } => {
            let edit = TagEdit::Set(split_tag_args(&tags));
            let tags =
                guest::edit_tags(api, kind, target.id, target.node.as_deref(), &edit).await?;
            (target, tags)
        }
    };

    if ctx.json() {
        emit_json(&TagsJson {
            vmid: target.id,
            tags,
        })
    } else {
        if tags.is_empty() {
            println!("{kind} {} has no tags.", target.id);
        } else {
            println!("{}", tags.join(" "));
        }
        Ok(())
    }
}

fn split_tag_args(args: &[String]) -> Vec<String> {
    args.iter().flat_map(|a| parse_tags(a)).collect()
}

// ── Backups ─────────────────────────────────────────────────────────

async fn run_backup(ctx: &Ctx<'_>, action: BackupCommand) -> Result<(), PveError> {
    let api = ctx.api;
    match action {
        BackupCommand::List {
            node,
            storage,
            vmid,
        } => {
            let filter = BackupFilter {
                node,
                storage,
                vmid,
            };
            let entries = backup::list_backups(api, &filter).await?;
            let rows: Vec<BackupJson> = entries
                .into_iter()
                .map(|e| BackupJson {
                    kind: e.kind.api_segment().to_string(),
                    volid: e.volume_id,
                    storage: e.storage,
                    node: e.node,
                    vmid: e.vmid,
                    size: e.size,
                    created_at: e.created_at,
                    notes: e.notes,
                    protected: e.protected,
                })
                .collect();
            if ctx.json() {
                return emit_json(&rows);
            }
            if rows.is_empty() {
                println!("No backups found.");
                return Ok(());
            }
            println!(
                "{:<20} {:>6}  {:<5} {:>10}  {:<12} VOLID",
                "CREATED", "VMID", "KIND", "SIZE", "NODE"
            );
            for b in &rows {
                let protected = if b.protected { " [protected]" } else { "" };
                println!(
                    "{:<20} {:>6}  {:<5} {:>10}  {:<12} {}{protected}",
                    b.created_at.map(format_timestamp).unwrap_or_else(|| "-".into()),
                    b.vmid.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
                    b.kind,
                    format_size(b.size),
                    b.node,
                    b.volid
                );
            }
            Ok(())
        }
        BackupCommand::Create {
            vmid,
            node,
            storage,
            mode,
            compress,
            bwlimit,
            notes,
            protected,
            detach,
        } => {
            let bwlimit_kib = bwlimit
                .as_deref()
                .map(parse_size)
                .transpose()?
                .map(|bytes| bytes / 1024);
            let opts = BackupOptions {
                storage,
                mode,
                compress,
                bwlimit_kib,
                notes,
                protected,
            };
            let upid = backup::create_backup(api, vmid, node.as_deref(), &opts).await?;
            ctx.conclude(upid, &format!("back up {vmid}"), detach.detach, Some(vmid))
                .await
        }
        BackupCommand::Delete {
            volid,
            node,
            storage,
            yes,
            detach,
        } => {
            // reject malformed ids before asking
            backup::archive_filename(&volid)?;
            confirm(&format!("Delete backup {volid}?"), yes)?;
            let upid = backup::delete_backup(api, &node, &volid, storage.as_deref()).await?;
            ctx.conclude(upid, &format!("delete {volid}"), detach.detach, None)
                .await
        }
        BackupCommand::Restore {
            volid,
            node,
            vmid,
            name,
            storage,
            detach,
        } => {
            let opts = RestoreOptions {
                vmid,
                name,
                storage,
            };
            let (vmid, upid) = backup::restore_backup(api, &node, &volid, &opts).await?;
            let kind = backup::archive_kind(&volid);
            let label = format!("restore {kind} {vmid} from {volid}");
            ctx.conclude(upid, &label, detach.detach, Some(vmid)).await
        }
    }
}

// ── Access control ──────────────────────────────────────────────────

async fn run_user(ctx: &Ctx<'_>, action: UserCommand) -> Result<(), PveError> {
    match action {
        UserCommand::List => {
            let rows: Vec<UserJson> = access::list_users(ctx.api)
                .await?
                .into_iter()
                .map(|u| UserJson {
                    userid: u.userid,
                    comment: u.comment,
                    email: u.email,
                    enabled: u.enable,
                })
                .collect();
            if ctx.json() {
                return emit_json(&rows);
            }
            for u in &rows {
                let enabled = if u.enabled { "" } else { " (disabled)" };
                println!(
                    "{:<32} {:<32} {}{enabled}",
                    u.userid,
                    u.email.as_deref().unwrap_or_default(),
                    u.comment.as_deref().unwrap_or_default()
                );
            }
            Ok(())
        }
        UserCommand::Add {
            userid,
            password,
            email,
            comment,
            groups,
        } => {
            let user = NewUser {
                userid,
                password,
                email,
                comment,
                groups,
            };
            access::add_user(ctx.api, &user).await?;
            done(ctx, &format!("created user {}", user.userid))
        }
        UserCommand::Delete { userid, yes } => {
            confirm(&format!("Delete user {userid}?"), yes)?;
            access::delete_user(ctx.api, &userid).await?;
            done(ctx, &format!("deleted user {userid}"))
        }
    }
}

async fn run_group(ctx: &Ctx<'_>, action: GroupCommand) -> Result<(), PveError> {
    match action {
        GroupCommand::List => {
            let rows: Vec<GroupJson> = access::list_groups(ctx.api)
                .await?
                .into_iter()
                .map(|g| GroupJson {
                    groupid: g.groupid,
                    comment: g.comment,
                    users: g
                        .users
                        .as_deref()
                        .unwrap_or_default()
                        .split(',')
                        .filter(|u| !u.is_empty())
                        .map(str::to_string)
                        .collect(),
                })
                .collect();
            if ctx.json() {
                return emit_json(&rows);
            }
            for g in &rows {
                println!(
                    "{:<24} {:<32} {}",
                    g.groupid,
                    g.users.join(","),
                    g.comment.as_deref().unwrap_or_default()
                );
            }
            Ok(())
        }
        GroupCommand::Add { groupid, comment } => {
            access::add_group(ctx.api, &groupid, comment.as_deref()).await?;
            done(ctx, &format!("created group {groupid}"))
        }
        GroupCommand::Delete { groupid, yes } => {
            confirm(&format!("Delete group {groupid}?"), yes)?;
            access::delete_group(ctx.api, &groupid).await?;
            done(ctx, &format!("deleted group {groupid}"))
        }
    }
}

fn acl_subject(subject: AclSubject) -> Result<Subject, PveError> {
    match (subject.user, subject.group) {
        (Some(user), None) => Ok(Subject::User(user)),
        (None, Some(group)) => Ok(Subject::Group(group)),
        _ => Err(PveError::invalid("pass exactly one of --user or --group")),
    }
}

async fn run_acl(ctx: &Ctx<'_>, action: AclCommand) -> Result<(), PveError> {
    match action {
        AclCommand::List => {
            let rows: Vec<AclJson> = access::list_acl(ctx.api)
                .await?
                .into_iter()
                .map(|a| AclJson {
                    path: a.path,
                    role: a.roleid,
                    subject: a.ugid,
                    subject_type: a.subject_type,
                    propagate: a.propagate,
                })
                .collect();
            if ctx.json() {
                return emit_json(&rows);
            }
            for a in &rows {
                let propagate = if a.propagate { "" } else { " (no propagate)" };
                println!(
                    "{:<24} {:<20} {:<6} {}{propagate}",
                    a.path, a.role, a.subject_type, a.subject
                );
            }
            Ok(())
        }
        AclCommand::Grant {
            path,
            role,
            subject,
            no_propagate,
        } => {
            let change = AclChange {
                path,
                role,
                subject: acl_subject(subject)?,
                propagate: !no_propagate,
            };
            access::grant(ctx.api, &change).await?;
            done(ctx, &format!("granted {} on {}", change.role, change.path))
        }
        AclCommand::Revoke {
            path,
            role,
            subject,
        } => {
            let change = AclChange {
                path,
                role,
                subject: acl_subject(subject)?,
                propagate: true,
            };
            access::revoke(ctx.api, &change).await?;
            done(ctx, &format!("revoked {} on {}", change.role, change.path))
        }
    }
}

/// Acknowledge a synchronous change.
fn done(ctx: &Ctx<'_>, message: &str) -> Result<(), PveError> {
    if ctx.json() {
        emit_json(&DoneJson {
            message: message.to_string(),
        })
    } else {
        println!("{message}");
        Ok(())
    }
}

// ── Prompts ─────────────────────────────────────────────────────────

fn confirm(prompt: &str, yes: bool) -> Result<(), PveError> {
    if yes {
        return Ok(());
    }
    if !std::io::stdin().is_terminal() {
        return Err(PveError::invalid(
            "refusing to continue without confirmation; pass --yes",
        ));
    }
    let answer = inquire::Confirm::new(prompt)
        .with_default(false)
        .prompt()
        .map_err(map_inquire_err)?;
    if answer { Ok(()) } else { Err(PveError::Cancelled) }
}

fn map_inquire_err(e: inquire::InquireError) -> PveError {
    match e {
        inquire::InquireError::OperationCanceled | inquire::InquireError::OperationInterrupted => {
            PveError::Cancelled
        }
        other => PveError::invalid(format!("prompt error: {other}")),
    }
}

// ── Local logs ──────────────────────────────────────────────────────

fn handle_log_command(
    logs_dir: &Path,
    failed: bool,
    all: bool,
    trace: bool,
    format: &OutputFormat,
) -> miette::Result<()> {
    if trace {
        let trace_path = paths::trace_log_path();
        if trace_path.exists() {
            print!("{}", read_file(&trace_path)?);
        } else {
            println!("No trace log found.");
        }
        return Ok(());
    }

    if all {
        let logs = logging::list_task_logs(logs_dir);
        if *format == OutputFormat::Json {
            let rows: Vec<TaskLogJson> = logs
                .iter()
                .map(|e| TaskLogJson {
                    timestamp: e.timestamp.clone(),
                    task: e.label.clone(),
                    status: e.status.clone(),
                    path: e.path.display().to_string(),
                })
                .collect();
            emit_json(&rows)?;
        } else if logs.is_empty() {
            println!("No task logs found.");
        } else {
            for entry in &logs {
                let indicator = if entry.status == "failed" {
                    style("FAIL").red()
                } else {
                    style(" OK ").green()
                };
                println!(
                    "[{indicator}] {} {} ({})",
                    entry.timestamp,
                    entry.label,
                    entry.path.display()
                );
            }
        }
        return Ok(());
    }

    match logging::latest_task_log(logs_dir, failed) {
        Some(path) => {
            let contents = read_file(&path)?;
            let fname = path.file_name().and_then(|f| f.to_str()).unwrap_or("?");
            println!("--- {fname} ---");
            print!("{contents}");
        }
        None if failed => println!("No failed task logs found."),
        None => println!("No task logs found. Watch a task first."),
    }

    Ok(())
}

fn read_file(path: &Path) -> Result<String, PveError> {
    std::fs::read_to_string(path).map_err(|source| PveError::Io {
        context: format!("reading {}", path.display()),
        source,
    })
}

// ── Output ──────────────────────────────────────────────────────────

fn emit_json<'a, T: facet::Facet<'a>>(value: &T) -> Result<(), PveError> {
    let text = facet_json::to_string(value).map_err(|e| PveError::Decode {
        context: "rendering JSON output".into(),
        message: e.to_string(),
    })?;
    println!("{text}");
    Ok(())
}

fn status_word(status: &str) -> String {
    match status {
        "running" | "ok" => style(status).green().to_string(),
        "stopped" => style(status).dim().to_string(),
        "failed" => style(status).red().to_string(),
        other => other.to_string(),
    }
}

#[derive(facet::Facet)]
struct TaskJson {
    upid: String,
    node: String,
    task_type: String,
    status: String,
    message: Option<String>,
    vmid: Option<u32>,
}

impl TaskJson {
    fn new(upid: &Upid, status: &str, message: Option<String>, vmid: Option<u32>) -> Self {
        Self {
            upid: upid.to_string(),
            node: upid.node.clone(),
            task_type: upid.task_type.clone(),
            status: status.to_string(),
            message,
            vmid,
        }
    }
}

#[derive(facet::Facet)]
struct TaskStatusJson {
    upid: String,
    node: String,
    task_type: String,
    status: String,
    exit_status: Option<String>,
}

#[derive(facet::Facet)]
struct GuestJson {
    vmid: u32,
    kind: String,
    node: String,
    name: String,
    status: String,
    tags: Vec<String>,
}

#[derive(facet::Facet)]
struct BackupJson {
    volid: String,
    storage: String,
    node: String,
    kind: String,
    vmid: Option<u32>,
    size: u64,
    created_at: Option<i64>,
    notes: Option<String>,
    protected: bool,
}

#[derive(facet::Facet)]
struct SnapshotJson {
    name: String,
    description: Option<String>,
    snaptime: Option<i64>,
    parent: Option<String>,
}

#[derive(facet::Facet)]
struct TagsJson {
    vmid: u32,
    tags: Vec<String>,
}

#[derive(facet::Facet)]
struct NextIdJson {
    vmid: u32,
}

#[derive(facet::Facet)]
struct UserJson {
    userid: String,
    comment: Option<String>,
    email: Option<String>,
    enabled: bool,
}

#[derive(facet::Facet)]
struct GroupJson {
    groupid: String,
    comment: Option<String>,
    users: Vec<String>,
}

#[derive(facet::Facet)]
struct AclJson {
    path: String,
    role: String,
    subject: String,
    subject_type: String,
    propagate: bool,
}

#[derive(facet::Facet)]
struct DoneJson {
    message: String,
}

#[derive(facet::Facet)]
struct TaskLogJson {
    timestamp: String,
    task: String,
    status: String,
    path: String,
}

/// Resolve `Auto` to a concrete format based on terminal detection.
fn resolve_output_format(format: &OutputFormat) -> OutputFormat {
    match format {
        OutputFormat::Auto => {
            if !std::io::stdout().is_terminal() || !std::io::stdin().is_terminal() {
                OutputFormat::Plain
            } else {
                OutputFormat::Interactive
            }
        }
        other => other.clone(),
    }
}

/// Map the resolved output format (plus `--verbose`/`--quiet`) to the
/// rendering mode of a watched task.
fn resolve_output_mode(format: &OutputFormat, verbose: bool, quiet: bool) -> OutputMode {
    match format {
        OutputFormat::Json => {
            if verbose || quiet {
                eprintln!("warning: --verbose/--quiet ignored in JSON output mode");
            }
            OutputMode::Silent
        }
        OutputFormat::Plain => {
            if quiet {
                OutputMode::Quiet
            } else if verbose {
                OutputMode::Verbose
            } else {
                OutputMode::Plain
            }
        }
        OutputFormat::Interactive | OutputFormat::Auto => {
            if quiet {
                OutputMode::Quiet
            } else if verbose {
                OutputMode::Verbose
            } else {
                OutputMode::Normal
            }
        }
    }
}
