use beads_sync::config::{self, CliOverrides};
use beads_sync::storage::Store;
use beads_sync::sync::SyncContext;
use beads_sync::{daemon, watch};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "beads-sync", about = "Distributed, git-backed sync core", version)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, global = true)]
    no_color: bool,
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[arg(long, global = true, env = "BEADS_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pull-first sync pipeline (§4.9).
    Sync(SyncArgs),
    /// Report the two staleness questions (§4.4) without mutating anything.
    Status,
    /// Block, triggering a flush/import on filesystem or git-ref changes (§4.10).
    Watch(WatchArgs),
    /// Run (or talk to) the local daemon (§4.11).
    Daemon(DaemonArgs),
}

#[derive(clap::Args, Debug)]
struct SyncArgs {
    #[arg(long)]
    no_push: bool,
    #[arg(long)]
    no_pull: bool,
    #[arg(long)]
    no_git_history: bool,
    #[arg(long)]
    rename_on_import: bool,
    #[arg(long)]
    force_export: bool,
    #[arg(long)]
    branch: Option<String>,
}

#[derive(clap::Args, Debug)]
struct WatchArgs {
    #[arg(long)]
    no_push: bool,
}

#[derive(Subcommand, Debug)]
enum DaemonArgs {
    /// Start serving the local Unix-domain socket.
    Start,
    /// Check whether a daemon is already listening and speaking a compatible protocol.
    Ping,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let beads_dir = config::discover_beads_dir(Some(Path::new(".")))?;
    let overrides = CliOverrides {
        db: cli.db.clone(),
        ..Default::default()
    };
    let (mut store, paths) = config::open_storage(&beads_dir, overrides.db.as_ref(), None)?;
    let layer = config::load_config(&beads_dir, Some(&store), &overrides)?;
    let workspace_dir = beads_dir
        .parent()
        .map_or_else(|| beads_dir.clone(), Path::to_path_buf);

    let ctx = SyncContext {
        workspace_dir,
        jsonl_path: paths.jsonl_path.clone(),
        db_path: paths.db_path.clone(),
        issue_prefix: config::issue_prefix_from_layer(&layer),
        repo_key: config::repo_key_from_layer(&layer),
        sync_branch: config::sync_branch_from_layer(&layer),
        no_push: false,
        no_pull: false,
        no_git_history: false,
        rename_on_import: false,
        force_export: false,
        validation_on_sync: config::validation_on_sync_from_layer(&layer),
    };

    match cli.command {
        Command::Sync(args) => run_sync(ctx, &mut store, &args, cli.json),
        Command::Status => run_status(&ctx, &store, cli.json),
        Command::Watch(args) => run_watch(ctx, &mut store, &args, &layer),
        Command::Daemon(args) => run_daemon(&beads_dir, &args),
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run_sync(
    mut ctx: SyncContext,
    store: &mut dyn Store,
    args: &SyncArgs,
    json: bool,
) -> anyhow::Result<()> {
    ctx.no_push = args.no_push;
    ctx.no_pull = args.no_pull;
    ctx.no_git_history = args.no_git_history;
    ctx.rename_on_import = args.rename_on_import;
    ctx.force_export = args.force_export;
    if args.branch.is_some() {
        ctx.sync_branch = args.branch.clone();
    }

    let report = beads_sync::sync::sync(&ctx, store)?;
    if json {
        println!(
            "{}",
            serde_json::json!({
                "imported": report.imported,
                "exported": report.exported,
                "pushed": report.pushed,
                "conflicts": report.merge.as_ref().map_or(0, |m| m.conflict_count),
            })
        );
    } else {
        println!(
            "sync complete: {} imported, {} exported, pushed={}",
            report.imported, report.exported, report.pushed
        );
    }
    Ok(())
}

fn run_status(ctx: &SyncContext, store: &dyn Store, json: bool) -> anyhow::Result<()> {
    let status = beads_sync::sync::sync_status(ctx, store)?;
    if json {
        println!(
            "{}",
            serde_json::json!({
                "jsonl_changed": status.jsonl_changed,
                "jsonl_newer": status.jsonl_newer,
            })
        );
    } else {
        println!(
            "jsonl_changed={} jsonl_newer={}",
            status.jsonl_changed, status.jsonl_newer
        );
    }
    Ok(())
}

fn run_watch(
    ctx: SyncContext,
    store: &mut dyn Store,
    args: &WatchArgs,
    layer: &config::ConfigLayer,
) -> anyhow::Result<()> {
    let targets = watch::WatchTargets {
        jsonl_path: ctx.jsonl_path.clone(),
        db_path: ctx.db_path.clone(),
        workspace_dir: ctx.workspace_dir.clone(),
    };
    let no_push = args.no_push;
    let auto_flush = config::auto_flush_enabled_from_layer(layer);
    let auto_import = config::auto_import_enabled_from_layer(layer);

    watch::watch(&targets, move |kinds| {
        use beads_sync::watch::ChangeKind;
        use beads_sync::sync::{sync, sync_flush_only, sync_import_only};

        let result = if kinds.contains(&ChangeKind::Vcs) {
            let mut run_ctx = ctx.clone();
            run_ctx.no_push = no_push;
            sync(&run_ctx, store).map(drop)
        } else if kinds.contains(&ChangeKind::Jsonl) && auto_import {
            sync_import_only(&ctx, store).map(drop)
        } else if kinds.contains(&ChangeKind::Db) && auto_flush {
            sync_flush_only(&ctx, store).map(drop)
        } else {
            Ok(())
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "watch-triggered sync failed");
        }
    })?;
    Ok(())
}

fn run_daemon(beads_dir: &Path, args: &DaemonArgs) -> anyhow::Result<()> {
    let socket = daemon::socket_path(beads_dir);
    match args {
        DaemonArgs::Start => {
            let listener = daemon::bind(&socket)?;
            let (store, _paths) = config::open_storage(beads_dir, None, None)?;
            daemon::run(&listener, move |mut stream| {
                if let Err(e) = daemon::serve_connection(&mut stream, &store) {
                    tracing::warn!(error = %e, "daemon connection dropped");
                }
            });
            Ok(())
        }
        DaemonArgs::Ping => match daemon::connect(&socket)? {
            Some(_) => {
                println!("daemon reachable");
                Ok(())
            }
            None => {
                println!("no daemon running");
                Ok(())
            }
        },
    }
}
