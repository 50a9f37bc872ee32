use std::path::PathBuf;

use anyhow::{Context, Result};
use arboreal_core::{audit_paths, Forest, Node, NodeId, NodeStore, SaveReport};
use arboreal_store_sqlite::SqliteStore;
use clap::{ArgGroup, Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "ARBOREAL_LOG";

#[derive(Debug, Parser)]
#[command(name = "arb")]
#[command(about = "Arboreal materialized-path forest CLI")]
struct Cli {
    #[arg(long, env = "ARBOREAL_DB", default_value = "./arboreal.sqlite3", global = true)]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Node {
        #[command(subcommand)]
        command: NodeCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Backup(DbBackupArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Audit,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = false)]
    skip_existing: bool,
}

#[derive(Debug, Subcommand)]
enum NodeCommand {
    Add(NodeAddArgs),
    Move(NodeMoveArgs),
    Rename(NodeRenameArgs),
    Show(NodeIdArgs),
    Children(NodeIdArgs),
    Ancestors(NodeIdArgs),
    Descendants(NodeIdArgs),
    Subtree(NodeIdArgs),
    Siblings(NodeIdArgs),
    Root(NodeIdArgs),
    List,
    Relation(NodeRelationArgs),
}

#[derive(Debug, Args)]
struct NodeAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    parent: Option<NodeId>,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("destination").required(true).args(["parent", "root"])))]
struct NodeMoveArgs {
    #[arg(long)]
    id: NodeId,
    #[arg(long)]
    parent: Option<NodeId>,
    #[arg(long)]
    root: bool,
}

#[derive(Debug, Args)]
struct NodeRenameArgs {
    #[arg(long)]
    id: NodeId,
    #[arg(long)]
    name: String,
}

#[derive(Debug, Args)]
struct NodeIdArgs {
    #[arg(long)]
    id: NodeId,
}

#[derive(Debug, Args)]
struct NodeRelationArgs {
    #[arg(long)]
    id: NodeId,
    #[arg(long)]
    other: NodeId,
}

/// Node as printed by every command: stored columns plus derived depth.
#[derive(Debug, Serialize)]
struct NodeView {
    id: Option<NodeId>,
    parent_id: Option<NodeId>,
    name: String,
    path: String,
    depth: usize,
    is_root: bool,
}

impl From<&Node> for NodeView {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id(),
            parent_id: node.parent_id(),
            name: node.name.clone(),
            path: node.path().to_string(),
            depth: node.depth(),
            is_root: node.is_root(),
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    debug!(db = %cli.db.display(), "opening database");
    let mut store = SqliteStore::open(&cli.db)?;

    match cli.command {
        Command::Db { command } => run_db(command, &mut store),
        Command::Node { command } => {
            store.migrate()?;
            let mut forest = Forest::new(store);
            run_node(command, &mut forest)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::Export(args) => run_db_export(&args, store),
        DbCommand::Import(args) => run_db_import(&args, store),
        DbCommand::Audit => run_db_audit(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_integrity_check(store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_db_backup(args: &DbBackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_export(args: &DbExportArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let manifest = store.export_snapshot(&args.out)?;
    emit_json(serde_json::json!({
        "out_dir": args.out,
        "manifest": manifest
    }))
}

fn run_db_import(args: &DbImportArgs, store: &mut SqliteStore) -> Result<()> {
    let summary = store.import_snapshot(&args.input, args.skip_existing)?;
    emit_json(serde_json::json!({
        "in_dir": args.input,
        "skip_existing": args.skip_existing,
        "summary": summary
    }))
}

fn run_db_audit(store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let mut violations = serde_json::to_value(store.malformed_paths()?)
        .context("failed to serialize malformed paths")?;
    // Typed reads fail on undecodable rows, so the tree audit needs a clean scan first.
    if violations.as_array().is_some_and(Vec::is_empty) {
        violations = serde_json::to_value(audit_paths(&store.list()?))
            .context("failed to serialize path violations")?;
    }
    let clean = violations.as_array().is_some_and(Vec::is_empty);
    emit_json(serde_json::json!({
        "clean": clean,
        "violations": violations
    }))
}

fn run_node(command: NodeCommand, forest: &mut Forest<SqliteStore>) -> Result<()> {
    match command {
        NodeCommand::Add(args) => {
            let mut node = Node::new(args.name).with_parent_id(args.parent);
            let report = forest.save(&mut node)?;
            emit_saved(&node, &report)
        }
        NodeCommand::Move(args) => {
            let mut node = forest.load(args.id)?;
            node.set_parent_id(if args.root { None } else { args.parent });
            let report = forest.save(&mut node)?;
            emit_saved(&node, &report)
        }
        NodeCommand::Rename(args) => {
            let mut node = forest.load(args.id)?;
            node.name = args.name;
            let report = forest.save(&mut node)?;
            emit_saved(&node, &report)
        }
        NodeCommand::Show(args) => {
            let node = forest.load(args.id)?;
            emit_json(serde_json::json!({ "node": NodeView::from(&node) }))
        }
        NodeCommand::Root(args) => {
            let node = forest.load(args.id)?;
            let root = forest.root_ancestor(&node)?;
            emit_json(serde_json::json!({ "node_id": args.id, "root": NodeView::from(&root) }))
        }
        NodeCommand::Children(args) => {
            let node = forest.load(args.id)?;
            emit_nodes(args.id, &forest.children(&node)?)
        }
        NodeCommand::Ancestors(args) => {
            let node = forest.load(args.id)?;
            emit_nodes(args.id, &forest.ancestors(&node)?)
        }
        NodeCommand::Descendants(args) => {
            let node = forest.load(args.id)?;
            emit_nodes(args.id, &forest.descendants(&node)?)
        }
        NodeCommand::Subtree(args) => {
            let node = forest.load(args.id)?;
            emit_nodes(args.id, &forest.subtree(&node)?)
        }
        NodeCommand::Siblings(args) => {
            let node = forest.load(args.id)?;
            emit_nodes(args.id, &forest.siblings(&node)?)
        }
        NodeCommand::List => {
            let nodes = forest.store().list()?;
            let views = nodes.iter().map(NodeView::from).collect::<Vec<_>>();
            emit_json(serde_json::json!({ "nodes": views }))
        }
        NodeCommand::Relation(args) => {
            let node = forest.load(args.id)?;
            let other = forest.load(args.other)?;
            emit_json(serde_json::json!({
                "id": args.id,
                "other": args.other,
                "is_ancestor": node.is_ancestor_of(&other),
                "is_descendant": node.is_descendant_of(&other),
                "is_sibling": node.is_sibling_of(&other)
            }))
        }
    }
}

fn emit_saved(node: &Node, report: &SaveReport) -> Result<()> {
    emit_json(serde_json::json!({
        "node": NodeView::from(node),
        "previous_path": report.previous_path.as_ref().map(ToString::to_string),
        "cascaded": report.cascaded,
        "stage": report.stage.as_str()
    }))
}

fn emit_nodes(id: NodeId, nodes: &[Node]) -> Result<()> {
    let views = nodes.iter().map(NodeView::from).collect::<Vec<_>>();
    emit_json(serde_json::json!({ "node_id": id, "nodes": views }))
}
