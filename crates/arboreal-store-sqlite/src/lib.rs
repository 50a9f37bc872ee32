use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use arboreal_core::{
    audit_paths, AncestryPath, Node, NodeId, NodeStore, PathViolation, TreeError, PATH_DELIMITER,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Params, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{info, warn};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;
const NODES_FILE: &str = "nodes.ndjson";
const MANIFEST_FILE: &str = "manifest.json";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

// No foreign key on parent_id: a dangling parent resolves to a root path.
const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS nodes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  parent_id INTEGER,
  name TEXT NOT NULL,
  path TEXT NOT NULL CHECK (
    path = '-'
    OR (path GLOB '-*-' AND path NOT GLOB '*[^0-9-]*' AND path NOT GLOB '*--*')
  ),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_nodes_parent_id ON nodes(parent_id);
CREATE INDEX IF NOT EXISTS idx_nodes_path ON nodes(path);
";

const SELECT_NODE_COLUMNS: &str = "SELECT id, parent_id, name, path FROM nodes";

pub struct SqliteStore {
    conn: Connection,
    unit_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub malformed_paths: Vec<PathViolation>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub snapshot_id: String,
    pub schema_version: i64,
    pub exported_at: String,
    pub path: String,
    pub sha256: String,
    pub nodes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_nodes: usize,
    pub skipped_existing_nodes: usize,
}

impl SqliteStore {
    /// Open a SQLite-backed node store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, unit_depth: 0 })
    }

    /// Open a private in-memory database with the latest schema applied.
    ///
    /// # Errors
    /// Returns an error when the database cannot be created or migrated.
    pub fn open_in_memory() -> Result<Self> {
        let mut store = Self::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when the database is newer than this build or a migration fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            info!(version = 1, "applied schema migration");
        }

        Ok(())
    }

    /// Run quick-check, path grammar scan, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            malformed_paths: self.malformed_paths()?,
            schema_status: self.schema_status()?,
        })
    }

    /// Rows whose stored path cannot be decoded; every other read fails on them.
    ///
    /// # Errors
    /// Returns an error when the rows cannot be read.
    pub fn malformed_paths(&self) -> Result<Vec<PathViolation>> {
        let mut stmt = self.conn.prepare("SELECT id, path FROM nodes ORDER BY id ASC")?;
        let mut rows = stmt.query([])?;
        let mut violations = Vec::new();

        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let path: String = row.get(1)?;
            if let Err(TreeError::InvalidPathFormat { path, reason }) = AncestryPath::parse(&path) {
                violations.push(PathViolation::MalformedPath { node_id: NodeId(id), path, reason });
            }
        }

        Ok(violations)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Export every node as NDJSON ordered by id, plus a digest manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let nodes = self.list()?;
        let (sha256, count) = write_ndjson_file(&out_dir.join(NODES_FILE), &nodes)?;

        let manifest = ExportManifest {
            snapshot_id: Ulid::new().to_string(),
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            path: NODES_FILE.to_string(),
            sha256,
            nodes: count,
        };

        let manifest_path = out_dir.join(MANIFEST_FILE);
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot, keeping node ids and stored paths as exported.
    ///
    /// The whole import is one transaction. It is rejected when the merged rows
    /// show path violations the database did not have before the import.
    ///
    /// # Errors
    /// Returns an error when the manifest does not match the data file, a row
    /// cannot be decoded, an id already exists and `skip_existing` is false, an
    /// imported path contradicts its parent, or a write fails.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join(MANIFEST_FILE))?;
        validate_import_manifest(in_dir, &manifest)?;

        let nodes = read_ndjson_file::<Node>(&in_dir.join(NODES_FILE))?;
        let violations_before = audit_paths(&self.list()?);
        let mut summary = ImportSummary { imported_nodes: 0, skipped_existing_nodes: 0 };
        let now = now_rfc3339()?;
        let tx = self.conn.transaction().context("failed to start import transaction")?;

        for node in nodes {
            let id = node.id().ok_or_else(|| anyhow!("exported node `{}` has no id", node.name))?;
            let exists = tx
                .query_row("SELECT 1 FROM nodes WHERE id = ?1", params![id.0], |_| Ok(()))
                .optional()
                .with_context(|| format!("failed to look up node {id}"))?
                .is_some();
            if exists {
                if skip_existing {
                    summary.skipped_existing_nodes += 1;
                    continue;
                }
                return Err(anyhow!("node already exists for id {id}"));
            }

            tx.execute(
                "INSERT INTO nodes(id, parent_id, name, path, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id.0, node.parent_id().map(|parent| parent.0), node.name, node.path().as_str(), now],
            )
            .with_context(|| format!("failed to import node {id}"))?;
            summary.imported_nodes += 1;
        }

        let merged = select_nodes(&tx, &format!("{SELECT_NODE_COLUMNS} ORDER BY id ASC"), [])?;
        let introduced = audit_paths(&merged)
            .into_iter()
            .filter(|violation| !violations_before.contains(violation))
            .collect::<Vec<_>>();
        if let Some(first) = introduced.first() {
            return Err(anyhow!(
                "import would leave {} inconsistent path(s), first: {first:?}",
                introduced.len()
            ));
        }

        tx.commit().context("failed to commit import transaction")?;
        Ok(summary)
    }

    fn query_nodes<P: Params>(&self, sql: &str, params: P) -> Result<Vec<Node>> {
        select_nodes(&self.conn, sql, params)
    }

    fn close_unit(&mut self, statement: &str) -> Result<(), TreeError> {
        self.conn.execute_batch(statement).map_err(|err| TreeError::Persistence {
            context: format!("failed to run `{statement}`"),
            source: err.into(),
        })
    }
}

impl NodeStore for SqliteStore {
    fn load(&self, id: NodeId) -> Result<Option<Node>> {
        let mut nodes = self.query_nodes(&format!("{SELECT_NODE_COLUMNS} WHERE id = ?1"), params![id.0])?;
        Ok(nodes.pop())
    }

    fn save(&mut self, node: &Node) -> Result<NodeId> {
        let now = now_rfc3339()?;
        let parent_id = node.parent_id().map(|parent| parent.0);

        match node.id() {
            Some(id) => {
                let changed = self
                    .conn
                    .execute(
                        "UPDATE nodes SET parent_id = ?1, name = ?2, path = ?3, updated_at = ?4
                         WHERE id = ?5",
                        params![parent_id, node.name, node.path().as_str(), now, id.0],
                    )
                    .with_context(|| format!("failed to update node {id}"))?;
                if changed == 0 {
                    return Err(anyhow!("cannot update node {id}: no such row"));
                }
                Ok(id)
            }
            None => {
                self.conn
                    .execute(
                        "INSERT INTO nodes(parent_id, name, path, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?4)",
                        params![parent_id, node.name, node.path().as_str(), now],
                    )
                    .with_context(|| format!("failed to insert node `{}`", node.name))?;
                Ok(NodeId(self.conn.last_insert_rowid()))
            }
        }
    }

    /// Range scan over `idx_nodes_path`, returned in id order.
    fn find_by_path_prefix(&self, prefix: &AncestryPath) -> Result<Vec<Node>> {
        let mut nodes = self.query_nodes(
            &format!("{SELECT_NODE_COLUMNS} WHERE path >= ?1 AND path < ?2"),
            params![prefix.as_str(), prefix_upper_bound(prefix)],
        )?;
        nodes.sort_by_key(Node::id);
        Ok(nodes)
    }

    fn find_children(&self, parent_id: Option<NodeId>) -> Result<Vec<Node>> {
        self.query_nodes(
            &format!("{SELECT_NODE_COLUMNS} WHERE parent_id IS ?1 ORDER BY id ASC"),
            params![parent_id.map(|parent| parent.0)],
        )
    }

    fn list(&self) -> Result<Vec<Node>> {
        self.query_nodes(&format!("{SELECT_NODE_COLUMNS} ORDER BY id ASC"), [])
    }

    /// The outermost unit is an `IMMEDIATE` transaction; nested units are savepoints.
    fn run_atomically<T, F>(&mut self, f: F) -> Result<T, TreeError>
    where
        F: FnOnce(&mut Self) -> Result<T, TreeError>,
    {
        let savepoint = format!("arboreal_unit_{}", self.unit_depth);
        let (begin, commit, rollback) = if self.unit_depth == 0 {
            ("BEGIN IMMEDIATE".to_string(), "COMMIT".to_string(), "ROLLBACK".to_string())
        } else {
            (
                format!("SAVEPOINT {savepoint}"),
                format!("RELEASE {savepoint}"),
                format!("ROLLBACK TO {savepoint}; RELEASE {savepoint}"),
            )
        };

        self.close_unit(&begin)?;
        self.unit_depth += 1;
        let result = f(self);
        self.unit_depth -= 1;

        let outcome = result.and_then(|value| self.close_unit(&commit).map(|()| value));
        if let Err(err) = &outcome {
            warn!(depth = self.unit_depth, "rolling back atomic unit: {err}");
            if let Err(rollback_err) = self.close_unit(&rollback) {
                warn!("rollback failed: {rollback_err}");
            }
        }
        outcome
    }
}

/// Smallest string above every path that starts with `prefix`: the trailing
/// delimiter is bumped to the next byte, which no path character reaches.
fn prefix_upper_bound(prefix: &AncestryPath) -> String {
    let stem = prefix.as_str().strip_suffix(PATH_DELIMITER).unwrap_or(prefix.as_str());
    let next = char::from_u32(u32::from(PATH_DELIMITER) + 1).unwrap_or(char::MAX);
    format!("{stem}{next}")
}

fn select_nodes<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Node>> {
    let mut stmt = conn.prepare(sql).with_context(|| format!("failed to prepare `{sql}`"))?;
    let mut rows = stmt.query(params)?;
    let mut nodes = Vec::new();
    while let Some(row) = rows.next()? {
        nodes.push(node_from_row(row)?);
    }
    Ok(nodes)
}

fn node_from_row(row: &Row<'_>) -> Result<Node> {
    let id: i64 = row.get(0)?;
    let parent_id: Option<i64> = row.get(1)?;
    let name: String = row.get(2)?;
    let path_raw: String = row.get(3)?;
    let path = AncestryPath::parse(&path_raw)
        .map_err(|err| anyhow!("node {id} has a corrupt stored path: {err}"))?;
    Ok(Node::restore(NodeId(id), parent_id.map(NodeId), path, name))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let mut values = Vec::new();

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }
    if manifest.path != NODES_FILE {
        return Err(anyhow!("manifest references unexpected data file {}", manifest.path));
    }

    let file_path = in_dir.join(NODES_FILE);
    if !file_path.exists() {
        return Err(anyhow!("manifest references missing file {}", file_path.display()));
    }

    let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
    if actual_sha256 != manifest.sha256 {
        return Err(anyhow!(
            "manifest digest mismatch for {NODES_FILE}: expected {}, got {actual_sha256}",
            manifest.sha256
        ));
    }
    if actual_records != manifest.nodes {
        return Err(anyhow!(
            "manifest node count mismatch for {NODES_FILE}: expected {}, got {actual_records}",
            manifest.nodes
        ));
    }

    Ok(())
}
