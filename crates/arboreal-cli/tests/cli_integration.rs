use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonschema::JSONSchema;
use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_arb<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_arb"))
        .args(args)
        .env_remove("ARBOREAL_DB")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute arb binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_arb(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "arb command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn field<'a>(value: &'a Value, key: &str) -> &'a Value {
    value.get(key).unwrap_or_else(|| panic!("missing field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json_file(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read JSON file {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse JSON file {}: {err}", path.display()))
}

fn validate_schema(schema_file: &str, instance: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_file);
    let schema_json = read_json_file(&schema_path);
    let compiled = JSONSchema::compile(&schema_json)
        .unwrap_or_else(|err| panic!("failed to compile schema {}: {err}", schema_path.display()));

    let errors = compiled
        .validate(instance)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>());
    if let Some(errors) = errors {
        panic!("schema validation failed for {}:\n{}", schema_file, errors.join("\n"));
    }
}

fn add_node(db: &Path, name: &str, parent: Option<i64>) -> i64 {
    let mut args = vec![
        "--db".to_string(),
        path_str(db).to_string(),
        "node".to_string(),
        "add".to_string(),
        "--name".to_string(),
        name.to_string(),
    ];
    if let Some(parent) = parent {
        args.push("--parent".to_string());
        args.push(parent.to_string());
    }
    let saved = run_json(args);
    validate_schema("node-save.schema.json", &saved);
    as_i64(field(&saved, "node"), "id")
}

fn node_path(db: &Path, id: i64) -> String {
    let shown = run_json(["--db", path_str(db), "node", "show", "--id", &id.to_string()]);
    as_str(field(&shown, "node"), "path").to_string()
}

fn node_ids(payload: &Value) -> Vec<i64> {
    field(payload, "nodes")
        .as_array()
        .unwrap_or_else(|| panic!("nodes should be an array: {payload}"))
        .iter()
        .map(|node| as_i64(node, "id"))
        .collect()
}

// Test IDs: TCLI-001, TCLI-002
#[test]
fn add_and_move_keep_paths_consistent_across_subtree() {
    let sandbox = unique_temp_dir("arboreal-cli-move");
    let db = sandbox.join("forest.sqlite3");

    let root = add_node(&db, "root", None);
    let a = add_node(&db, "a", Some(root));
    let b = add_node(&db, "b", Some(a));
    let c = add_node(&db, "c", Some(b));
    let other = add_node(&db, "other", None);

    assert_eq!(node_path(&db, root), "-");
    assert_eq!(node_path(&db, c), format!("-{root}-{a}-{b}-"));

    let moved = run_json([
        "--db",
        path_str(&db),
        "node",
        "move",
        "--id",
        &a.to_string(),
        "--parent",
        &other.to_string(),
    ]);
    validate_schema("node-save.schema.json", &moved);
    assert_eq!(as_i64(&moved, "cascaded"), 2);
    assert_eq!(as_str(&moved, "previous_path"), format!("-{root}-"));
    assert_eq!(as_str(&moved, "stage"), "cascaded");

    assert_eq!(node_path(&db, b), format!("-{other}-{a}-"));
    assert_eq!(node_path(&db, c), format!("-{other}-{a}-{b}-"));

    let to_root =
        run_json(["--db", path_str(&db), "node", "move", "--id", &b.to_string(), "--root"]);
    assert_eq!(as_str(field(&to_root, "node"), "path"), "-");
    assert_eq!(node_path(&db, c), format!("-{b}-"));

    let audit = run_json(["--db", path_str(&db), "db", "audit"]);
    validate_schema("db-audit.schema.json", &audit);
    assert_eq!(field(&audit, "clean").as_bool(), Some(true));

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-003
#[test]
fn cycle_move_exits_non_zero_and_changes_nothing() {
    let sandbox = unique_temp_dir("arboreal-cli-cycle");
    let db = sandbox.join("forest.sqlite3");

    let root = add_node(&db, "root", None);
    let a = add_node(&db, "a", Some(root));
    let b = add_node(&db, "b", Some(a));

    let output = run_arb([
        "--db",
        path_str(&db),
        "node",
        "move",
        "--id",
        &root.to_string(),
        "--parent",
        &b.to_string(),
    ]);
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cycle") || stderr.contains("ancestor"), "stderr was: {stderr}");

    assert_eq!(node_path(&db, root), "-");
    assert_eq!(node_path(&db, b), format!("-{root}-{a}-"));

    let self_parent = run_arb([
        "--db",
        path_str(&db),
        "node",
        "move",
        "--id",
        &a.to_string(),
        "--parent",
        &a.to_string(),
    ]);
    assert!(!self_parent.status.success());

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-004
#[test]
fn move_requires_exactly_one_destination() {
    let sandbox = unique_temp_dir("arboreal-cli-args");
    let db = sandbox.join("forest.sqlite3");
    let root = add_node(&db, "root", None);

    let neither = run_arb(["--db", path_str(&db), "node", "move", "--id", &root.to_string()]);
    assert!(!neither.status.success());

    let both = run_arb([
        "--db",
        path_str(&db),
        "node",
        "move",
        "--id",
        &root.to_string(),
        "--parent",
        "1",
        "--root",
    ]);
    assert!(!both.status.success());

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-005
#[test]
fn navigation_commands_validate_against_versioned_schemas() {
    let sandbox = unique_temp_dir("arboreal-cli-nav");
    let db = sandbox.join("forest.sqlite3");

    let root = add_node(&db, "root", None);
    let a = add_node(&db, "a", Some(root));
    let a2 = add_node(&db, "a2", Some(root));
    let b = add_node(&db, "b", Some(a));
    let db_arg = path_str(&db);

    let children = run_json(["--db", db_arg, "node", "children", "--id", &root.to_string()]);
    validate_schema("node-collection.schema.json", &children);
    assert_eq!(node_ids(&children), vec![a, a2]);

    let ancestors = run_json(["--db", db_arg, "node", "ancestors", "--id", &b.to_string()]);
    validate_schema("node-collection.schema.json", &ancestors);
    assert_eq!(node_ids(&ancestors), vec![root, a]);

    let descendants = run_json(["--db", db_arg, "node", "descendants", "--id", &root.to_string()]);
    validate_schema("node-collection.schema.json", &descendants);
    assert_eq!(node_ids(&descendants), vec![a, a2, b]);

    let subtree = run_json(["--db", db_arg, "node", "subtree", "--id", &a.to_string()]);
    assert_eq!(node_ids(&subtree), vec![a, b]);

    let siblings = run_json(["--db", db_arg, "node", "siblings", "--id", &a.to_string()]);
    assert_eq!(node_ids(&siblings), vec![a2]);

    let top = run_json(["--db", db_arg, "node", "root", "--id", &b.to_string()]);
    validate_schema("node-root.schema.json", &top);
    assert_eq!(as_i64(field(&top, "root"), "id"), root);

    let list = run_json(["--db", db_arg, "node", "list"]);
    validate_schema("node-collection.schema.json", &list);
    assert_eq!(node_ids(&list), vec![root, a, a2, b]);

    let relation = run_json([
        "--db",
        db_arg,
        "node",
        "relation",
        "--id",
        &root.to_string(),
        "--other",
        &b.to_string(),
    ]);
    validate_schema("node-relation.schema.json", &relation);
    assert_eq!(field(&relation, "is_ancestor").as_bool(), Some(true));
    assert_eq!(field(&relation, "is_descendant").as_bool(), Some(false));
    assert_eq!(field(&relation, "is_sibling").as_bool(), Some(false));

    let renamed = run_json(["--db", db_arg, "node", "rename", "--id", &a.to_string(), "--name", "alpha"]);
    validate_schema("node-save.schema.json", &renamed);
    assert_eq!(as_str(field(&renamed, "node"), "name"), "alpha");
    assert_eq!(as_i64(&renamed, "cascaded"), 0);

    let shown = run_json(["--db", db_arg, "node", "show", "--id", &a.to_string()]);
    validate_schema("node-show.schema.json", &shown);
    assert_eq!(as_str(&shown, "contract_version"), "cli.v1");

    let missing = run_arb(["--db", db_arg, "node", "show", "--id", "9999"]);
    assert!(!missing.status.success());

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-006, TCLI-007
#[test]
fn db_commands_cover_migrate_integrity_backup_export_import() {
    let sandbox = unique_temp_dir("arboreal-cli-db");
    let db_a = sandbox.join("a.sqlite3");
    let db_b = sandbox.join("b.sqlite3");
    let backup_file = sandbox.join("backup").join("a.sqlite3");
    let export_dir = sandbox.join("export");

    let dry_run = run_json(["--db", path_str(&db_a), "db", "migrate", "--dry-run"]);
    assert_eq!(field(&dry_run, "dry_run").as_bool(), Some(true));
    assert_eq!(field(&dry_run, "would_apply_versions"), &serde_json::json!([1]));

    let migrated = run_json(["--db", path_str(&db_a), "db", "migrate"]);
    assert_eq!(as_i64(&migrated, "after_version"), 1);

    let version = run_json(["--db", path_str(&db_a), "db", "schema-version"]);
    validate_schema("db-schema-version.schema.json", &version);
    assert_eq!(field(&version, "up_to_date").as_bool(), Some(true));

    let root = add_node(&db_a, "root", None);
    let child = add_node(&db_a, "child", Some(root));

    let integrity = run_json(["--db", path_str(&db_a), "db", "integrity-check"]);
    assert_eq!(field(&integrity, "quick_check_ok").as_bool(), Some(true));
    assert_eq!(field(&integrity, "malformed_paths"), &serde_json::json!([]));

    let backup =
        run_json(["--db", path_str(&db_a), "db", "backup", "--out", path_str(&backup_file)]);
    assert_eq!(as_str(&backup, "status"), "ok");
    assert!(backup_file.exists());
    assert_eq!(node_path(&backup_file, child), format!("-{root}-"));

    let export =
        run_json(["--db", path_str(&db_a), "db", "export", "--out", path_str(&export_dir)]);
    validate_schema("db-export.schema.json", &export);
    assert_eq!(as_i64(field(&export, "manifest"), "nodes"), 2);
    assert!(export_dir.join("manifest.json").exists());

    let import = run_json(["--db", path_str(&db_b), "db", "import", "--in", path_str(&export_dir)]);
    assert_eq!(as_i64(field(&import, "summary"), "imported_nodes"), 2);
    assert_eq!(node_path(&db_b, child), format!("-{root}-"));

    let duplicate =
        run_arb(["--db", path_str(&db_b), "db", "import", "--in", path_str(&export_dir)]);
    assert!(!duplicate.status.success());

    let skipped = run_json([
        "--db",
        path_str(&db_b),
        "db",
        "import",
        "--in",
        path_str(&export_dir),
        "--skip-existing",
    ]);
    assert_eq!(as_i64(field(&skipped, "summary"), "skipped_existing_nodes"), 2);

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-008
#[test]
fn db_path_can_come_from_environment() {
    let sandbox = unique_temp_dir("arboreal-cli-env");
    let db = sandbox.join("env.sqlite3");

    let output = Command::new(env!("CARGO_BIN_EXE_arb"))
        .args(["node", "add", "--name", "from-env"])
        .env("ARBOREAL_DB", &db)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute arb binary: {err}"));
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(db.exists());

    let list = run_json(["--db", path_str(&db), "node", "list"]);
    assert_eq!(node_ids(&list), vec![1]);

    let _ = fs::remove_dir_all(&sandbox);
}
