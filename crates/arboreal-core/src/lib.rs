use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Separator wrapped around every ancestor id in a materialized path.
pub const PATH_DELIMITER: char = '-';

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("invalid ancestry path `{path}`: {reason}")]
    InvalidPathFormat { path: String, reason: String },
    #[error("node {node_id} MUST NOT be its own ancestor (candidate path `{path}`)")]
    Cycle { node_id: NodeId, path: AncestryPath },
    #[error("persistence failed: {context}")]
    Persistence {
        context: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(
        "cascade from node {node_id} failed after rewriting {rewritten} of {matched} descendants"
    )]
    CascadeFailure {
        node_id: NodeId,
        rewritten: usize,
        matched: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("node {0} not found")]
    NotFound(NodeId),
}

impl TreeError {
    fn persistence(context: impl Into<String>) -> impl FnOnce(anyhow::Error) -> Self {
        let context = context.into();
        move |source| Self::Persistence { context, source }
    }

    /// Only a cycle rejection can be fixed by the caller (pick another parent).
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Cycle { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct NodeId(pub i64);

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value.trim().parse::<i64>().map(Self)
    }
}

/// Materialized ancestry of a node: `-` for roots, otherwise `-<id>-<id>-...-`
/// listing ancestors from the root down to the immediate parent.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct AncestryPath(String);

impl AncestryPath {
    #[must_use]
    pub fn root() -> Self {
        Self(PATH_DELIMITER.to_string())
    }

    /// Parse a stored path string.
    ///
    /// # Errors
    /// Returns [`TreeError::InvalidPathFormat`] unless the value matches `-(\d+-)*`.
    pub fn parse(value: &str) -> Result<Self, TreeError> {
        validate_path_format(value)?;
        Ok(Self(value.to_string()))
    }

    /// Re-check the grammar of an already constructed path.
    ///
    /// # Errors
    /// Returns [`TreeError::InvalidPathFormat`] when the path was built from an id
    /// that cannot be encoded (for example a negative id).
    pub fn validate(&self) -> Result<(), TreeError> {
        validate_path_format(&self.0)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.len() == PATH_DELIMITER.len_utf8()
    }

    /// Number of ancestors encoded in the path.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.0.matches(PATH_DELIMITER).count().saturating_sub(1)
    }

    #[must_use]
    pub fn ancestor_ids(&self) -> Vec<NodeId> {
        self.0
            .split(PATH_DELIMITER)
            .filter(|segment| !segment.is_empty())
            .filter_map(|segment| segment.parse::<NodeId>().ok())
            .collect()
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.0.contains(&format!("{PATH_DELIMITER}{id}{PATH_DELIMITER}"))
    }

    /// Path of a child of the node `id` whose own path is `self`.
    #[must_use]
    pub fn child_prefix(&self, id: NodeId) -> Self {
        Self(format!("{}{id}{PATH_DELIMITER}", self.0))
    }

    #[must_use]
    pub fn starts_with(&self, prefix: &AncestryPath) -> bool {
        self.0.starts_with(prefix.as_str())
    }

    /// Swap `old_prefix` for `new_prefix`, keeping the part below it untouched.
    /// Returns `None` when `self` does not start with `old_prefix`.
    #[must_use]
    pub fn rebase(&self, old_prefix: &AncestryPath, new_prefix: &AncestryPath) -> Option<Self> {
        self.0.strip_prefix(old_prefix.as_str()).map(|rest| Self(format!("{}{rest}", new_prefix.0)))
    }
}

impl Default for AncestryPath {
    fn default() -> Self {
        Self::root()
    }
}

impl Display for AncestryPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AncestryPath {
    type Error = TreeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_path_format(&value)?;
        Ok(Self(value))
    }
}

impl From<AncestryPath> for String {
    fn from(value: AncestryPath) -> Self {
        value.0
    }
}

fn validate_path_format(value: &str) -> Result<(), TreeError> {
    let invalid = |reason: &str| TreeError::InvalidPathFormat {
        path: value.to_string(),
        reason: reason.to_string(),
    };

    let Some(inner) = value.strip_prefix(PATH_DELIMITER) else {
        return Err(invalid("path MUST start with the delimiter"));
    };
    if inner.is_empty() {
        return Ok(());
    }
    let Some(body) = inner.strip_suffix(PATH_DELIMITER) else {
        return Err(invalid("path MUST end with the delimiter"));
    };

    for segment in body.split(PATH_DELIMITER) {
        if segment.is_empty() || !segment.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(invalid("ancestor ids MUST be non-negative integers"));
        }
        if segment.parse::<i64>().is_err() {
            return Err(invalid("ancestor id is out of range"));
        }
    }

    Ok(())
}

/// A forest member. `path` is derived on every save and cannot be assigned by callers.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Node {
    id: Option<NodeId>,
    parent_id: Option<NodeId>,
    path: AncestryPath,
    pub name: String,
    #[serde(skip)]
    parent: Option<Box<Node>>,
}

impl Node {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { id: None, parent_id: None, path: AncestryPath::root(), name: name.into(), parent: None }
    }

    /// Rebuild a node exactly as a store holds it.
    #[must_use]
    pub fn restore(
        id: NodeId,
        parent_id: Option<NodeId>,
        path: AncestryPath,
        name: impl Into<String>,
    ) -> Self {
        Self { id: Some(id), parent_id, path, name: name.into(), parent: None }
    }

    #[must_use]
    pub fn with_parent_id(mut self, parent_id: Option<NodeId>) -> Self {
        self.set_parent_id(parent_id);
        self
    }

    /// Attach an in-memory parent; an unsaved parent is persisted before this node.
    #[must_use]
    pub fn with_parent(mut self, parent: Node) -> Self {
        self.set_parent(parent);
        self
    }

    pub fn set_parent_id(&mut self, parent_id: Option<NodeId>) {
        self.parent_id = parent_id;
        self.parent = None;
    }

    pub fn set_parent(&mut self, parent: Node) {
        self.parent_id = parent.id;
        self.parent = Some(Box::new(parent));
    }

    #[must_use]
    pub fn id(&self) -> Option<NodeId> {
        self.id
    }

    #[must_use]
    pub fn parent_id(&self) -> Option<NodeId> {
        self.parent_id
    }

    #[must_use]
    pub fn path(&self) -> &AncestryPath {
        &self.path
    }

    /// The attached in-memory parent, if one was set with [`Node::set_parent`].
    #[must_use]
    pub fn parent(&self) -> Option<&Node> {
        self.parent.as_deref()
    }

    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.path.depth()
    }

    #[must_use]
    pub fn ancestor_ids(&self) -> Vec<NodeId> {
        self.path.ancestor_ids()
    }

    /// Prefix shared by the paths of every descendant of this node.
    #[must_use]
    pub fn descendant_prefix(&self) -> Option<AncestryPath> {
        self.id.map(|id| self.path.child_prefix(id))
    }

    #[must_use]
    pub fn is_descendant_of(&self, other: &Node) -> bool {
        other.descendant_prefix().is_some_and(|prefix| self.path.starts_with(&prefix))
    }

    #[must_use]
    pub fn is_ancestor_of(&self, other: &Node) -> bool {
        other.is_descendant_of(self)
    }

    #[must_use]
    pub fn is_sibling_of(&self, other: &Node) -> bool {
        match (self.id, other.id) {
            (Some(lhs), Some(rhs)) => lhs != rhs && self.parent_id == other.parent_id,
            _ => false,
        }
    }

    /// Copy of this node without its attached parent, as stores keep it.
    #[must_use]
    pub fn detached(&self) -> Self {
        Self {
            id: self.id,
            parent_id: self.parent_id,
            path: self.path.clone(),
            name: self.name.clone(),
            parent: None,
        }
    }
}

/// Storage collaborator. Implementations do not validate paths: every rule
/// about ancestry lives in [`Forest`].
pub trait NodeStore {
    /// # Errors
    /// Returns an error when the backend cannot be read.
    fn load(&self, id: NodeId) -> anyhow::Result<Option<Node>>;

    /// Insert the node when it has no id and return the new id, otherwise
    /// overwrite the stored row with the same id.
    ///
    /// # Errors
    /// Returns an error when the write fails or the id to update does not exist.
    fn save(&mut self, node: &Node) -> anyhow::Result<NodeId>;

    /// Every stored node whose path starts with `prefix`, in no particular order.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be read.
    fn find_by_path_prefix(&self, prefix: &AncestryPath) -> anyhow::Result<Vec<Node>>;

    /// Nodes whose `parent_id` equals `parent_id`; `None` selects the roots.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be read.
    fn find_children(&self, parent_id: Option<NodeId>) -> anyhow::Result<Vec<Node>>;

    /// # Errors
    /// Returns an error when the backend cannot be read.
    fn list(&self) -> anyhow::Result<Vec<Node>>;

    /// Run `f` as one unit: its writes are kept only when it returns `Ok`.
    ///
    /// # Errors
    /// Returns the error of `f`, or [`TreeError::Persistence`] when the unit
    /// cannot be opened or committed.
    fn run_atomically<T, F>(&mut self, f: F) -> Result<T, TreeError>
    where
        F: FnOnce(&mut Self) -> Result<T, TreeError>,
        Self: Sized;
}

/// In-process store over a `BTreeMap`, with snapshot rollback for atomic units.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    nodes: BTreeMap<NodeId, Node>,
    last_id: i64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl NodeStore for MemoryStore {
    fn load(&self, id: NodeId) -> anyhow::Result<Option<Node>> {
        Ok(self.nodes.get(&id).cloned())
    }

    fn save(&mut self, node: &Node) -> anyhow::Result<NodeId> {
        let mut stored = node.detached();
        let id = match node.id {
            Some(id) => {
                if !self.nodes.contains_key(&id) {
                    return Err(anyhow!("cannot update node {id}: no such row"));
                }
                id
            }
            None => {
                self.last_id += 1;
                NodeId(self.last_id)
            }
        };
        stored.id = Some(id);
        self.nodes.insert(id, stored);
        Ok(id)
    }

    fn find_by_path_prefix(&self, prefix: &AncestryPath) -> anyhow::Result<Vec<Node>> {
        Ok(self.nodes.values().filter(|node| node.path.starts_with(prefix)).cloned().collect())
    }

    fn find_children(&self, parent_id: Option<NodeId>) -> anyhow::Result<Vec<Node>> {
        Ok(self.nodes.values().filter(|node| node.parent_id == parent_id).cloned().collect())
    }

    fn list(&self) -> anyhow::Result<Vec<Node>> {
        Ok(self.nodes.values().cloned().collect())
    }

    fn run_atomically<T, F>(&mut self, f: F) -> Result<T, TreeError>
    where
        F: FnOnce(&mut Self) -> Result<T, TreeError>,
    {
        let snapshot = (self.nodes.clone(), self.last_id);
        let result = f(self);
        if result.is_err() {
            (self.nodes, self.last_id) = snapshot;
        }
        result
    }
}

/// Compute the path a node would have under its current `parent_id`.
///
/// A `parent_id` that `parent_lookup` cannot resolve yields the root path.
///
/// # Errors
/// Propagates failures of `parent_lookup`.
pub fn compute_path<F>(node: &Node, parent_lookup: F) -> Result<AncestryPath, TreeError>
where
    F: FnOnce(NodeId) -> Result<Option<Node>, TreeError>,
{
    let Some(parent_id) = node.parent_id else {
        return Ok(AncestryPath::root());
    };

    match parent_lookup(parent_id)? {
        Some(parent) => Ok(parent.path.child_prefix(parent_id)),
        None => {
            debug!(%parent_id, "parent does not resolve; node is treated as a root");
            Ok(AncestryPath::root())
        }
    }
}

/// Reject a computed path that is malformed or lists the node among its own ancestors.
///
/// # Errors
/// Returns [`TreeError::InvalidPathFormat`] or [`TreeError::Cycle`].
pub fn guard_ancestry(node: &Node) -> Result<(), TreeError> {
    node.path.validate()?;

    if let Some(node_id) = node.id {
        if node.path.contains(node_id) {
            return Err(TreeError::Cycle { node_id, path: node.path.clone() });
        }
    }

    Ok(())
}

/// Rewrite the stored path of every descendant of `node_id` after its own path
/// moved from `old_path` to `new_path`. Returns the number of rewritten nodes.
///
/// Descendants are written straight to the store; their `parent_id` did not change.
///
/// # Errors
/// Returns [`TreeError::CascadeFailure`] when the prefix query or any write fails.
pub fn cascade_descendants<S: NodeStore>(
    store: &mut S,
    node_id: NodeId,
    old_path: &AncestryPath,
    new_path: &AncestryPath,
) -> Result<usize, TreeError> {
    let old_prefix = old_path.child_prefix(node_id);
    let new_prefix = new_path.child_prefix(node_id);
    if old_prefix == new_prefix {
        return Ok(0);
    }

    let descendants = store.find_by_path_prefix(&old_prefix).map_err(|source| {
        TreeError::CascadeFailure { node_id, rewritten: 0, matched: 0, source }
    })?;
    let matched = descendants.len();

    for (rewritten, mut descendant) in descendants.into_iter().enumerate() {
        let failure = |source| TreeError::CascadeFailure { node_id, rewritten, matched, source };
        let Some(rebased) = descendant.path.rebase(&old_prefix, &new_prefix) else {
            return Err(failure(anyhow!(
                "store returned path `{}` outside prefix `{old_prefix}`",
                descendant.path
            )));
        };
        descendant.path = rebased;
        store.save(&descendant).map_err(failure)?;
    }

    info!(%node_id, matched, %old_prefix, %new_prefix, "cascaded path change to descendants");
    Ok(matched)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SaveStage {
    Initial,
    PathComputed,
    Validated,
    Persisted,
    Cascaded,
    Rejected,
    CascadeFailed,
}

impl SaveStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::PathComputed => "path_computed",
            Self::Validated => "validated",
            Self::Persisted => "persisted",
            Self::Cascaded => "cascaded",
            Self::Rejected => "rejected",
            Self::CascadeFailed => "cascade_failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cascaded | Self::Rejected | Self::CascadeFailed)
    }
}

impl Display for SaveStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SaveReport {
    pub id: NodeId,
    pub previous_path: Option<AncestryPath>,
    pub path: AncestryPath,
    pub cascaded: usize,
    pub stage: SaveStage,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PathViolation {
    MalformedPath { node_id: NodeId, path: String, reason: String },
    ParentMismatch { node_id: NodeId, expected: AncestryPath, actual: AncestryPath },
    SelfAncestry { node_id: NodeId, path: AncestryPath },
}

/// Check stored nodes against the parent they point to and against self-ancestry.
#[must_use]
pub fn audit_paths(nodes: &[Node]) -> Vec<PathViolation> {
    let by_id = nodes
        .iter()
        .filter_map(|node| node.id.map(|id| (id, node)))
        .collect::<BTreeMap<_, _>>();
    let mut violations = Vec::new();

    for node in nodes {
        let Some(node_id) = node.id else {
            continue;
        };

        if node.path.contains(node_id) {
            violations.push(PathViolation::SelfAncestry { node_id, path: node.path.clone() });
            continue;
        }

        let expected = compute_path(node, |parent_id| {
            Ok(by_id.get(&parent_id).map(|parent| parent.detached()))
        });
        if let Ok(expected) = expected {
            if expected != node.path {
                violations.push(PathViolation::ParentMismatch {
                    node_id,
                    expected,
                    actual: node.path.clone(),
                });
            }
        }
    }

    violations
}

/// Save pipeline and tree reads over a [`NodeStore`].
#[derive(Debug, Clone)]
pub struct Forest<S> {
    store: S,
}

impl<S: NodeStore> Forest<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Compute the path, reject cycles, persist (unsaved parents first) and
    /// cascade a path change to descendants, all as one atomic unit.
    ///
    /// On failure nothing is kept in the store. The node keeps the rejected
    /// candidate path, and ids handed out inside the failed unit are cleared.
    ///
    /// # Errors
    /// Returns [`TreeError::Cycle`] or [`TreeError::InvalidPathFormat`] before any
    /// write, [`TreeError::Persistence`] when a store call fails, and
    /// [`TreeError::CascadeFailure`] when rewriting descendants fails.
    pub fn save(&mut self, node: &mut Node) -> Result<SaveReport, TreeError> {
        let fresh = unsaved_chain(node);
        let result = self.store.run_atomically(|store| save_in_unit(store, node));
        if result.is_err() {
            forget_rolled_back_ids(node, &fresh);
        }
        result
    }

    /// # Errors
    /// Returns [`TreeError::NotFound`] when no node has this id.
    pub fn load(&self, id: NodeId) -> Result<Node, TreeError> {
        self.store
            .load(id)
            .map_err(TreeError::persistence(format!("failed to load node {id}")))?
            .ok_or(TreeError::NotFound(id))
    }

    /// # Errors
    /// Returns [`TreeError::Persistence`] when the store cannot be read.
    pub fn parent(&self, node: &Node) -> Result<Option<Node>, TreeError> {
        match node.parent_id {
            Some(parent_id) => self
                .store
                .load(parent_id)
                .map_err(TreeError::persistence(format!("failed to load node {parent_id}"))),
            None => Ok(None),
        }
    }

    /// # Errors
    /// Returns [`TreeError::Persistence`] when the store cannot be read.
    pub fn children(&self, node: &Node) -> Result<Vec<Node>, TreeError> {
        let Some(id) = node.id else {
            return Ok(Vec::new());
        };
        let mut children = self
            .store
            .find_children(Some(id))
            .map_err(TreeError::persistence(format!("failed to load children of {id}")))?;
        children.sort_by_key(|child| child.id);
        Ok(children)
    }

    /// Topmost ancestor that still resolves; the node itself when it is a root.
    ///
    /// # Errors
    /// Returns [`TreeError::Persistence`] when the store cannot be read.
    pub fn root_ancestor(&self, node: &Node) -> Result<Node, TreeError> {
        for ancestor_id in node.ancestor_ids() {
            let ancestor = self
                .store
                .load(ancestor_id)
                .map_err(TreeError::persistence(format!("failed to load node {ancestor_id}")))?;
            if let Some(ancestor) = ancestor {
                return Ok(ancestor);
            }
        }
        Ok(node.detached())
    }

    /// Resolvable ancestors ordered from the root down to the parent.
    ///
    /// # Errors
    /// Returns [`TreeError::Persistence`] when the store cannot be read.
    pub fn ancestors(&self, node: &Node) -> Result<Vec<Node>, TreeError> {
        let mut ancestors = Vec::new();
        for ancestor_id in node.ancestor_ids() {
            let ancestor = self
                .store
                .load(ancestor_id)
                .map_err(TreeError::persistence(format!("failed to load node {ancestor_id}")))?;
            ancestors.extend(ancestor);
        }
        Ok(ancestors)
    }

    /// Strict descendants ordered by depth, then id.
    ///
    /// # Errors
    /// Returns [`TreeError::Persistence`] when the store cannot be read.
    pub fn descendants(&self, node: &Node) -> Result<Vec<Node>, TreeError> {
        let Some(prefix) = node.descendant_prefix() else {
            return Ok(Vec::new());
        };
        let mut descendants = self
            .store
            .find_by_path_prefix(&prefix)
            .map_err(TreeError::persistence(format!("failed to query prefix {prefix}")))?;
        descendants.sort_by_key(|descendant| (descendant.depth(), descendant.id));
        Ok(descendants)
    }

    /// The node followed by its descendants.
    ///
    /// # Errors
    /// Returns [`TreeError::Persistence`] when the store cannot be read.
    pub fn subtree(&self, node: &Node) -> Result<Vec<Node>, TreeError> {
        let mut subtree = vec![node.detached()];
        subtree.extend(self.descendants(node)?);
        Ok(subtree)
    }

    /// Other nodes sharing this node's `parent_id` (other roots for a root).
    ///
    /// # Errors
    /// Returns [`TreeError::Persistence`] when the store cannot be read.
    pub fn siblings(&self, node: &Node) -> Result<Vec<Node>, TreeError> {
        let mut siblings = self
            .store
            .find_children(node.parent_id)
            .map_err(TreeError::persistence("failed to load siblings"))?;
        siblings.retain(|sibling| node.id.is_none() || sibling.id != node.id);
        siblings.sort_by_key(|sibling| sibling.id);
        Ok(siblings)
    }

    /// # Errors
    /// Returns [`TreeError::Persistence`] when the store cannot be read.
    pub fn audit(&self) -> Result<Vec<PathViolation>, TreeError> {
        let nodes = self.store.list().map_err(TreeError::persistence("failed to list nodes"))?;
        Ok(audit_paths(&nodes))
    }
}

fn enter_stage(node: &Node, stage: SaveStage) {
    debug!(node_id = ?node.id, path = %node.path, %stage, "save stage");
}

fn save_in_unit<S: NodeStore>(store: &mut S, node: &mut Node) -> Result<SaveReport, TreeError> {
    enter_stage(node, SaveStage::Initial);

    if let Some(parent) = node.parent.as_deref_mut() {
        if !parent.is_persisted() {
            debug!(child = %node.name, parent = %parent.name, "persisting unsaved parent first");
            save_in_unit(store, parent)?;
        }
        node.parent_id = parent.id;
    }

    let previous_path = match node.id {
        Some(id) => store
            .load(id)
            .map_err(TreeError::persistence(format!("failed to load stored node {id}")))?
            .map(|stored| stored.path),
        None => None,
    };

    node.path = compute_path(node, |parent_id| {
        store
            .load(parent_id)
            .map_err(TreeError::persistence(format!("failed to load parent {parent_id}")))
    })?;
    enter_stage(node, SaveStage::PathComputed);

    if let Err(err) = guard_ancestry(node) {
        warn!(node_id = ?node.id, path = %node.path, stage = %SaveStage::Rejected, "save rejected: {err}");
        return Err(err);
    }
    enter_stage(node, SaveStage::Validated);

    let id = store.save(node).map_err(TreeError::persistence(format!(
        "failed to persist node `{}`",
        node.name
    )))?;
    node.id = Some(id);
    enter_stage(node, SaveStage::Persisted);

    let cascaded = match &previous_path {
        Some(old_path) if *old_path != node.path => {
            cascade_descendants(store, id, old_path, &node.path).inspect_err(|err| {
                warn!(node_id = %id, stage = %SaveStage::CascadeFailed, "cascade failed: {err}");
            })?
        }
        _ => 0,
    };
    enter_stage(node, SaveStage::Cascaded);

    Ok(SaveReport {
        id,
        previous_path,
        path: node.path.clone(),
        cascaded,
        stage: SaveStage::Cascaded,
    })
}

fn unsaved_chain(node: &Node) -> Vec<bool> {
    let mut chain = Vec::new();
    let mut current = Some(node);
    while let Some(level) = current {
        chain.push(!level.is_persisted());
        current = level.parent.as_deref();
    }
    chain
}

fn forget_rolled_back_ids(node: &mut Node, unsaved: &[bool]) {
    let mut current = Some(node);
    for (depth, was_unsaved) in unsaved.iter().enumerate() {
        let Some(level) = current else {
            break;
        };
        if *was_unsaved {
            level.id = None;
        }
        if unsaved.get(depth + 1).copied().unwrap_or(false) {
            level.parent_id = None;
        }
        current = level.parent.as_deref_mut();
    }
}
