//! Project snapshot transfer between peers.
//!
//! A newcomer with an empty workspace asks the room for files; any peer with
//! a non-empty workspace answers, and the server routes the answer back to
//! the requester only.
//!
//! ```text
//! newcomer                     server                       peer
//!    │ project:sync:request ──►  │ ── project:sync:request ──► │ (requesterId)
//!    │                           │                             │ export()
//!    │                           │ ◄── project:sync:data ──────│ (targetId, files)
//!    │ ◄── project:sync:data ─── │   unicast to targetId       │
//!    │ replace()                 │                             │
//! ```
//!
//! The tree is nested JSON: `{"src":{"directory":{"main.rs":{"file":{"contents":"…"}}}}}`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::protocol::{ClientEvent, ConnectionId};

/// Directory names never included in a snapshot.
pub const EXCLUDED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    ".next",
    ".swc",
    ".npm",
];

/// How long a requester waits before giving up.
pub const DEFAULT_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(30);

// ───────────────────────────────────────────────────────────────────
// Tree
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotNode {
    File { contents: String },
    Directory(SnapshotTree),
}

/// A directory level of a snapshot, keyed by entry name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotTree(BTreeMap<String, SnapshotNode>);

impl SnapshotTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from `/`-separated relative paths.
    pub fn from_files<I, P, C>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: AsRef<str>,
        C: Into<String>,
    {
        let mut tree = Self::new();
        for (path, contents) in files {
            tree.insert_file(path.as_ref(), contents.into());
        }
        tree
    }

    /// Insert a file, creating intermediate directories. A file in the way of
    /// a directory is replaced.
    pub fn insert_file(&mut self, path: &str, contents: String) {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let Some((name, dirs)) = parts.split_last() else {
            return;
        };
        let mut level = self;
        for dir in dirs {
            let node = level
                .0
                .entry((*dir).to_string())
                .or_insert_with(|| SnapshotNode::Directory(SnapshotTree::new()));
            if !matches!(node, SnapshotNode::Directory(_)) {
                *node = SnapshotNode::Directory(SnapshotTree::new());
            }
            level = match node {
                SnapshotNode::Directory(tree) => tree,
                SnapshotNode::File { .. } => return,
            };
        }
        level
            .0
            .insert((*name).to_string(), SnapshotNode::File { contents });
    }

    /// Flatten into `(path, contents)` pairs in path order.
    pub fn files(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        self.collect_files("", &mut out);
        out
    }

    fn collect_files(&self, prefix: &str, out: &mut Vec<(String, String)>) {
        for (name, node) in &self.0 {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            match node {
                SnapshotNode::File { contents } => out.push((path, contents.clone())),
                SnapshotNode::Directory(tree) => tree.collect_files(&path, out),
            }
        }
    }

    pub fn file_count(&self) -> usize {
        self.0
            .values()
            .map(|node| match node {
                SnapshotNode::File { .. } => 1,
                SnapshotNode::Directory(tree) => tree.file_count(),
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.file_count() == 0
    }

    pub fn get(&self, name: &str) -> Option<&SnapshotNode> {
        self.0.get(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &SnapshotNode)> {
        self.0.iter()
    }

    fn insert_node(&mut self, name: String, node: SnapshotNode) {
        self.0.insert(name, node);
    }
}

/// True when an entry name is safe to materialize as a single path component.
fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

// ───────────────────────────────────────────────────────────────────
// Workspaces
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("No snapshot received within {0:?}")]
    TimedOut(Duration),
    #[error("Unsafe entry name in snapshot: {0:?}")]
    InvalidPath(String),
    #[error("Workspace I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Snapshot channel closed")]
    ChannelClosed,
}

/// A project file system that can be exported and wholesale replaced.
pub trait Workspace {
    /// Export every file outside excluded directories.
    fn export(&self) -> Result<SnapshotTree, SnapshotError>;

    /// Replace the whole workspace with `tree`. Destructive.
    fn replace(&mut self, tree: &SnapshotTree) -> Result<(), SnapshotError>;

    fn is_empty(&self) -> Result<bool, SnapshotError> {
        Ok(self.export()?.is_empty())
    }
}

/// Workspace held in memory, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryWorkspace {
    files: BTreeMap<String, String>,
}

impl MemoryWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, path: &str, contents: impl Into<String>) {
        self.files.insert(path.to_string(), contents.into());
    }

    pub fn read(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }
}

impl Workspace for MemoryWorkspace {
    fn export(&self) -> Result<SnapshotTree, SnapshotError> {
        let visible = self.files.iter().filter(|(path, _)| {
            !path
                .split('/')
                .any(|part| EXCLUDED_DIRS.contains(&part))
        });
        Ok(SnapshotTree::from_files(
            visible.map(|(path, contents)| (path.as_str(), contents.clone())),
        ))
    }

    fn replace(&mut self, tree: &SnapshotTree) -> Result<(), SnapshotError> {
        let files = tree.files();
        for (path, _) in &files {
            if let Some(bad) = path.split('/').find(|part| !is_safe_name(part)) {
                return Err(SnapshotError::InvalidPath(bad.to_string()));
            }
        }
        self.files = files.into_iter().collect();
        Ok(())
    }
}

/// Workspace rooted at a directory on disk.
#[derive(Debug, Clone)]
pub struct DirWorkspace {
    root: PathBuf,
}

impl DirWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn export_dir(dir: &Path) -> Result<SnapshotTree, SnapshotError> {
        let mut tree = SnapshotTree::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if EXCLUDED_DIRS.contains(&name.as_str()) {
                    continue;
                }
                tree.insert_node(name, SnapshotNode::Directory(Self::export_dir(&entry.path())?));
            } else if file_type.is_file() {
                match fs::read_to_string(entry.path()) {
                    Ok(contents) => tree.insert_node(name, SnapshotNode::File { contents }),
                    Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                        log::debug!("Skipping non-UTF-8 file {}", entry.path().display());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(tree)
    }

    fn write_tree(dir: &Path, tree: &SnapshotTree) -> Result<(), SnapshotError> {
        fs::create_dir_all(dir)?;
        for (name, node) in tree.entries() {
            let path = dir.join(name);
            match node {
                SnapshotNode::File { contents } => fs::write(path, contents)?,
                SnapshotNode::Directory(sub) => Self::write_tree(&path, sub)?,
            }
        }
        Ok(())
    }

    fn check_names(tree: &SnapshotTree) -> Result<(), SnapshotError> {
        for (name, node) in tree.entries() {
            if !is_safe_name(name) {
                return Err(SnapshotError::InvalidPath(name.clone()));
            }
            if let SnapshotNode::Directory(sub) = node {
                Self::check_names(sub)?;
            }
        }
        Ok(())
    }
}

impl Workspace for DirWorkspace {
    fn export(&self) -> Result<SnapshotTree, SnapshotError> {
        if !self.root.exists() {
            return Ok(SnapshotTree::new());
        }
        Self::export_dir(&self.root)
    }

    fn replace(&mut self, tree: &SnapshotTree) -> Result<(), SnapshotError> {
        Self::check_names(tree)?;
        if self.root.exists() {
            for entry in fs::read_dir(&self.root)? {
                let path = entry?.path();
                if path.is_dir() {
                    fs::remove_dir_all(&path)?;
                } else {
                    fs::remove_file(&path)?;
                }
            }
        }
        Self::write_tree(&self.root, tree)?;
        log::info!(
            "Replaced workspace {} with {} files",
            self.root.display(),
            tree.file_count()
        );
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// Request/response state machine
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Requesting { since: Instant },
    Fulfilled,
    TimedOut,
}

/// Requester-side snapshot bootstrap.
///
/// Time is passed in explicitly so the machine can be driven by any clock.
#[derive(Debug, Clone)]
pub struct SnapshotSync {
    phase: SyncPhase,
    timeout: Duration,
}

impl SnapshotSync {
    pub fn new(timeout: Duration) -> Self {
        Self {
            phase: SyncPhase::Idle,
            timeout,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start a request if the local workspace is empty and none was made yet.
    pub fn begin(&mut self, room_id: &str, workspace_empty: bool, now: Instant) -> Option<ClientEvent> {
        if !workspace_empty || self.phase != SyncPhase::Idle {
            return None;
        }
        self.phase = SyncPhase::Requesting { since: now };
        log::debug!("Requesting project snapshot in {}", room_id);
        Some(ClientEvent::ProjectSyncRequest {
            room_id: room_id.to_string(),
        })
    }

    /// Check for expiry. Moves to `TimedOut` once the deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Result<(), SnapshotError> {
        match self.phase {
            SyncPhase::Requesting { since } if now.saturating_duration_since(since) >= self.timeout => {
                log::warn!("Project snapshot request timed out after {:?}", self.timeout);
                self.phase = SyncPhase::TimedOut;
                Err(SnapshotError::TimedOut(self.timeout))
            }
            SyncPhase::TimedOut => Err(SnapshotError::TimedOut(self.timeout)),
            _ => Ok(()),
        }
    }

    /// Time left before the request expires.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        match self.phase {
            SyncPhase::Requesting { since } => {
                Some(self.timeout.saturating_sub(now.saturating_duration_since(since)))
            }
            _ => None,
        }
    }

    /// Apply received data. Ignored unless a request was made; a later
    /// response overwrites an earlier one.
    pub fn receive<W: Workspace>(
        &mut self,
        files: &SnapshotTree,
        workspace: &mut W,
    ) -> Result<bool, SnapshotError> {
        if self.phase == SyncPhase::Idle {
            log::debug!("Ignoring unsolicited project snapshot");
            return Ok(false);
        }
        workspace.replace(files)?;
        self.phase = SyncPhase::Fulfilled;
        Ok(true)
    }

    pub fn reset(&mut self) {
        self.phase = SyncPhase::Idle;
    }
}

impl Default for SnapshotSync {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_TIMEOUT)
    }
}

/// Responder side: answer a request if this peer has anything to share.
pub fn answer_request<W: Workspace>(
    room_id: &str,
    requester: ConnectionId,
    workspace: &W,
) -> Result<Option<ClientEvent>, SnapshotError> {
    let files = workspace.export()?;
    if files.is_empty() {
        return Ok(None);
    }
    log::debug!("Answering snapshot request from {} with {} files", requester, files.file_count());
    Ok(Some(ClientEvent::ProjectSyncData {
        room_id: room_id.to_string(),
        target_id: requester,
        files,
    }))
}
