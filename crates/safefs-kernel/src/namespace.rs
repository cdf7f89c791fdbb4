//! [`Namespace`] – the in-memory resource tree.
//!
//! Directories and leaves addressed by absolute slash-separated paths. Every
//! node is owned by its parent directory; there are no back-references, so
//! the tree can never form a cycle. Nodes come into existence only through
//! path-creating operations ([`Namespace::mkdir`], [`Namespace::write`],
//! [`Namespace::append`]) and leave only through [`Namespace::unlink`] of a
//! childless node.
//!
//! The whole tree sits behind one re-entrant lock; every operation is a
//! short critical section that never blocks on anything else.
//!
//! # Example
//!
//! ```
//! use safefs_kernel::namespace::{Content, Namespace};
//! use serde_json::json;
//!
//! let ns = Namespace::new();
//! ns.write("/devices/motor/cmd", json!({"linear": 0.2})).unwrap();
//!
//! assert!(ns.exists("/devices/motor"));
//! assert_eq!(ns.ls("/devices").unwrap(), Some(vec!["motor".to_string()]));
//! assert_eq!(
//!     ns.read("/devices/motor/cmd").unwrap(),
//!     Some(Content::Value(json!({"linear": 0.2})))
//! );
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::ReentrantMutex;
use safefs_types::KernelError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::path;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Whether a node holds children or a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Directory,
    Leaf,
}

/// What [`Namespace::read`] returns for an existing path.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    /// The payload of a leaf.
    Value(Value),
    /// Child names of a directory, in name order.
    Directory(Vec<String>),
}

impl Content {
    /// Render as JSON; a directory becomes `{"type": "directory", "children": [..]}`.
    pub fn into_json(self) -> Value {
        match self {
            Content::Value(v) => v,
            Content::Directory(children) => {
                serde_json::json!({ "type": "directory", "children": children })
            }
        }
    }
}

/// Result of [`Namespace::stat`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub path: String,
    pub kind: NodeKind,
    /// Child count for directories, serialized payload length for leaves.
    pub size: usize,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal node
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Body {
    Directory(BTreeMap<String, Node>),
    Leaf(Value),
}

#[derive(Debug)]
struct Node {
    name: String,
    body: Body,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

impl Node {
    fn directory(name: &str, now: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            body: Body::Directory(BTreeMap::new()),
            created_at: now,
            modified_at: now,
        }
    }

    fn leaf(name: &str, value: Value, now: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            body: Body::Leaf(value),
            created_at: now,
            modified_at: now,
        }
    }

    fn kind(&self) -> NodeKind {
        match self.body {
            Body::Directory(_) => NodeKind::Directory,
            Body::Leaf(_) => NodeKind::Leaf,
        }
    }

    fn size(&self) -> usize {
        match &self.body {
            Body::Directory(children) => children.len(),
            Body::Leaf(v) => serde_json::to_string(v).map_or(0, |s| s.len()),
        }
    }
}

fn lookup<'a>(root: &'a Node, normalized: &str) -> Option<&'a Node> {
    path::segments(normalized).try_fold(root, |node, seg| match &node.body {
        Body::Directory(children) => children.get(seg),
        Body::Leaf(_) => None,
    })
}

fn lookup_mut<'a>(root: &'a mut Node, segs: &[&str]) -> Option<&'a mut Node> {
    let mut node = root;
    for seg in segs {
        node = match &mut node.body {
            Body::Directory(children) => children.get_mut(*seg)?,
            Body::Leaf(_) => return None,
        };
    }
    Some(node)
}

fn prefix_of(segs: &[&str], depth: usize) -> String {
    format!("/{}", segs[..=depth].join("/"))
}

/// Walk `segs` from `root`, creating missing directories, and return the
/// child map of the last one. Fails without creating anything if a segment
/// already exists as a leaf.
fn ensure_dirs<'a>(
    root: &'a mut Node,
    segs: &[&str],
    now: DateTime<Utc>,
) -> Result<&'a mut BTreeMap<String, Node>, KernelError> {
    let mut children = match &mut root.body {
        Body::Directory(children) => children,
        Body::Leaf(_) => {
            return Err(KernelError::TypeConflict {
                path: path::ROOT.to_string(),
                detail: "root is not a directory".into(),
            });
        }
    };
    for (depth, seg) in segs.iter().enumerate() {
        let node = children
            .entry((*seg).to_string())
            .or_insert_with(|| Node::directory(seg, now));
        children = match &mut node.body {
            Body::Directory(children) => children,
            Body::Leaf(_) => {
                return Err(KernelError::TypeConflict {
                    path: prefix_of(segs, depth),
                    detail: "exists as a leaf".into(),
                });
            }
        };
    }
    Ok(children)
}

fn collect_paths(node: &Node, at: &str, out: &mut Vec<String>) {
    if let Body::Directory(children) = &node.body {
        for (name, child) in children {
            let child_path = path::join(at, name);
            out.push(child_path.clone());
            collect_paths(child, &child_path, out);
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Namespace
// ────────────────────────────────────────────────────────────────────────────

/// The resource tree. Cheap to share behind an `Arc`; all methods take `&self`.
#[derive(Debug)]
pub struct Namespace {
    tree: ReentrantMutex<RefCell<Node>>,
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

impl Namespace {
    /// Create a tree holding only the root directory.
    pub fn new() -> Self {
        Self {
            tree: ReentrantMutex::new(RefCell::new(Node::directory("", Utc::now()))),
        }
    }

    /// Create every directory along `path`. Existing directories are kept.
    ///
    /// # Errors
    ///
    /// [`KernelError::TypeConflict`] if a segment exists as a leaf.
    pub fn mkdir(&self, path: &str) -> Result<(), KernelError> {
        let path = path::normalize(path)?;
        let segs: Vec<&str> = path::segments(&path).collect();
        let guard = self.tree.lock();
        let mut root = guard.borrow_mut();
        ensure_dirs(&mut root, &segs, Utc::now())?;
        debug!(path = %path, "mkdir");
        Ok(())
    }

    /// Store `value` at `path`, creating missing parent directories.
    ///
    /// Replacing an existing leaf keeps its creation time.
    ///
    /// # Errors
    ///
    /// [`KernelError::TypeConflict`] if `path` is a directory or a parent
    /// segment is a leaf.
    pub fn write(&self, path: &str, value: Value) -> Result<(), KernelError> {
        let path = path::normalize(path)?;
        let segs: Vec<&str> = path::segments(&path).collect();
        let Some((name, parents)) = segs.split_last() else {
            return Err(KernelError::TypeConflict {
                path,
                detail: "is a directory".into(),
            });
        };
        let now = Utc::now();
        let guard = self.tree.lock();
        let mut root = guard.borrow_mut();
        let children = ensure_dirs(&mut root, parents, now)?;
        match children.get_mut(*name) {
            Some(node) => match &mut node.body {
                Body::Directory(_) => Err(KernelError::TypeConflict {
                    path,
                    detail: "is a directory".into(),
                }),
                Body::Leaf(payload) => {
                    *payload = value;
                    node.modified_at = now;
                    Ok(())
                }
            },
            None => {
                children.insert((*name).to_string(), Node::leaf(name, value, now));
                Ok(())
            }
        }
    }

    /// Append `value` to the list stored at `path`.
    ///
    /// An absent or `null` leaf becomes `[value]`; a scalar leaf `x` becomes
    /// `[x, value]` on first use.
    pub fn append(&self, path: &str, value: Value) -> Result<(), KernelError> {
        let path = path::normalize(path)?;
        let segs: Vec<&str> = path::segments(&path).collect();
        let Some((name, parents)) = segs.split_last() else {
            return Err(KernelError::TypeConflict {
                path,
                detail: "is a directory".into(),
            });
        };
        let now = Utc::now();
        let guard = self.tree.lock();
        let mut root = guard.borrow_mut();
        let children = ensure_dirs(&mut root, parents, now)?;
        match children.get_mut(*name) {
            Some(node) => match &mut node.body {
                Body::Directory(_) => Err(KernelError::TypeConflict {
                    path,
                    detail: "is a directory".into(),
                }),
                Body::Leaf(payload) => {
                    if let Value::Array(items) = payload {
                        items.push(value);
                    } else if payload.is_null() {
                        *payload = Value::Array(vec![value]);
                    } else {
                        let previous = payload.take();
                        *payload = Value::Array(vec![previous, value]);
                    }
                    node.modified_at = now;
                    Ok(())
                }
            },
            None => {
                children.insert(
                    (*name).to_string(),
                    Node::leaf(name, Value::Array(vec![value]), now),
                );
                Ok(())
            }
        }
    }

    /// Leaf payload, directory listing, or `None` when absent.
    pub fn read(&self, path: &str) -> Result<Option<Content>, KernelError> {
        let path = path::normalize(path)?;
        let guard = self.tree.lock();
        let root = guard.borrow();
        Ok(lookup(&root, &path).map(|node| match &node.body {
            Body::Leaf(v) => Content::Value(v.clone()),
            Body::Directory(children) => Content::Directory(children.keys().cloned().collect()),
        }))
    }

    /// Child names of a directory; `None` for leaves and absent paths.
    pub fn ls(&self, path: &str) -> Result<Option<Vec<String>>, KernelError> {
        let path = path::normalize(path)?;
        let guard = self.tree.lock();
        let root = guard.borrow();
        Ok(lookup(&root, &path).and_then(|node| match &node.body {
            Body::Directory(children) => Some(children.keys().cloned().collect()),
            Body::Leaf(_) => None,
        }))
    }

    pub fn stat(&self, path: &str) -> Result<Option<Metadata>, KernelError> {
        let path = path::normalize(path)?;
        let guard = self.tree.lock();
        let root = guard.borrow();
        Ok(lookup(&root, &path).map(|node| Metadata {
            path: path.clone(),
            kind: node.kind(),
            size: node.size(),
            created_at: node.created_at,
            modified_at: node.modified_at,
        }))
    }

    /// `true` if `path` names an existing node. Malformed paths do not exist.
    pub fn exists(&self, path: &str) -> bool {
        let Ok(path) = path::normalize(path) else {
            return false;
        };
        let guard = self.tree.lock();
        let root = guard.borrow();
        lookup(&root, &path).is_some()
    }

    /// Remove a leaf or an empty directory. Returns `Ok(false)` if absent.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotEmpty`] for a directory with children,
    /// [`KernelError::InvalidPath`] for the root.
    pub fn unlink(&self, path: &str) -> Result<bool, KernelError> {
        let path = path::normalize(path)?;
        let segs: Vec<&str> = path::segments(&path).collect();
        let Some((name, parents)) = segs.split_last() else {
            return Err(KernelError::InvalidPath("cannot unlink the root".into()));
        };
        let guard = self.tree.lock();
        let mut root = guard.borrow_mut();
        let Some(parent) = lookup_mut(&mut root, parents) else {
            return Ok(false);
        };
        let Body::Directory(children) = &mut parent.body else {
            return Ok(false);
        };
        let occupied = match children.get(*name) {
            None => return Ok(false),
            Some(node) => matches!(&node.body, Body::Directory(c) if !c.is_empty()),
        };
        if occupied {
            return Err(KernelError::NotEmpty(path));
        }
        children.remove(*name);
        debug!(path = %path, "unlink");
        Ok(true)
    }

    /// Every path beneath `path`, depth first in name order, excluding
    /// `path` itself. Leaves and absent paths yield an empty list.
    pub fn walk(&self, path: &str) -> Result<Vec<String>, KernelError> {
        let path = path::normalize(path)?;
        let guard = self.tree.lock();
        let root = guard.borrow();
        let mut out = Vec::new();
        if let Some(node) = lookup(&root, &path) {
            collect_paths(node, &path, &mut out);
        }
        Ok(out)
    }

    /// Name of the node at `path`, mostly useful for diagnostics.
    pub fn name_of(&self, path: &str) -> Result<Option<String>, KernelError> {
        let path = path::normalize(path)?;
        let guard = self.tree.lock();
        let root = guard.borrow();
        Ok(lookup(&root, &path).map(|node| node.name.clone()))
    }
}
