//! Hierarchical file view folded from `file_found` / `file_modified` /
//! `file_created` records.
//!
//! Status per path only moves up the lattice; content is replaced only
//! by a different non-empty value and is never cleared. Every path segment
//! becomes a node, so a record whose parents were never reported still
//! shows up under synthesised folders.

use crate::{EventKind, EventRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Directories that never reach the tree.
pub const NOISE_SEGMENTS: [&str; 11] = [
    ".git",
    ".svn",
    ".hg",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    ".mypy_cache",
    ".pytest_cache",
    ".tox",
    ".gradle",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Scanning,
    Scanned,
    Modifying,
    Completed,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Scanning => "scanning",
            FileStatus::Scanned => "scanned",
            FileStatus::Modifying => "modifying",
            FileStatus::Completed => "completed",
        }
    }

    pub fn rank(self) -> u8 {
        match self {
            FileStatus::Pending => 0,
            FileStatus::Scanning => 1,
            FileStatus::Scanned => 2,
            FileStatus::Modifying => 3,
            FileStatus::Completed => 4,
        }
    }

    pub fn for_kind(kind: EventKind) -> Option<Self> {
        match kind {
            EventKind::FileFound => Some(FileStatus::Scanned),
            EventKind::FileModified => Some(FileStatus::Modifying),
            EventKind::FileCreated => Some(FileStatus::Completed),
            _ => None,
        }
    }

    /// Transition rule: keep whichever status ranks higher.
    pub fn advance(current: Option<Self>, next: Self) -> Self {
        match current {
            Some(current) if current.rank() >= next.rank() => current,
            _ => next,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Folder,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileNode {
    pub name: String,
    pub path: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub status: Option<FileStatus>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub children: Vec<FileNode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileTree {
    pub roots: Vec<FileNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PathEntry {
    status: Option<FileStatus>,
    content: Option<String>,
}

#[derive(Default)]
struct TrieNode {
    entry: Option<PathEntry>,
    children: BTreeMap<String, TrieNode>,
}

impl FileTree {
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn find(&self, path: &str) -> Option<&FileNode> {
        let segments = split_path(path);
        let mut level = &self.roots;
        let mut found = None;
        for segment in segments {
            let node = level.iter().find(|node| node.name == segment)?;
            level = &node.children;
            found = Some(node);
        }
        found
    }

    pub fn file_count(&self) -> usize {
        fn count(nodes: &[FileNode]) -> usize {
            nodes
                .iter()
                .map(|node| match node.kind {
                    NodeKind::File => 1,
                    NodeKind::Folder => count(&node.children),
                })
                .sum()
        }
        count(&self.roots)
    }

    pub fn count_with_status(&self, status: FileStatus) -> usize {
        fn count(nodes: &[FileNode], status: FileStatus) -> usize {
            nodes
                .iter()
                .map(|node| {
                    let own = node.kind == NodeKind::File && node.status == Some(status);
                    usize::from(own) + count(&node.children, status)
                })
                .sum()
        }
        count(&self.roots, status)
    }
}

pub fn accepts(kind: EventKind) -> bool {
    kind.is_file_event()
}

pub fn project_file_tree(records: &[EventRecord]) -> FileTree {
    let mut entries: BTreeMap<String, PathEntry> = BTreeMap::new();
    for record in records {
        let Some(next) = FileStatus::for_kind(record.kind()) else {
            continue;
        };
        let Some(raw_path) = record.payload_str(&["path", "file_path", "file"]) else {
            continue;
        };
        let segments = split_path(raw_path);
        if segments.is_empty() || is_noise(&segments) {
            continue;
        }
        let entry = entries.entry(segments.join("/")).or_default();
        entry.status = Some(FileStatus::advance(entry.status, next));
        if let Some(content) = record.payload().get("content").and_then(|value| value.as_str()) {
            if !content.is_empty() && entry.content.as_deref() != Some(content) {
                entry.content = Some(content.to_string());
            }
        }
    }

    let mut root = TrieNode::default();
    for (path, entry) in entries {
        let mut node = &mut root;
        for segment in path.split('/') {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node.entry = Some(entry);
    }

    FileTree {
        roots: build_level(&root, ""),
    }
}

fn build_level(parent: &TrieNode, prefix: &str) -> Vec<FileNode> {
    let mut nodes: Vec<FileNode> = parent
        .children
        .iter()
        .map(|(name, child)| {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            let children = build_level(child, &path);
            let entry = child.entry.clone().unwrap_or_default();
            FileNode {
                name: name.clone(),
                kind: if children.is_empty() {
                    NodeKind::File
                } else {
                    NodeKind::Folder
                },
                path,
                status: entry.status,
                content: entry.content,
                children,
            }
        })
        .collect();
    nodes.sort_by(|left, right| {
        let left_rank = u8::from(left.kind == NodeKind::File);
        let right_rank = u8::from(right.kind == NodeKind::File);
        left_rank
            .cmp(&right_rank)
            .then_with(|| left.name.cmp(&right.name))
    });
    nodes
}

fn split_path(raw: &str) -> Vec<&str> {
    raw.split(|ch: char| ch == '/' || ch == '\\')
        .map(str::trim)
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect()
}

fn is_noise(segments: &[&str]) -> bool {
    segments
        .iter()
        .any(|segment| NOISE_SEGMENTS.contains(segment))
}
