//! A path-indexed tree holding the records of one layer.
//!
//! The tree is a nest of [`Directory`] nodes keyed by filename, so that the ancestors of every
//! path exist structurally even when the layer archive never mentioned them.  Those implicit
//! directories carry no record.

use std::{
    collections::{btree_map, BTreeMap},
    ffi::OsStr,
    path::{Component, Path},
    sync::Arc,
};

use crate::record::{FileKind, FileRecord};

#[derive(Debug, Default)]
pub struct Directory {
    /// The record for this directory itself, if the archive contained one.
    record: Option<FileRecord>,
    /// Set if the layer made this directory opaque.
    opaque: Option<FileRecord>,
    entries: BTreeMap<Box<OsStr>, Node>,
}

#[derive(Debug)]
pub enum Node {
    Directory(Box<Directory>),
    Leaf(FileRecord),
}

impl Directory {
    pub fn is_opaque(&self) -> bool {
        self.opaque.is_some()
    }

    fn get(&self, path: &Path) -> Option<&Node> {
        let mut dir = self;
        let mut node: Option<&Node> = None;

        for component in path.components() {
            let Component::Normal(name) = component else {
                continue;
            };
            if let Some(parent) = node {
                dir = match parent {
                    Node::Directory(subdir) => subdir,
                    Node::Leaf(..) => return None,
                };
            }
            node = Some(dir.entries.get(name)?);
        }

        node
    }

    /// Walks down to the directory at `path`, creating implicit directories along the way.  A
    /// leaf standing where a directory is needed gets replaced: within one layer the later
    /// entry wins.
    fn make_dirs(&mut self, path: &Path) -> &mut Directory {
        let mut dir = self;

        for component in path.components() {
            let Component::Normal(name) = component else {
                continue;
            };
            let node = dir
                .entries
                .entry(Box::from(name))
                .or_insert_with(|| Node::Directory(Box::default()));
            if let Node::Leaf(..) = node {
                *node = Node::Directory(Box::default());
            }
            let Node::Directory(subdir) = node else {
                unreachable!("leaf was just replaced");
            };
            dir = subdir;
        }

        dir
    }

    fn get_dir_mut(&mut self, path: &Path) -> Option<&mut Directory> {
        let mut dir = self;

        for component in path.components() {
            let Component::Normal(name) = component else {
                continue;
            };
            dir = match dir.entries.get_mut(name)? {
                Node::Directory(subdir) => subdir,
                Node::Leaf(..) => return None,
            };
        }

        Some(dir)
    }

    fn regular_size(&self) -> u64 {
        self.entries
            .values()
            .map(|node| match node {
                Node::Leaf(record) if record.kind.is_regular() => record.size,
                Node::Leaf(..) => 0,
                Node::Directory(dir) => dir.regular_size(),
            })
            .sum()
    }

    fn count(&self) -> usize {
        let own = usize::from(self.record.is_some()) + usize::from(self.opaque.is_some());
        own + self
            .entries
            .values()
            .map(|node| match node {
                Node::Leaf(..) => 1,
                Node::Directory(dir) => dir.count(),
            })
            .sum::<usize>()
    }
}

/// The files written by a single layer.
///
/// Built once by [`crate::builder::LayerBuilder`] and never modified afterwards.
#[derive(Debug)]
pub struct LayerTree {
    name: String,
    root: Directory,
    file_size: u64,
}

impl LayerTree {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root: Directory::default(),
            file_size: 0,
        }
    }

    /// The archive entry name this tree was built from.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Directory {
        &self.root
    }

    /// The sum of the declared sizes of the regular files added to this tree.
    pub fn total_size(&self) -> u64 {
        self.file_size
    }

    /// The number of records in the tree, including whiteouts and opaque markers.
    pub fn len(&self) -> usize {
        self.root.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finds the record stored at `path`.  Implicit directories have no record.
    pub fn lookup(&self, path: impl AsRef<Path>) -> Option<&FileRecord> {
        let path = path.as_ref();
        if path.components().all(|c| !matches!(c, Component::Normal(..))) {
            return self.root.record.as_ref();
        }
        match self.root.get(path)? {
            Node::Leaf(record) => Some(record),
            Node::Directory(dir) => dir.record.as_ref(),
        }
    }

    /// Iterates over every record, depth first in asciibetical order.  A directory's own
    /// record comes before its opaque marker, and both before its children.
    pub fn walk(&self) -> Walk<'_> {
        let mut walk = Walk {
            pending: Vec::new(),
            stack: Vec::new(),
        };
        walk.enter(&self.root);
        walk
    }

    /// Stores `record` at its path, replacing whatever the layer wrote there before.
    ///
    /// Directories merge with an existing directory so that previously added children
    /// survive.  The size of a regular file is added to the total even if it replaces an
    /// earlier regular file: each archive member is counted once, when it is seen.
    pub(crate) fn insert(&mut self, record: FileRecord) {
        if record.kind.is_regular() {
            self.file_size += record.size;
        }

        let path = record.path.clone();
        let Some(filename) = path.file_name() else {
            match record.kind {
                FileKind::Directory => self.root.record = Some(record),
                FileKind::OpaqueWhiteout => self.root.opaque = Some(record),
                _ => log::warn!("{}: ignoring non-directory record for /", self.name),
            }
            return;
        };

        let dir = self.root.make_dirs(path.parent().unwrap_or(Path::new("/")));

        match record.kind {
            FileKind::Directory => dir.make_dirs(Path::new(filename)).record = Some(record),
            FileKind::OpaqueWhiteout => dir.make_dirs(Path::new(filename)).opaque = Some(record),
            _ => {
                dir.entries.insert(Box::from(filename), Node::Leaf(record));
            }
        }
    }

    /// Applies another layer's record on top of this tree, the way a union filesystem would.
    fn apply(&mut self, record: &FileRecord) {
        let path = record.path.as_path();
        match record.kind {
            FileKind::Whiteout => {
                if let (Some(parent), Some(filename)) = (path.parent(), path.file_name()) {
                    if let Some(dir) = self.root.get_dir_mut(parent) {
                        dir.entries.remove(filename);
                    }
                }
            }
            FileKind::OpaqueWhiteout => {
                if let Some(dir) = self.root.get_dir_mut(path) {
                    dir.entries.clear();
                }
            }
            _ => self.insert(record.clone()),
        }
    }
}

/// Flattens a chronological list of layer trees into the filesystem a container would see.
///
/// Whiteouts delete the path (and everything below it) from the result, opaque markers empty
/// their directory, and anything else replaces what lower layers had at the same path.  The
/// total size of the result counts only the regular files that survive.
pub fn squash(trees: &[Arc<LayerTree>]) -> LayerTree {
    let mut merged = LayerTree::new("squashed");

    for tree in trees {
        for (_, record) in tree.walk() {
            merged.apply(record);
        }
    }

    merged.file_size = merged.root.regular_size();
    merged
}

/// Depth-first iterator over the records of a [`LayerTree`].
pub struct Walk<'a> {
    /// Records of the directory most recently entered, popped from the back.
    pending: Vec<&'a FileRecord>,
    stack: Vec<btree_map::Values<'a, Box<OsStr>, Node>>,
}

impl<'a> Walk<'a> {
    fn enter(&mut self, dir: &'a Directory) {
        self.pending.extend(dir.opaque.iter());
        self.pending.extend(dir.record.iter());
        self.stack.push(dir.entries.values());
    }
}

impl<'a> Iterator for Walk<'a> {
    type Item = (&'a Path, &'a FileRecord);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.pending.pop() {
                return Some((record.path.as_path(), record));
            }

            match self.stack.last_mut()?.next() {
                None => {
                    self.stack.pop();
                }
                Some(Node::Leaf(record)) => return Some((record.path.as_path(), record)),
                Some(Node::Directory(dir)) => self.enter(dir),
            }
        }
    }
}
