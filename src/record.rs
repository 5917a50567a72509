//! Records observed inside layer archives.
//!
//! An [`ArchiveRecord`] is what the archive decoder hands out: the raw path and tar entry type
//! of one member, before any interpretation.  A [`FileRecord`] is the classified form stored in
//! a [`crate::tree::LayerTree`].

use std::{
    ffi::OsStr,
    os::unix::ffi::OsStrExt,
    path::{Component, Path, PathBuf},
};

use serde::Serialize;
use tar::EntryType;

/// Filename prefix marking a path as deleted by the layer that contains it.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Filename marking the containing directory as opaque: nothing from lower layers shows
/// through it.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// One member of a tar archive as seen by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    /// The member path, with any GNU long-name extension already applied.
    pub path: PathBuf,
    pub entry_type: EntryType,
    /// The size declared in the header.
    pub size: u64,
    pub link_name: Option<PathBuf>,
}

impl ArchiveRecord {
    pub fn new(path: impl Into<PathBuf>, entry_type: EntryType, size: u64) -> Self {
        Self {
            path: path.into(),
            entry_type,
            size,
            link_name: None,
        }
    }

    pub fn with_link_name(mut self, link_name: impl Into<PathBuf>) -> Self {
        self.link_name = Some(link_name.into());
        self
    }

    /// Returns the header class name when this record is a PAX extended header, which we never
    /// accept as layer content.
    pub fn extended_header_class(&self) -> Option<&'static str> {
        if self.entry_type.is_pax_global_extensions() {
            Some("XGlobalHeader")
        } else if self.entry_type.is_pax_local_extensions() {
            Some("XHeader")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    /// The path was deleted by this layer.
    Whiteout,
    /// Everything below this directory from earlier layers was deleted by this layer.
    OpaqueWhiteout,
    Other,
}

impl FileKind {
    fn from_entry_type(entry_type: EntryType) -> Self {
        match entry_type {
            EntryType::Regular | EntryType::Continuous => FileKind::Regular,
            EntryType::Directory => FileKind::Directory,
            EntryType::Symlink => FileKind::Symlink,
            _ => FileKind::Other,
        }
    }

    pub fn is_regular(self) -> bool {
        self == FileKind::Regular
    }

    pub fn is_whiteout(self) -> bool {
        matches!(self, FileKind::Whiteout | FileKind::OpaqueWhiteout)
    }
}

/// A classified filesystem entry belonging to one layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    /// Normalized absolute path.  For whiteouts this is the deleted path, for opaque markers
    /// the directory they apply to.
    pub path: PathBuf,
    pub size: u64,
    pub kind: FileKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_target: Option<PathBuf>,
}

impl FileRecord {
    /// Classifies a raw archive record.
    ///
    /// Hard link targets are made absolute, the same way member paths are.  Symlink targets
    /// are kept verbatim since relative targets are meaningful.
    pub fn classify(record: &ArchiveRecord) -> Self {
        let path = normalize_path(&record.path);

        let link_target = record.link_name.as_ref().map(|link| {
            if record.entry_type == EntryType::Link {
                normalize_path(link)
            } else {
                link.clone()
            }
        });

        let whiteout = match path.file_name().map(OsStrExt::as_bytes) {
            Some(name) if name == OPAQUE_WHITEOUT.as_bytes() => {
                let dir = path.parent().map_or_else(|| PathBuf::from("/"), Path::to_path_buf);
                Some((dir, FileKind::OpaqueWhiteout))
            }
            Some(name) => name
                .strip_prefix(WHITEOUT_PREFIX.as_bytes())
                .filter(|target| !target.is_empty())
                .map(|target| {
                    (
                        path.with_file_name(OsStr::from_bytes(target)),
                        FileKind::Whiteout,
                    )
                }),
            None => None,
        };

        let (path, kind) =
            whiteout.unwrap_or_else(|| (path, FileKind::from_entry_type(record.entry_type)));

        Self {
            path,
            size: record.size,
            kind,
            link_target,
        }
    }

    pub fn is_root(&self) -> bool {
        self.path.parent().is_none()
    }
}

/// Turns an archive member path into an absolute path without `.` or `..` components.
///
/// `..` is resolved lexically and never climbs above `/`.  Archives written by different tools
/// disagree about leading `./` and `/`, so all of `a`, `./a` and `/a` end up as `/a`.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(name) => normalized.push(name),
            Component::ParentDir => {
                normalized.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(..) => {}
        }
    }
    normalized
}
