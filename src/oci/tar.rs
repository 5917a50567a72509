//! Decoding of `docker save` archives.
//!
//! The outer archive is read once, front to back.  Each layer sub-archive is decoded into its
//! list of [`ArchiveRecord`]s as soon as it is encountered, JSON documents are kept in memory,
//! and everything else is skipped.
//!
//! Both levels are read in raw mode: the `tar` crate would otherwise apply PAX extended headers
//! silently, and we want to see them.  GNU long-name and long-link records are folded into the
//! record that follows them, the same way GNU tar does.

use std::{
    borrow::Cow,
    collections::HashMap,
    ffi::OsString,
    io::Read,
    mem,
    os::unix::ffi::OsStringExt,
    path::{Path, PathBuf},
};

use log::{debug, trace, warn};
use tar::{Archive, Entry, EntryType};

use crate::{
    error::{AnalysisError, Result},
    record::{normalize_path, ArchiveRecord},
};

const LAYER_SUFFIX: &str = "layer.tar";
const JSON_SUFFIX: &str = ".json";

/// One layer sub-archive, fully decoded.
#[derive(Debug)]
pub struct LayerArchive {
    /// 1-based position among the layer archives of the image archive.
    pub position: usize,
    /// The entry name in the image archive, e.g. `<id>/layer.tar`.
    pub name: String,
    pub records: Vec<ArchiveRecord>,
}

/// What remains of the image archive once the layers have been handed off.
#[derive(Debug, Default)]
pub struct ScannedArchive {
    /// Contents of every regular `*.json` entry, by entry name.
    pub json_files: HashMap<String, Vec<u8>>,
    /// `layer.tar` entries that are symlinks, mapped to the entry name they point at.
    pub layer_aliases: HashMap<String, String>,
    /// How many layer archives were decoded.
    pub layers: usize,
}

fn bytes_to_path(bytes: Vec<u8>) -> PathBuf {
    PathBuf::from(OsString::from_vec(bytes))
}

fn is_regular(entry_type: EntryType) -> bool {
    matches!(entry_type, EntryType::Regular | EntryType::Continuous)
}

/// Calls `visit` for every member of `archive`, with GNU long-name extensions applied.
///
/// `visit` may read the member's content from the entry it is given.
fn visit_entries<R: Read>(
    archive: &mut Archive<R>,
    context: &str,
    mut visit: impl FnMut(ArchiveRecord, &mut Entry<'_, R>) -> Result<()>,
) -> Result<()> {
    let mut gnu_longname: Vec<u8> = vec![];
    let mut gnu_longlink: Vec<u8> = vec![];

    let entries = archive
        .entries()
        .map_err(AnalysisError::io(format!("entries of {context}")))?
        .raw(true);

    for entry in entries {
        let mut entry = entry.map_err(AnalysisError::io(format!("entry header in {context}")))?;
        let entry_type = entry.header().entry_type();

        if entry_type.is_gnu_longname() || entry_type.is_gnu_longlink() {
            let buffer = if entry_type.is_gnu_longname() {
                &mut gnu_longname
            } else {
                &mut gnu_longlink
            };
            buffer.clear();
            entry
                .read_to_end(buffer)
                .map_err(AnalysisError::io(format!("GNU long name in {context}")))?;
            if buffer.last() == Some(&b'\0') {
                buffer.pop();
            }
            continue;
        }

        let header = entry.header();
        let path = match mem::take(&mut gnu_longname) {
            name if name.is_empty() => header.path_bytes().into_owned(),
            name => name,
        };
        let link_name = match mem::take(&mut gnu_longlink) {
            link if link.is_empty() => header.link_name_bytes().map(Cow::into_owned),
            link => Some(link),
        };

        let record = ArchiveRecord {
            path: bytes_to_path(path),
            entry_type,
            size: entry.size(),
            link_name: link_name.map(bytes_to_path),
        };
        visit(record, &mut entry)?;
    }

    Ok(())
}

/// Decodes every record of one layer archive.
///
/// Records are returned as found, including any PAX extended headers: deciding what to do with
/// those is up to the layer builder.
pub fn read_layer_records<R: Read>(reader: R, name: &str) -> Result<Vec<ArchiveRecord>> {
    let mut archive = Archive::new(reader);
    let mut records = vec![];

    visit_entries(&mut archive, name, |record, _| {
        records.push(record);
        Ok(())
    })?;

    trace!("{name}: {} records", records.len());
    Ok(records)
}

/// Resolves the target of a symlink found at `name` to an entry name in the same archive.
fn resolve_link(name: &str, target: &Path) -> String {
    let parent = Path::new(name).parent().unwrap_or(Path::new(""));
    let resolved = normalize_path(&parent.join(target));
    resolved
        .strip_prefix("/")
        .unwrap_or(&resolved)
        .to_string_lossy()
        .into_owned()
}

/// Reads an image archive in a single forward pass.
///
/// `on_layer` is called once per layer archive, in the order the layer archives appear, with
/// the decoded records.  An error from `on_layer` stops the scan.
pub fn scan_image<R: Read>(
    reader: R,
    mut on_layer: impl FnMut(LayerArchive) -> Result<()>,
) -> Result<ScannedArchive> {
    let mut archive = Archive::new(reader);
    let mut scanned = ScannedArchive::default();

    visit_entries(&mut archive, "image archive", |record, entry| {
        if let Some(class) = record.extended_header_class() {
            return Err(AnalysisError::ArchiveFormat {
                path: record.path.to_string_lossy().into_owned(),
                flag: char::from(record.entry_type.as_byte()),
                class,
            });
        }

        let name = record.path.to_string_lossy().into_owned();

        if is_regular(record.entry_type) && name.ends_with(LAYER_SUFFIX) {
            let records = read_layer_records(entry, &name)?;
            scanned.layers += 1;
            debug!("decoded layer archive {name} ({} records)", records.len());
            on_layer(LayerArchive {
                position: scanned.layers,
                name,
                records,
            })
        } else if record.entry_type == EntryType::Symlink && name.ends_with(LAYER_SUFFIX) {
            match &record.link_name {
                Some(target) => {
                    let target = resolve_link(&name, target);
                    debug!("layer archive {name} is a link to {target}");
                    scanned.layer_aliases.insert(name, target);
                }
                None => warn!("ignoring layer symlink {name} without a target"),
            }
            Ok(())
        } else if is_regular(record.entry_type) && name.ends_with(JSON_SUFFIX) {
            let mut content = vec![];
            entry
                .read_to_end(&mut content)
                .map_err(AnalysisError::io(name.clone()))?;
            scanned.json_files.insert(name, content);
            Ok(())
        } else {
            trace!("skipping {name} ({:?})", record.entry_type);
            Ok(())
        }
    })?;

    Ok(scanned)
}
