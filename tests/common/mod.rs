//! Builds `docker save` style archives in memory.

#![allow(dead_code)]

use serde_json::{json, Value};
use tar::{Builder, EntryType, Header};

/// The contents of one layer archive.
pub struct LayerContent {
    builder: Builder<Vec<u8>>,
}

impl LayerContent {
    fn new() -> Self {
        Self {
            builder: Builder::new(Vec::new()),
        }
    }

    fn append(&mut self, path: &str, entry_type: EntryType, data: &[u8]) -> &mut Self {
        let mut header = Header::new_gnu();
        header.set_mode(if entry_type == EntryType::Directory {
            0o755
        } else {
            0o644
        });
        header.set_mtime(1234567890);
        header.set_size(data.len() as u64);
        header.set_entry_type(entry_type);
        self.builder.append_data(&mut header, path, data).unwrap();
        self
    }

    pub fn file(&mut self, path: &str, size: usize) -> &mut Self {
        self.append(path, EntryType::Regular, &vec![b'x'; size])
    }

    pub fn dir(&mut self, path: &str) -> &mut Self {
        self.append(path, EntryType::Directory, &[])
    }

    /// Deletes `path` from lower layers.
    pub fn whiteout(&mut self, path: &str) -> &mut Self {
        let (dir, name) = path.rsplit_once('/').unwrap_or(("", path));
        let marker = if dir.is_empty() {
            format!(".wh.{name}")
        } else {
            format!("{dir}/.wh.{name}")
        };
        self.append(&marker, EntryType::Regular, &[])
    }

    pub fn symlink(&mut self, path: &str, target: &str) -> &mut Self {
        let mut header = Header::new_gnu();
        header.set_mode(0o777);
        header.set_size(0);
        header.set_entry_type(EntryType::Symlink);
        self.builder.append_link(&mut header, path, target).unwrap();
        self
    }

    /// A PAX extended header record, as GNU tar writes before a member with a long name.
    pub fn pax_header(&mut self, path: &str) -> &mut Self {
        let data = b"19 path=etc/shadow\n";
        let mut header = Header::new_ustar();
        header.set_mode(0o644);
        header.set_size(data.len() as u64);
        header.set_entry_type(EntryType::XHeader);
        self.builder.append_data(&mut header, path, &data[..]).unwrap();
        self
    }

    fn finish(self) -> Vec<u8> {
        self.builder.into_inner().unwrap()
    }
}

enum LayerSource {
    Content(Vec<u8>),
    /// A symlink to the layer archive of an earlier layer.
    Link(usize),
}

struct FixtureLayer {
    source: LayerSource,
    tracked: bool,
}

/// A saved image under construction.
#[derive(Default)]
pub struct ImageFixture {
    layers: Vec<FixtureLayer>,
    history: Vec<Value>,
    tags: Vec<String>,
    top_level_pax: bool,
}

pub fn layer_dir(index: usize) -> String {
    format!("{:064x}", index + 1)
}

pub fn layer_path(index: usize) -> String {
    format!("{}/layer.tar", layer_dir(index))
}

pub fn diff_id(index: usize) -> String {
    format!("sha256:{:064x}", 0xd1ff_0000 + index)
}

const CONFIG_PATH: &str = "c0ffee.json";

impl ImageFixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    /// Adds a build step that produced a layer.
    pub fn layer(mut self, created_by: &str, build: impl FnOnce(&mut LayerContent)) -> Self {
        let mut content = LayerContent::new();
        build(&mut content);
        self.layers.push(FixtureLayer {
            source: LayerSource::Content(content.finish()),
            tracked: true,
        });
        self.history.push(json!({ "created_by": created_by }));
        self
    }

    /// Adds a layer archive that no history entry accounts for.
    pub fn untracked_layer(mut self, build: impl FnOnce(&mut LayerContent)) -> Self {
        let mut content = LayerContent::new();
        build(&mut content);
        self.layers.push(FixtureLayer {
            source: LayerSource::Content(content.finish()),
            tracked: false,
        });
        self
    }

    /// Adds a build step whose layer archive is a symlink to the archive of layer `target`.
    pub fn linked_layer(mut self, created_by: &str, target: usize) -> Self {
        self.layers.push(FixtureLayer {
            source: LayerSource::Link(target),
            tracked: true,
        });
        self.history.push(json!({ "created_by": created_by }));
        self
    }

    /// Adds a build step that only changed metadata.
    pub fn empty_step(mut self, created_by: &str) -> Self {
        self.history
            .push(json!({ "created_by": created_by, "empty_layer": true }));
        self
    }

    /// Puts a PAX extended header record at the top of the image archive.
    pub fn with_top_level_pax_header(mut self) -> Self {
        self.top_level_pax = true;
        self
    }

    fn append_file(builder: &mut Builder<Vec<u8>>, path: &str, data: &[u8]) {
        let mut header = Header::new_gnu();
        header.set_mode(0o644);
        header.set_mtime(1234567890);
        header.set_size(data.len() as u64);
        header.set_entry_type(EntryType::Regular);
        builder.append_data(&mut header, path, data).unwrap();
    }

    pub fn config(&self) -> Value {
        let produced = self.layers.iter().filter(|l| l.tracked).count();
        json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {
                "type": "layers",
                "diff_ids": (0..produced).map(diff_id).collect::<Vec<_>>(),
            },
            "history": self.history,
        })
    }

    pub fn manifest(&self) -> Value {
        json!([{
            "Config": CONFIG_PATH,
            "RepoTags": self.tags,
            "Layers": (0..self.layers.len()).map(layer_path).collect::<Vec<_>>(),
        }])
    }

    /// Writes the image archive, layers first, the way `docker save` orders it.
    pub fn build(self) -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());

        if self.top_level_pax {
            let data = b"20 path=manifest.js\n";
            let mut header = Header::new_ustar();
            header.set_mode(0o644);
            header.set_size(data.len() as u64);
            header.set_entry_type(EntryType::XHeader);
            builder
                .append_data(&mut header, "PaxHeaders.0/manifest.json", &data[..])
                .unwrap();
        }

        for (index, layer) in self.layers.iter().enumerate() {
            let dir = layer_dir(index);
            let mut header = Header::new_gnu();
            header.set_mode(0o755);
            header.set_size(0);
            header.set_entry_type(EntryType::Directory);
            builder
                .append_data(&mut header, format!("{dir}/"), &[][..])
                .unwrap();
            Self::append_file(&mut builder, &format!("{dir}/VERSION"), b"1.0");
            Self::append_file(&mut builder, &format!("{dir}/json"), b"{}");

            match &layer.source {
                LayerSource::Content(data) => {
                    Self::append_file(&mut builder, &layer_path(index), data);
                }
                LayerSource::Link(target) => {
                    let mut header = Header::new_gnu();
                    header.set_mode(0o777);
                    header.set_size(0);
                    header.set_entry_type(EntryType::Symlink);
                    builder
                        .append_link(
                            &mut header,
                            layer_path(index),
                            format!("../{}", layer_path(*target)),
                        )
                        .unwrap();
                }
            }
        }

        let config = serde_json::to_vec(&self.config()).unwrap();
        Self::append_file(&mut builder, CONFIG_PATH, &config);
        let manifest = serde_json::to_vec(&self.manifest()).unwrap();
        Self::append_file(&mut builder, "manifest.json", &manifest);

        builder.into_inner().unwrap()
    }
}
