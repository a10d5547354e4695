//! Declarative project description.
//!
//! The semantic schema mirrors the original tool's project documents: an
//! `iso_project` with one data track (identifiers, optional license,
//! directory tree) and any number of audio tracks. The concrete text format
//! here is JSON through serde; the extractor emits the same schema back out.
//!
//! Mapping into the [`DirTree`] resolves inheritable attributes layer by
//! layer, checks each source file against its declared type, and stamps
//! datestamps from explicit `date` fields or source file mtimes.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::attr::EntryAttributes;
use crate::datestamp::IsoDate;
use crate::model::{DirTree, EntryId, EntryKind, ResolvedAttributes};
use crate::{IsoError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cue_sheet: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub no_xa: bool,
    pub tracks: Vec<Track>,
}

impl Project {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| IsoError::MalformedProject(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        // Serialization of this schema cannot fail
        serde_json::to_string_pretty(self).expect("project serialization")
    }

    /// The single data track; it must come first.
    pub fn data_track(&self) -> Result<&Track> {
        let first = self
            .tracks
            .first()
            .ok_or_else(|| IsoError::MalformedProject("project has no tracks".into()))?;
        if first.track_type != TrackType::Data {
            return Err(IsoError::MalformedProject(
                "the first track must be a data track".into(),
            ));
        }
        if self.tracks[1..].iter().any(|t| t.track_type == TrackType::Data) {
            return Err(IsoError::MalformedProject(
                "only the first track can be a data track".into(),
            ));
        }
        Ok(first)
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks
            .iter()
            .filter(|t| t.track_type == TrackType::Audio)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    #[serde(rename = "type")]
    pub track_type: TrackType,
    /// Audio source file (audio tracks only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    /// Identifier CD-DA file entries use to reference this track.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trackid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifiers: Option<Identifiers>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<License>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_attributes: Option<EntryAttributes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory_tree: Option<DirNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackType {
    Data,
    Audio,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Identifiers {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_set: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_preparer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copyright: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<IsoDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct License {
    pub file: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirNode {
    /// Absent on the `directory_tree` root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Host directory whose contents populate this node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    /// Explicit record datestamp; the source mtime otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<IsoDate>,
    #[serde(flatten)]
    pub attributes: EntryAttributes,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<Node>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "lowercase")]
pub enum Node {
    File(FileNode),
    Dir(DirNode),
    Dummy(DummyNode),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    #[serde(rename = "type", default)]
    pub kind: FileKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trackid: Option<String>,
    /// Explicit record datestamp; the source mtime otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<IsoDate>,
    #[serde(flatten)]
    pub attributes: EntryAttributes,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    #[default]
    Data,
    /// Interleaved XA/STR data, autodetected per sector.
    Mixed,
    /// Pure XA audio stream.
    Xa,
    /// STR video; falls back to data-only form when 2048-aligned.
    Str,
    /// CD-DA track reference.
    Da,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DummyNode {
    pub sectors: u32,
    /// 0 for Form 1, 1 for Form 2.
    #[serde(rename = "type", default)]
    pub form: u8,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Builds the filesystem model for a data track.
///
/// `base_dir` anchors relative source paths (normally the project file's
/// directory); `build_date` stamps entries without a source or explicit date.
pub fn build_tree(track: &Track, base_dir: &Path, build_date: IsoDate) -> Result<DirTree> {
    let tree_node = track
        .directory_tree
        .as_ref()
        .ok_or_else(|| IsoError::MalformedProject("data track has no directory_tree".into()))?;

    let defaults = EntryAttributes::defaults();
    let track_attrs = match &track.default_attributes {
        Some(overlay) => defaults.overlay(overlay),
        None => defaults,
    };
    let root_attrs = track_attrs.overlay(&tree_node.attributes);

    let root_date = entry_date(
        tree_node.date,
        tree_node.source.as_deref().map(|p| base_dir.join(p)),
        build_date,
        root_attrs.gmt_offs(),
    );
    let mut tree = DirTree::new(root_date, ResolvedAttributes::from(&root_attrs));

    let root = tree.root();
    populate_dir(&mut tree, root, tree_node, &root_attrs, base_dir, build_date)?;
    Ok(tree)
}

fn populate_dir(
    tree: &mut DirTree,
    dir: EntryId,
    node: &DirNode,
    inherited: &EntryAttributes,
    base_dir: &Path,
    build_date: IsoDate,
) -> Result<()> {
    for child in &node.entries {
        match child {
            Node::File(file) => {
                add_file_node(tree, dir, file, inherited, base_dir, build_date)?;
            }
            Node::Dir(sub) => {
                let name = sub.name.as_deref().ok_or_else(|| {
                    IsoError::MalformedProject("nested dir element has no name".into())
                })?;
                let attrs = inherited.overlay(&sub.attributes);
                let date = entry_date(
                    sub.date,
                    sub.source.as_deref().map(|p| base_dir.join(p)),
                    build_date,
                    attrs.gmt_offs(),
                );
                let sub_id =
                    tree.add_dir(dir, name, date, ResolvedAttributes::from(&attrs))?;
                populate_dir(tree, sub_id, sub, &attrs, base_dir, build_date)?;
            }
            Node::Dummy(dummy) => {
                tree.add_dummy(dir, dummy.sectors, dummy.form != 0);
            }
        }
    }

    // A source directory fills in anything not declared explicitly
    if let Some(source) = &node.source {
        populate_from_host(tree, dir, &base_dir.join(source), inherited, build_date)?;
    }

    Ok(())
}

fn add_file_node(
    tree: &mut DirTree,
    dir: EntryId,
    node: &FileNode,
    inherited: &EntryAttributes,
    base_dir: &Path,
    build_date: IsoDate,
) -> Result<EntryId> {
    let attrs = inherited.overlay(&node.attributes);
    let resolved = ResolvedAttributes::from(&attrs);

    if node.kind == FileKind::Da {
        let track_id = node.trackid.clone().ok_or_else(|| {
            IsoError::MalformedProject(format!("da file {} has no trackid", node.name))
        })?;
        let date = node.date.unwrap_or(build_date);
        // Size and LBA resolve when the audio track is placed
        return tree.add_file(
            dir,
            &node.name,
            EntryKind::Cdda { track_id },
            0,
            None,
            date,
            resolved,
        );
    }

    let source = node.source.as_ref().ok_or_else(|| {
        IsoError::MalformedProject(format!("file {} has no source", node.name))
    })?;
    let source = base_dir.join(source);
    let meta = fs::metadata(&source).map_err(|_| IsoError::SourceNotFound(source.clone()))?;
    let size = meta.len();

    let kind = match node.kind {
        FileKind::Data => EntryKind::File,
        FileKind::Xa | FileKind::Mixed => {
            check_stream_source(&source, size, false)?;
            EntryKind::Form2File
        }
        FileKind::Str => {
            if size % 2336 == 0 {
                check_stream_source(&source, size, true)?;
                EntryKind::Form2File
            } else if size % 2048 == 0 {
                EntryKind::StrVideo
            } else {
                return Err(IsoError::SourceSizeInvalid {
                    path: source,
                    reason: "STR source is not a multiple of 2336 or 2048 bytes".into(),
                });
            }
        }
        FileKind::Da => unreachable!(),
    };

    let date = entry_date(node.date, Some(source.clone()), build_date, attrs.gmt_offs());
    tree.add_file(dir, &node.name, kind, size, Some(source), date, resolved)
}

/// Rejects WAV containers and sizes that cannot hold whole 2336-byte
/// payloads.
fn check_stream_source(path: &Path, size: u64, aligned_checked: bool) -> Result<()> {
    let mut magic = [0u8; 4];
    let mut file = fs::File::open(path).map_err(|_| IsoError::SourceNotFound(path.into()))?;
    let _ = file.read(&mut magic)?;
    if &magic == b"RIFF" {
        return Err(IsoError::SourceSizeInvalid {
            path: path.into(),
            reason: "source is a WAV container, not a raw XA/STR stream".into(),
        });
    }
    if !aligned_checked && size % 2336 != 0 {
        return Err(IsoError::SourceSizeInvalid {
            path: path.into(),
            reason: "XA source is not a multiple of 2336 bytes".into(),
        });
    }
    Ok(())
}

/// Pulls a host directory's contents into the tree. Explicit project entries
/// win on name collisions.
fn populate_from_host(
    tree: &mut DirTree,
    dir: EntryId,
    host_dir: &Path,
    inherited: &EntryAttributes,
    build_date: IsoDate,
) -> Result<()> {
    let mut listing: Vec<_> = fs::read_dir(host_dir)
        .map_err(|_| IsoError::SourceNotFound(host_dir.to_path_buf()))?
        .collect::<std::io::Result<_>>()?;
    listing.sort_by_key(|e| e.file_name());

    for item in listing {
        let name = item.file_name().to_string_lossy().into_owned();
        let path = item.path();
        let meta = item.metadata()?;

        let already_there = tree
            .sorted_children(dir)
            .iter()
            .any(|id| {
                let existing = tree.entry(*id).id.as_str();
                let existing = existing.strip_suffix(";1").unwrap_or(existing);
                existing.eq_ignore_ascii_case(&name)
            });
        if already_there {
            debug!("{} already declared, skipping host copy", name);
            continue;
        }

        let date = entry_date(None, Some(path.clone()), build_date, inherited.gmt_offs());
        if meta.is_dir() {
            let sub = tree.add_dir(dir, &name, date, ResolvedAttributes::from(inherited))?;
            populate_from_host(tree, sub, &path, inherited, build_date)?;
        } else {
            tree.add_file(
                dir,
                &name,
                EntryKind::File,
                meta.len(),
                Some(path),
                date,
                ResolvedAttributes::from(inherited),
            )?;
        }
    }

    Ok(())
}

/// Explicit date, else the source's mtime, else the build clock.
fn entry_date(
    explicit: Option<IsoDate>,
    source: Option<PathBuf>,
    build_date: IsoDate,
    gmt_offs: i8,
) -> IsoDate {
    if let Some(date) = explicit {
        return date;
    }
    if let Some(path) = source
        && let Ok(meta) = fs::metadata(path)
        && let Ok(mtime) = meta.modified()
    {
        return IsoDate::from_system_time(mtime, gmt_offs);
    }
    IsoDate { gmt_offs, ..build_date }
}
