//! Image extractor.
//!
//! Walks an existing image's filesystem, writes every entry out as a loose
//! file in the form its XA attributes dictate, and can emit a project
//! description that rebuilds a byte-identical image: entries appear in LBA
//! order, gaps become dummy entries, record datestamps ride along as
//! explicit dates, and CD-DA entries become audio tracks.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use psxcd::{DirRecord, ImageReader, InferredKind};
use tracing::{info, warn};

use crate::attr::EntryAttributes;
use crate::datestamp::IsoDate;
use crate::project::{
    DirNode, DummyNode, FileKind, FileNode, Identifiers, License, Node, Project, Track, TrackType,
};
use crate::{IsoError, Result};

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub out_dir: PathBuf,
    /// Emit a rebuildable project description here.
    pub script: Option<PathBuf>,
}

#[derive(Debug)]
pub struct ExtractSummary {
    pub files: usize,
    pub skipped: usize,
}

/// One walked filesystem object.
struct Item {
    record: DirRecord,
    /// Directory the entry lives in, relative to the extraction root.
    parent_path: PathBuf,
    kind: InferredKind,
}

impl Item {
    fn output_path(&self) -> PathBuf {
        self.parent_path.join(self.record.clean_identifier())
    }

    /// Image sectors the entry's extent spans.
    fn extent_sectors(&self) -> u32 {
        self.record.size.div_ceil(2048)
    }
}

/// Extracts `image` into `options.out_dir`.
pub fn extract(image: &Path, options: &ExtractOptions) -> Result<ExtractSummary> {
    let reader = ImageReader::open(image)?;
    let pvd = reader
        .read_volume_descriptor()
        .map_err(|_| IsoError::ImageTruncated)?;

    info!("volume      : {}", pvd.volume_id);
    info!("system      : {}", pvd.system_id);
    info!("publisher   : {}", pvd.publisher_id);

    fs::create_dir_all(&options.out_dir)?;

    // License region ahead of the descriptors
    let license = reader.read_form2(0, 12);
    let has_license = license.iter().any(|&b| b != 0);
    if has_license {
        fs::write(options.out_dir.join("license_data.dat"), &license)?;
        info!("wrote license_data.dat");
    }

    // Pre-create the directory hierarchy from the path table
    let table = reader.read_path_table(pvd.path_table_lba, pvd.path_table_size);
    for index in 0..table.len() {
        let dir = options.out_dir.join(path_table_dir(&table, index));
        fs::create_dir_all(&dir)?;
    }

    let mut items = Vec::new();
    walk(
        &reader,
        pvd.root_lba,
        pvd.root_size.div_ceil(2048),
        &PathBuf::new(),
        0,
        &mut items,
    );

    let mut summary = ExtractSummary { files: 0, skipped: 0 };
    for item in &items {
        if item.kind == InferredKind::Directory {
            continue;
        }
        match extract_item(&reader, item, &options.out_dir) {
            Ok(()) => summary.files += 1,
            Err(error) => {
                warn!("skipping {}: {error}", item.record.identifier);
                summary.skipped += 1;
            }
        }
    }
    info!(
        "extracted {} files ({} skipped)",
        summary.files, summary.skipped
    );

    if let Some(script) = &options.script {
        let root_date = reader
            .read_dir_records(pvd.root_lba, 1)
            .first()
            .map(|record| IsoDate::from_record_bytes(record.date));
        let project = emit_project(&reader, &pvd, root_date, has_license, &items);
        fs::write(script, project.to_json())?;
        info!("wrote project description {}", script.display());
    }

    Ok(summary)
}

/// Full path of a path-table directory, following parent indices.
fn path_table_dir(table: &[psxcd::PathTableEntry], mut index: usize) -> PathBuf {
    let mut parts = Vec::new();
    loop {
        let entry = &table[index];
        if entry.name.is_empty() || entry.parent == 0 {
            break;
        }
        parts.push(entry.name.clone());
        index = usize::from(entry.parent) - 1;
    }
    parts.iter().rev().collect()
}

fn walk(
    reader: &ImageReader,
    lba: u32,
    sectors: u32,
    path: &PathBuf,
    depth: usize,
    items: &mut Vec<Item>,
) {
    if depth > 8 {
        warn!("directory nesting deeper than 8 levels at {}", path.display());
        return;
    }

    // The first two records are `.` and `..`
    for record in reader.read_dir_records(lba, sectors).into_iter().skip(2) {
        if record.is_dot_entry() {
            continue;
        }
        let name = record.clean_identifier();
        if name.contains(['/', '\\']) || name == ".." {
            warn!("skipping entry with unsafe identifier {name:?}");
            continue;
        }

        // The record flags decide the structure; the XA attributes decide
        // the extraction form
        let kind = if record.flags & 0x02 != 0 {
            InferredKind::Directory
        } else {
            match record.xa {
                Some(xa) => xa.inferred_kind(),
                None => InferredKind::Data,
            }
        };

        if kind == InferredKind::Directory {
            let sub_path = path.join(name);
            walk(
                reader,
                record.lba,
                record.size.div_ceil(2048),
                &sub_path,
                depth + 1,
                items,
            );
        }

        items.push(Item {
            record,
            parent_path: path.clone(),
            kind,
        });
    }
}

fn extract_item(reader: &ImageReader, item: &Item, out_dir: &Path) -> Result<()> {
    let path = out_dir.join(item.output_path());
    let record = &item.record;
    info!("extracting {}", item.output_path().display());

    match item.kind {
        InferredKind::Data => {
            fs::write(&path, reader.read_data(record.lba, u64::from(record.size)))?;
        }
        InferredKind::Form2 => {
            // Form 2 payloads: 2336 bytes per recorded 2048-byte sector
            fs::write(&path, reader.read_form2(record.lba, item.extent_sectors()))?;
        }
        InferredKind::Cdda => {
            let pcm = reader.read_raw(record.lba, item.extent_sectors());
            write_cdda_wav(&path, &pcm)?;
        }
        InferredKind::Directory => {}
    }
    Ok(())
}

/// Wraps raw CD-DA PCM in a RIFF/WAVE container.
fn write_cdda_wav(path: &Path, pcm: &[u8]) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: 44_100,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for sample in pcm.chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([sample[0], sample[1]]))?;
    }
    writer.finalize()?;
    Ok(())
}

/// Rebuildable project description for the walked image.
fn emit_project(
    reader: &ImageReader,
    pvd: &psxcd::VolumeDescriptor,
    root_date: Option<IsoDate>,
    has_license: bool,
    items: &[Item],
) -> Project {
    let mut sorted: Vec<&Item> = items.iter().collect();
    sorted.sort_by_key(|item| item.record.lba);

    // Directory nodes build up in an arena; each child dir occupies a
    // placeholder slot in its parent until the fold at the end.
    let mut dirs: Vec<DirNode> = vec![DirNode {
        date: root_date,
        ..Default::default()
    }];
    let mut slots: Vec<(usize, usize)> = vec![(0, 0)];
    let mut dir_index: HashMap<PathBuf, usize> = HashMap::from([(PathBuf::new(), 0)]);

    let mut audio_tracks = Vec::new();
    let mut expected = pvd.root_lba + pvd.root_size.div_ceil(2048);

    for item in &sorted {
        let parent = dir_index.get(&item.parent_path).copied().unwrap_or(0);
        let record = &item.record;

        if item.kind == InferredKind::Cdda {
            // The two-second pregap precedes the audio data
            expected += psxcd::PREGAP_SECTORS;
        }
        if record.lba > expected {
            dirs[parent].entries.push(Node::Dummy(DummyNode {
                sectors: record.lba - expected,
                form: 0,
            }));
        }
        expected = record.lba + item.extent_sectors();

        let date = Some(IsoDate::from_record_bytes(record.date));
        let attributes = record
            .xa
            .map(|xa| EntryAttributes {
                gmt_offs: None,
                xa_attrib: (item.kind == InferredKind::Form2)
                    .then_some((xa.attributes >> 8) as u8),
                xa_perm: Some(xa.permissions()),
                xa_gid: Some(xa.group_id),
                xa_uid: Some(xa.user_id),
            })
            .unwrap_or_default();

        match item.kind {
            InferredKind::Directory => {
                let node = DirNode {
                    name: Some(record.clean_identifier().to_string()),
                    source: None,
                    date,
                    attributes,
                    entries: Vec::new(),
                };
                dirs.push(node);
                let index = dirs.len() - 1;
                dirs[parent].entries.push(Node::Dir(DirNode::default()));
                slots.push((parent, dirs[parent].entries.len() - 1));
                dir_index.insert(item.output_path(), index);
            }
            kind => {
                let (file_kind, trackid) = match kind {
                    InferredKind::Form2 => (FileKind::Mixed, None),
                    InferredKind::Cdda => {
                        let trackid = format!("{:02}", audio_tracks.len() + 2);
                        audio_tracks.push(Track {
                            track_type: TrackType::Audio,
                            source: Some(item.output_path()),
                            trackid: Some(trackid.clone()),
                            identifiers: None,
                            license: None,
                            default_attributes: None,
                            directory_tree: None,
                        });
                        (FileKind::Da, Some(trackid))
                    }
                    _ => (FileKind::Data, None),
                };

                dirs[parent].entries.push(Node::File(FileNode {
                    name: record.clean_identifier().to_string(),
                    source: (file_kind != FileKind::Da).then(|| item.output_path()),
                    kind: file_kind,
                    trackid,
                    date,
                    attributes,
                }));
            }
        }
    }

    // Anything between the last extent and the end of the image is a gap
    let total = reader.total_sectors();
    if total > expected {
        dirs[0].entries.push(Node::Dummy(DummyNode {
            sectors: total - expected,
            form: 0,
        }));
    }

    // Fold children into their parents, deepest first
    for index in (1..dirs.len()).rev() {
        let node = std::mem::take(&mut dirs[index]);
        let (parent, slot) = slots[index];
        dirs[parent].entries[slot] = Node::Dir(node);
    }
    let root = std::mem::take(&mut dirs[0]);

    let identifiers = Identifiers {
        system: non_empty(&pvd.system_id),
        volume: non_empty(&pvd.volume_id),
        volume_set: non_empty(&pvd.volume_set_id),
        publisher: non_empty(&pvd.publisher_id),
        data_preparer: non_empty(&pvd.data_preparer_id),
        application: non_empty(&pvd.application_id),
        copyright: non_empty(&pvd.copyright_file_id),
        creation_date: parse_long_date(&pvd.creation_date),
    };

    let data_track = Track {
        track_type: TrackType::Data,
        source: None,
        trackid: None,
        identifiers: Some(identifiers),
        license: has_license.then(|| License {
            file: PathBuf::from("license_data.dat"),
        }),
        default_attributes: None,
        directory_tree: Some(root),
    };

    let mut tracks = vec![data_track];
    tracks.extend(audio_tracks);

    Project {
        image_name: None,
        cue_sheet: None,
        no_xa: false,
        tracks,
    }
}

fn non_empty(text: &str) -> Option<String> {
    (!text.is_empty()).then(|| text.to_string())
}

/// Parses the 17-byte long datestamp; `None` when unspecified.
fn parse_long_date(raw: &[u8; 17]) -> Option<IsoDate> {
    let digits = std::str::from_utf8(&raw[..16]).ok()?;
    if digits.chars().all(|c| c == '0') {
        return None;
    }
    let year: u16 = digits[0..4].parse().ok()?;
    Some(IsoDate {
        year: year.checked_sub(1900)? as u8,
        month: digits[4..6].parse().ok()?,
        day: digits[6..8].parse().ok()?,
        hour: digits[8..10].parse().ok()?,
        minute: digits[10..12].parse().ok()?,
        second: digits[12..14].parse().ok()?,
        gmt_offs: raw[16] as i8,
    })
}
