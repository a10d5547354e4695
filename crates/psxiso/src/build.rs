//! Builder orchestration.
//!
//! Planning happens entirely up front: the directory tree is built and
//! validated, LBAs are assigned, audio tracks are placed and CD-DA
//! references resolved. Only then is the output file created, sized to the
//! final LBA count, and each region written through its own sector view.
//! On failure the partial image and cue sheet are removed.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use psxcd::{ImageWriter, Msf, WriterOptions};
use tracing::{info, warn};

use crate::cue::{CueSheet, CueTrack, CueTrackKind};
use crate::datestamp::IsoDate;
use crate::layout::{assign_lbas, path_table_len};
use crate::model::{DirTree, EntryId, EntryKind, LBA_PLACEHOLDER};
use crate::pack;
use crate::project::{Project, Track};
use crate::records::write_directory_records;
use crate::volume::{self, LICENSE_DATA_SIZE, PATH_TABLE_LBA, VolumeIdentifiers};
use crate::{IsoError, Result};

/// Builder configuration, all explicit; nothing global.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Base directory for relative source paths (the project file's home).
    pub project_dir: PathBuf,
    /// Overrides the project's `image_name`.
    pub output: Option<PathBuf>,
    /// Overrides the project's `cue_sheet`.
    pub cue_file: Option<PathBuf>,
    /// Overrides the volume identifier.
    pub volume_label: Option<String>,
    /// Writes a human-readable LBA table here.
    pub lba_list: Option<PathBuf>,
    /// Writes a C header of `LBA_*` defines here.
    pub lba_header: Option<PathBuf>,
    pub overwrite: bool,
    /// Plan and produce listings without generating the image.
    pub no_image: bool,
    pub no_xa: bool,
    /// Build clock; the current time when unset.
    pub timestamp: Option<IsoDate>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            output: None,
            cue_file: None,
            volume_label: None,
            lba_list: None,
            lba_header: None,
            overwrite: false,
            no_image: false,
            no_xa: false,
            timestamp: None,
        }
    }
}

/// What a successful build produced.
#[derive(Debug)]
pub struct BuildSummary {
    pub image: Option<PathBuf>,
    pub cue: Option<PathBuf>,
    pub total_sectors: u32,
    pub files: usize,
    pub directories: usize,
}

/// One placed audio track.
struct AudioPlacement {
    source: PathBuf,
    number: u8,
    /// First audio track: virtual two-second pregap, nothing stored.
    pregap: bool,
    /// Stored 150-sector gap, later tracks only.
    gap_lba: Option<u32>,
    data_lba: u32,
    sectors: u32,
}

/// Builds a project into a disc image and cue sheet.
pub fn build(project: &Project, options: &BuildOptions) -> Result<BuildSummary> {
    let data_track = project.data_track()?;
    let xa = !(project.no_xa || options.no_xa);
    let build_date = options
        .timestamp
        .unwrap_or_else(|| IsoDate::from_system_time(SystemTime::now(), 0));

    let identifiers = data_track.identifiers.clone().unwrap_or_default();
    let creation = identifiers.creation_date.unwrap_or(build_date);
    let ids = VolumeIdentifiers {
        system: identifiers.system.unwrap_or_default(),
        volume: options
            .volume_label
            .clone()
            .or(identifiers.volume)
            .unwrap_or_default(),
        volume_set: identifiers.volume_set.unwrap_or_default(),
        publisher: identifiers.publisher.unwrap_or_default(),
        data_preparer: identifiers.data_preparer.unwrap_or_default(),
        application: identifiers.application.unwrap_or_default(),
        copyright: identifiers.copyright.unwrap_or_default(),
    };

    info!("parsing directory tree");
    let mut tree = crate::project::build_tree(data_track, &options.project_dir, build_date)?;

    let table_len = path_table_len(&tree);
    if table_len > 2048 {
        warn!("path table exceeds 2048 bytes");
    }
    let table_sectors = table_len.div_ceil(2048);
    let fs_len = assign_lbas(&mut tree, PATH_TABLE_LBA + 4 * table_sectors, xa);

    info!(
        files = tree.file_count(),
        directories = tree.dir_count(),
        sectors = fs_len,
        "filesystem planned"
    );

    let cue_path = cue_output_path(project, options);
    let placements = place_audio_tracks(
        project,
        options,
        &mut tree,
        fs_len,
        cue_path.is_some() || options.no_image,
    )?;
    let total_sectors = placements
        .last()
        .map(|p| p.data_lba + p.sectors)
        .unwrap_or(fs_len);

    // Every CD-DA reference must have found its track
    for id in tree.ids() {
        let entry = tree.entry(id);
        if let EntryKind::Cdda { track_id } = &entry.kind
            && entry.lba == LBA_PLACEHOLDER
        {
            return Err(IsoError::UnresolvedTrack(track_id.clone()));
        }
    }

    if let Some(path) = &options.lba_list {
        write_lba_listing(path, &tree)?;
        info!("wrote LBA listing {}", path.display());
    }
    if let Some(path) = &options.lba_header {
        write_lba_header(path, &tree)?;
        info!("wrote LBA header {}", path.display());
    }

    if options.no_image {
        return Ok(BuildSummary {
            image: None,
            cue: None,
            total_sectors,
            files: tree.file_count(),
            directories: tree.dir_count(),
        });
    }

    let image_path = image_output_path(project, options)?;
    if image_path.exists() && !options.overwrite {
        return Err(IsoError::ImageExists(image_path));
    }

    let result = write_image(
        &image_path,
        cue_path.as_deref(),
        project,
        options,
        &tree,
        &ids,
        creation,
        xa,
        total_sectors,
        &placements,
    );

    if let Err(error) = result {
        let _ = fs::remove_file(&image_path);
        if let Some(cue) = &cue_path {
            let _ = fs::remove_file(cue);
        }
        return Err(error);
    }

    info!(
        "image generated: {} bytes ({} sectors)",
        u64::from(total_sectors) * 2352,
        total_sectors
    );

    Ok(BuildSummary {
        image: Some(image_path),
        cue: cue_path,
        total_sectors,
        files: tree.file_count(),
        directories: tree.dir_count(),
    })
}

fn place_audio_tracks(
    project: &Project,
    options: &BuildOptions,
    tree: &mut DirTree,
    fs_len: u32,
    has_cue: bool,
) -> Result<Vec<AudioPlacement>> {
    let audio: Vec<&Track> = project.audio_tracks().collect();
    if audio.is_empty() {
        return Ok(Vec::new());
    }
    if !has_cue {
        return Err(IsoError::NoCueForAudioTrack);
    }

    let mut placements = Vec::new();
    let mut cursor = fs_len;

    for (index, track) in audio.iter().enumerate() {
        let source = track.source.as_ref().ok_or_else(|| {
            IsoError::MalformedProject("audio track has no source".into())
        })?;
        let source = options.project_dir.join(source);
        let bytes = pack::audio_size(&source)?;
        let sectors = bytes.div_ceil(2352) as u32;

        let first = index == 0;
        let (gap_lba, data_lba) = if first {
            // The two-second pregap of the first track is virtual
            (None, cursor)
        } else {
            (Some(cursor), cursor + psxcd::PREGAP_SECTORS)
        };

        if let Some(trackid) = &track.trackid {
            resolve_da_entries(tree, trackid, data_lba, bytes);
        }

        placements.push(AudioPlacement {
            source,
            number: (index + 2) as u8,
            pregap: first,
            gap_lba,
            data_lba,
            sectors,
        });
        cursor = data_lba + sectors;
    }

    Ok(placements)
}

/// Points every matching CD-DA entry at the placed track. The entry LBA is
/// the pregap start; the directory record adds the 150-sector offset back.
fn resolve_da_entries(tree: &mut DirTree, trackid: &str, data_lba: u32, bytes: u64) {
    if data_lba < psxcd::PREGAP_SECTORS {
        warn!("audio track {trackid} starts inside the first two seconds of the image");
    }
    for id in tree.ids().collect::<Vec<EntryId>>() {
        let entry = tree.entry_mut(id);
        if let EntryKind::Cdda { track_id } = &entry.kind
            && track_id == trackid
        {
            entry.lba = data_lba.saturating_sub(psxcd::PREGAP_SECTORS);
            entry.size = bytes;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn write_image(
    image_path: &Path,
    cue_path: Option<&Path>,
    project: &Project,
    options: &BuildOptions,
    tree: &DirTree,
    ids: &VolumeIdentifiers,
    creation: IsoDate,
    xa: bool,
    total_sectors: u32,
    placements: &[AudioPlacement],
) -> Result<()> {
    let mut writer = ImageWriter::create(image_path, total_sectors, WriterOptions::default())?;

    match &project.data_track()?.license {
        Some(license) => {
            let path = options.project_dir.join(&license.file);
            let data =
                fs::read(&path).map_err(|_| IsoError::SourceNotFound(path.clone()))?;
            if data.len() != LICENSE_DATA_SIZE {
                warn!(
                    "license file {} is {} bytes, expected {}",
                    path.display(),
                    data.len(),
                    LICENSE_DATA_SIZE
                );
            }
            info!("writing license data");
            volume::write_license(&mut writer, &data);
        }
        None => volume::write_blank_license_region(&mut writer),
    }

    info!("writing filesystem");
    volume::write_descriptor(&mut writer, tree, ids, creation, xa, total_sectors);
    write_directory_records(&mut writer, tree, xa);
    pack::write_file_payloads(&mut writer, tree)?;

    for placement in placements {
        if let Some(gap) = placement.gap_lba {
            let mut view = writer.view_raw(gap, psxcd::PREGAP_SECTORS);
            view.write_blank_sectors(psxcd::PREGAP_SECTORS);
        }
        let mut view = writer.view_raw(placement.data_lba, placement.sectors);
        pack::pack_audio(&mut view, &placement.source)?;
    }

    writer.finish()?;

    if let Some(cue_path) = cue_path {
        let sheet = cue_sheet(image_path, placements);
        let mut file = fs::File::create(cue_path)?;
        write!(file, "{sheet}")?;
    }

    Ok(())
}

fn cue_sheet(image_path: &Path, placements: &[AudioPlacement]) -> CueSheet {
    let image = image_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut sheet = CueSheet::data_only(image);
    for placement in placements {
        sheet.tracks.push(CueTrack {
            number: placement.number,
            kind: CueTrackKind::Audio,
            pregap: placement.pregap,
            index0: placement.gap_lba.map(Msf::from_sectors),
            index1: Msf::from_sectors(placement.data_lba),
        });
    }
    sheet
}

fn image_output_path(project: &Project, options: &BuildOptions) -> Result<PathBuf> {
    if let Some(output) = &options.output {
        return Ok(output.clone());
    }
    project
        .image_name
        .as_ref()
        .map(|name| options.project_dir.join(name))
        .ok_or_else(|| IsoError::MalformedProject("no image_name and no --output given".into()))
}

fn cue_output_path(project: &Project, options: &BuildOptions) -> Option<PathBuf> {
    if let Some(cue) = &options.cue_file {
        return Some(cue.clone());
    }
    project
        .cue_sheet
        .as_ref()
        .map(|name| options.project_dir.join(name))
}

fn write_lba_listing(path: &Path, tree: &DirTree) -> Result<()> {
    let mut out = fs::File::create(path)?;
    writeln!(out, "File LBA listing")?;
    writeln!(out)?;
    writeln!(
        out,
        "    {:<6}{:<18}{:<10}{:<10}{:<12}{:<10}Source",
        "Type", "Name", "Sectors", "LBA", "Timecode", "Bytes"
    )?;
    list_dir(&mut out, tree, tree.root())?;
    Ok(())
}

fn list_dir(out: &mut fs::File, tree: &DirTree, dir: EntryId) -> Result<()> {
    let mut children = tree.entry(dir).children.clone();
    children.sort_by_key(|id| tree.entry(*id).lba);

    for child in children {
        let entry = tree.entry(child);
        let kind = match entry.kind {
            EntryKind::File => "File",
            EntryKind::Dir => "Dir",
            EntryKind::Form2File => "XA",
            EntryKind::StrVideo => "STR",
            EntryKind::Cdda { .. } => "CDDA",
            EntryKind::Dummy { .. } => "Dummy",
        };
        let name = if entry.id.is_empty() { "<DUMMY>" } else { &entry.id };
        let source = entry
            .source
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        writeln!(
            out,
            "    {:<6}{:<18}{:<10}{:<10}{:<12}{:<10}{}",
            kind,
            name,
            entry.extent_sectors(),
            entry.recorded_lba(),
            Msf::from_sectors(entry.recorded_lba() + psxcd::PREGAP_SECTORS).to_string(),
            entry.size,
            source
        )?;

        if entry.is_dir() {
            list_dir(out, tree, child)?;
            writeln!(out, "    End   {}", tree.entry(child).id)?;
        }
    }
    Ok(())
}

fn write_lba_header(path: &Path, tree: &DirTree) -> Result<()> {
    let mut out = fs::File::create(path)?;
    writeln!(out, "#ifndef _ISO_FILES")?;
    writeln!(out, "#define _ISO_FILES")?;
    writeln!(out)?;
    header_dir(&mut out, tree, tree.root())?;
    writeln!(out)?;
    writeln!(out, "#endif")?;
    Ok(())
}

fn header_dir(out: &mut fs::File, tree: &DirTree, dir: EntryId) -> Result<()> {
    for child in tree.sorted_children(dir) {
        let entry = tree.entry(child);
        if entry.id.is_empty() || entry.is_dir() {
            continue;
        }
        let mut name = String::from("LBA_");
        for ch in entry.id.chars() {
            match ch {
                ';' => break,
                '.' => name.push('_'),
                ch => name.push(ch.to_ascii_uppercase()),
            }
        }
        writeln!(out, "#define {:<24}{}", name, entry.recorded_lba())?;
    }

    for child in tree.sorted_children(dir) {
        if tree.entry(child).is_dir() {
            header_dir(out, tree, child)?;
        }
    }
    Ok(())
}
