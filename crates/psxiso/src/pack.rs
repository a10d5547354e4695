//! Payload packing: file extents, dummy gaps and audio tracks.
//!
//! The filesystem pass walks the entry list in ascending LBA order and copies
//! each source into the sector form its kind dictates. Audio tracks are
//! written in a separate pass as raw 2352-byte PCM sectors.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use psxcd::{
    EdcEccForm, FORM2_PAYLOAD_SIZE, ImageWriter, RawSectorView, SECTOR_SIZE, SUBHEADER_DATA,
    SUBHEADER_EOF, SUBHEADER_FORM2, SUBHEADER_STR,
};
use tracing::{info, warn};

use crate::model::{DirTree, Entry, EntryKind};
use crate::{IsoError, Result};

/// Copies every file extent and dummy gap into the image.
pub fn write_file_payloads(writer: &mut ImageWriter, tree: &DirTree) -> Result<()> {
    for id in tree.ids_by_lba() {
        let entry = tree.entry(id);
        match entry.kind {
            EntryKind::File => pack_data_file(writer, entry)?,
            EntryKind::StrVideo => pack_str_video(writer, entry)?,
            EntryKind::Form2File => pack_form2_file(writer, entry)?,
            EntryKind::Dummy { form2 } => pack_dummy(writer, entry, form2),
            // Directory extents come from the record writer; audio tracks
            // from the audio pass
            EntryKind::Dir | EntryKind::Cdda { .. } => {}
        }
    }
    Ok(())
}

/// Regular data file: Form 1 sectors, EOF subheader on the last one.
fn pack_data_file(writer: &mut ImageWriter, entry: &Entry) -> Result<()> {
    let mut view = writer.view_m2f1(entry.lba, entry.extent_sectors(), EdcEccForm::Form1);
    view.set_subheader(SUBHEADER_DATA);

    let mut source = open_source(entry)?;
    info!("packing {}", entry.id);

    let mut remaining = entry.size;
    let mut buf = [0u8; 2048];
    while remaining > 0 {
        let take = remaining.min(2048) as usize;
        buf[..take].fill(0);
        read_up_to(&mut source, &mut buf[..take])?;

        if remaining <= 2048 {
            view.set_subheader(SUBHEADER_EOF);
        }
        view.write_memory(&buf[..take]);
        remaining -= take as u64;
    }

    view.finish();
    Ok(())
}

/// Data-only STR video: Form 1 sectors with the streaming subheader.
fn pack_str_video(writer: &mut ImageWriter, entry: &Entry) -> Result<()> {
    let mut view = writer.view_m2f1(entry.lba, entry.extent_sectors(), EdcEccForm::Form1);
    view.set_subheader(SUBHEADER_STR);

    let mut source = open_source(entry)?;
    info!("packing STR {}", entry.id);
    view.write_file(&mut source)?;
    view.finish();
    Ok(())
}

/// Interleaved XA/STR stream: 2336-byte payloads, per-sector form detection.
fn pack_form2_file(writer: &mut ImageWriter, entry: &Entry) -> Result<()> {
    let mut view = writer.view_m2f2(entry.lba, entry.extent_sectors(), EdcEccForm::Autodetect);

    let mut source = open_source(entry)?;
    info!("packing XA {}", entry.id);
    view.write_file(&mut source)?;
    view.finish();
    Ok(())
}

fn pack_dummy(writer: &mut ImageWriter, entry: &Entry, form2: bool) {
    let sectors = entry.extent_sectors();
    if form2 {
        // Form 2 blanks keep the Form 2 submode flag in their subheaders, so
        // the full 2336-byte payload is written out explicitly
        let mut payload = [0u8; FORM2_PAYLOAD_SIZE];
        payload[..4].copy_from_slice(&SUBHEADER_FORM2.to_le_bytes());
        payload[4..8].copy_from_slice(&SUBHEADER_FORM2.to_le_bytes());

        let mut view = writer.view_m2f2(entry.lba, sectors, EdcEccForm::Form2);
        for _ in 0..sectors {
            view.write_memory(&payload);
        }
        view.finish();
    } else {
        let mut view = writer.view_m2f1(entry.lba, sectors, EdcEccForm::Form1);
        view.set_subheader(0);
        view.write_blank_sectors(sectors);
        view.finish();
    }
}

fn open_source(entry: &Entry) -> Result<File> {
    let path = entry
        .source
        .as_deref()
        .ok_or_else(|| IsoError::MalformedProject(format!("{} has no source", entry.id)))?;
    File::open(path).map_err(|_| IsoError::SourceNotFound(path.to_path_buf()))
}

/// Byte length of the PCM data an audio source will contribute.
///
/// WAV containers are validated (44.1 kHz, 16-bit, stereo); anything else is
/// taken as raw PCM with a warning.
pub fn audio_size(path: &Path) -> Result<u64> {
    if is_riff(path)? {
        let reader = hound::WavReader::open(path)?;
        check_wav_spec(path, reader.spec())?;
        Ok(u64::from(reader.len()) * 2)
    } else {
        warn!("{} is not a WAV, packing as raw PCM", path.display());
        let meta = std::fs::metadata(path)
            .map_err(|_| IsoError::SourceNotFound(path.to_path_buf()))?;
        Ok(meta.len())
    }
}

/// Writes one audio track's PCM into a raw sector view, zero-padding the
/// final sector.
pub fn pack_audio(view: &mut RawSectorView<'_>, path: &Path) -> Result<()> {
    info!("packing audio {}", path.display());

    if is_riff(path)? {
        let mut reader = hound::WavReader::open(path)?;
        check_wav_spec(path, reader.spec())?;

        let mut buf = Vec::with_capacity(SECTOR_SIZE);
        for sample in reader.samples::<i16>() {
            buf.extend_from_slice(&sample?.to_le_bytes());
            if buf.len() == SECTOR_SIZE {
                view.write_memory(&buf);
                buf.clear();
            }
        }
        view.write_memory(&buf);
    } else {
        let mut file =
            File::open(path).map_err(|_| IsoError::SourceNotFound(path.to_path_buf()))?;
        let mut buf = [0u8; 16 * SECTOR_SIZE];
        loop {
            let n = read_up_to(&mut file, &mut buf)?;
            if n == 0 {
                break;
            }
            view.write_memory(&buf[..n]);
        }
    }

    view.pad_sector();
    Ok(())
}

fn is_riff(path: &Path) -> Result<bool> {
    let mut file = File::open(path).map_err(|_| IsoError::SourceNotFound(path.to_path_buf()))?;
    let mut magic = [0u8; 12];
    let n = read_up_to(&mut file, &mut magic)?;
    Ok(n == 12 && &magic[..4] == b"RIFF" && &magic[8..] == b"WAVE")
}

fn check_wav_spec(path: &Path, spec: hound::WavSpec) -> Result<()> {
    if spec.channels != 2
        || spec.sample_rate != 44_100
        || spec.bits_per_sample != 16
        || spec.sample_format != hound::SampleFormat::Int
    {
        return Err(IsoError::SourceSizeInvalid {
            path: path.to_path_buf(),
            reason: "only 44.1 kHz 16-bit stereo WAV audio is supported".into(),
        });
    }
    Ok(())
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
