//! Memory-mapped disc image writer.
//!
//! The output file is sized up front to `2352 × total LBA` and mapped once.
//! Writers hand out exclusive [`SectorView`]s over LBA ranges; a view streams
//! payload bytes into consecutive sectors, stamps each finished sector's
//! header, and defers EDC/ECC generation into batches that are encoded across
//! the rayon pool. Checksum work touches only the view's own sectors, so the
//! batches run without any locking.

use std::fs::OpenOptions;
use std::io::Read;
use std::path::Path;

use memmap2::MmapMut;
use rayon::prelude::*;

use crate::codec::SectorCodec;
use crate::{FORM1_DATA_SIZE, FORM2_PAYLOAD_SIZE, Result, SECTOR_SIZE};

/// Sectors accumulated before a view hands a batch to the rayon pool.
const CHECKSUM_BATCH: usize = 512;

/// Below this many pending sectors the batch is encoded inline; the fan-out
/// overhead dominates for tiny directory extents.
const PARALLEL_THRESHOLD: usize = 32;

/// Checksum treatment for sectors finalized by a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdcEccForm {
    /// EDC + P/Q parity (regular data sectors).
    Form1,
    /// EDC only, no parity (XA audio / STR audio sectors).
    Form2,
    /// Decide per sector from the Form 2 submode bit of the payload's own
    /// subheader. Used for interleaved XA/STR streams.
    Autodetect,
}

/// Writer-wide knobs.
#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    /// Whether Form 2 sectors get an EDC word; zero-filled when disabled.
    pub form2_edc: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self { form2_edc: true }
    }
}

/// Fully resolved per-sector encode job.
#[derive(Debug, Clone, Copy)]
enum SectorJob {
    Form1,
    Form2 { edc: bool },
}

/// A disc image being assembled in place.
pub struct ImageWriter {
    map: MmapMut,
    codec: SectorCodec,
    size_lba: u32,
    form2_edc: bool,
}

impl ImageWriter {
    /// Creates `path` sized to `size_lba` sectors and maps it read/write.
    pub fn create(path: impl AsRef<Path>, size_lba: u32, options: WriterOptions) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(u64::from(size_lba) * SECTOR_SIZE as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            map,
            codec: SectorCodec::new(),
            size_lba,
            form2_edc: options.form2_edc,
        })
    }

    /// Total image size in sectors.
    pub fn size_lba(&self) -> u32 {
        self.size_lba
    }

    /// A view writing Mode 2 Form 1 sector layouts (2048-byte payloads).
    pub fn view_m2f1(&mut self, offset_lba: u32, size_lba: u32, form: EdcEccForm) -> SectorView<'_> {
        let form2_edc = self.form2_edc;
        let (data, codec) = self.range(offset_lba, size_lba);
        SectorView::new(data, codec, offset_lba, FORM1_DATA_SIZE, form, form2_edc)
    }

    /// A view writing Mode 2 Form 2 sector layouts (2336-byte payloads that
    /// carry their own subheaders).
    pub fn view_m2f2(&mut self, offset_lba: u32, size_lba: u32, form: EdcEccForm) -> SectorView<'_> {
        let form2_edc = self.form2_edc;
        let (data, codec) = self.range(offset_lba, size_lba);
        SectorView::new(data, codec, offset_lba, FORM2_PAYLOAD_SIZE, form, form2_edc)
    }

    /// A view writing raw 2352-byte sectors verbatim (CD-DA).
    pub fn view_raw(&mut self, offset_lba: u32, size_lba: u32) -> RawSectorView<'_> {
        let (data, _) = self.range(offset_lba, size_lba);
        RawSectorView { data, offset: 0 }
    }

    /// Flushes the mapping to disk.
    pub fn finish(self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    fn range(&mut self, offset_lba: u32, size_lba: u32) -> (&mut [u8], &SectorCodec) {
        assert!(
            offset_lba + size_lba <= self.size_lba,
            "sector view [{offset_lba}, {}) exceeds image of {} sectors",
            offset_lba + size_lba,
            self.size_lba,
        );
        let start = offset_lba as usize * SECTOR_SIZE;
        let end = (offset_lba + size_lba) as usize * SECTOR_SIZE;
        let Self { map, codec, .. } = self;
        (&mut map[start..end], codec)
    }
}

/// Streaming writer over a contiguous LBA range.
///
/// Bytes written land in the user-data region of the current sector; filling
/// it finalizes the sector (header, subheader, zero padding) and queues its
/// checksum job. Sectors finalize in strictly increasing LBA order. Dropping
/// the view finalizes a partially written sector and blocks until every
/// queued checksum job has run.
pub struct SectorView<'a> {
    data: &'a mut [u8],
    codec: &'a SectorCodec,
    start_lba: u32,
    payload_size: usize,
    form: EdcEccForm,
    form2_edc: bool,
    subheader: [u8; 4],
    sector: usize,
    offset: usize,
    jobs: Vec<SectorJob>,
    encoded: usize,
}

impl<'a> SectorView<'a> {
    fn new(
        data: &'a mut [u8],
        codec: &'a SectorCodec,
        start_lba: u32,
        payload_size: usize,
        form: EdcEccForm,
        form2_edc: bool,
    ) -> Self {
        Self {
            data,
            codec,
            start_lba,
            payload_size,
            form,
            form2_edc,
            subheader: [0; 4],
            sector: 0,
            offset: 0,
            jobs: Vec::new(),
            encoded: 0,
        }
    }

    /// Sets the logical subheader stamped (twice) into subsequent Form 1
    /// layout sectors. Ignored by Form 2 layouts, whose payloads carry their
    /// own subheaders.
    pub fn set_subheader(&mut self, subheader: u32) {
        self.subheader = subheader.to_le_bytes();
    }

    /// Bytes still free in the current sector's user-data region.
    pub fn space_in_current_sector(&self) -> usize {
        self.payload_size - self.offset
    }

    /// Copies `bytes` into consecutive sectors. Writing nothing is a no-op;
    /// writing past the view's end is a programmer error and panics.
    pub fn write_memory(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            assert!(
                self.sector * SECTOR_SIZE < self.data.len(),
                "write past the end of a sector view at LBA {}",
                self.start_lba as usize + self.sector,
            );

            let take = bytes.len().min(self.space_in_current_sector());
            let payload_start = self.sector * SECTOR_SIZE + self.payload_offset();
            let dest = payload_start + self.offset;
            self.data[dest..dest + take].copy_from_slice(&bytes[..take]);
            self.offset += take;
            bytes = &bytes[take..];

            if self.offset == self.payload_size {
                self.finalize_sector();
            }
        }
    }

    /// Streams `reader` to the view in whole-sector chunks until EOF,
    /// zero-padding a trailing partial sector. Returns the bytes consumed.
    pub fn write_file<R: Read>(&mut self, reader: &mut R) -> Result<u64> {
        let mut buf = vec![0u8; self.payload_size];
        let mut total = 0u64;

        loop {
            let n = read_up_to(reader, &mut buf)?;
            if n == 0 {
                break;
            }
            self.write_memory(&buf[..n]);
            total += n as u64;
            if n < buf.len() {
                break;
            }
        }

        Ok(total)
    }

    /// Finalizes `count` blank sectors (zero payload, headers and checksums
    /// still written). The view must sit on a sector boundary.
    pub fn write_blank_sectors(&mut self, count: u32) {
        debug_assert_eq!(self.offset, 0, "write_blank_sectors mid-sector");
        for _ in 0..count {
            assert!(
                self.sector * SECTOR_SIZE < self.data.len(),
                "blank sector past the end of a sector view at LBA {}",
                self.start_lba as usize + self.sector,
            );
            self.finalize_sector();
        }
    }

    /// Zero-pads and finalizes the current sector.
    pub fn next_sector(&mut self) {
        self.finalize_sector();
    }

    /// Finalizes any partially written sector and blocks until all queued
    /// checksum jobs have completed. Equivalent to dropping the view.
    pub fn finish(self) {}

    fn payload_offset(&self) -> usize {
        // Form 1 layouts place user data after the stamped subheader;
        // Form 2 payloads start right after the header and bring their own.
        if self.payload_size == FORM1_DATA_SIZE { 24 } else { 16 }
    }

    fn finalize_sector(&mut self) {
        let lba = self.start_lba + self.sector as u32;
        let base = self.sector * SECTOR_SIZE;
        let payload_start = self.payload_offset();
        let sector = &mut self.data[base..base + SECTOR_SIZE];

        self.codec.write_header(sector, lba);

        if self.payload_size == FORM1_DATA_SIZE {
            sector[16..20].copy_from_slice(&self.subheader);
            sector[20..24].copy_from_slice(&self.subheader);
        }

        // Zero from the end of the written payload through the checksum
        // area; the encode input must never contain stale bytes
        sector[payload_start + self.offset..].fill(0);

        let job = match self.form {
            EdcEccForm::Form1 => SectorJob::Form1,
            EdcEccForm::Form2 => SectorJob::Form2 { edc: self.form2_edc },
            EdcEccForm::Autodetect => {
                if SectorCodec::payload_is_form2(&sector[16..]) {
                    SectorJob::Form2 { edc: self.form2_edc }
                } else {
                    SectorJob::Form1
                }
            }
        };
        self.jobs.push(job);

        self.sector += 1;
        self.offset = 0;

        if self.jobs.len() - self.encoded >= CHECKSUM_BATCH {
            self.run_checksum_jobs();
        }
    }

    fn run_checksum_jobs(&mut self) {
        let pending = self.jobs.len() - self.encoded;
        if pending == 0 {
            return;
        }

        let start = self.encoded * SECTOR_SIZE;
        let end = self.jobs.len() * SECTOR_SIZE;
        let region = &mut self.data[start..end];
        let jobs = &self.jobs[self.encoded..];
        let codec = self.codec;

        let encode = |(chunk, job): (&mut [u8], &SectorJob)| {
            let sector: &mut [u8; SECTOR_SIZE] = chunk.try_into().unwrap();
            match *job {
                SectorJob::Form1 => codec.encode_mode2_form1(sector),
                SectorJob::Form2 { edc } => codec.encode_mode2_form2(sector, edc),
            }
        };

        if pending >= PARALLEL_THRESHOLD {
            region
                .par_chunks_exact_mut(SECTOR_SIZE)
                .zip(jobs.par_iter())
                .for_each(encode);
        } else {
            region.chunks_exact_mut(SECTOR_SIZE).zip(jobs).for_each(encode);
        }

        self.encoded = self.jobs.len();
    }
}

impl Drop for SectorView<'_> {
    fn drop(&mut self) {
        if self.offset > 0 {
            self.finalize_sector();
        }
        self.run_checksum_jobs();
    }
}

/// A view writing verbatim 2352-byte sectors; no header, no checksums.
pub struct RawSectorView<'a> {
    data: &'a mut [u8],
    offset: usize,
}

impl RawSectorView<'_> {
    /// Copies raw bytes into the view.
    pub fn write_memory(&mut self, bytes: &[u8]) {
        assert!(
            self.offset + bytes.len() <= self.data.len(),
            "raw write past the end of a sector view",
        );
        self.data[self.offset..self.offset + bytes.len()].copy_from_slice(bytes);
        self.offset += bytes.len();
    }

    /// Zero-fills `count` whole sectors.
    pub fn write_blank_sectors(&mut self, count: u32) {
        let len = count as usize * SECTOR_SIZE;
        assert!(self.offset + len <= self.data.len());
        self.data[self.offset..self.offset + len].fill(0);
        self.offset += len;
    }

    /// Zero-pads the current sector to its 2352-byte boundary, if partial.
    pub fn pad_sector(&mut self) {
        let partial = self.offset % SECTOR_SIZE;
        if partial != 0 {
            let pad = SECTOR_SIZE - partial;
            self.data[self.offset..self.offset + pad].fill(0);
            self.offset += pad;
        }
    }
}

/// Reads until `buf` is full or the source is exhausted.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FORM1_EDC_OFFSET, FORM2_EDC_OFFSET, SYNC_PATTERN};
    use crate::{SUBHEADER_DATA, SUBHEADER_EOF, SUBHEADER_FORM2};

    fn build_image(size_lba: u32, write: impl FnOnce(&mut ImageWriter)) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.bin");
        let mut writer = ImageWriter::create(&path, size_lba, WriterOptions::default()).unwrap();
        write(&mut writer);
        writer.finish().unwrap();
        std::fs::read(&path).unwrap()
    }

    #[test]
    fn image_is_sized_up_front() {
        let image = build_image(4, |_| {});
        assert_eq!(image.len(), 4 * SECTOR_SIZE);
    }

    #[test]
    fn sector_offset_is_lba_times_2352() {
        let image = build_image(4, |writer| {
            let mut view = writer.view_m2f1(2, 1, EdcEccForm::Form1);
            view.set_subheader(SUBHEADER_DATA);
            view.write_memory(b"abc");
        });

        let base = 2 * SECTOR_SIZE;
        assert_eq!(&image[base..base + 12], &SYNC_PATTERN);
        assert_eq!(image[base + 15], 0x02);
        assert_eq!(&image[base + 16..base + 24], &[0, 0, 8, 0, 0, 0, 8, 0]);
        assert_eq!(&image[base + 24..base + 27], b"abc");
        // Zero padding up to the EDC word
        assert!(image[base + 27..base + FORM1_EDC_OFFSET].iter().all(|&b| b == 0));
    }

    #[test]
    fn form1_sectors_carry_valid_checksums() {
        let image = build_image(2, |writer| {
            let mut view = writer.view_m2f1(0, 2, EdcEccForm::Form1);
            view.set_subheader(SUBHEADER_DATA);
            view.write_memory(&[0x41u8; 3000]);
        });

        let codec = SectorCodec::new();
        for lba in 0..2usize {
            let sector = &image[lba * SECTOR_SIZE..(lba + 1) * SECTOR_SIZE];
            let edc = codec.edc_partial(0, &sector[16..FORM1_EDC_OFFSET]);
            assert_eq!(edc.to_le_bytes(), sector[FORM1_EDC_OFFSET..FORM1_EDC_OFFSET + 4]);

            let mut copy: [u8; SECTOR_SIZE] = sector.try_into().unwrap();
            codec.encode_mode2_form1(&mut copy);
            assert_eq!(&copy[..], sector);
        }
    }

    #[test]
    fn partial_sector_finalizes_on_drop() {
        let image = build_image(1, |writer| {
            let mut view = writer.view_m2f1(0, 1, EdcEccForm::Form1);
            view.set_subheader(SUBHEADER_EOF);
            view.write_memory(&[0x41]);
        });

        assert_eq!(image[24], 0x41);
        assert!(image[25..FORM1_EDC_OFFSET].iter().all(|&b| b == 0));
        assert_ne!(&image[FORM1_EDC_OFFSET..FORM1_EDC_OFFSET + 4], &[0u8; 4]);
    }

    #[test]
    fn form2_payload_keeps_its_own_subheader() {
        let mut payload = vec![0u8; FORM2_PAYLOAD_SIZE];
        payload[..8].copy_from_slice(&[0x01, 0x02, 0x64, 0x00, 0x01, 0x02, 0x64, 0x00]);
        payload[100] = 0x77;

        let image = build_image(1, |writer| {
            let mut view = writer.view_m2f2(0, 1, EdcEccForm::Form2);
            view.write_memory(&payload);
        });

        assert_eq!(&image[16..24], &payload[..8]);
        assert_eq!(image[116], 0x77);

        let codec = SectorCodec::new();
        let edc = codec.edc_partial(0, &image[16..FORM2_EDC_OFFSET]);
        assert_eq!(edc.to_le_bytes(), image[FORM2_EDC_OFFSET..SECTOR_SIZE]);
    }

    #[test]
    fn autodetect_splits_on_submode_bit() {
        // First payload Form 1 (video), second Form 2 (audio)
        let mut video = vec![0u8; FORM2_PAYLOAD_SIZE];
        video[..8].copy_from_slice(&[0x01, 0x01, 0x48, 0x00, 0x01, 0x01, 0x48, 0x00]);
        let mut audio = vec![0u8; FORM2_PAYLOAD_SIZE];
        audio[..8].copy_from_slice(&[0x01, 0x01, 0x64, 0x00, 0x01, 0x01, 0x64, 0x00]);

        let image = build_image(2, |writer| {
            let mut view = writer.view_m2f2(0, 2, EdcEccForm::Autodetect);
            view.write_memory(&video);
            view.write_memory(&audio);
        });

        // The video sector got P parity, the audio sector did not
        let video_out = &image[..SECTOR_SIZE];
        let audio_out = &image[SECTOR_SIZE..2 * SECTOR_SIZE];
        assert!(video_out[2076..2248].iter().any(|&b| b != 0));

        let codec = SectorCodec::new();
        let edc = codec.edc_partial(0, &audio_out[16..FORM2_EDC_OFFSET]);
        assert_eq!(edc.to_le_bytes(), audio_out[FORM2_EDC_OFFSET..]);
    }

    #[test]
    fn blank_sectors_are_checksummed() {
        let image = build_image(3, |writer| {
            let mut view = writer.view_m2f1(0, 3, EdcEccForm::Form1);
            view.write_blank_sectors(3);
        });

        let codec = SectorCodec::new();
        for lba in 0..3usize {
            let sector = &image[lba * SECTOR_SIZE..(lba + 1) * SECTOR_SIZE];
            assert_eq!(&sector[..12], &SYNC_PATTERN);
            assert_eq!(sector[15], 0x02);
            // Zero payload checksums to zero, and the encode is a fixpoint
            let mut copy: [u8; SECTOR_SIZE] = sector.try_into().unwrap();
            codec.encode_mode2_form1(&mut copy);
            assert_eq!(&copy[..], sector);
        }
    }

    #[test]
    fn form2_blank_sectors_zero_the_full_edc_window() {
        let image = build_image(2, |writer| {
            let mut view = writer.view_m2f1(0, 2, EdcEccForm::Form2);
            view.set_subheader(SUBHEADER_FORM2);
            view.write_blank_sectors(2);
        });

        let codec = SectorCodec::new();
        for lba in 0..2usize {
            let sector = &image[lba * SECTOR_SIZE..(lba + 1) * SECTOR_SIZE];
            assert_eq!(&sector[16..24], &[0, 0, 0x20, 0, 0, 0, 0x20, 0]);
            // The EDC window reaches past the 2048-byte payload; all of it
            // must be zero before the checksum lands
            assert!(sector[24..FORM2_EDC_OFFSET].iter().all(|&b| b == 0));
            let edc = codec.edc_partial(0, &sector[16..FORM2_EDC_OFFSET]);
            assert_eq!(edc.to_le_bytes(), sector[FORM2_EDC_OFFSET..]);
        }
    }

    #[test]
    #[should_panic(expected = "write past the end")]
    fn writing_past_view_end_panics() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overflow.bin");
        let mut writer = ImageWriter::create(&path, 1, WriterOptions::default()).unwrap();
        let mut view = writer.view_m2f1(0, 1, EdcEccForm::Form1);
        view.write_memory(&vec![0u8; FORM1_DATA_SIZE + 1]);
    }

    #[test]
    fn raw_view_is_verbatim() {
        let image = build_image(2, |writer| {
            let mut view = writer.view_raw(0, 2);
            view.write_memory(&[0xAA; 100]);
            view.pad_sector();
            view.write_blank_sectors(1);
        });

        assert_eq!(&image[..100], &[0xAA; 100]);
        assert!(image[100..].iter().all(|&b| b == 0));
    }
}
