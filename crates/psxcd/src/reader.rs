//! Disc image reader.
//!
//! Opens an existing `.bin` image read-only through a memory map and exposes
//! the ISO 9660 / CD-XA structures needed to walk it: the primary volume
//! descriptor, path tables and directory records with their XA attribute
//! blocks. Payload reads filter out the sector framing (sync, address, mode,
//! checksums); reads past the end of a truncated image are zero-padded, which
//! is what a drive reading a pressed disc would return.

use std::fs::File;
use std::path::Path;

use bitflags::bitflags;
use memmap2::Mmap;
use tracing::debug;

use crate::{CdError, FORM1_DATA_SIZE, FORM2_PAYLOAD_SIZE, Result, SECTOR_SIZE};

/// A read-only mapped disc image.
pub struct ImageReader {
    _file: File,
    map: Mmap,
    total_sectors: u32,
}

impl ImageReader {
    /// Opens a raw 2352-byte-per-sector image.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let map = unsafe { Mmap::map(&file)? };

        let total_sectors = map.len().div_ceil(SECTOR_SIZE) as u32;
        debug!(
            sectors = total_sectors,
            path = %path.as_ref().display(),
            "opened disc image"
        );

        Ok(Self {
            _file: file,
            map,
            total_sectors,
        })
    }

    /// Number of sectors in the image (a truncated tail counts as one).
    pub fn total_sectors(&self) -> u32 {
        self.total_sectors
    }

    /// Reads `size` bytes of user data starting at `lba`, 2048 bytes per
    /// sector.
    pub fn read_data(&self, lba: u32, size: u64) -> Vec<u8> {
        self.read_region(lba, size, 24, FORM1_DATA_SIZE)
    }

    /// Reads `sectors` Form 2 payloads (subheader + data + EDC, 2336 bytes
    /// per sector) starting at `lba`.
    pub fn read_form2(&self, lba: u32, sectors: u32) -> Vec<u8> {
        let size = u64::from(sectors) * FORM2_PAYLOAD_SIZE as u64;
        self.read_region(lba, size, 16, FORM2_PAYLOAD_SIZE)
    }

    /// Reads `sectors` raw 2352-byte sectors starting at `lba`.
    pub fn read_raw(&self, lba: u32, sectors: u32) -> Vec<u8> {
        let size = u64::from(sectors) * SECTOR_SIZE as u64;
        self.read_region(lba, size, 0, SECTOR_SIZE)
    }

    fn read_region(&self, lba: u32, size: u64, skip: usize, stride: usize) -> Vec<u8> {
        let mut out = vec![0u8; size as usize];
        let mut copied = 0usize;
        let mut sector = lba as u64;

        while copied < out.len() {
            let take = stride.min(out.len() - copied);
            let start = sector as usize * SECTOR_SIZE + skip;
            let end = (start + take).min(self.map.len());
            if start < self.map.len() {
                out[copied..copied + (end - start)].copy_from_slice(&self.map[start..end]);
            }
            copied += take;
            sector += 1;
        }

        out
    }

    /// Parses the primary volume descriptor at LBA 16.
    pub fn read_volume_descriptor(&self) -> Result<VolumeDescriptor> {
        VolumeDescriptor::parse(&self.read_data(16, FORM1_DATA_SIZE as u64))
    }

    /// Reads the little-endian path table, yielding entries in table order.
    pub fn read_path_table(&self, lba: u32, table_size: u32) -> Vec<PathTableEntry> {
        let data = self.read_data(lba, u64::from(table_size));
        let mut entries = Vec::new();
        let mut offset = 0usize;

        while offset + 8 <= data.len() {
            let name_len = data[offset] as usize;
            if name_len == 0 {
                break;
            }

            let dir_lba = u32::from_le_bytes([
                data[offset + 2],
                data[offset + 3],
                data[offset + 4],
                data[offset + 5],
            ]);
            let parent = u16::from_le_bytes([data[offset + 6], data[offset + 7]]);

            let name_end = (offset + 8 + name_len).min(data.len());
            let raw_name = &data[offset + 8..name_end];
            // The root entry's name is a single NUL
            let name = String::from_utf8_lossy(raw_name)
                .trim_end_matches('\0')
                .to_string();

            entries.push(PathTableEntry {
                name,
                lba: dir_lba,
                parent,
            });

            // Odd-length names are followed by a pad byte
            offset += 8 + name_len + (name_len & 1);
        }

        entries
    }

    /// Reads every record of a directory extent, including `.` and `..`.
    pub fn read_dir_records(&self, lba: u32, sectors: u32) -> Vec<DirRecord> {
        let mut records = Vec::new();

        for sec in 0..sectors {
            let data = self.read_data(lba + sec, FORM1_DATA_SIZE as u64);
            let mut offset = 0usize;

            // A zero length byte ends the sector; records never span sectors
            while offset < data.len() {
                let len = data[offset] as usize;
                if len == 0 || offset + len > data.len() {
                    break;
                }
                if let Some(record) = DirRecord::parse(&data[offset..offset + len]) {
                    records.push(record);
                }
                offset += len;
            }
        }

        records
    }
}

/// The fields of the primary volume descriptor this tool cares about.
#[derive(Debug, Clone)]
pub struct VolumeDescriptor {
    pub system_id: String,
    pub volume_id: String,
    pub volume_set_id: String,
    pub publisher_id: String,
    pub data_preparer_id: String,
    pub application_id: String,
    pub copyright_file_id: String,
    /// Volume size in sectors.
    pub volume_size: u32,
    /// Path table size in bytes.
    pub path_table_size: u32,
    /// LBA of the primary little-endian path table.
    pub path_table_lba: u32,
    pub root_lba: u32,
    pub root_size: u32,
    /// Raw 17-byte creation datestamp.
    pub creation_date: [u8; 17],
}

impl VolumeDescriptor {
    /// Parses a 2048-byte descriptor payload.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FORM1_DATA_SIZE {
            return Err(CdError::InvalidDescriptor("short descriptor".into()));
        }
        if &data[1..6] != b"CD001" {
            return Err(CdError::InvalidDescriptor(
                "missing CD001 signature".into(),
            ));
        }
        if data[0] != 1 {
            return Err(CdError::InvalidDescriptor(format!(
                "expected primary volume descriptor, got type {}",
                data[0]
            )));
        }

        let le32 = |offset: usize| {
            u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
        };

        let mut creation_date = [0u8; 17];
        creation_date.copy_from_slice(&data[813..830]);

        Ok(Self {
            system_id: padded_str(&data[8..40]),
            volume_id: padded_str(&data[40..72]),
            volume_set_id: padded_str(&data[190..318]),
            publisher_id: padded_str(&data[318..446]),
            data_preparer_id: padded_str(&data[446..574]),
            application_id: padded_str(&data[574..702]),
            copyright_file_id: padded_str(&data[702..739]),
            volume_size: le32(80),
            path_table_size: le32(132),
            path_table_lba: le32(140),
            root_lba: le32(156 + 2),
            root_size: le32(156 + 10),
            creation_date,
        })
    }
}

/// One little-endian path table entry.
#[derive(Debug, Clone)]
pub struct PathTableEntry {
    /// Directory name; empty for the root entry.
    pub name: String,
    pub lba: u32,
    /// 1-based index of the parent directory within the table.
    pub parent: u16,
}

/// One parsed directory record.
#[derive(Debug, Clone)]
pub struct DirRecord {
    /// Identifier as stored, version suffix included.
    pub identifier: String,
    pub lba: u32,
    pub size: u32,
    pub flags: u8,
    /// Raw 7-byte record datestamp.
    pub date: [u8; 7],
    pub xa: Option<XaAttributes>,
}

impl DirRecord {
    /// The `.` and `..` entries lead every directory extent.
    pub fn is_dot_entry(&self) -> bool {
        self.identifier == "\u{0}" || self.identifier == "\u{1}" || self.identifier.is_empty()
    }

    /// Identifier without the `;1` version suffix.
    pub fn clean_identifier(&self) -> &str {
        self.identifier
            .split(';')
            .next()
            .unwrap_or(&self.identifier)
    }

    fn parse(record: &[u8]) -> Option<Self> {
        if record.len() < 33 {
            return None;
        }

        let lba = u32::from_le_bytes([record[2], record[3], record[4], record[5]]);
        let size = u32::from_le_bytes([record[10], record[11], record[12], record[13]]);
        let mut date = [0u8; 7];
        date.copy_from_slice(&record[18..25]);
        let flags = record[25];

        let id_len = record[32] as usize;
        if record.len() < 33 + id_len {
            return None;
        }
        let identifier = String::from_utf8_lossy(&record[33..33 + id_len])
            .trim_end_matches('\0')
            .to_string();

        // A pad byte follows even-length identifiers, then the XA block
        let xa_offset = 33 + id_len + (1 - (id_len & 1));
        let xa = (record.len() >= xa_offset + 14).then(|| XaAttributes::parse(&record[xa_offset..]));

        Some(Self {
            identifier,
            lba,
            size,
            flags,
            date,
            xa,
        })
    }
}

bitflags! {
    /// Kind bits of the XA attribute word (the low 11 bits are permissions).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XaFlags: u16 {
        /// Mode 2 Form 1 data
        const FORM1 = 0x0800;
        /// Mode 2 Form 2 data
        const FORM2 = 0x1000;
        /// Interleaved XA stream
        const INTERLEAVED = 0x2000;
        /// CD-DA audio track reference
        const CDDA = 0x4000;
        /// Directory record
        const DIRECTORY = 0x8000;
    }
}

/// Permission bits portion of the XA attribute word.
pub const XA_PERMISSIONS_MASK: u16 = 0x07FF;

/// File kind inferred from an entry's XA attribute word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferredKind {
    Data,
    Form2,
    Cdda,
    Directory,
}

/// The 14-byte CD-XA attribute block trailing a directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XaAttributes {
    pub group_id: u16,
    pub user_id: u16,
    /// Kind flags in the high bits, permissions in the low 11.
    pub attributes: u16,
    pub file_number: u8,
}

impl XaAttributes {
    /// Parses the block; the stored integers are big-endian.
    pub fn parse(data: &[u8]) -> Self {
        Self {
            group_id: u16::from_be_bytes([data[0], data[1]]),
            user_id: u16::from_be_bytes([data[2], data[3]]),
            attributes: u16::from_be_bytes([data[4], data[5]]),
            file_number: data[8],
        }
    }

    pub fn permissions(&self) -> u16 {
        self.attributes & XA_PERMISSIONS_MASK
    }

    pub fn flags(&self) -> XaFlags {
        XaFlags::from_bits_truncate(self.attributes)
    }

    /// Guesses the entry kind from the attribute word. Many discs leave some
    /// or all of these flags unset, so when the two form bits agree the safe
    /// reading is a Form 2 stream.
    pub fn inferred_kind(&self) -> InferredKind {
        let flags = self.flags();
        if flags.contains(XaFlags::CDDA) {
            InferredKind::Cdda
        } else if flags.contains(XaFlags::DIRECTORY) {
            InferredKind::Directory
        } else if flags.contains(XaFlags::FORM1) && !flags.contains(XaFlags::FORM2) {
            InferredKind::Data
        } else if flags.contains(XaFlags::FORM2) && !flags.contains(XaFlags::FORM1) {
            InferredKind::Form2
        } else {
            InferredKind::Form2
        }
    }
}

/// Trims trailing padding from a fixed-width identifier field.
fn padded_str(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches([' ', '\0'])
        .to_string()
}
