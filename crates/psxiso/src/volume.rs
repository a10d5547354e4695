//! Volume descriptor, path tables and license region.
//!
//! The primary volume descriptor occupies LBA 16 (subheader end-of-record),
//! its terminator LBA 17 (end-of-file). The little-endian path table starts
//! at LBA 18 and is followed by its copy, the big-endian table, and that
//! table's copy. The optional license region covers LBA 0-15.

use psxcd::{
    EdcEccForm, ImageWriter, SUBHEADER_DATA, SUBHEADER_EOF, SUBHEADER_EOL, SUBHEADER_FORM2,
    SectorView,
};

use crate::datestamp::{IsoDate, unspecified_long_date};
use crate::layout::path_table_len;
use crate::model::{DirTree, EntryId};

/// Sectors reserved for the license region at the head of the disc.
pub const LICENSE_SECTORS: u32 = 16;

/// Byte size of the verbatim license payload (12 Form 2 payloads).
pub const LICENSE_DATA_SIZE: usize = 12 * 2336;

/// First LBA of the primary little-endian path table.
pub const PATH_TABLE_LBA: u32 = 18;

/// Identifier strings stamped into the volume descriptor.
#[derive(Debug, Clone, Default)]
pub struct VolumeIdentifiers {
    pub system: String,
    pub volume: String,
    pub volume_set: String,
    pub publisher: String,
    pub data_preparer: String,
    pub application: String,
    pub copyright: String,
}

/// Writes the descriptor pair and all four path tables.
pub fn write_descriptor(
    writer: &mut ImageWriter,
    tree: &DirTree,
    ids: &VolumeIdentifiers,
    creation: IsoDate,
    xa: bool,
    total_lba: u32,
) {
    let table_len = path_table_len(tree);
    let table_sectors = table_len.div_ceil(2048);

    let pvd = build_pvd(tree, ids, creation, xa, total_lba, table_len, table_sectors);

    let mut descriptors = writer.view_m2f1(16, 2, EdcEccForm::Form1);
    descriptors.set_subheader(SUBHEADER_EOL);
    descriptors.write_memory(&pvd);

    let mut terminator = [0u8; 2048];
    terminator[0] = 255;
    terminator[1..6].copy_from_slice(b"CD001");
    terminator[6] = 1;
    descriptors.set_subheader(SUBHEADER_EOF);
    descriptors.write_memory(&terminator);
    descriptors.finish();

    // L table, L copy, M table, M copy
    let mut lba = PATH_TABLE_LBA;
    for msb in [false, true] {
        let table = generate_path_table(tree, msb, table_sectors as usize * 2048);
        for _ in 0..2 {
            let mut view = writer.view_m2f1(lba, table_sectors, EdcEccForm::Form1);
            write_payload_with_eof(&mut view, &table);
            view.finish();
            lba += table_sectors;
        }
    }
}

/// Writes the 12 verbatim license sectors plus 4 blank Form 2 sectors.
///
/// The license payload carries its own subheaders; the sectors still get
/// full Form 1 checksums, matching pressed PlayStation discs.
pub fn write_license(writer: &mut ImageWriter, data: &[u8]) {
    let len = data.len().min(LICENSE_DATA_SIZE);
    let mut license = writer.view_m2f2(0, 12, EdcEccForm::Form1);
    license.write_memory(&data[..len]);
    if license.space_in_current_sector() < 2336 {
        license.next_sector();
    }
    license.write_blank_sectors(12 - len.div_ceil(2336) as u32);
    license.finish();

    let mut tail = writer.view_m2f1(12, 4, EdcEccForm::Form2);
    tail.set_subheader(SUBHEADER_FORM2);
    tail.write_blank_sectors(4);
    tail.finish();
}

/// Blank license region for projects without license data.
pub fn write_blank_license_region(writer: &mut ImageWriter) {
    let mut view = writer.view_m2f1(0, LICENSE_SECTORS, EdcEccForm::Form2);
    view.write_blank_sectors(LICENSE_SECTORS);
    view.finish();
}

fn build_pvd(
    tree: &DirTree,
    ids: &VolumeIdentifiers,
    creation: IsoDate,
    xa: bool,
    total_lba: u32,
    table_len: u32,
    table_sectors: u32,
) -> [u8; 2048] {
    let mut pvd = [0u8; 2048];

    pvd[0] = 1;
    pvd[1..6].copy_from_slice(b"CD001");
    pvd[6] = 1;

    copy_padded(&mut pvd[8..40], &ids.system);
    copy_padded(&mut pvd[40..72], &ids.volume);

    set_pair32(&mut pvd, 80, total_lba);
    set_pair16(&mut pvd, 120, 1);
    set_pair16(&mut pvd, 124, 1);
    set_pair16(&mut pvd, 128, 2048);
    set_pair32(&mut pvd, 132, table_len);

    pvd[140..144].copy_from_slice(&PATH_TABLE_LBA.to_le_bytes());
    pvd[144..148].copy_from_slice(&(PATH_TABLE_LBA + table_sectors).to_le_bytes());
    pvd[148..152].copy_from_slice(&(PATH_TABLE_LBA + table_sectors + 1).to_be_bytes());
    pvd[152..156].copy_from_slice(&(PATH_TABLE_LBA + 2 * table_sectors + 1).to_be_bytes());

    // Root directory record, embedded
    let root = tree.entry(tree.root());
    pvd[156] = 34;
    set_pair32(&mut pvd, 158, root.lba);
    set_pair32(&mut pvd, 166, root.size as u32);
    pvd[174..181].copy_from_slice(&creation.to_record_bytes());
    pvd[181] = 0x02;
    set_pair16(&mut pvd, 184, 1);
    pvd[188] = 1;
    pvd[189] = 0;

    copy_padded(&mut pvd[190..318], &ids.volume_set);
    copy_padded(&mut pvd[318..446], &ids.publisher);
    copy_padded(&mut pvd[446..574], &ids.data_preparer);
    copy_padded(&mut pvd[574..702], &ids.application);
    copy_padded(&mut pvd[702..739], &ids.copyright);
    copy_padded(&mut pvd[739..776], "");
    copy_padded(&mut pvd[776..813], "");

    pvd[813..830].copy_from_slice(&creation.to_long_bytes());
    pvd[830..847].copy_from_slice(&unspecified_long_date());
    pvd[847..864].copy_from_slice(&unspecified_long_date());
    pvd[864..881].copy_from_slice(&unspecified_long_date());

    pvd[881] = 1;

    if xa {
        // Application-use area starts at 883; the marker sits at offset 141
        pvd[1024..1032].copy_from_slice(b"CD-XA001");
    }

    pvd
}

/// Generates one path table (all four written copies come from two of
/// these). Directory numbering visits each directory's sorted children
/// before descending, and parent references use the parent's number.
pub fn generate_path_table(tree: &DirTree, msb: bool, padded_len: usize) -> Vec<u8> {
    let mut table = Vec::with_capacity(padded_len);

    // Root entry: 1-byte NUL name, parent is itself
    table.push(1);
    table.push(0);
    push_u32(&mut table, tree.entry(tree.root()).lba, msb);
    push_u16(&mut table, 1, msb);
    table.extend_from_slice(&[0, 0]);

    let mut number = 1u16;
    gen_directory(tree, tree.root(), 1, &mut number, msb, &mut table);

    table.resize(padded_len, 0);
    table
}

fn gen_directory(
    tree: &DirTree,
    dir: EntryId,
    parent_number: u16,
    number: &mut u16,
    msb: bool,
    table: &mut Vec<u8>,
) {
    let child_dirs: Vec<EntryId> = tree
        .sorted_children(dir)
        .into_iter()
        .filter(|id| tree.entry(*id).is_dir())
        .collect();

    let mut numbers = Vec::with_capacity(child_dirs.len());
    for child in &child_dirs {
        *number += 1;
        numbers.push(*number);

        let entry = tree.entry(*child);
        table.push(entry.id.len() as u8);
        table.push(0);
        push_u32(table, entry.lba, msb);
        push_u16(table, parent_number, msb);
        table.extend_from_slice(entry.id.as_bytes());
        if entry.id.len() % 2 != 0 {
            table.push(0);
        }
    }

    for (child, child_number) in child_dirs.iter().zip(numbers) {
        gen_directory(tree, *child, child_number, number, msb, table);
    }
}

/// Streams a whole-sector payload, switching the subheader to end-of-file
/// for the final sector.
pub fn write_payload_with_eof(view: &mut SectorView<'_>, payload: &[u8]) {
    debug_assert_eq!(payload.len() % 2048, 0);

    view.set_subheader(SUBHEADER_DATA);
    let (head, tail) = payload.split_at(payload.len() - 2048);
    view.write_memory(head);
    view.set_subheader(SUBHEADER_EOF);
    view.write_memory(tail);
}

fn copy_padded(dest: &mut [u8], src: &str) {
    let upper = src.to_ascii_uppercase();
    let bytes = upper.as_bytes();
    let n = bytes.len().min(dest.len());
    dest[..n].copy_from_slice(&bytes[..n]);
    dest[n..].fill(b' ');
}

fn push_u16(table: &mut Vec<u8>, value: u16, msb: bool) {
    let bytes = if msb { value.to_be_bytes() } else { value.to_le_bytes() };
    table.extend_from_slice(&bytes);
}

fn push_u32(table: &mut Vec<u8>, value: u32, msb: bool) {
    let bytes = if msb { value.to_be_bytes() } else { value.to_le_bytes() };
    table.extend_from_slice(&bytes);
}

fn set_pair16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    buf[offset + 2..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn set_pair32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    buf[offset + 4..offset + 8].copy_from_slice(&value.to_be_bytes());
}
