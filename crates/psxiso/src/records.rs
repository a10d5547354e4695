//! Directory record emission.
//!
//! Each directory's extent opens with the `.` and `..` records, followed by
//! the children in sorted order. A record that would cross a 2048-byte
//! boundary starts a new sector instead; the extent sizing in [`crate::layout`]
//! applies the same rule, so the records always fit the planned extent.

use psxcd::{EdcEccForm, ImageWriter, SUBHEADER_DATA, SUBHEADER_EOF, SectorView};

use crate::layout::XA_BLOCK_LEN;
use crate::model::{DirTree, Entry, EntryId, EntryKind};

/// XA attribute word stamped on the `.` and `..` records.
const DOT_RECORD_XA: u16 = 0x8800 | 0x555;

/// Writes the record extents of every directory in the tree.
pub fn write_directory_records(writer: &mut ImageWriter, tree: &DirTree, xa: bool) {
    write_dir(writer, tree, tree.root(), tree.root(), xa);
}

fn write_dir(writer: &mut ImageWriter, tree: &DirTree, dir: EntryId, parent: EntryId, xa: bool) {
    let entry = tree.entry(dir);
    let sectors = (entry.size / 2048) as u32;
    let mut view = writer.view_m2f1(entry.lba, sectors, EdcEccForm::Form1);
    view.set_subheader(SUBHEADER_DATA);

    emit(&mut view, &dot_record(tree.entry(dir), b"\x00", xa));
    emit(&mut view, &dot_record(tree.entry(parent), b"\x01", xa));

    for child in tree.sorted_children(dir) {
        let child_entry = tree.entry(child);
        if child_entry.id.is_empty() {
            continue;
        }
        emit(&mut view, &child_record(child_entry, xa));
    }

    // The trailing partial sector closes the extent with an EOF subheader
    if view.space_in_current_sector() < 2048 {
        view.set_subheader(SUBHEADER_EOF);
        view.next_sector();
    }
    view.finish();

    for child in tree.entry(dir).children.clone() {
        if tree.entry(child).is_dir() {
            write_dir(writer, tree, child, dir, xa);
        }
    }
}

fn emit(view: &mut SectorView<'_>, record: &[u8]) {
    if view.space_in_current_sector() < record.len() {
        view.next_sector();
    }
    view.write_memory(record);
}

/// A `.` or `..` record describing `target`'s own extent.
fn dot_record(target: &Entry, identifier: &[u8; 1], xa: bool) -> Vec<u8> {
    build_record(
        identifier,
        target.lba,
        target.size as u32,
        target,
        0x02,
        xa.then_some((DOT_RECORD_XA, 0, 0, 0)),
    )
}

fn child_record(entry: &Entry, xa: bool) -> Vec<u8> {
    let flags = if entry.is_dir() { 0x02 } else { 0x00 };
    build_record(
        entry.id.as_bytes(),
        entry.recorded_lba(),
        entry.recorded_size(),
        entry,
        flags,
        xa.then(|| xa_block_values(entry)),
    )
}

/// The XA attribute word and file number for an entry's record.
fn xa_block_values(entry: &Entry) -> (u16, u16, u16, u8) {
    let perms = entry.perms & 0x7FF;
    let (attributes, file_number) = match entry.kind {
        EntryKind::Dir => (perms | 0x8800, 0),
        EntryKind::Cdda { .. } => (perms | 0x4000, 0),
        EntryKind::Form2File => {
            // A project-supplied attribute byte replaces the default flags
            let kind_bits = match entry.xa_attrib {
                Some(bits) => u16::from(bits) << 8,
                None => 0x3800,
            };
            (perms | kind_bits, 1)
        }
        EntryKind::File | EntryKind::StrVideo | EntryKind::Dummy { .. } => (perms | 0x0800, 0),
    };
    (attributes, entry.gid, entry.uid, file_number)
}

fn build_record(
    identifier: &[u8],
    lba: u32,
    size: u32,
    entry: &Entry,
    flags: u8,
    xa: Option<(u16, u16, u16, u8)>,
) -> Vec<u8> {
    let mut record = vec![0u8; 33];

    record[2..6].copy_from_slice(&lba.to_le_bytes());
    record[6..10].copy_from_slice(&lba.to_be_bytes());
    record[10..14].copy_from_slice(&size.to_le_bytes());
    record[14..18].copy_from_slice(&size.to_be_bytes());
    record[18..25].copy_from_slice(&entry.date.to_record_bytes());
    record[25] = flags;
    record[28] = 1; // volume sequence number pair
    record[31] = 1;
    record[32] = identifier.len() as u8;

    record.extend_from_slice(identifier);
    if record.len() % 2 != 0 {
        record.push(0);
    }

    if let Some((attributes, gid, uid, file_number)) = xa {
        let mut block = [0u8; XA_BLOCK_LEN];
        block[0..2].copy_from_slice(&gid.to_be_bytes());
        block[2..4].copy_from_slice(&uid.to_be_bytes());
        block[4..6].copy_from_slice(&attributes.to_be_bytes());
        block[6] = b'X';
        block[7] = b'A';
        block[8] = file_number;
        record.extend_from_slice(&block);
    }

    // The planner sized the extent from this same length
    debug_assert_eq!(
        record.len(),
        crate::layout::record_len(identifier.len(), xa.is_some())
    );

    record[0] = record.len() as u8;
    record
}
