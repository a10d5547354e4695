//! Extent sizing and LBA assignment.
//!
//! Directory extents are sized from the exact record lengths the record
//! writer will emit, applying the rule that a record never spans a 2048-byte
//! sector boundary. LBAs are assigned in one pre-order pass: a directory
//! consumes its extent where its entry appears, then its children follow in
//! insertion order. CD-DA entries keep their placeholder until the audio
//! track pass places them.

use tracing::warn;

use crate::model::{DirTree, EntryId, EntryKind};

/// Length of the trailing XA attribute block of a directory record.
pub const XA_BLOCK_LEN: usize = 14;

/// The exact on-disc length of one directory record.
///
/// 33-byte base, identifier, a pad byte when the identifier length is even,
/// and the XA block when XA is enabled.
pub fn record_len(id_len: usize, xa: bool) -> usize {
    let mut len = 33 + id_len;
    len += len % 2;
    if xa {
        len += XA_BLOCK_LEN;
    }
    len
}

/// A directory's extent length in bytes, rounded to whole sectors.
///
/// Children are measured in rendered (sorted) order so the boundary rule
/// lands on the same records the writer will push to the next sector.
pub fn dir_extent_len(tree: &DirTree, dir: EntryId, xa: bool) -> u32 {
    let mut len = 2 * record_len(1, xa);

    for child in tree.sorted_children(dir) {
        let id = &tree.entry(child).id;
        if id.is_empty() {
            continue;
        }

        let data_len = record_len(id.len(), xa);
        if (len % 2048) + data_len > 2048 {
            len = len.next_multiple_of(2048);
        }
        len += data_len;
    }

    len.next_multiple_of(2048) as u32
}

/// Total path-table length in bytes: 10 for the root plus, per directory,
/// an 8-byte header and the even-padded identifier.
pub fn path_table_len(tree: &DirTree) -> u32 {
    fn directories(tree: &DirTree, dir: EntryId, len: &mut u32) {
        for child in tree.entry(dir).children.iter() {
            if tree.entry(*child).is_dir() {
                let id_len = tree.entry(*child).id.len() as u32;
                *len += 8 + id_len + (id_len & 1);
                directories(tree, *child, len);
            }
        }
    }

    let mut len = 10;
    directories(tree, tree.root(), &mut len);
    len
}

/// Assigns every extent's LBA starting at `start_lba` (the sector after the
/// path tables) and returns the total filesystem length in sectors.
pub fn assign_lbas(tree: &mut DirTree, start_lba: u32, xa: bool) -> u32 {
    assign_dir(tree, tree.root(), start_lba, xa)
}

fn assign_dir(tree: &mut DirTree, dir: EntryId, mut lba: u32, xa: bool) -> u32 {
    let extent = dir_extent_len(tree, dir, xa);
    if extent > 2048 {
        warn!(
            "directory record {} exceeds 2048 bytes",
            tree.path_of(dir)
        );
    }

    {
        let entry = tree.entry_mut(dir);
        entry.size = u64::from(extent);
        entry.lba = lba;
    }
    lba += extent / 2048;

    for child in tree.entry(dir).children.clone() {
        match tree.entry(child).kind {
            EntryKind::Dir => {
                lba = assign_dir(tree, child, lba, xa);
            }
            // Audio tracks live outside the filesystem; resolved later
            EntryKind::Cdda { .. } => {}
            _ => {
                let entry = tree.entry_mut(child);
                entry.lba = lba;
                lba += entry.extent_sectors();
            }
        }
    }

    lba
}
