//! In-memory filesystem model.
//!
//! All entries live in one flat arena in insertion order; directories hold
//! child lists of arena indices and a back-reference to their parent index.
//! The arena order decides where extents land on the disc, while each
//! directory's *rendered* listing is sorted separately, so file placement and
//! directory listings are independent of each other.
//!
//! Entries are created by the project frontend, mutated only by the layout
//! planner (LBA and directory extent sizes), and frozen for writing.

use std::fmt::Write as _;

use tracing::warn;

use crate::attr::EntryAttributes;
use crate::datestamp::IsoDate;
use crate::{IsoError, Result};

/// LBA value carried by CD-DA entries until their audio track is placed.
pub const LBA_PLACEHOLDER: u32 = u32::MAX;

/// Longest identifier the filesystem accepts.
pub const MAX_IDENTIFIER_LEN: usize = 31;

/// Identifiers longer than this trip the legacy-format warning.
pub const LEGACY_IDENTIFIER_LEN: usize = 12;

/// Index of an entry in the [`DirTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(pub(crate) usize);

/// What an entry is, with per-variant payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular data file: Mode 2 Form 1, 2048 bytes per sector.
    File,
    /// Interleaved XA/STR stream: 2336-byte payloads, per-sector form
    /// detection on write.
    Form2File,
    /// Data-only STR video: Form 1 sectors with the STR subheader.
    StrVideo,
    /// Audio track reference; occupies no filesystem sectors.
    Cdda { track_id: String },
    Dir,
    /// Invisible zero-filled gap; no directory record is emitted.
    Dummy { form2: bool },
}

/// One filesystem object.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Emitted identifier: uppercase, `;1`-suffixed for files, empty for
    /// dummies.
    pub id: String,
    pub kind: EntryKind,
    /// Extent size in bytes. For directories this is set by the planner; for
    /// dummies it is the declared sector count times 2048.
    pub size: u64,
    pub lba: u32,
    pub date: IsoDate,
    /// XA permission bits (11 bits).
    pub perms: u16,
    /// Optional override for the XA kind-flag byte.
    pub xa_attrib: Option<u8>,
    pub gid: u16,
    pub uid: u16,
    /// Host path the payload comes from, if any.
    pub source: Option<std::path::PathBuf>,
    pub parent: Option<EntryId>,
    /// Child entries in insertion order (directories only).
    pub children: Vec<EntryId>,
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    /// Filesystem sectors this entry's extent occupies.
    pub fn extent_sectors(&self) -> u32 {
        match self.kind {
            EntryKind::File | EntryKind::StrVideo | EntryKind::Dummy { .. } | EntryKind::Dir => {
                self.size.div_ceil(2048) as u32
            }
            EntryKind::Form2File => self.size.div_ceil(2336) as u32,
            EntryKind::Cdda { .. } => 0,
        }
    }

    /// The extent size stored in this entry's directory record. Form 2 and
    /// CD-DA extents are recorded as if they held 2048-byte sectors.
    pub fn recorded_size(&self) -> u32 {
        match self.kind {
            EntryKind::Form2File => 2048 * self.size.div_ceil(2336) as u32,
            EntryKind::StrVideo => 2048 * self.size.div_ceil(2048) as u32,
            EntryKind::Cdda { .. } => 2048 * self.size.div_ceil(2352) as u32,
            _ => self.size as u32,
        }
    }

    /// The LBA stored in this entry's directory record. CD-DA records point
    /// past the two-second pregap at the audio data itself.
    pub fn recorded_lba(&self) -> u32 {
        match self.kind {
            EntryKind::Cdda { .. } => self.lba + psxcd::PREGAP_SECTORS,
            _ => self.lba,
        }
    }
}

/// Resolved (non-optional) attribute values attached to new entries.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedAttributes {
    pub gmt_offs: i8,
    pub xa_attrib: Option<u8>,
    pub perms: u16,
    pub gid: u16,
    pub uid: u16,
}

impl From<&EntryAttributes> for ResolvedAttributes {
    fn from(attrs: &EntryAttributes) -> Self {
        Self {
            gmt_offs: attrs.gmt_offs(),
            xa_attrib: attrs.xa_attrib,
            perms: attrs.xa_perm(),
            gid: attrs.xa_gid(),
            uid: attrs.xa_uid(),
        }
    }
}

/// The directory tree arena.
#[derive(Debug)]
pub struct DirTree {
    entries: Vec<Entry>,
    root: EntryId,
}

impl DirTree {
    /// Creates a tree holding only the root directory.
    pub fn new(date: IsoDate, attrs: ResolvedAttributes) -> Self {
        let root = Entry {
            id: String::new(),
            kind: EntryKind::Dir,
            size: 0,
            lba: 0,
            date,
            perms: attrs.perms,
            xa_attrib: attrs.xa_attrib,
            gid: attrs.gid,
            uid: attrs.uid,
            source: None,
            parent: None,
            children: Vec::new(),
        };
        Self {
            entries: vec![root],
            root: EntryId(0),
        }
    }

    pub fn root(&self) -> EntryId {
        self.root
    }

    pub fn entry(&self, id: EntryId) -> &Entry {
        &self.entries[id.0]
    }

    pub fn entry_mut(&mut self, id: EntryId) -> &mut Entry {
        &mut self.entries[id.0]
    }

    /// Every arena index in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = EntryId> + '_ {
        (0..self.entries.len()).map(EntryId)
    }

    /// Arena indices sorted by assigned LBA; ties keep insertion order.
    pub fn ids_by_lba(&self) -> Vec<EntryId> {
        let mut ids: Vec<EntryId> = self.ids().collect();
        ids.sort_by_key(|id| self.entry(*id).lba);
        ids
    }

    /// A directory's children in rendered order: ascending identifier, with
    /// identifier-less dummies at the end.
    pub fn sorted_children(&self, dir: EntryId) -> Vec<EntryId> {
        let mut children = self.entry(dir).children.clone();
        children.sort_by(|a, b| {
            let (a, b) = (&self.entry(*a).id, &self.entry(*b).id);
            match (a.is_empty(), b.is_empty()) {
                (true, true) => std::cmp::Ordering::Equal,
                (true, false) => std::cmp::Ordering::Greater,
                (false, true) => std::cmp::Ordering::Less,
                (false, false) => a.cmp(b),
            }
        });
        children
    }

    /// Slash-separated path of an entry, for diagnostics.
    pub fn path_of(&self, id: EntryId) -> String {
        let mut parts = Vec::new();
        let mut cursor = Some(id);
        while let Some(entry_id) = cursor {
            let entry = self.entry(entry_id);
            if !entry.id.is_empty() {
                parts.push(entry.id.clone());
            }
            cursor = entry.parent;
        }
        let mut path = String::new();
        for part in parts.iter().rev() {
            let _ = write!(path, "/{part}");
        }
        if path.is_empty() { "/".into() } else { path }
    }

    /// Adds a subdirectory, merging into an existing directory of the same
    /// name.
    pub fn add_dir(
        &mut self,
        parent: EntryId,
        name: &str,
        date: IsoDate,
        attrs: ResolvedAttributes,
    ) -> Result<EntryId> {
        let id = validate_identifier(name)?;

        if let Some(existing) = self.find_child(parent, &id) {
            if self.entry(existing).is_dir() {
                // Subsequent occurrences reuse the first directory's subtree
                return Ok(existing);
            }
            return Err(IsoError::DuplicateIdentifier(self.child_path(parent, &id)));
        }

        self.check_limits(parent, &id)?;

        let entry_id = self.push(Entry {
            id,
            kind: EntryKind::Dir,
            size: 0,
            lba: 0,
            date,
            perms: attrs.perms,
            xa_attrib: attrs.xa_attrib,
            gid: attrs.gid,
            uid: attrs.uid,
            source: None,
            parent: Some(parent),
            children: Vec::new(),
        });
        Ok(entry_id)
    }

    /// Adds a file-like entry (anything but a directory or dummy).
    pub fn add_file(
        &mut self,
        parent: EntryId,
        name: &str,
        kind: EntryKind,
        size: u64,
        source: Option<std::path::PathBuf>,
        date: IsoDate,
        attrs: ResolvedAttributes,
    ) -> Result<EntryId> {
        debug_assert!(!matches!(kind, EntryKind::Dir | EntryKind::Dummy { .. }));

        let id = format!("{};1", validate_identifier(name)?);
        if self.find_child(parent, &id).is_some() {
            return Err(IsoError::DuplicateIdentifier(self.child_path(parent, &id)));
        }
        self.check_limits(parent, &id)?;

        let lba = if matches!(kind, EntryKind::Cdda { .. }) {
            LBA_PLACEHOLDER
        } else {
            0
        };

        let entry_id = self.push(Entry {
            id,
            kind,
            size,
            lba,
            date,
            perms: attrs.perms,
            xa_attrib: attrs.xa_attrib,
            gid: attrs.gid,
            uid: attrs.uid,
            source,
            parent: Some(parent),
            children: Vec::new(),
        });
        Ok(entry_id)
    }

    /// Adds an invisible dummy gap of `sectors` 2048-byte units.
    pub fn add_dummy(&mut self, parent: EntryId, sectors: u32, form2: bool) -> EntryId {
        self.push(Entry {
            id: String::new(),
            kind: EntryKind::Dummy { form2 },
            size: u64::from(sectors) * 2048,
            lba: 0,
            date: IsoDate::from_unix(0, 0),
            perms: 0,
            xa_attrib: None,
            gid: 0,
            uid: 0,
            source: None,
            parent: Some(parent),
            children: Vec::new(),
        })
    }

    /// Total named files (recursively, directories excluded).
    pub fn file_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.is_dir() && !e.id.is_empty())
            .count()
    }

    /// Total directories, root excluded.
    pub fn dir_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_dir()).count() - 1
    }

    fn push(&mut self, entry: Entry) -> EntryId {
        let id = EntryId(self.entries.len());
        if let Some(parent) = entry.parent {
            self.entries[parent.0].children.push(id);
        }
        self.entries.push(entry);
        id
    }

    fn find_child(&self, parent: EntryId, id: &str) -> Option<EntryId> {
        self.entry(parent)
            .children
            .iter()
            .copied()
            .find(|child| self.entry(*child).id.eq_ignore_ascii_case(id))
    }

    fn child_path(&self, parent: EntryId, id: &str) -> String {
        let base = self.path_of(parent);
        if base == "/" {
            format!("/{id}")
        } else {
            format!("{base}/{id}")
        }
    }

    fn check_limits(&self, parent: EntryId, id: &str) -> Result<()> {
        let mut depth = 1usize;
        let mut cursor = Some(parent);
        while let Some(entry_id) = cursor {
            depth += 1;
            cursor = self.entry(entry_id).parent;
        }
        if depth > 8 {
            return Err(IsoError::PathTooDeep(self.child_path(parent, id)));
        }

        let path = self.child_path(parent, id);
        if path.len() - 1 > 255 {
            return Err(IsoError::PathTooLong(path));
        }
        Ok(())
    }
}

/// Uppercases and checks an identifier against the d-character limits.
fn validate_identifier(name: &str) -> Result<String> {
    let id = name.to_ascii_uppercase();

    if id.is_empty() || id.contains(['/', '\\']) {
        return Err(IsoError::MalformedProject(format!(
            "invalid entry name {name:?}"
        )));
    }
    if id.len() > MAX_IDENTIFIER_LEN {
        return Err(IsoError::IdentifierTooLong(id));
    }
    if id.len() > LEGACY_IDENTIFIER_LEN {
        warn!(
            "identifier {id} is over {LEGACY_IDENTIFIER_LEN} characters and may not read on \
             original hardware"
        );
    }

    Ok(id)
}
