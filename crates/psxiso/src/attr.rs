//! Inheritable CD-XA entry attributes.
//!
//! Every layer of the project (track defaults, directory tree, directory,
//! file) may override any subset of these; the effective value at an entry is
//! the deepest explicitly-set one on the chain from the root.

use serde::{Deserialize, Serialize};

/// Default XA permission bits: owner/group/world read + execute.
pub const DEFAULT_XA_PERM: u16 = 0x555;

/// An overlay of optional attribute settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryAttributes {
    /// GMT offset in 15-minute units applied to datestamps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gmt_offs: Option<i8>,
    /// Override for the kind-flag byte of the XA attribute word.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xa_attrib: Option<u8>,
    /// XA permission bits (11 bits).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xa_perm: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xa_gid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xa_uid: Option<u16>,
}

impl EntryAttributes {
    /// The root of every overlay chain.
    pub fn defaults() -> Self {
        Self {
            gmt_offs: Some(0),
            xa_attrib: None,
            xa_perm: Some(DEFAULT_XA_PERM),
            xa_gid: Some(0),
            xa_uid: Some(0),
        }
    }

    /// Returns `self` with every field `derived` sets replaced.
    pub fn overlay(mut self, derived: &EntryAttributes) -> Self {
        if derived.gmt_offs.is_some() {
            self.gmt_offs = derived.gmt_offs;
        }
        if derived.xa_attrib.is_some() {
            self.xa_attrib = derived.xa_attrib;
        }
        if derived.xa_perm.is_some() {
            self.xa_perm = derived.xa_perm;
        }
        if derived.xa_gid.is_some() {
            self.xa_gid = derived.xa_gid;
        }
        if derived.xa_uid.is_some() {
            self.xa_uid = derived.xa_uid;
        }
        self
    }

    /// True when no field is set; lets emitters skip empty attribute blocks.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn gmt_offs(&self) -> i8 {
        self.gmt_offs.unwrap_or(0)
    }

    pub fn xa_perm(&self) -> u16 {
        self.xa_perm.unwrap_or(DEFAULT_XA_PERM)
    }

    pub fn xa_gid(&self) -> u16 {
        self.xa_gid.unwrap_or(0)
    }

    pub fn xa_uid(&self) -> u16 {
        self.xa_uid.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deepest_setting_wins() {
        let tree = EntryAttributes {
            gmt_offs: Some(36),
            xa_perm: Some(0x511),
            ..Default::default()
        };
        let dir = EntryAttributes {
            xa_gid: Some(7),
            ..Default::default()
        };
        let file = EntryAttributes {
            gmt_offs: Some(-20),
            ..Default::default()
        };

        let effective = EntryAttributes::defaults()
            .overlay(&tree)
            .overlay(&dir)
            .overlay(&file);

        assert_eq!(effective.gmt_offs(), -20);
        assert_eq!(effective.xa_perm(), 0x511);
        assert_eq!(effective.xa_gid(), 7);
        assert_eq!(effective.xa_uid(), 0);
    }

    #[test]
    fn unset_layers_change_nothing() {
        let base = EntryAttributes::defaults();
        assert_eq!(base.overlay(&EntryAttributes::default()), base);
    }
}
