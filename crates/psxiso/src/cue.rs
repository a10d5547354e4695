//! Cue sheet emission.
//!
//! One `FILE` line for the image, a `MODE2/2352` entry for the data track,
//! and one `AUDIO` entry per audio track. The first audio track carries a
//! virtual two-second pregap; later tracks point `INDEX 00` at their
//! physical gap sectors.

use std::fmt;

use psxcd::Msf;

#[derive(Debug, Clone)]
pub struct CueSheet {
    /// Image file name as referenced from the sheet.
    pub image: String,
    pub tracks: Vec<CueTrack>,
}

#[derive(Debug, Clone)]
pub struct CueTrack {
    pub number: u8,
    pub kind: CueTrackKind,
    /// Virtual pregap (`PREGAP 00:02:00`), not stored in the image.
    pub pregap: bool,
    /// Start of the stored gap, when one exists in the image.
    pub index0: Option<Msf>,
    /// Start of the track data.
    pub index1: Msf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CueTrackKind {
    Mode2,
    Audio,
}

impl fmt::Display for CueSheet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "FILE \"{}\" BINARY", self.image)?;
        for track in &self.tracks {
            let kind = match track.kind {
                CueTrackKind::Mode2 => "MODE2/2352",
                CueTrackKind::Audio => "AUDIO",
            };
            writeln!(f, "  TRACK {:02} {}", track.number, kind)?;
            if track.pregap {
                writeln!(f, "    PREGAP 00:02:00")?;
            }
            if let Some(index0) = track.index0 {
                writeln!(f, "    INDEX 00 {index0}")?;
            }
            writeln!(f, "    INDEX 01 {}", track.index1)?;
        }
        Ok(())
    }
}

impl CueSheet {
    /// The single-entry sheet every data-only image gets.
    pub fn data_only(image: String) -> Self {
        Self {
            image,
            tracks: vec![CueTrack {
                number: 1,
                kind: CueTrackKind::Mode2,
                pregap: false,
                index0: None,
                index1: Msf::from_sectors(0),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_only_sheet() {
        let sheet = CueSheet::data_only("game.bin".into());
        assert_eq!(
            sheet.to_string(),
            "FILE \"game.bin\" BINARY\n  TRACK 01 MODE2/2352\n    INDEX 01 00:00:00\n"
        );
    }

    #[test]
    fn audio_tracks_render_pregap_or_gap_index() {
        let mut sheet = CueSheet::data_only("game.bin".into());
        sheet.tracks.push(CueTrack {
            number: 2,
            kind: CueTrackKind::Audio,
            pregap: true,
            index0: None,
            index1: Msf::from_sectors(1000),
        });
        sheet.tracks.push(CueTrack {
            number: 3,
            kind: CueTrackKind::Audio,
            pregap: false,
            index0: Some(Msf::from_sectors(1200)),
            index1: Msf::from_sectors(1350),
        });

        let text = sheet.to_string();
        assert!(text.contains("  TRACK 02 AUDIO\n    PREGAP 00:02:00\n    INDEX 01 00:13:25\n"));
        assert!(text.contains("  TRACK 03 AUDIO\n    INDEX 00 00:16:00\n    INDEX 01 00:18:00\n"));
    }
}
