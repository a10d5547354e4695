//! End-to-end builder and extractor scenarios.

use std::fs;
use std::path::{Path, PathBuf};

use psxcd::codec::{FORM1_EDC_OFFSET, FORM2_EDC_OFFSET};
use psxcd::{ImageReader, SECTOR_SIZE, SectorCodec, XaFlags};
use psxiso::attr::EntryAttributes;
use psxiso::build::{BuildOptions, BuildSummary, build};
use psxiso::datestamp::IsoDate;
use psxiso::extract::{ExtractOptions, extract};
use psxiso::project::{
    DirNode, DummyNode, FileKind, FileNode, Identifiers, License, Node, Project, Track, TrackType,
};
use psxiso::IsoError;

fn fixed_date() -> IsoDate {
    IsoDate {
        year: 98,
        month: 11,
        day: 20,
        hour: 4,
        minute: 30,
        second: 0,
        gmt_offs: 0,
    }
}

fn file_node(name: &str, source: &str) -> Node {
    Node::File(FileNode {
        name: name.into(),
        source: Some(PathBuf::from(source)),
        kind: FileKind::Data,
        trackid: None,
        date: Some(fixed_date()),
        attributes: EntryAttributes::default(),
    })
}

fn data_track(volume: &str, entries: Vec<Node>) -> Track {
    Track {
        track_type: TrackType::Data,
        source: None,
        trackid: None,
        identifiers: Some(Identifiers {
            volume: Some(volume.into()),
            creation_date: Some(fixed_date()),
            ..Default::default()
        }),
        license: None,
        default_attributes: None,
        directory_tree: Some(DirNode {
            date: Some(fixed_date()),
            entries,
            ..Default::default()
        }),
    }
}

fn project(volume: &str, entries: Vec<Node>) -> Project {
    Project {
        image_name: None,
        cue_sheet: None,
        no_xa: false,
        tracks: vec![data_track(volume, entries)],
    }
}

fn build_in(dir: &Path, project: &Project) -> (PathBuf, BuildSummary) {
    let image = dir.join("out.bin");
    let options = BuildOptions {
        project_dir: dir.to_path_buf(),
        output: Some(image.clone()),
        overwrite: true,
        timestamp: Some(fixed_date()),
        ..Default::default()
    };
    let summary = build(project, &options).unwrap();
    (image, summary)
}

fn sector(image: &[u8], lba: u32) -> &[u8] {
    &image[lba as usize * SECTOR_SIZE..(lba as usize + 1) * SECTOR_SIZE]
}

fn assert_form1_checksums(codec: &SectorCodec, sec: &[u8]) {
    let edc = codec.edc_partial(0, &sec[16..FORM1_EDC_OFFSET]);
    assert_eq!(edc.to_le_bytes(), sec[FORM1_EDC_OFFSET..FORM1_EDC_OFFSET + 4]);

    let mut copy: [u8; SECTOR_SIZE] = sec.try_into().unwrap();
    codec.encode_mode2_form1(&mut copy);
    assert_eq!(&copy[..], sec, "P/Q parity does not recompute");
}

#[test]
fn minimum_image() {
    let dir = tempfile::tempdir().unwrap();
    let (image_path, summary) = build_in(dir.path(), &project("EMPTY", vec![]));

    // 16 license + 2 descriptors + 4 path-table sectors + 1 root extent
    assert_eq!(summary.total_sectors, 23);
    let image = fs::read(&image_path).unwrap();
    assert_eq!(image.len(), 23 * SECTOR_SIZE);

    // PVD magic at the start of LBA 16's user data
    let pvd = &sector(&image, 16)[24..];
    assert_eq!(&pvd[..6], b"\x01CD001");
    assert_eq!(&pvd[40..45], b"EMPTY");
    assert_eq!(&pvd[80..84], &23u32.to_le_bytes());

    // Descriptor terminator at LBA 17
    let terminator = &sector(&image, 17)[24..];
    assert_eq!(terminator[0], 255);
    assert_eq!(&terminator[1..6], b"CD001");

    // Every sector carries its own BCD address
    let codec = SectorCodec::new();
    for lba in [0u32, 16, 17, 18, 22] {
        let sec = sector(&image, lba);
        let mut expected = [0u8; SECTOR_SIZE];
        codec.write_header(&mut expected, lba);
        assert_eq!(&sec[..16], &expected[..16], "header at LBA {lba}");
    }

    // The PVD sector is a fully checksummed Form 1 sector
    assert_form1_checksums(&codec, sector(&image, 16));
}

#[test]
fn single_one_byte_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("hello.bin"), [0x41]).unwrap();

    let (image_path, _) = build_in(
        dir.path(),
        &project("TEST", vec![file_node("HELLO.BIN", "hello.bin")]),
    );
    let image = fs::read(&image_path).unwrap();

    let reader = ImageReader::open(&image_path).unwrap();
    let pvd = reader.read_volume_descriptor().unwrap();
    assert_eq!(pvd.root_lba, 22);

    let records = reader.read_dir_records(22, 1);
    let hello = &records[2];
    assert_eq!(hello.identifier, "HELLO.BIN;1");
    assert_eq!(hello.lba, 23);
    assert_eq!(hello.size, 1);

    // User data starts 24 bytes into the sector
    let base = 23 * SECTOR_SIZE;
    assert_eq!(image[base + 24], 0x41);
    assert!(image[base + 25..base + FORM1_EDC_OFFSET].iter().all(|&b| b == 0));

    // Final (only) sector of the file carries the EOF subheader
    assert_eq!(&image[base + 16..base + 20], &[0, 0, 0x89, 0]);

    let codec = SectorCodec::new();
    assert_form1_checksums(&codec, sector(&image, 23));
}

#[test]
fn listing_is_sorted_but_layout_is_insertion_ordered() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("b.bin"), vec![0u8; 100]).unwrap();
    fs::write(dir.path().join("a.bin"), vec![1u8; 100]).unwrap();

    let (image_path, _) = build_in(
        dir.path(),
        &project(
            "ORDER",
            vec![file_node("B.BIN", "b.bin"), file_node("A.BIN", "a.bin")],
        ),
    );

    let reader = ImageReader::open(&image_path).unwrap();
    let records = reader.read_dir_records(22, 1);
    let ids: Vec<&str> = records[2..].iter().map(|r| r.identifier.as_str()).collect();
    assert_eq!(ids, ["A.BIN;1", "B.BIN;1"]);

    // B was added first, so it sits at the lower LBA
    assert_eq!(records[3].lba, 23);
    assert_eq!(records[2].lba, 24);
}

#[test]
fn dummy_gap_between_files() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("first.bin"), vec![0xAAu8; 10]).unwrap();
    fs::write(dir.path().join("second.bin"), vec![0xBBu8; 10]).unwrap();

    let (image_path, summary) = build_in(
        dir.path(),
        &project(
            "GAPPED",
            vec![
                file_node("FIRST.BIN", "first.bin"),
                Node::Dummy(DummyNode { sectors: 10, form: 0 }),
                file_node("SECOND.BIN", "second.bin"),
            ],
        ),
    );
    // 23 base + first + 10 dummy + second
    assert_eq!(summary.total_sectors, 35);

    let reader = ImageReader::open(&image_path).unwrap();
    let records = reader.read_dir_records(22, 1);

    // No record for the dummy
    assert_eq!(records.len(), 4);
    let first = records.iter().find(|r| r.identifier == "FIRST.BIN;1").unwrap();
    let second = records.iter().find(|r| r.identifier == "SECOND.BIN;1").unwrap();
    assert_eq!(first.lba, 23);
    assert_eq!(second.lba, 34);

    // The gap sectors are zero-filled but fully checksummed
    let image = fs::read(&image_path).unwrap();
    let codec = SectorCodec::new();
    for lba in 24..34 {
        let sec = sector(&image, lba);
        assert!(sec[24..FORM1_EDC_OFFSET].iter().all(|&b| b == 0));
        assert_form1_checksums(&codec, sec);
    }
}

#[test]
fn form2_dummy_gap_is_checksummed() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.bin"), [0x11u8; 4]).unwrap();

    let (image_path, summary) = build_in(
        dir.path(),
        &project(
            "GAP2",
            vec![
                file_node("A.BIN", "a.bin"),
                Node::Dummy(DummyNode { sectors: 5, form: 1 }),
            ],
        ),
    );
    assert_eq!(summary.total_sectors, 29);

    let image = fs::read(&image_path).unwrap();
    let codec = SectorCodec::new();
    for lba in 24..29 {
        let sec = sector(&image, lba);
        // Form 2 blanks: submode flag in the subheader, zero data, no parity
        assert_eq!(&sec[16..24], &[0, 0, 0x20, 0, 0, 0, 0x20, 0]);
        assert!(sec[24..FORM2_EDC_OFFSET].iter().all(|&b| b == 0));

        let edc = codec.edc_partial(0, &sec[16..FORM2_EDC_OFFSET]);
        assert_ne!(edc, 0);
        assert_eq!(edc.to_le_bytes(), sec[FORM2_EDC_OFFSET..]);

        let mut copy: [u8; SECTOR_SIZE] = sec.try_into().unwrap();
        codec.encode_mode2_form2(&mut copy, true);
        assert_eq!(&copy[..], sec);
    }
}

#[test]
fn xa_file_occupies_one_form2_sector() {
    let dir = tempfile::tempdir().unwrap();
    // One Form 2 payload with a real-time audio subheader
    let mut payload = vec![0u8; 2336];
    payload[..8].copy_from_slice(&[0x01, 0x01, 0x64, 0x00, 0x01, 0x01, 0x64, 0x00]);
    payload[100] = 0x5A;
    fs::write(dir.path().join("song.xa"), &payload).unwrap();

    let mut entries = vec![Node::File(FileNode {
        name: "SONG.XA".into(),
        source: Some("song.xa".into()),
        kind: FileKind::Xa,
        trackid: None,
        date: Some(fixed_date()),
        attributes: EntryAttributes::default(),
    })];
    entries.push(file_node("PAD.BIN", "pad.bin"));
    fs::write(dir.path().join("pad.bin"), [0u8; 4]).unwrap();

    let (image_path, _) = build_in(dir.path(), &project("XA", entries));

    let reader = ImageReader::open(&image_path).unwrap();
    let records = reader.read_dir_records(22, 1);
    let song = records.iter().find(|r| r.identifier == "SONG.XA;1").unwrap();
    let pad = records.iter().find(|r| r.identifier == "PAD.BIN;1").unwrap();

    // Exactly one sector: the next file follows immediately
    assert_eq!(song.lba, 23);
    assert_eq!(pad.lba, 24);
    assert_eq!(song.size, 2048);

    let xa = song.xa.unwrap();
    assert_eq!(xa.attributes, 0x3800 | 0x555);
    assert_eq!(xa.file_number, 1);
    assert!(xa.flags().contains(XaFlags::FORM2 | XaFlags::INTERLEAVED));

    // The payload lands verbatim: subheader, data, and a Form 2 EDC
    let image = fs::read(&image_path).unwrap();
    let sec = sector(&image, 23);
    assert_eq!(&sec[16..24], &payload[..8]);
    assert_eq!(sec[116], 0x5A);

    let codec = SectorCodec::new();
    let edc = codec.edc_partial(0, &sec[16..FORM2_EDC_OFFSET]);
    assert_eq!(edc.to_le_bytes(), sec[FORM2_EDC_OFFSET..]);
}

#[test]
fn cdda_track_reference() {
    let dir = tempfile::tempdir().unwrap();

    // 588 stereo frames = exactly one audio sector
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: 44_100,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut wav = hound::WavWriter::create(dir.path().join("t2.wav"), spec).unwrap();
    for i in 0..588i16 {
        wav.write_sample(i).unwrap();
        wav.write_sample(-i).unwrap();
    }
    wav.finalize().unwrap();

    let mut tracks = vec![data_track(
        "CDDA",
        vec![
            // Padding pushes the audio past the first two minutes' worth of
            // sectors, as on any realistically sized disc
            Node::Dummy(DummyNode { sectors: 160, form: 0 }),
            Node::File(FileNode {
                name: "TRACK.DA".into(),
                source: None,
                kind: FileKind::Da,
                trackid: Some("02".into()),
                date: Some(fixed_date()),
                attributes: EntryAttributes::default(),
            }),
        ],
    )];
    tracks.push(Track {
        track_type: TrackType::Audio,
        source: Some("t2.wav".into()),
        trackid: Some("02".into()),
        identifiers: None,
        license: None,
        default_attributes: None,
        directory_tree: None,
    });
    let project = Project {
        image_name: None,
        cue_sheet: None,
        no_xa: false,
        tracks,
    };

    let image_path = dir.path().join("out.bin");
    let cue_path = dir.path().join("out.cue");
    let options = BuildOptions {
        project_dir: dir.path().to_path_buf(),
        output: Some(image_path.clone()),
        cue_file: Some(cue_path.clone()),
        timestamp: Some(fixed_date()),
        ..Default::default()
    };
    let summary = build(&project, &options).unwrap();

    // 23 filesystem sectors + 160 dummy sectors, then one audio sector
    assert_eq!(summary.total_sectors, 184);

    let cue = fs::read_to_string(&cue_path).unwrap();
    assert!(cue.contains("FILE \"out.bin\" BINARY"));
    assert!(cue.contains("TRACK 01 MODE2/2352"));
    // Virtual pregap; audio data at sector 183 = 00:02:33
    assert!(
        cue.contains("  TRACK 02 AUDIO\n    PREGAP 00:02:00\n    INDEX 01 00:02:33\n"),
        "unexpected cue:\n{cue}"
    );

    let reader = ImageReader::open(&image_path).unwrap();
    let records = reader.read_dir_records(22, 1);
    let da = records.iter().find(|r| r.identifier == "TRACK.DA;1").unwrap();
    assert!(da.xa.unwrap().flags().contains(XaFlags::CDDA));
    // The record points at the audio data, past the virtual pregap
    assert_eq!(da.lba, 183);
    assert_eq!(da.size, 2048);

    // Raw PCM, no sector framing
    let image = fs::read(&image_path).unwrap();
    let audio = sector(&image, 183);
    assert_eq!(&audio[..4], &[0, 0, 0, 0]);
    assert_eq!(&audio[4..8], &[1, 0, 0xFF, 0xFF]);
}

#[test]
fn unresolved_track_reference_fails() {
    let dir = tempfile::tempdir().unwrap();
    let project = project(
        "BAD",
        vec![Node::File(FileNode {
            name: "TRACK.DA".into(),
            source: None,
            kind: FileKind::Da,
            trackid: Some("07".into()),
            date: None,
            attributes: EntryAttributes::default(),
        })],
    );

    let options = BuildOptions {
        project_dir: dir.path().to_path_buf(),
        output: Some(dir.path().join("out.bin")),
        timestamp: Some(fixed_date()),
        ..Default::default()
    };
    let error = build(&project, &options).unwrap_err();
    assert!(matches!(error, IsoError::UnresolvedTrack(id) if id == "07"));
}

#[test]
fn failed_build_removes_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let mut track = data_track("CLEANUP", vec![]);
    track.license = Some(License {
        file: PathBuf::from("missing_license.dat"),
    });
    let project = Project {
        image_name: None,
        cue_sheet: None,
        no_xa: false,
        tracks: vec![track],
    };

    let image = dir.path().join("out.bin");
    let options = BuildOptions {
        project_dir: dir.path().to_path_buf(),
        output: Some(image.clone()),
        timestamp: Some(fixed_date()),
        ..Default::default()
    };
    assert!(matches!(
        build(&project, &options),
        Err(IsoError::SourceNotFound(_))
    ));
    assert!(!image.exists());
}

#[test]
fn existing_image_is_not_clobbered() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("out.bin");
    fs::write(&image, b"precious").unwrap();

    let options = BuildOptions {
        project_dir: dir.path().to_path_buf(),
        output: Some(image.clone()),
        timestamp: Some(fixed_date()),
        ..Default::default()
    };
    assert!(matches!(
        build(&project("KEEP", vec![]), &options),
        Err(IsoError::ImageExists(_))
    ));
    assert_eq!(fs::read(&image).unwrap(), b"precious");
}

#[test]
fn noxa_build_has_no_attribute_blocks() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.bin"), [1u8; 4]).unwrap();

    let image = dir.path().join("out.bin");
    let options = BuildOptions {
        project_dir: dir.path().to_path_buf(),
        output: Some(image.clone()),
        no_xa: true,
        timestamp: Some(fixed_date()),
        ..Default::default()
    };
    build(&project("PLAIN", vec![file_node("A.BIN", "a.bin")]), &options).unwrap();

    let reader = ImageReader::open(&image).unwrap();
    let records = reader.read_dir_records(22, 1);
    assert!(records[2].xa.is_none());

    // No CD-XA marker in the descriptor
    let image_bytes = fs::read(&image).unwrap();
    let pvd = &sector(&image_bytes, 16)[24..];
    assert_eq!(&pvd[1024..1032], &[0u8; 8]);
}

#[test]
fn extract_then_rebuild_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();

    // Source material: data files, a subdirectory, an XA stream, a dummy
    // gap, a license blob and one audio track
    fs::write(dir.path().join("main.exe"), vec![0x42u8; 5000]).unwrap();
    fs::write(dir.path().join("data.bin"), (0u32..800).map(|i| i as u8).collect::<Vec<u8>>()).unwrap();

    let mut xa_payload = vec![0u8; 2336 * 2];
    xa_payload[..8].copy_from_slice(&[0x01, 0x01, 0x64, 0x00, 0x01, 0x01, 0x64, 0x00]);
    xa_payload[2336..2344].copy_from_slice(&[0x01, 0x01, 0x08, 0x00, 0x01, 0x01, 0x08, 0x00]);
    fs::write(dir.path().join("song.xa"), &xa_payload).unwrap();

    let license: Vec<u8> = (0..12 * 2336u32).map(|i| (i % 251) as u8).collect();
    fs::write(dir.path().join("license.dat"), &license).unwrap();

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: 44_100,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut wav = hound::WavWriter::create(dir.path().join("t2.wav"), spec).unwrap();
    for i in 0..1000i16 {
        wav.write_sample(i).unwrap();
        wav.write_sample(i / 2).unwrap();
    }
    wav.finalize().unwrap();

    let mut track = data_track(
        "ROUNDTRIP",
        vec![
            file_node("MAIN.EXE", "main.exe"),
            Node::Dummy(DummyNode { sectors: 150, form: 0 }),
            Node::Dir(DirNode {
                name: Some("SUB".into()),
                date: Some(fixed_date()),
                entries: vec![
                    file_node("DATA.BIN", "data.bin"),
                    Node::File(FileNode {
                        name: "SONG.XA".into(),
                        source: Some("song.xa".into()),
                        kind: FileKind::Xa,
                        trackid: None,
                        date: Some(fixed_date()),
                        attributes: EntryAttributes::default(),
                    }),
                ],
                ..Default::default()
            }),
            Node::File(FileNode {
                name: "TRACK.DA".into(),
                source: None,
                kind: FileKind::Da,
                trackid: Some("02".into()),
                date: Some(fixed_date()),
                attributes: EntryAttributes::default(),
            }),
        ],
    );
    track.license = Some(License {
        file: PathBuf::from("license.dat"),
    });

    let project = Project {
        image_name: None,
        cue_sheet: None,
        no_xa: false,
        tracks: vec![
            track,
            Track {
                track_type: TrackType::Audio,
                source: Some("t2.wav".into()),
                trackid: Some("02".into()),
                identifiers: None,
                license: None,
                default_attributes: None,
                directory_tree: None,
            },
        ],
    };

    let original = dir.path().join("original.bin");
    let options = BuildOptions {
        project_dir: dir.path().to_path_buf(),
        output: Some(original.clone()),
        cue_file: Some(dir.path().join("original.cue")),
        timestamp: Some(fixed_date()),
        ..Default::default()
    };
    build(&project, &options).unwrap();

    // Extract into a fresh directory with a project description
    let extracted = dir.path().join("extracted");
    let script = extracted.join("project.json");
    let summary = extract(
        &original,
        &ExtractOptions {
            out_dir: extracted.clone(),
            script: Some(script.clone()),
        },
    )
    .unwrap();
    assert_eq!(summary.skipped, 0);

    // Rebuild from the emitted project
    let reparsed = psxiso::project::Project::from_json(&fs::read_to_string(&script).unwrap()).unwrap();
    let rebuilt = dir.path().join("rebuilt.bin");
    let rebuild_options = BuildOptions {
        project_dir: extracted.clone(),
        output: Some(rebuilt.clone()),
        cue_file: Some(dir.path().join("rebuilt.cue")),
        timestamp: Some(IsoDate {
            // A different clock must not leak into the output
            year: 120,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
            gmt_offs: 0,
        }),
        ..Default::default()
    };
    build(&reparsed, &rebuild_options).unwrap();

    let first = fs::read(&original).unwrap();
    let second = fs::read(&rebuilt).unwrap();
    assert_eq!(first.len(), second.len());
    if first != second {
        let index = first
            .iter()
            .zip(&second)
            .position(|(a, b)| a != b)
            .unwrap();
        panic!(
            "images differ at byte {index} (LBA {}, offset {})",
            index / SECTOR_SIZE,
            index % SECTOR_SIZE,
        );
    }
}
