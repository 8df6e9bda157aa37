use syncrec::convert::{self, FrameGeometry, SegmentPolicy, Y4mEncoder};
use syncrec::device::sim::{SimOptions, SimulatedSystem};
use syncrec::diagnostics;
use syncrec::sink::{self, SessionRecord};
use syncrec::{CaptureSession, PixelFormat, RigConfig};

fn record_session(dir: &std::path::Path, frames: u64) -> syncrec::capture::SessionReport {
    let mut config = RigConfig::new("sim-0000", dir);
    config.buffer_depth = 2;
    config.max_frames = Some(frames);
    let mut system = SimulatedSystem::with_cameras(
        2,
        SimOptions {
            lossless: true,
            frame_limit: Some(frames + 2),
            ..SimOptions::default()
        },
    );
    let report = CaptureSession::new(config)
        .with_stamp("20240301_090000")
        .run(&mut system)
        .expect("session runs");
    assert!(report.outcome.is_success());
    report
}

#[test]
fn recording_converts_into_bounded_segments() {
    let dir = tempfile::tempdir().unwrap();
    let report = record_session(dir.path(), 25);
    let record = SessionRecord::load(&report.metadata_path).unwrap();

    let input = &report.devices[1].binary_path;
    let name = input.file_name().and_then(|name| name.to_str());
    let geometry = FrameGeometry::from_record(&record, name);
    assert_eq!(geometry.pixel_format, PixelFormat::Mono8);
    assert_eq!(geometry.frame_size(), 64 * 48);

    let out = dir.path().join("video");
    std::fs::create_dir(&out).unwrap();
    let policy = SegmentPolicy {
        max_frames: 10,
        ..SegmentPolicy::default()
    };
    let mut encoder = Y4mEncoder::new();
    let mut progress = Vec::new();
    let summary = convert::convert_file(input, &out, &geometry, &policy, &mut encoder, |n| {
        progress.push(n)
    })
    .unwrap();

    assert_eq!(summary.frames, 25);
    assert_eq!(summary.trailing_bytes, 0);
    assert_eq!(progress.len(), 25);
    assert_eq!(progress.last(), Some(&25));
    let names: Vec<String> = summary
        .segments
        .iter()
        .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec![
            "20240301_090000_sim-0001_file1_1.y4m",
            "20240301_090000_sim-0001_file1_2.y4m",
            "20240301_090000_sim-0001_file1_3.y4m",
        ]
    );

    for (segment, frames) in summary.segments.iter().zip([10usize, 10, 5]) {
        let mut decoder = y4m::decode(std::fs::File::open(segment).unwrap()).unwrap();
        assert_eq!((decoder.get_width(), decoder.get_height()), (64, 48));
        assert_eq!(decoder.get_framerate().num, 100);
        let mut decoded = 0;
        while let Ok(frame) = decoder.read_frame() {
            assert_eq!(frame.get_y_plane().len(), 64 * 48);
            decoded += 1;
        }
        assert_eq!(decoded, frames);
    }

    // The first frame of the second segment is the eleventh recorded frame.
    let mut decoder = y4m::decode(std::fs::File::open(&summary.segments[1]).unwrap()).unwrap();
    let frame = decoder.read_frame().unwrap();
    let frame_id = u64::from_le_bytes(frame.get_y_plane()[..8].try_into().unwrap());
    assert_eq!(frame_id, 12);
}

#[test]
fn trailing_partial_frame_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let report = record_session(dir.path(), 4);
    let record = SessionRecord::load(&report.metadata_path).unwrap();
    let input = report.devices[0].binary_path.clone();

    let mut bytes = std::fs::read(&input).unwrap();
    bytes.extend_from_slice(&[7; 100]);
    std::fs::write(&input, &bytes).unwrap();

    let geometry = FrameGeometry::from_record(&record, None);
    let mut encoder = Y4mEncoder::new();
    let summary = convert::convert_file(
        &input,
        dir.path(),
        &geometry,
        &SegmentPolicy::default(),
        &mut encoder,
        |_| {},
    )
    .unwrap();
    assert_eq!(summary.frames, 4);
    assert_eq!(summary.trailing_bytes, 100);
    assert_eq!(summary.segments.len(), 1);
}

#[test]
fn byte_limit_splits_segments() {
    let dir = tempfile::tempdir().unwrap();
    let report = record_session(dir.path(), 7);
    let record = SessionRecord::load(&report.metadata_path).unwrap();
    let geometry = FrameGeometry::from_record(&record, None);
    let policy = SegmentPolicy {
        max_frames: 5000,
        max_bytes: 3 * geometry.frame_size() as u64,
    };
    let mut encoder = Y4mEncoder::new();
    let summary = convert::convert_file(
        &report.devices[0].binary_path,
        dir.path(),
        &geometry,
        &policy,
        &mut encoder,
        |_| {},
    )
    .unwrap();
    assert_eq!(summary.frames, 7);
    assert_eq!(summary.segments.len(), 3);
}

#[test]
fn log_diagnostics_match_the_recording() {
    let dir = tempfile::tempdir().unwrap();
    let report = record_session(dir.path(), 40);
    let rows = sink::read_log(&report.log_path).unwrap();
    let diagnostics = diagnostics::analyze(&rows, diagnostics::DEFAULT_CRITICAL_INTERVAL_S);

    assert_eq!(diagnostics.total_rows, 80);
    assert_eq!(diagnostics.cameras.len(), 2);
    for camera in &diagnostics.cameras {
        assert_eq!(camera.frames_recorded, 40);
        assert_eq!(camera.dropped_frames, 0);
        assert_eq!(camera.first_frame_id, 2);
        assert_eq!(camera.last_frame_id, 41);
    }
    assert_eq!(diagnostics.cameras[1].serial, "sim-0001");
    assert_eq!(diagnostics.cameras[1].identity, 1);
}
