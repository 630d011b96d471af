use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use binwise::{
    BoundingBox, CameraDiscovery, CaptureBackend, CaptureSettings, ChannelSink, Detection,
    PipelineConfig, PipelineController, PipelineError, PipelineEvent, PipelineState,
    SharedBackend, StubBackend,
};
use binwise::ingest::SyntheticDriver;

fn discovery() -> CameraDiscovery {
    let settings = CaptureSettings {
        width: 640,
        height: 480,
        fps: 100,
        buffer_depth: 1,
    };
    CameraDiscovery::new(vec![0], vec![CaptureBackend::Any], settings)
        .with_driver(Arc::new(SyntheticDriver::new(640, 480)))
}

// A 640x480 frame letterboxed to 640x640 gains 80px of padding on top, so the
// source box (100, 100, 200, 200) sits at (100, 180, 200, 280) in detector space.
fn bottle_backend() -> SharedBackend {
    let detector_space = BoundingBox::new(100.0, 180.0, 200.0, 280.0);
    Arc::new(Mutex::new(
        StubBackend::new(vec!["bottle".into()])
            .with_detections(vec![Detection::new(0, "bottle", 0.9, detector_space)]),
    ))
}

#[test]
fn detections_reach_the_sink_in_display_space() {
    let mut pipeline = PipelineController::new(PipelineConfig::default(), discovery());
    pipeline.attach_detector(bottle_backend());
    let (sink, rx) = ChannelSink::new();
    pipeline.set_sink(Box::new(sink));
    pipeline.start().expect("start pipeline");
    assert_eq!(pipeline.state(), PipelineState::Running);

    let mut detection_events = Vec::new();
    let mut labels = Vec::new();
    let mut plain_frames = 0;
    let deadline = Instant::now() + Duration::from_secs(10);
    while detection_events.len() < 3 && Instant::now() < deadline {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(PipelineEvent::PlainFrame(frame)) => {
                assert_eq!(frame.dimensions(), (640, 640));
                plain_frames += 1;
            }
            Ok(PipelineEvent::AnnotatedFrame(frame)) => {
                assert_eq!(frame.image.dimensions(), (640, 640));
                labels.extend(frame.labels.into_iter().map(|l| l.text));
            }
            Ok(PipelineEvent::Detections(d)) => detection_events.push(d),
            Err(_) => {}
        }
    }
    pipeline.stop().expect("stop pipeline");
    assert_eq!(pipeline.state(), PipelineState::Stopped);

    assert!(detection_events.len() >= 3, "only {} detection events", detection_events.len());
    assert!(plain_frames >= 3);
    for detections in &detection_events {
        assert_eq!(detections.len(), 1);
        let d = &detections[0];
        assert_eq!(d.class_name, "bottle");
        assert!((d.bbox.x1 - 100.0).abs() < 0.5, "{:?}", d.bbox);
        assert!((d.bbox.y1 - 133.33).abs() < 0.5, "{:?}", d.bbox);
        assert!((d.bbox.x2 - 200.0).abs() < 0.5, "{:?}", d.bbox);
        assert!((d.bbox.y2 - 266.67).abs() < 0.5, "{:?}", d.bbox);
    }
    assert!(labels.iter().all(|text| text == "bottle 0.90"));
    assert!(!labels.is_empty());
    assert!(pipeline.stats().frames_processed >= 3);
}

#[test]
fn start_without_model_reports_model_not_loaded() {
    let mut pipeline = PipelineController::new(PipelineConfig::default(), discovery());
    assert!(matches!(pipeline.start(), Err(PipelineError::ModelNotLoaded)));
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    pipeline.stop().expect("stop is idempotent");
}

#[test]
fn pipeline_can_restart_after_stop() {
    let mut pipeline = PipelineController::new(PipelineConfig::default(), discovery());
    pipeline.attach_detector(bottle_backend());
    for _ in 0..2 {
        let (sink, rx) = ChannelSink::new();
        pipeline.set_sink(Box::new(sink));
        pipeline.start().expect("start pipeline");
        let got_event = rx.recv_timeout(Duration::from_secs(5)).is_ok();
        pipeline.stop().expect("stop pipeline");
        assert!(got_event);
    }
}
