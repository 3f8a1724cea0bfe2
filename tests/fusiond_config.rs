use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use fusion_pipeline::config::FusionConfig;
use fusion_pipeline::{BackendRegistry, DeliveryMode, DepthSampling, TrackerConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "FUSION_CONFIG",
        "FUSION_SOURCE_URL",
        "FUSION_DETECTOR",
        "FUSION_DEPTH",
        "FUSION_DELIVERY",
        "FUSION_DRAIN_TIMEOUT_MS",
        "FUSION_UNHEALTHY_THRESHOLD",
        "FUSION_TRACKING",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = FusionConfig::load().expect("load config");
    assert_eq!(cfg.source.width, 640);
    assert_eq!(cfg.source.height, 480);
    assert_eq!(cfg.source.fps, 30);
    assert_eq!(cfg.detector.backend, "color");
    assert_eq!(cfg.depth.backend, "luminance");
    assert_eq!(cfg.pipeline.delivery, DeliveryMode::Inline);
    assert_eq!(cfg.pipeline.unhealthy_threshold, 3);
    assert_eq!(cfg.pipeline.drain_timeout, Duration::from_secs(2));
    assert_eq!(cfg.fusion.sampling, DepthSampling::Center);
    assert_eq!(cfg.tracking, None);
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "source": { "url": "stub://bench", "width": 320, "height": 240, "fps": 15 },
            "detector": { "backend": "stub", "min_score": 0.4, "max_detections": 10 },
            "depth": { "backend": "ground", "near_m": 1.0, "far_m": 30.0, "stride": 2 },
            "fusion": { "sampling": "median", "focal_scale": 1.1 },
            "pipeline": { "delivery": "threaded", "delivery_queue": 8, "drain_timeout_ms": 500 }
        }"#,
    );

    std::env::set_var("FUSION_CONFIG", file.path());
    std::env::set_var("FUSION_DEPTH", "constant");
    std::env::set_var("FUSION_UNHEALTHY_THRESHOLD", "5");

    let cfg = FusionConfig::load().expect("load config");

    assert_eq!(cfg.source.url, "stub://bench");
    assert_eq!((cfg.source.width, cfg.source.height, cfg.source.fps), (320, 240, 15));
    assert_eq!(cfg.detector.backend, "stub");
    assert_eq!(cfg.detector.min_score, 0.4);
    assert_eq!(cfg.detector.max_detections, 10);
    assert_eq!(cfg.depth.backend, "constant");
    assert_eq!(cfg.depth.far_m, 30.0);
    assert_eq!(cfg.depth.stride, 2);
    assert_eq!(cfg.fusion.sampling, DepthSampling::Median);
    assert_eq!(cfg.pipeline.delivery, DeliveryMode::Threaded);
    assert_eq!(cfg.pipeline.delivery_queue, 8);
    assert_eq!(cfg.pipeline.drain_timeout, Duration::from_millis(500));
    assert_eq!(cfg.pipeline.unhealthy_threshold, 5);

    let pipeline = cfg.pipeline_config();
    assert_eq!(pipeline.unhealthy_threshold, 5);
    assert_eq!(pipeline.filter.min_score, 0.4);

    let registry = BackendRegistry::with_builtin();
    assert_eq!(registry.create_depth(&cfg.depth).unwrap().name(), "constant");
    assert_eq!(registry.create_detector(&cfg.detector).unwrap().name(), "stub");

    clear_env();
}

#[test]
fn rejects_inverted_depth_range() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{ "depth": { "near_m": 5.0, "far_m": 2.0 } }"#);
    std::env::set_var("FUSION_CONFIG", file.path());

    let err = FusionConfig::load().unwrap_err();
    assert!(err.to_string().contains("near_m < far_m"));

    clear_env();
}

#[test]
fn rejects_zero_unhealthy_threshold() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("FUSION_UNHEALTHY_THRESHOLD", "0");
    let err = FusionConfig::load().unwrap_err();
    assert!(err.to_string().contains("unhealthy_threshold"));

    clear_env();
}

#[test]
fn rejects_unknown_delivery_mode() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("FUSION_DELIVERY", "carrier-pigeon");
    let err = FusionConfig::load().unwrap_err();
    assert!(err.to_string().contains("FUSION_DELIVERY"));

    clear_env();
}

#[test]
fn rejects_unknown_top_level_keys() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{ "camera": { "url": "stub://x" } }"#);
    std::env::set_var("FUSION_CONFIG", file.path());
    assert!(FusionConfig::load().is_err());

    clear_env();
}

#[test]
fn tracking_section_and_env_switch() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{ "tracking": { "enabled": true, "min_hits": 2, "iou_threshold": 0.5 } }"#,
    );
    std::env::set_var("FUSION_CONFIG", file.path());
    let cfg = FusionConfig::load().expect("load config");
    let tracking = cfg.tracking.expect("tracking enabled");
    assert_eq!(tracking.min_hits, 2);
    assert_eq!(tracking.iou_threshold, 0.5);
    assert_eq!(tracking.max_objects, TrackerConfig::default().max_objects);
    assert_eq!(cfg.pipeline_config().tracking, Some(tracking));

    std::env::set_var("FUSION_TRACKING", "off");
    assert_eq!(FusionConfig::load().expect("load config").tracking, None);

    std::env::remove_var("FUSION_CONFIG");
    std::env::set_var("FUSION_TRACKING", "on");
    assert_eq!(
        FusionConfig::load().expect("load config").tracking,
        Some(TrackerConfig::default())
    );

    std::env::set_var("FUSION_TRACKING", "sometimes");
    assert!(FusionConfig::load()
        .unwrap_err()
        .to_string()
        .contains("FUSION_TRACKING"));

    clear_env();
}

#[test]
fn rejects_out_of_range_tracking_overlap() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{ "tracking": { "enabled": true, "iou_threshold": 1.5 } }"#);
    std::env::set_var("FUSION_CONFIG", file.path());
    let err = FusionConfig::load().unwrap_err();
    assert!(err.to_string().contains("tracking.iou_threshold"));

    clear_env();
}
