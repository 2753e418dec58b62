use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir =
        std::env::temp_dir().join(format!("m2m_cli_{label}_{}_{}", std::process::id(), nanos));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn write_config(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("decoder.json");
    fs::write(&path, body).expect("write config");
    path
}

fn assert_schema_version(value: &serde_json::Value) {
    assert_eq!(
        value.get("schema_version").and_then(|v| v.as_u64()),
        Some(1),
        "missing schema_version=1 field"
    );
}

fn run_m2m(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_m2m"))
        .args(args)
        .env("NO_COLOR", "1")
        .output()
        .expect("run m2m")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout
        .lines()
        .rev()
        .find(|line| line.trim_start().starts_with('{'))
        .unwrap_or_else(|| panic!("no JSON on stdout: {stdout}"));
    serde_json::from_str(line).expect("parse JSON output")
}

#[test]
fn help_lists_subcommands() {
    let output = run_m2m(&["help"]);
    assert!(
        output.status.success(),
        "m2m help failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("probe"), "missing probe in help output");
    assert!(stdout.contains("validate"), "missing validate in help output");
    assert!(stdout.contains("formats"), "missing formats in help output");
}

#[test]
fn validate_json_reports_accepted_config() {
    let dir = unique_temp_dir("validate_ok");
    let config = write_config(
        &dir,
        r#"{
            "codec": "h264",
            "coded_size": { "width": 1920, "height": 1088 },
            "output_format": "yuv420p",
            "num_capture_buffers": 12,
            "num_output_buffers": 8
        }"#,
    );

    let output = run_m2m(&["validate", "--config", config.to_str().expect("utf8"), "--json"]);
    assert!(
        output.status.success(),
        "validate failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["command"], "validate");
    assert_eq!(value["ok"], true);
    assert_eq!(value["codec"], "h264");
    assert_eq!(value["bitstream_filter"], "h264_mp4toannexb");
    assert_eq!(value["output_format"], "yuv420p");
    assert_eq!(value["coded_size"]["height"], 1088);
    assert_eq!(value["num_capture_buffers"], 12);

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn validate_json_rejects_small_capture_pool() {
    let dir = unique_temp_dir("validate_small_pool");
    let config = write_config(&dir, r#"{ "codec": "vp8", "num_capture_buffers": 4 }"#);

    let output = run_m2m(&["validate", "--config", config.to_str().expect("utf8"), "--json"]);
    assert!(!output.status.success(), "small capture pool must be rejected");

    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["command"], "validate");
    assert_eq!(value["ok"], false);
    assert_eq!(value["error_code"], 400);
    let error = value["error"].as_str().expect("error string");
    assert!(error.contains("num_capture_buffers"), "unexpected error: {error}");

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn validate_rejects_stale_schema_version() {
    let dir = unique_temp_dir("validate_schema");
    let config = write_config(&dir, r#"{ "config_schema_version": 7, "codec": "hevc" }"#);

    let output = run_m2m(&["validate", "--config", config.to_str().expect("utf8"), "--json"]);
    assert!(!output.status.success());

    let value = stdout_json(&output);
    let error = value["error"].as_str().expect("error string");
    assert!(error.contains("schema mismatch"), "unexpected error: {error}");

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn probe_missing_device_reports_open_failure() {
    let dir = unique_temp_dir("probe_missing");
    let device = dir.join("video-does-not-exist");
    let device = device.to_str().expect("utf8");

    let output = run_m2m(&["probe", "--device", device, "--json"]);
    assert!(!output.status.success(), "probe of a missing node must fail");

    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["command"], "probe");
    assert_eq!(value["ok"], false);
    assert_eq!(value["error_code"], 101);
    let error = value["error"].as_str().expect("error string");
    assert!(error.contains(device), "error should name the device: {error}");

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn formats_json_lists_pixel_formats_and_codecs() {
    let output = run_m2m(&["formats", "--json"]);
    assert!(
        output.status.success(),
        "formats failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["ok"], true);

    let formats = value["formats"].as_array().expect("formats array");
    assert!(
        formats
            .iter()
            .any(|f| f["format"] == "nv12" && f["fourcc"] == "NV12"),
        "nv12 missing: {formats:?}"
    );
    assert!(
        formats
            .iter()
            .any(|f| f["format"] == "nv12_tiled" && f["fourcc"] == "TM12"),
        "tiled nv12 missing: {formats:?}"
    );

    let codecs = value["codecs"].as_array().expect("codecs array");
    let h264 = codecs
        .iter()
        .find(|c| c["codec"] == "h264")
        .expect("h264 listed");
    assert_eq!(h264["fourcc"], "H264");
    assert_eq!(h264["bitstream_filter"], "h264_mp4toannexb");
    let vp8 = codecs
        .iter()
        .find(|c| c["codec"] == "vp8")
        .expect("vp8 listed");
    assert!(vp8["bitstream_filter"].is_null());
}

#[test]
fn formats_plain_output_is_human_readable() {
    let output = run_m2m(&["formats"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("pixel formats:"));
    assert!(stdout.contains("codecs:"));
}
