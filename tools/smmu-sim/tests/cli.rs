#![cfg(not(target_arch = "wasm32"))]

use std::fs;
use std::path::PathBuf;

use tempfile::tempdir;

fn bundled_scenario() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scenarios/nested_stall.json")
}

#[test]
fn bundled_scenario_passes_and_reports_json() {
    let output = assert_cmd::cargo::cargo_bin_cmd!("smmu-sim")
        .arg(bundled_scenario())
        .args(["--preset", "development", "--threads", "2"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let report: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(report["failedExpectations"], 0);
    assert_eq!(report["translations"].as_array().unwrap().len(), 5);
    assert_eq!(report["priResponsesQueued"], 1);
    assert_eq!(report["replay"]["translations"], 10);
    assert_eq!(report["statistics"]["priResponses"], 1);
    assert_eq!(report["statistics"]["totalTranslations"], 15);
}

#[test]
fn failed_expectation_exits_non_zero() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.json");
    fs::write(
        &path,
        r#"{
            "streams": [{ "streamId": 1, "pasids": [{ "pasid": 1 }] }],
            "steps": [{ "translate": { "streamId": 1, "pasid": 1, "iova": "0x1000",
                                       "expect": { "pa": "0x1000" } } }]
        }"#,
    )
    .unwrap();

    let output = assert_cmd::cargo::cargo_bin_cmd!("smmu-sim")
        .arg(&path)
        .assert()
        .failure()
        .get_output()
        .clone();
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["failedExpectations"], 1);
    assert_eq!(report["translations"][0]["errorKind"], "PageNotMapped");
    assert!(String::from_utf8_lossy(&output.stderr).contains("1 expectation(s) failed"));
}

#[test]
fn config_file_overrides_preset() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("config.json");
    fs::write(&config, r#"{ "address": { "maxIovaBits": 32 } }"#).unwrap();
    let scenario = dir.path().join("wide.json");
    fs::write(
        &scenario,
        r#"{
            "streams": [{ "streamId": 1, "pasids": [{ "pasid": 1 }] }],
            "steps": [{ "translate": { "streamId": 1, "pasid": 1, "iova": "0x10_0000_0000",
                                       "expect": { "error": "InvalidAddress" } } }]
        }"#,
    )
    .unwrap();

    assert_cmd::cargo::cargo_bin_cmd!("smmu-sim")
        .arg(&scenario)
        .arg("--config")
        .arg(&config)
        .args(["--preset", "high-performance"])
        .assert()
        .success();
}

#[test]
fn malformed_scenario_is_an_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.json");
    fs::write(&path, r#"{ "steps": [ "explode" ] }"#).unwrap();
    assert_cmd::cargo::cargo_bin_cmd!("smmu-sim")
        .arg(&path)
        .assert()
        .failure();
}
