use std::io::Write;

use keyseek_core::Config;
use pretty_assertions::assert_eq;

#[test]
fn test_load_from_toml_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[planner]\nenable_distinct_scan = true\nallow_fetch = false\n\n[executor]\nmax_blocking_sort_documents = 10\nmax_replans = 1"
    )
    .unwrap();

    let config = Config::load_from_path(file.path()).unwrap();
    assert!(config.planner.enable_distinct_scan);
    assert!(!config.planner.allow_fetch);
    assert_eq!(config.executor.max_blocking_sort_documents, 10);
    assert_eq!(config.executor.max_replans, 1);
}

#[test]
fn test_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load_from_path(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, Config::default());
}

#[test]
fn test_invalid_toml_is_an_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[planner]\nallow_fetch = \"sometimes\"").unwrap();
    assert!(Config::load_from_path(file.path()).is_err());
}
