use std::{env, fs};

use strata_server::config::loader::load_config;

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("strata.toml");
    let cache_dir = dir.path().join("bodies");

    let toml_content = format!(
        r#"
[server]
host = "127.0.0.1"
port = 8081
workers = 2

[cache]
enabled = true
directory = "{}"
local_capacity = 256
load_factor = 0.5
await_timeout_ms = 5000

[logging]
level = "debug"
"#,
        cache_dir.display()
    );
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.server.port, 8081);
    assert_eq!(cfg.worker_count(), 2);
    assert_eq!(cfg.cache.local_capacity, 256);
    assert_eq!(cfg.cache.directory, cache_dir);
    assert_eq!(cfg.cache.max_miss_attempts, 8);
    assert_eq!(cfg.logging.level.to_ascii_lowercase(), "debug");

    // 2) Env override should win over file
    unsafe {
        env::set_var("STRATA__CACHE__LOCAL_CAPACITY", "512");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.cache.local_capacity, 512);
    unsafe {
        env::remove_var("STRATA__CACHE__LOCAL_CAPACITY");
    }

    // 3) Invalid config (capacity not a power of two) should error
    let invalid_path = dir.path().join("invalid.toml");
    let invalid_toml = r#"
[cache]
local_capacity = 1000
"#;
    fs::write(&invalid_path, invalid_toml).expect("write invalid toml");
    let err = load_config(invalid_path.to_str()).expect_err("expected validation error");
    assert!(err.contains("power of two"));

    // 4) Missing file falls back to defaults
    let missing = dir.path().join("missing.toml");
    let cfg = load_config(missing.to_str()).expect("defaults");
    assert!(cfg.cache.enabled);
    assert_eq!(cfg.server.port, 8080);
}
