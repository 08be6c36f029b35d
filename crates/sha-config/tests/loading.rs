use std::path::Path;
use std::sync::Mutex;

use sha_config::{load, StoreLocation};

// Config env vars are process-global; serialize the tests that touch them so
// they don't race each other's `std::env::set_var`/`remove_var` calls.
static ENV_LOCK: Mutex<()> = Mutex::new(());

const ENV_VARS: &[&str] = &[
    "SHA_TUNNEL_ENDPOINT",
    "SHA_CONTROL_API_TOKEN",
    "SHA_STORE_POSTGRES_URL",
    "SHA_DEVICE_OBSERVER_POLL_INTERVAL_MS",
    "SHA_DEBUG",
    "SHA_CLOUDSTACK_API_URL",
    "SHA_CLOUDSTACK_API_KEY",
    "SHA_CLOUDSTACK_SECRET_KEY",
    "SHA_CLOUDSTACK_DOMAIN",
    "SHA_CLOUDSTACK_ZONE",
];

fn clear_env() {
    for var in ENV_VARS {
        std::env::remove_var(var);
    }
}

#[test]
fn load_valid_fixture() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/config.toml");
    let config = load(Some(&path)).expect("should load without error");

    assert_eq!(config.tunnel_endpoint, "https://tunnel.example.com:8443");
    assert_eq!(config.control_api_token, "file-token");
    assert_eq!(config.cloudstack.zone, "zone-1");
    assert!(matches!(config.store, StoreLocation::Memory));
}

#[test]
fn env_overlay_wins_over_file_value() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    std::env::set_var("SHA_CONTROL_API_TOKEN", "env-token");
    std::env::set_var("SHA_STORE_POSTGRES_URL", "postgres://localhost/sha");

    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/config.toml");
    let config = load(Some(&path)).expect("should load without error");

    assert_eq!(config.control_api_token, "env-token");
    match config.store {
        StoreLocation::Postgres(url) => assert_eq!(url, "postgres://localhost/sha"),
        StoreLocation::Memory => panic!("expected postgres url from env to win"),
    }

    clear_env();
}

#[test]
fn missing_file_with_complete_env_still_loads() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    std::env::set_var("SHA_TUNNEL_ENDPOINT", "https://tunnel.example.com");
    std::env::set_var("SHA_CONTROL_API_TOKEN", "env-only-token");
    std::env::set_var("SHA_CLOUDSTACK_API_URL", "https://cs.example.com/api");
    std::env::set_var("SHA_CLOUDSTACK_API_KEY", "k");
    std::env::set_var("SHA_CLOUDSTACK_SECRET_KEY", "s");
    std::env::set_var("SHA_CLOUDSTACK_DOMAIN", "ROOT");
    std::env::set_var("SHA_CLOUDSTACK_ZONE", "zone-1");

    let config = load(Some(Path::new("/nonexistent/config.toml"))).expect("env alone should suffice");
    assert_eq!(config.tunnel_endpoint, "https://tunnel.example.com");
    assert!(matches!(config.store, StoreLocation::Memory));

    clear_env();
}

#[test]
fn missing_required_field_is_a_config_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let err = load(Some(Path::new("/nonexistent/config.toml"))).unwrap_err();
    assert!(matches!(err, sha_config::ConfigError::MissingField { .. }));
}
