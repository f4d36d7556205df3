use std::collections::HashMap;
use std::path::Path;

use bay_config::{apply_overrides, default_config, load_config, DriverKind};
use bay_domain::{Capability, ProfileId};

#[test]
fn load_valid_fixture() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/bay.yml");
    let config = load_config(&path).expect("should load without error");

    assert_eq!(config.server.port, 9000);
    assert_eq!(config.driver, DriverKind::Docker);
    assert_eq!(config.gc.interval.as_secs(), 120);

    let profile = config
        .profile(&ProfileId::new("code-small"))
        .expect("fixture profile present");
    assert_eq!(profile.containers.len(), 1);
    assert!(profile.containers[0]
        .capabilities
        .contains(&Capability::Python));
}

#[test]
fn defaults_carry_builtin_profiles() {
    let config = default_config();
    assert!(config.profile(&ProfileId::new("python-default")).is_some());

    let browser = config
        .profile(&ProfileId::new("browser-python"))
        .expect("browser-python profile");
    assert_eq!(browser.containers.len(), 2);
    let gull = browser
        .select_container(Capability::Browser)
        .expect("browser container");
    assert_eq!(gull.name, "gull");
}

#[test]
fn missing_file_returns_error() {
    assert!(load_config(Path::new("/nonexistent/bay.yml")).is_err());
}

#[test]
fn overrides_take_precedence() {
    let mut config = default_config();
    let vars: HashMap<String, String> = [
        ("BAY_API_TOKEN", "sekrit"),
        ("BAY_DRIVER", "docker"),
        ("BAY_PORT", "9001"),
        ("BAY_GC_INTERVAL_SECS", "30"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    apply_overrides(&mut config, &vars).unwrap();
    assert_eq!(config.server.api_token.as_deref(), Some("sekrit"));
    assert_eq!(config.driver, DriverKind::Docker);
    assert_eq!(config.server.port, 9001);
    assert_eq!(config.gc.interval.as_secs(), 30);
}

#[test]
fn malformed_override_is_an_error() {
    let mut config = default_config();
    let vars: HashMap<String, String> =
        [("BAY_PORT".to_string(), "not-a-port".to_string())].into_iter().collect();
    assert!(apply_overrides(&mut config, &vars).is_err());
}
