use fg_domain::config::Config;
use fg_domain::device::Environment;

#[test]
fn default_host_is_localhost() {
    let config = Config::default();
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.environment, Environment::Lab);
}

#[test]
fn explicit_zero_host_parses() {
    let toml_str = r#"
[server]
host = "0.0.0.0"
port = 3443
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.server.host, "0.0.0.0");
}

#[test]
fn secrets_stay_out_of_the_config_file() {
    // Only env-var *names* are configurable; raw secrets have no field.
    let config = Config::default();
    let rendered = toml::to_string(&config).unwrap();
    assert!(rendered.contains("FLEETGATE_VAULT_KEY"));
    assert!(rendered.contains("FLEETGATE_APPROVAL_SECRET"));
}
