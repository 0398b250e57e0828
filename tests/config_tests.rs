use forecast_edge::config::Config;
use forecast_edge::observation::Extreme;
use forecast_edge::signal::TemperatureUnit;

const DEFAULT_TOML: &str = include_str!("../config/default.toml");

#[test]
fn parse_shipped_default_toml() {
    let config = Config::from_toml_str(DEFAULT_TOML).unwrap();
    assert_eq!(config.scan_interval_ms().unwrap(), 30_000);
    assert_eq!(config.engine.horizon_days, 2);

    let segments: Vec<&str> = config.segments.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(segments, vec!["NY", "PHIL", "MIA"]);
    assert!((config.fallback_spread_for("MIA") - 2.5).abs() < f64::EPSILON);
    assert!((config.fallback_spread_for("PHIL") - 3.5).abs() < f64::EPSILON);

    assert_eq!(config.sources.len(), 2);
    let ensemble = &config.sources[0];
    assert!(ensemble.is_ensemble);
    assert_eq!(ensemble.schema.unit, TemperatureUnit::Celsius);
    assert_eq!(ensemble.schema.records_path, "daily");
    let nws = &config.sources[1];
    assert_eq!(nws.schema.records_path, "properties.periods");
    assert_eq!(nws.schema.issued_at_field.as_deref(), Some("generatedAt"));

    assert_eq!(config.sizing.segment_correlations.len(), 1);
    assert_eq!(config.risk.drawdown_levels.len(), 4);
    assert_eq!(config.adaptive.cooldown_ms().unwrap(), 86_400_000);
    assert_eq!(config.risk.loss_cooldown_ms().unwrap(), 1_800_000);

    assert!(config.exit.enabled);
    assert_eq!(config.exit.min_hold_ms().unwrap(), 300_000);
    assert!(config.observations.enabled);
    assert!(config.observations.source.is_none());
    let ny = config.segment("NY").unwrap();
    assert_eq!(ny.extreme, Extreme::High);
    assert_eq!(ny.utc_offset_hours, -5);
}

#[test]
fn empty_toml_uses_defaults() {
    let config = Config::from_toml_str("").unwrap();
    assert!(config.sources.is_empty());
    assert!((config.edge.fee_rate - 0.05).abs() < f64::EPSILON);
    assert_eq!(config.gateway.circuit_breaker_failures, 3);
    assert_eq!(config.persistence.path("segments.json").to_string_lossy(), "data/segments.json");
}

#[test]
/// Verifies validation rejects values that would break the engine at runtime.
fn invalid_values_are_rejected() {
    assert!(Config::from_toml_str("[edge]\nfee_rate = 1.5\n").is_err());
    assert!(Config::from_toml_str("[edge]\nmax_buy_price_cents = 120\n").is_err());
    assert!(Config::from_toml_str("[adaptive]\ncooldown = \"soon\"\n").is_err());
    assert!(Config::from_toml_str("[risk]\nloss_cooldown = \"0m\"\n").is_err());
    assert!(Config::from_toml_str("[fusion]\nbin_width = 0.0\n").is_err());
    assert!(Config::from_toml_str(
        "[[sources]]\nid = \"bad\"\nurl_template = \"not a url {segment}\"\n"
    )
    .is_err());
}
