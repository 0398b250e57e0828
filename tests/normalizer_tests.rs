use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use forecast_edge::error::EngineError;
use forecast_edge::signal::{
    fetch_records, normalize, SourceSchema, StaticForecastSource, TemperatureUnit,
};

fn target() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 7, 14, 21, 0, 0).unwrap()
}

#[test]
/// Verifies Celsius payloads are converted to Fahrenheit for both the point
/// estimate and every ensemble member.
fn celsius_payload_is_converted() {
    let schema = SourceSchema {
        records_path: "daily".to_string(),
        point_field: "max".to_string(),
        ensemble_field: Some("members".to_string()),
        unit: TemperatureUnit::Celsius,
        ..SourceSchema::default()
    };
    let raw = json!({"daily": [{
        "max": 20.0,
        "members": [10.0, 20.0, 30.0],
        "issued_at": "2026-07-14T06:00:00Z",
        "target_time": "2026-07-14T18:00:00Z"
    }]});
    let records = normalize("ens", &schema, &raw, "NY", target(), target()).unwrap();
    assert_eq!(records.len(), 1);
    let r = &records[0];
    assert!((r.point_estimate() - 68.0).abs() < 1e-9);
    assert_eq!(r.ensemble_members(), Some(&[50.0, 68.0, 86.0][..]));
    assert_eq!(
        r.issued_at(),
        Utc.with_ymd_and_hms(2026, 7, 14, 6, 0, 0).unwrap()
    );
    assert_eq!(r.source_id(), "ens");
    assert_eq!(r.segment_id(), "NY");
}

#[test]
/// Verifies payloads without usable entries are reported as unavailable,
/// not as failures.
fn empty_or_mismatched_payloads_are_unavailable() {
    let schema = SourceSchema::default();
    let empty = normalize("nws", &schema, &json!([]), "NY", target(), target()).unwrap_err();
    assert!(matches!(empty, EngineError::DataUnavailable { .. }));
    assert!(empty.is_expected_skip());

    let other_day = json!([{"value": 80.0, "target_time": "2026-07-15T18:00:00Z"}]);
    let err = normalize("nws", &schema, &other_day, "NY", target(), target()).unwrap_err();
    assert!(matches!(err, EngineError::DataUnavailable { .. }));

    let no_value = json!([{"note": "missing"}]);
    let err = normalize("nws", &schema, &no_value, "NY", target(), target()).unwrap_err();
    assert!(matches!(err, EngineError::DataUnavailable { .. }));
}

#[tokio::test]
/// Verifies fetching through a source trait object: known dates yield records,
/// unknown dates are unavailable, failing sources surface external failures.
async fn fetch_records_through_source() {
    let date = target().date_naive();
    let source = StaticForecastSource::new("nws", SourceSchema::default())
        .with_payload("NY", date, json!([{"value": 84.0}]))
        .with_payload("NY", date, json!([]));
    let records = fetch_records(&source, "NY", target(), target()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!((records[0].point_estimate() - 84.0).abs() < 1e-9);

    let missing = fetch_records(&source, "MIA", target(), target())
        .await
        .unwrap_err();
    assert!(matches!(missing, EngineError::DataUnavailable { .. }));

    let broken = StaticForecastSource::new("down", SourceSchema::default()).failing("503");
    let err = fetch_records(&broken, "NY", target(), target())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ExternalFailure { .. }));
    assert!(err.is_recoverable());
}
