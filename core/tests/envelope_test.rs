use chrono::DateTime;
use market_bus_core::envelope::{parse_offset, timestamp_now};
use market_bus_core::Envelope;
use serde_json::{json, Value};

#[test]
fn wire_format_uses_camel_case_fields() {
    let env = Envelope::builder("market-rest", "/user/create", json!({"username": "an"}))
        .event_id("evt-1")
        .timestamp("2024-01-02T03:04:05.678+07:00")
        .build();

    let wire: Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
    assert_eq!(
        wire,
        json!({
            "sourceId": "market-rest",
            "eventId": "evt-1",
            "uri": "/user/create",
            "timestamp": "2024-01-02T03:04:05.678+07:00",
            "payload": {"username": "an"}
        })
    );
}

#[test]
fn new_envelope_stamps_offset_timestamp_and_event_id() {
    let env = Envelope::new("market-rest", "/stock/update", json!({}));
    assert!(uuid::Uuid::parse_str(env.event_id()).is_ok());

    let ts = DateTime::parse_from_rfc3339(env.timestamp()).expect("RFC 3339 timestamp");
    assert_eq!(ts.offset().local_minus_utc(), 7 * 3600);
    assert!(env.timestamp().ends_with("+07:00"));
}

#[test]
fn builder_offset_changes_the_timestamp_zone() {
    let utc = parse_offset("Z").unwrap();
    let env = Envelope::builder("a", "/b", 1u32).offset(utc).build();
    assert!(env.timestamp().ends_with("+00:00"));
    // Millisecond precision
    let ts = timestamp_now(utc);
    let fraction = ts.split('.').nth(1).unwrap();
    assert_eq!(fraction.len(), "123+00:00".len());
}

#[test]
fn replies_without_event_id_or_timestamp_still_parse() {
    let raw = br#"{"sourceId":"market-worker","uri":"/stock/create","payload":{"success":true}}"#;
    let env: Envelope = Envelope::from_slice(raw).unwrap();
    assert_eq!(env.source_id(), "market-worker");
    assert_eq!(env.event_id(), "");
    assert_eq!(env.payload()["success"], true);
}

#[test]
fn payload_decodes_into_a_typed_reply() {
    #[derive(serde::Deserialize, Debug, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Ack {
        success: bool,
        error_code: Option<String>,
    }

    let env = Envelope::new("w", "/x", json!({"success": false, "errorCode": "E1"}));
    let typed = env.decode_payload::<Ack>().unwrap();
    assert_eq!(
        typed.payload(),
        &Ack {
            success: false,
            error_code: Some("E1".into())
        }
    );

    let bad = Envelope::new("w", "/x", json!("not an object"));
    assert!(bad.decode_payload::<Ack>().is_err());
}

#[test]
fn offsets_are_range_checked() {
    assert!(parse_offset("+07:00").is_some());
    assert!(parse_offset("+07").is_some());
    assert!(parse_offset("+25:00").is_none());
    assert!(parse_offset("+05:75").is_none());
    assert!(parse_offset("UTC").is_none());
}
