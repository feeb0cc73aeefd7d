use jsonschema::JSONSchema;
use serde_json::json;

fn compile(schema: &str) -> JSONSchema {
    let schema_json: serde_json::Value = serde_json::from_str(schema).unwrap();
    let schema_static: &'static serde_json::Value = Box::leak(Box::new(schema_json));
    JSONSchema::options().compile(schema_static).unwrap()
}

fn event_lines() -> Vec<serde_json::Value> {
    include_str!("resources/log_data/2018/11/2018-11-05-events.json")
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[test]
fn every_fixture_event_is_valid() {
    let compiled = compile(include_str!("../schemas/staging_events.v1.json"));
    let events = event_lines();
    assert_eq!(events.len(), 5);
    for event in &events {
        assert!(compiled.is_valid(event), "event should validate: {}", event);
    }
}

#[test]
fn fixture_songs_are_valid() {
    let compiled = compile(include_str!("../schemas/staging_songs.v1.json"));
    for raw in [
        include_str!("resources/song_data/A/A/TRAAAOAS128F42411.json"),
        include_str!("resources/song_data/A/A/TRAAAOAS128F42412.json"),
    ] {
        let song: serde_json::Value = serde_json::from_str(raw).unwrap();
        assert!(compiled.is_valid(&song));
    }
}

#[test]
fn event_without_timestamp_is_rejected() {
    let compiled = compile(include_str!("../schemas/staging_events.v1.json"));
    let mut event = event_lines().remove(0);
    event.as_object_mut().unwrap().remove("ts");
    assert!(!compiled.is_valid(&event), "ts is required");
}

#[test]
fn string_session_id_is_rejected() {
    let compiled = compile(include_str!("../schemas/staging_events.v1.json"));
    let mut event = event_lines().remove(0);
    event["sessionId"] = json!("100");
    assert!(!compiled.is_valid(&event));
}

#[test]
fn song_duration_must_be_numeric() {
    let compiled = compile(include_str!("../schemas/staging_songs.v1.json"));
    let mut song: serde_json::Value =
        serde_json::from_str(include_str!("resources/song_data/A/A/TRAAAOAS128F42411.json")).unwrap();
    song["duration"] = json!("258.3");
    assert!(!compiled.is_valid(&song));
}
