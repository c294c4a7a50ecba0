//! # Poll Cycle Scenarios
//!
//! These tests drive complete cycles through [`PollScheduler`] with a
//! scripted provider and recording sinks, and check the resilience rules:
//! feeds are isolated from each other, absent fields keep their last value,
//! and a location that is not available yet means no requests at all.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use crate::config::FeedToggles;
use crate::device_io::SharedInput;
use crate::geo::{GeoResolver, LocationSpec, PositionInput};
use crate::parse::FeedParser;
use crate::provider::{FeedSource, FetchError, RawPayload};
use crate::publish::testing::{recording_router, RecordingSink};
use crate::scheduler::{FeedOutcome, PollScheduler};
use tokio::sync::watch;
use crate::{FeedKind, FieldId, FieldValue};

/// Provider whose answers are scripted per feed and can change between cycles.
#[derive(Clone, Default)]
struct ScriptedSource {
    answers: Arc<Mutex<HashMap<FeedKind, Result<RawPayload, FetchError>>>>,
    location: Arc<Mutex<Option<RawPayload>>>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl ScriptedSource {
    fn answer(&self, kind: FeedKind, body: serde_json::Value) {
        self.answers
            .lock()
            .unwrap()
            .insert(kind, Ok(RawPayload::new(body.to_string())));
    }

    fn answer_raw(&self, kind: FeedKind, body: &str) {
        self.answers
            .lock()
            .unwrap()
            .insert(kind, Ok(RawPayload::new(body)));
    }

    fn fail(&self, kind: FeedKind, err: FetchError) {
        self.answers.lock().unwrap().insert(kind, Err(err));
    }

    fn name_location(&self, name: &str) {
        *self.location.lock().unwrap() =
            Some(RawPayload::new(json!({ "data": { "name": name } }).to_string()));
    }

    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn feed_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(what, _)| what != "location")
            .map(|(what, _)| what)
            .collect()
    }
}

#[async_trait]
impl FeedSource for ScriptedSource {
    async fn fetch(&self, kind: FeedKind, geohash: &str) -> Result<RawPayload, FetchError> {
        self.calls
            .lock()
            .unwrap()
            .push((kind.name().to_string(), geohash.to_string()));
        self.answers
            .lock()
            .unwrap()
            .get(&kind)
            .cloned()
            .unwrap_or(Err(FetchError::NetworkUnavailable("unscripted".into())))
    }

    async fn fetch_location(&self, geohash: &str) -> Result<RawPayload, FetchError> {
        self.calls
            .lock()
            .unwrap()
            .push(("location".to_string(), geohash.to_string()));
        self.location
            .lock()
            .unwrap()
            .clone()
            .ok_or(FetchError::HttpStatus(404))
    }
}

fn fixed_clock() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 7, 24, 3, 15, 0).unwrap()
}

struct Hub {
    scheduler: PollScheduler<ScriptedSource>,
    source: ScriptedSource,
    sinks: HashMap<FieldId, RecordingSink>,
}

impl Hub {
    fn sink(&self, field: FieldId) -> &RecordingSink {
        &self.sinks[&field]
    }

    fn last(&self, field: FieldId) -> Option<FieldValue> {
        self.sink(field).last()
    }
}

/// Hub on a fixed geohash with every field bound.
fn hub_with(location: LocationSpec, feeds: FeedToggles, inputs: Vec<(&str, SharedInput)>) -> Hub {
    let source = ScriptedSource::default();
    let (router, sinks) = recording_router(FieldId::ALL);
    let resolver = GeoResolver::new(location, |id| -> Option<Arc<dyn PositionInput>> {
        inputs
            .iter()
            .find(|(name, _)| *name == id)
            .map(|(_, input)| Arc::new(input.clone()) as Arc<dyn PositionInput>)
    })
    .unwrap();
    let scheduler = PollScheduler::new(
        resolver,
        source.clone(),
        FeedParser::default(),
        router,
        feeds,
        Duration::from_secs(300),
    )
    .with_clock(fixed_clock);
    Hub {
        scheduler,
        source,
        sinks,
    }
}

fn hub() -> Hub {
    hub_with(
        LocationSpec::Geohash("r1r0fs".into()),
        FeedToggles::default(),
        Vec::new(),
    )
}

fn good_observations() -> serde_json::Value {
    json!({ "data": { "temp": 21.3, "humidity": 64, "rain_since_9am": 0.0,
                      "wind": { "speed_kilometre": 11 } } })
}

fn good_forecast() -> serde_json::Value {
    json!({ "data": [
        { "temp_min": 12, "temp_max": 24, "short_text": "Sunny.", "icon_descriptor": "sunny",
          "rain": { "chance": 5, "amount": { "min": 0, "max": null, "units": "mm" } } },
        { "temp_min": 14, "temp_max": 19, "short_text": "Showers.", "icon_descriptor": "shower",
          "rain": { "chance": 80, "amount": { "min": 2, "max": 8, "units": "mm" } } }
    ] })
}

fn severe_warning() -> serde_json::Value {
    json!({ "data": [ { "id": "VIC_RC022", "type": "severe_thunderstorm_warning",
                        "title": "Severe Thunderstorm Warning for Central" } ] })
}

fn script_all_good(source: &ScriptedSource) {
    source.answer(FeedKind::Observations, good_observations());
    source.answer(FeedKind::Forecast, good_forecast());
    source.answer(FeedKind::Warnings, json!({ "data": [] }));
}

/// One healthy cycle fetches the three feeds in order and fills every field.
#[tokio::test]
async fn full_cycle_publishes_every_feed_in_order() {
    let mut hub = hub();
    script_all_good(&hub.source);
    hub.source.name_location("Melbourne");

    let report = hub.scheduler.run_cycle().await;

    assert_eq!(report.geohash.as_deref(), Some("r1r0fs"));
    assert_eq!(
        hub.source.feed_calls(),
        vec!["observations", "forecast", "warnings"]
    );
    assert_eq!(hub.last(FieldId::Temperature), Some(FieldValue::Number(21.3)));
    assert_eq!(hub.last(FieldId::TodayMax), Some(FieldValue::Number(24.0)));
    assert_eq!(
        hub.last(FieldId::TomorrowRainAmount),
        Some(FieldValue::Text("2-8 mm".into()))
    );
    assert_eq!(hub.last(FieldId::WarningsJson), Some(FieldValue::Text("[]".into())));
    assert_eq!(hub.last(FieldId::OutGeohash), Some(FieldValue::Text("r1r0fs".into())));
    assert_eq!(
        hub.last(FieldId::LocationName),
        Some(FieldValue::Text("Melbourne".into()))
    );
    assert_eq!(
        hub.last(FieldId::LastUpdate),
        Some(FieldValue::Text("2025-07-24T03:15:00Z".into()))
    );
}

/// A feed that errors keeps its old values while the others still update.
#[tokio::test]
async fn failed_feed_does_not_block_or_blank_the_others() {
    let mut hub = hub();
    script_all_good(&hub.source);
    hub.scheduler.run_cycle().await;

    // Forecast goes down; the other feeds carry new values
    hub.source.fail(FeedKind::Forecast, FetchError::HttpStatus(503));
    hub.source.answer(
        FeedKind::Observations,
        json!({ "data": { "temp": 25.0, "humidity": 40 } }),
    );
    hub.source.answer(FeedKind::Warnings, severe_warning());

    let report = hub.scheduler.run_cycle().await;

    assert_eq!(
        report.outcome(FeedKind::Forecast),
        Some(&FeedOutcome::Failed(FetchError::HttpStatus(503)))
    );
    assert_eq!(hub.last(FieldId::Temperature), Some(FieldValue::Number(25.0)));
    assert!(hub
        .last(FieldId::WarningsJson)
        .and_then(|v| v.as_text().map(|t| t.contains("Severe Thunderstorm")))
        .unwrap_or(false));

    // Forecast fields are exactly what the first cycle left behind
    assert_eq!(hub.sink(FieldId::TodayMax).received().len(), 1);
    assert_eq!(
        hub.scheduler.state().get(FieldId::TodaySummary),
        Some(&FieldValue::Text("Sunny.".into()))
    );
}

/// Timeouts, HTML error pages and error envelopes all leave state untouched.
#[tokio::test]
async fn timeout_and_garbage_are_treated_alike() {
    let mut hub = hub();
    script_all_good(&hub.source);
    hub.scheduler.run_cycle().await;
    let before = hub.scheduler.state().clone();

    hub.source.fail(FeedKind::Observations, FetchError::Timeout);
    hub.source.answer_raw(FeedKind::Forecast, "<html>maintenance</html>");
    hub.source.answer(FeedKind::Warnings, json!({ "errors": ["bad geohash"] }));

    let report = hub.scheduler.run_cycle().await;

    assert_eq!(report.outcome(FeedKind::Forecast), Some(&FeedOutcome::Empty));
    assert_eq!(report.outcome(FeedKind::Warnings), Some(&FeedOutcome::Empty));
    for field in FieldId::ALL.iter().filter(|f| f.feed().is_some()) {
        assert_eq!(
            hub.scheduler.state().get(*field),
            before.get(*field),
            "{field} must keep its value"
        );
    }
}

/// Bad values in a payload are skipped one field at a time.
#[tokio::test]
async fn partially_malformed_payload_updates_only_valid_fields() {
    let mut hub = hub();
    script_all_good(&hub.source);
    hub.scheduler.run_cycle().await;

    hub.source.answer(
        FeedKind::Observations,
        json!({ "data": { "temp": 18.0, "humidity": "n/a", "wind": { "speed_kilometre": -4 } } }),
    );
    hub.scheduler.run_cycle().await;

    assert_eq!(hub.last(FieldId::Temperature), Some(FieldValue::Number(18.0)));
    assert_eq!(hub.last(FieldId::Humidity), Some(FieldValue::Number(64.0)));
    assert_eq!(hub.last(FieldId::WindSpeedKmh), Some(FieldValue::Number(11.0)));
    // rain_since_9am disappeared from the payload, it is not cleared either
    assert_eq!(hub.last(FieldId::RainSince9am), Some(FieldValue::Number(0.0)));
}

/// No request goes out until both position inputs have reported.
#[tokio::test]
async fn sensor_location_without_reading_skips_the_cycle() {
    let lat = SharedInput::new();
    let lon = SharedInput::new();
    let mut hub = hub_with(
        LocationSpec::SensorLatLon {
            lat_ref: "gps_lat".into(),
            lon_ref: "gps_lon".into(),
        },
        FeedToggles::default(),
        vec![("gps_lat", lat.clone()), ("gps_lon", lon.clone())],
    );
    script_all_good(&hub.source);

    for _ in 0..3 {
        let report = hub.scheduler.run_cycle().await;
        assert!(report.deferred());
    }
    lat.set(-37.8136);
    assert!(hub.scheduler.run_cycle().await.deferred());

    assert!(hub.source.calls().is_empty(), "no request may be made");
    assert!(hub.scheduler.state().is_empty());
    assert!(hub.sinks.values().all(|s| s.received().is_empty()));

    // First fix arrives
    lon.set(144.9631);
    let report = hub.scheduler.run_cycle().await;
    assert_eq!(report.geohash.as_deref(), Some("r1r0fs"));
    assert_eq!(hub.last(FieldId::Temperature), Some(FieldValue::Number(21.3)));
}

/// A new position means a new geohash, new requests and a new place name.
#[tokio::test]
async fn moving_device_fetches_for_its_new_cell() {
    let lat = SharedInput::new();
    let lon = SharedInput::new();
    lat.set(-37.8136);
    lon.set(144.9631);
    let mut hub = hub_with(
        LocationSpec::SensorLatLon {
            lat_ref: "lat".into(),
            lon_ref: "lon".into(),
        },
        FeedToggles {
            observations: true,
            forecast: false,
            warnings: false,
        },
        vec![("lat", lat.clone()), ("lon", lon.clone())],
    );
    script_all_good(&hub.source);
    hub.source.name_location("Melbourne");

    hub.scheduler.run_cycle().await;
    lat.set(-33.8688);
    lon.set(151.2093);
    hub.source.name_location("Sydney");
    hub.scheduler.run_cycle().await;

    let cells: Vec<String> = hub
        .source
        .calls()
        .into_iter()
        .filter(|(what, _)| what == "observations")
        .map(|(_, gh)| gh)
        .collect();
    assert_eq!(cells, vec!["r1r0fs".to_string(), "r3gx2f".to_string()]);
    assert_eq!(hub.last(FieldId::OutGeohash), Some(FieldValue::Text("r3gx2f".into())));
    assert_eq!(
        hub.last(FieldId::LocationName),
        Some(FieldValue::Text("Sydney".into()))
    );
}

/// A null in the very first payload never reaches the sink.
#[tokio::test]
async fn first_cycle_with_null_humidity_never_touches_humidity_sink() {
    let mut hub = hub_with(
        LocationSpec::StaticLatLon {
            lat: -37.8136,
            lon: 144.9631,
        },
        FeedToggles {
            observations: true,
            forecast: false,
            warnings: false,
        },
        Vec::new(),
    );
    hub.source.answer(
        FeedKind::Observations,
        json!({ "data": { "temperature": 0, "temp": 21.3, "humidity": null } }),
    );

    hub.scheduler.run_cycle().await;

    assert_eq!(hub.source.feed_calls(), vec!["observations"]);
    assert_eq!(
        hub.sink(FieldId::Temperature).received(),
        vec![FieldValue::Number(21.3)]
    );
    assert!(hub.sink(FieldId::Humidity).received().is_empty());
    assert_eq!(hub.scheduler.state().get(FieldId::Humidity), None);
}

/// An empty warning list is real data and clears an earlier alert.
#[tokio::test]
async fn empty_warning_list_replaces_a_previous_alert() {
    let mut hub = hub();
    script_all_good(&hub.source);
    hub.source.answer(FeedKind::Warnings, severe_warning());
    hub.scheduler.run_cycle().await;
    assert_ne!(hub.last(FieldId::WarningsJson), Some(FieldValue::Text("[]".into())));

    hub.source.answer(FeedKind::Warnings, json!({ "data": [] }));
    hub.scheduler.run_cycle().await;
    assert_eq!(hub.last(FieldId::WarningsJson), Some(FieldValue::Text("[]".into())));

    // A failed warnings fetch afterwards leaves "[]" in place
    hub.source.fail(FeedKind::Warnings, FetchError::EmptyBody);
    hub.scheduler.run_cycle().await;
    assert_eq!(hub.last(FieldId::WarningsJson), Some(FieldValue::Text("[]".into())));
}

/// The same payloads twice leave the same state.
#[tokio::test]
async fn repeating_a_cycle_is_idempotent() {
    let mut hub = hub();
    script_all_good(&hub.source);
    hub.source.name_location("Melbourne");

    hub.scheduler.run_cycle().await;
    let first = hub.scheduler.state().clone();
    hub.scheduler.run_cycle().await;

    assert_eq!(hub.scheduler.state(), &first);
    assert_eq!(first.len(), hub.scheduler.state().len());
}

/// Switched-off feeds cost no requests and publish nothing.
#[tokio::test]
async fn disabled_feeds_are_never_fetched() {
    let mut hub = hub_with(
        LocationSpec::Geohash("r1r0fs".into()),
        FeedToggles {
            observations: false,
            forecast: true,
            warnings: false,
        },
        Vec::new(),
    );
    script_all_good(&hub.source);

    let report = hub.scheduler.run_cycle().await;

    assert_eq!(hub.source.feed_calls(), vec!["forecast"]);
    assert_eq!(report.feeds.len(), 1);
    assert!(hub.sink(FieldId::Temperature).received().is_empty());
    assert!(hub.sink(FieldId::WarningsJson).received().is_empty());
}

/// Geohash and timestamp only move once some feed actually answered.
#[tokio::test]
async fn meta_fields_wait_for_a_successful_fetch() {
    let mut hub = hub();
    for kind in FeedKind::ALL {
        hub.source
            .fail(kind, FetchError::NetworkUnavailable("wifi down".into()));
    }

    let report = hub.scheduler.run_cycle().await;

    assert!(report.meta.is_empty());
    assert!(hub.sink(FieldId::LastUpdate).received().is_empty());
    assert!(hub.sink(FieldId::OutGeohash).received().is_empty());

    // Network comes back; only observations answers
    hub.source.answer(FeedKind::Observations, good_observations());
    let report = hub.scheduler.run_cycle().await;
    assert!(report.meta.contains(&FieldId::LastUpdate));
    assert_eq!(hub.last(FieldId::OutGeohash), Some(FieldValue::Text("r1r0fs".into())));
}

/// The place name is fetched once per cell, with failed lookups retried.
#[tokio::test]
async fn location_name_is_looked_up_once_per_geohash() {
    let mut hub = hub();
    script_all_good(&hub.source);

    // Lookup fails at first and is retried next cycle
    hub.scheduler.run_cycle().await;
    assert!(hub.sink(FieldId::LocationName).received().is_empty());

    hub.source.name_location("Melbourne");
    hub.scheduler.run_cycle().await;
    hub.scheduler.run_cycle().await;

    let lookups = hub
        .source
        .calls()
        .iter()
        .filter(|(what, _)| what == "location")
        .count();
    assert_eq!(lookups, 2);
    assert_eq!(hub.sink(FieldId::LocationName).received().len(), 2);
}

fn sensor_location() -> LocationSpec {
    LocationSpec::SensorLatLon {
        lat_ref: "gps_lat".into(),
        lon_ref: "gps_lon".into(),
    }
}

/// A fix that lands between ticks is polled within seconds, not at the next
/// full interval, even when the inputs cannot announce it.
#[tokio::test(start_paused = true)]
async fn first_fix_is_polled_without_waiting_for_the_interval() {
    let lat = SharedInput::new();
    let lon = SharedInput::new();
    let hub = hub_with(
        sensor_location(),
        FeedToggles::default(),
        vec![("gps_lat", lat.clone()), ("gps_lon", lon.clone())],
    );
    script_all_good(&hub.source);
    let Hub {
        scheduler, source, ..
    } = hub;
    let (tx, rx) = watch::channel(());

    let driver = async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(source.calls().is_empty());

        lat.set(-37.8136);
        lon.set(144.9631);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.feed_calls(), vec!["observations", "forecast", "warnings"]);

        tx.send(()).unwrap();
    };

    tokio::join!(scheduler.run(rx), driver);
}

/// Inputs wired to the poll trigger get a cycle the moment the pair is complete.
#[tokio::test(start_paused = true)]
async fn first_reading_on_triggered_inputs_polls_immediately() {
    let lat = SharedInput::new();
    let lon = SharedInput::new();
    let hub = hub_with(
        sensor_location(),
        FeedToggles::default(),
        vec![("gps_lat", lat.clone()), ("gps_lon", lon.clone())],
    );
    script_all_good(&hub.source);
    let trigger = hub.scheduler.trigger();
    let lat = lat.with_trigger(trigger.clone());
    let lon = lon.with_trigger(trigger);
    let Hub {
        scheduler, source, ..
    } = hub;
    let (tx, rx) = watch::channel(());

    let driver = async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        lat.set(-37.8136);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(source.calls().is_empty(), "half a fix is still no location");

        lon.set(144.9631);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.feed_calls(), vec!["observations", "forecast", "warnings"]);

        // Later readings are ordinary updates, not new triggers
        lat.set(-37.8140);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.feed_calls().len(), 3);

        tx.send(()).unwrap();
    };

    tokio::join!(scheduler.run(rx), driver);
}
