//! # BOM Feed Parsing
//!
//! Decodes raw JSON payloads into [`FeedRecord`]s. Every field is extracted
//! on its own: a missing key, a value of the wrong type, or a number outside
//! a plausible range leaves that one field `None` and the rest of the record
//! intact. Only a payload that is not the expected envelope at all (not
//! JSON, or no `data` member of the right shape) yields an entirely empty
//! record.
//!
//! ## Payload Shapes
//!
//! ### Observations (`locations/{gh}/observations`)
//! ```json
//! { "data": { "temp": 21.3, "humidity": 64, "rain_since_9am": 0.2,
//!             "wind": { "speed_kilometre": 11, "direction": "SW" } } }
//! ```
//! BOM answers with a single object holding the latest reading. A list of
//! readings is also accepted; which end is newest is set by
//! [`ObservationOrder`].
//!
//! ### Daily forecast (`locations/{gh}/forecasts/daily`)
//! `data` (or `forecast`) is an array of days; element 0 is today and
//! element 1 tomorrow. Several keys have historical aliases which are tried
//! in order.
//!
//! ### Warnings (`locations/{gh}/warnings`)
//! `data` is an array of active warnings. It is re-serialized compactly and
//! published as one text value; an empty array is a real value (`[]`).

use crate::config::ObservationOrder;
use crate::provider::RawPayload;
use crate::{FeedKind, FieldId, FieldValue};
use serde_json::Value;
use std::ops::RangeInclusive;

/// Plausible air temperatures in °C.
const TEMPERATURE_RANGE: RangeInclusive<f64> = -90.0..=60.0;
const PERCENT_RANGE: RangeInclusive<f64> = 0.0..=100.0;
const WIND_RANGE: RangeInclusive<f64> = 0.0..=500.0;
/// Rainfall in mm, over a day or since 9am.
const RAIN_RANGE: RangeInclusive<f64> = 0.0..=2000.0;

/// Latest conditions from the observations feed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObservationRecord {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed_kmh: Option<f64>,
    pub rain_since_9am: Option<f64>,
}

/// One day of the daily forecast.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DayForecast {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub rain_chance: Option<f64>,
    pub rain_min: Option<f64>,
    pub rain_max: Option<f64>,
    /// Human-readable rain range, e.g. `"1-5 mm"`
    pub rain_amount: Option<String>,
    pub summary: Option<String>,
    pub icon: Option<String>,
    pub sunrise: Option<String>,
    pub sunset: Option<String>,
}

/// Today's and tomorrow's forecast.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ForecastRecord {
    pub today: DayForecast,
    pub tomorrow: DayForecast,
}

/// Active warnings, serialized as a JSON array.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WarningsRecord {
    pub warnings_json: Option<String>,
}

/// Parsed, partial result of one feed.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedRecord {
    Observations(ObservationRecord),
    Forecast(ForecastRecord),
    Warnings(WarningsRecord),
}

impl FeedRecord {
    /// A record with every field absent.
    pub fn absent(kind: FeedKind) -> Self {
        match kind {
            FeedKind::Observations => FeedRecord::Observations(ObservationRecord::default()),
            FeedKind::Forecast => FeedRecord::Forecast(ForecastRecord::default()),
            FeedKind::Warnings => FeedRecord::Warnings(WarningsRecord::default()),
        }
    }

    pub fn kind(&self) -> FeedKind {
        match self {
            FeedRecord::Observations(_) => FeedKind::Observations,
            FeedRecord::Forecast(_) => FeedKind::Forecast,
            FeedRecord::Warnings(_) => FeedKind::Warnings,
        }
    }

    /// Present fields only, in catalogue order.
    pub fn present_fields(&self) -> Vec<(FieldId, FieldValue)> {
        let mut out = Vec::new();
        match self {
            FeedRecord::Observations(o) => {
                push_num(&mut out, FieldId::Temperature, o.temperature);
                push_num(&mut out, FieldId::Humidity, o.humidity);
                push_num(&mut out, FieldId::WindSpeedKmh, o.wind_speed_kmh);
                push_num(&mut out, FieldId::RainSince9am, o.rain_since_9am);
            }
            FeedRecord::Forecast(f) => {
                push_day(&mut out, &f.today, DayFields::TODAY);
                push_day(&mut out, &f.tomorrow, DayFields::TOMORROW);
            }
            FeedRecord::Warnings(w) => {
                push_text(&mut out, FieldId::WarningsJson, &w.warnings_json);
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.present_fields().is_empty()
    }
}

/// Field ids one forecast day maps to.
struct DayFields {
    min: FieldId,
    max: FieldId,
    rain_chance: FieldId,
    rain_min: FieldId,
    rain_max: FieldId,
    rain_amount: FieldId,
    summary: FieldId,
    icon: FieldId,
    sunrise: FieldId,
    sunset: FieldId,
}

impl DayFields {
    const TODAY: DayFields = DayFields {
        min: FieldId::TodayMin,
        max: FieldId::TodayMax,
        rain_chance: FieldId::TodayRainChance,
        rain_min: FieldId::TodayRainMin,
        rain_max: FieldId::TodayRainMax,
        rain_amount: FieldId::TodayRainAmount,
        summary: FieldId::TodaySummary,
        icon: FieldId::TodayIcon,
        sunrise: FieldId::TodaySunrise,
        sunset: FieldId::TodaySunset,
    };

    const TOMORROW: DayFields = DayFields {
        min: FieldId::TomorrowMin,
        max: FieldId::TomorrowMax,
        rain_chance: FieldId::TomorrowRainChance,
        rain_min: FieldId::TomorrowRainMin,
        rain_max: FieldId::TomorrowRainMax,
        rain_amount: FieldId::TomorrowRainAmount,
        summary: FieldId::TomorrowSummary,
        icon: FieldId::TomorrowIcon,
        sunrise: FieldId::TomorrowSunrise,
        sunset: FieldId::TomorrowSunset,
    };
}

fn push_num(out: &mut Vec<(FieldId, FieldValue)>, id: FieldId, v: Option<f64>) {
    if let Some(v) = v {
        out.push((id, FieldValue::Number(v)));
    }
}

fn push_text(out: &mut Vec<(FieldId, FieldValue)>, id: FieldId, v: &Option<String>) {
    if let Some(v) = v {
        out.push((id, FieldValue::Text(v.clone())));
    }
}

fn push_day(out: &mut Vec<(FieldId, FieldValue)>, day: &DayForecast, ids: DayFields) {
    push_num(out, ids.min, day.min);
    push_num(out, ids.max, day.max);
    push_num(out, ids.rain_chance, day.rain_chance);
    push_num(out, ids.rain_min, day.rain_min);
    push_num(out, ids.rain_max, day.rain_max);
    push_text(out, ids.rain_amount, &day.rain_amount);
    push_text(out, ids.summary, &day.summary);
    push_text(out, ids.icon, &day.icon);
    push_text(out, ids.sunrise, &day.sunrise);
    push_text(out, ids.sunset, &day.sunset);
}

/// Turns raw feed payloads into records.
#[derive(Clone, Copy, Debug, Default)]
pub struct FeedParser {
    observation_order: ObservationOrder,
}

impl FeedParser {
    pub fn new(observation_order: ObservationOrder) -> Self {
        Self { observation_order }
    }

    /// Parse `payload` as feed `kind`. Never fails; see the module docs.
    pub fn parse(&self, kind: FeedKind, payload: &RawPayload) -> FeedRecord {
        let root: Value = match serde_json::from_str(payload.as_str()) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("Failed to parse {} JSON: {}", kind, e);
                return FeedRecord::absent(kind);
            }
        };

        let parsed = match kind {
            FeedKind::Observations => self
                .parse_observations(&root)
                .map(FeedRecord::Observations),
            FeedKind::Forecast => parse_forecast(&root).map(FeedRecord::Forecast),
            FeedKind::Warnings => parse_warnings(&root).map(FeedRecord::Warnings),
        };

        parsed.unwrap_or_else(|| {
            log::warn!("Unexpected {} payload envelope", kind);
            FeedRecord::absent(kind)
        })
    }

    fn parse_observations(&self, root: &Value) -> Option<ObservationRecord> {
        let latest = match root.get("data")? {
            obj @ Value::Object(_) => obj,
            Value::Array(readings) => match self.observation_order {
                ObservationOrder::NewestFirst => readings.first()?,
                ObservationOrder::NewestLast => readings.last()?,
            },
            _ => return None,
        };
        if !latest.is_object() {
            return None;
        }

        Some(ObservationRecord {
            temperature: number(latest, &["temp"], TEMPERATURE_RANGE),
            humidity: number(latest, &["humidity"], PERCENT_RANGE),
            wind_speed_kmh: latest
                .get("wind")
                .and_then(|w| number(w, &["speed_kilometre"], WIND_RANGE)),
            rain_since_9am: number(latest, &["rain_since_9am"], RAIN_RANGE),
        })
    }
}

fn parse_forecast(root: &Value) -> Option<ForecastRecord> {
    let days = match root.get("data") {
        Some(Value::Array(days)) => days,
        _ => match root.get("forecast") {
            Some(Value::Array(days)) => {
                log::debug!("Using 'forecast' instead of 'data'");
                days
            }
            _ => return None,
        },
    };

    Some(ForecastRecord {
        today: days.first().map(parse_day).unwrap_or_default(),
        tomorrow: days.get(1).map(parse_day).unwrap_or_default(),
    })
}

fn parse_day(day: &Value) -> DayForecast {
    let rain = day.get("rain");
    let amount = rain.and_then(|r| r.get("amount"));
    let rain_min = amount.and_then(|a| number(a, &["min"], RAIN_RANGE));
    let rain_max = amount.and_then(|a| number(a, &["max"], RAIN_RANGE));
    let units = amount
        .and_then(|a| text(a, &["units"]))
        .unwrap_or_else(|| "mm".to_string());
    let astro = day.get("astronomical");

    DayForecast {
        min: number(day, &["temp_min", "temperature_min"], TEMPERATURE_RANGE),
        max: number(day, &["temp_max", "temperature_max"], TEMPERATURE_RANGE),
        rain_chance: rain.and_then(|r| number(r, &["chance"], PERCENT_RANGE)),
        rain_min,
        rain_max,
        rain_amount: format_rain_range(rain_min, rain_max, &units),
        summary: text(day, &["short_text", "summary"]),
        icon: text(day, &["icon_descriptor", "icon"]),
        sunrise: astro.and_then(|a| text(a, &["sunrise_time"])),
        sunset: astro.and_then(|a| text(a, &["sunset_time"])),
    }
}

fn parse_warnings(root: &Value) -> Option<WarningsRecord> {
    match root.get("data")? {
        data @ Value::Array(_) => Some(WarningsRecord {
            warnings_json: serde_json::to_string(data).ok(),
        }),
        _ => None,
    }
}

/// Place name from a `locations/{gh}` lookup.
///
/// Accepts both the single-location form (`data` object) and the search
/// form (`data` array, first match wins).
pub fn parse_location_name(payload: &RawPayload) -> Option<String> {
    let root: Value = serde_json::from_str(payload.as_str()).ok()?;
    let place = match root.get("data")? {
        obj @ Value::Object(_) => obj,
        Value::Array(matches) => matches.first()?,
        _ => return None,
    };
    text(place, &["name"])
}

/// First numeric value among `keys` that lies within `range`.
fn number(obj: &Value, keys: &[&str], range: RangeInclusive<f64>) -> Option<f64> {
    let v = keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_f64))?;
    if range.contains(&v) {
        Some(v)
    } else {
        log::debug!("Discarding implausible value {} for {:?}", v, keys);
        None
    }
}

/// First non-blank string value among `keys`.
fn text(obj: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn format_amount(mm: f64) -> String {
    if mm.fract() == 0.0 {
        format!("{:.0}", mm)
    } else {
        format!("{:.1}", mm)
    }
}

/// `"1-5 mm"` for a range, `"0 mm"` when only the lower bound is known.
fn format_rain_range(min: Option<f64>, max: Option<f64>, units: &str) -> Option<String> {
    match (min, max) {
        (Some(lo), Some(hi)) if hi > lo => Some(format!(
            "{}-{} {}",
            format_amount(lo),
            format_amount(hi),
            units
        )),
        (Some(lo), _) => Some(format!("{} {}", format_amount(lo), units)),
        (None, Some(hi)) => Some(format!("up to {} {}", format_amount(hi), units)),
        (None, None) => None,
    }
}
