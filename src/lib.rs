//! # Weather Hub Core Library
//!
//! This library provides the runtime of a periodic weather-data hub for small
//! embedded devices. It resolves a location to a geohash, polls the Bureau of
//! Meteorology (BOM) observation, forecast and warning feeds on a fixed
//! interval, and republishes individual weather quantities to independent
//! output sinks.
//!
//! ## Design Philosophy
//!
//! ### Absence Is Not Failure
//! Every feed is parsed into a record of optional fields. A field that could
//! not be determined this cycle is simply absent, and an absent field never
//! touches its sink. Whatever a sink last received stays visible until a
//! later cycle produces a fresh value for it.
//!
//! ### Feed Isolation
//! The three feeds are fetched one after another inside a single cycle. A
//! network failure, HTTP error or garbage payload on one feed only means
//! "this feed did not update"; the remaining feeds still run and publish.
//!
//! ### Data Flow
//! 1. **Resolve**: configured geohash, static coordinates or live position sensors → geohash
//! 2. **Fetch**: one HTTP GET per enabled feed, bounded by a timeout and a body cap
//! 3. **Parse**: JSON → [`parse::FeedRecord`], field by field
//! 4. **Publish**: present fields → bound sinks, remembered in [`publish::PublishedState`]
//!
//! ## Core Types
//! - [`FeedKind`]: the three independently toggled provider feeds
//! - [`FieldId`]: the fixed catalogue of publishable output fields
//! - [`FieldValue`]: a numeric or textual value travelling to a sink

use std::fmt;
use std::str::FromStr;

// Module declarations
pub mod config;
pub mod device_io;
pub mod geo;
pub mod parse;
pub mod provider;
pub mod publish;
pub mod scheduler;

#[cfg(test)]
mod tests;

/// One of the three provider feeds a poll cycle can fetch.
///
/// The declaration order is the order feeds run within a cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeedKind {
    Observations,
    Forecast,
    Warnings,
}

impl FeedKind {
    /// All feeds in cycle order.
    pub const ALL: [FeedKind; 3] = [
        FeedKind::Observations,
        FeedKind::Forecast,
        FeedKind::Warnings,
    ];

    /// Endpoint path below `locations/{geohash}/`.
    pub fn endpoint(self) -> &'static str {
        match self {
            FeedKind::Observations => "observations",
            FeedKind::Forecast => "forecasts/daily",
            FeedKind::Warnings => "warnings",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FeedKind::Observations => "observations",
            FeedKind::Forecast => "forecast",
            FeedKind::Warnings => "warnings",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

macro_rules! field_ids {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Identity of every output field the hub can publish.
        ///
        /// This is a closed set: configuration refers to fields by their
        /// snake_case name and an unknown name is a configuration error.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum FieldId {
            $($variant),+
        }

        impl FieldId {
            /// Every field, numeric fields first.
            pub const ALL: &'static [FieldId] = &[$(FieldId::$variant),+];

            /// Configuration name of the field.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(FieldId::$variant => $name),+
                }
            }
        }

        impl FromStr for FieldId {
            type Err = UnknownField;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($name => Ok(FieldId::$variant),)+
                    _ => Err(UnknownField(s.to_string())),
                }
            }
        }
    };
}

field_ids! {
    // Observations
    Temperature => "temperature",
    Humidity => "humidity",
    WindSpeedKmh => "wind_speed_kmh",
    RainSince9am => "rain_since_9am",
    // Forecast, today
    TodayMin => "today_min",
    TodayMax => "today_max",
    TodayRainChance => "today_rain_chance",
    TodayRainMin => "today_rain_min",
    TodayRainMax => "today_rain_max",
    // Forecast, tomorrow
    TomorrowMin => "tomorrow_min",
    TomorrowMax => "tomorrow_max",
    TomorrowRainChance => "tomorrow_rain_chance",
    TomorrowRainMin => "tomorrow_rain_min",
    TomorrowRainMax => "tomorrow_rain_max",
    // Textual
    TodayRainAmount => "today_rain_amount",
    TodaySummary => "today_summary",
    TodayIcon => "today_icon",
    TodaySunrise => "today_sunrise",
    TodaySunset => "today_sunset",
    TomorrowRainAmount => "tomorrow_rain_amount",
    TomorrowSummary => "tomorrow_summary",
    TomorrowIcon => "tomorrow_icon",
    TomorrowSunrise => "tomorrow_sunrise",
    TomorrowSunset => "tomorrow_sunset",
    WarningsJson => "warnings_json",
    // Meta, maintained by the scheduler
    LocationName => "location_name",
    OutGeohash => "out_geohash",
    LastUpdate => "last_update",
}

/// Error returned when a configuration names a field outside the catalogue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown field type '{0}'")]
pub struct UnknownField(pub String);

impl FieldId {
    /// Feed that owns this field, or `None` for the scheduler's meta fields.
    pub fn feed(self) -> Option<FeedKind> {
        use FieldId::*;
        match self {
            Temperature | Humidity | WindSpeedKmh | RainSince9am => Some(FeedKind::Observations),
            WarningsJson => Some(FeedKind::Warnings),
            LocationName | OutGeohash | LastUpdate => None,
            _ => Some(FeedKind::Forecast),
        }
    }

    /// Display unit for numeric fields.
    pub fn unit(self) -> Option<&'static str> {
        use FieldId::*;
        match self {
            Temperature | TodayMin | TodayMax | TomorrowMin | TomorrowMax => Some("°C"),
            Humidity | TodayRainChance | TomorrowRainChance => Some("%"),
            WindSpeedKmh => Some("km/h"),
            RainSince9am | TodayRainMin | TodayRainMax | TomorrowRainMin | TomorrowRainMax => {
                Some("mm")
            }
            _ => None,
        }
    }

    /// Number of decimals shown when a numeric value is rendered as text.
    pub fn accuracy(self) -> usize {
        use FieldId::*;
        match self {
            Humidity | WindSpeedKmh | TodayRainChance | TomorrowRainChance => 0,
            _ => 1,
        }
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value published to a sink.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Number(_) => None,
            FieldValue::Text(s) => Some(s),
        }
    }

    /// Render the value the way a display or state file expects it,
    /// using the field's accuracy and unit for numbers.
    ///
    /// ```
    /// use weather_hub_lib::{FieldId, FieldValue};
    ///
    /// assert_eq!(FieldValue::Number(21.34).render(FieldId::Temperature), "21.3 °C");
    /// assert_eq!(FieldValue::Number(64.0).render(FieldId::Humidity), "64 %");
    /// assert_eq!(FieldValue::Text("Sunny.".into()).render(FieldId::TodaySummary), "Sunny.");
    /// ```
    pub fn render(&self, field: FieldId) -> String {
        match self {
            FieldValue::Number(v) => {
                let digits = field.accuracy();
                match field.unit() {
                    Some(unit) => format!("{:.*} {}", digits, v, unit),
                    None => format!("{:.*}", digits, v),
                }
            }
            FieldValue::Text(s) => s.clone(),
        }
    }

    /// Like [`render`](Self::render) but without the unit, for machine readers.
    pub fn plain(&self, field: FieldId) -> String {
        match self {
            FieldValue::Number(v) => format!("{:.*}", field.accuracy(), v),
            FieldValue::Text(s) => s.clone(),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}
