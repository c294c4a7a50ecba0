//! # Location Resolution
//!
//! Turns the configured location into the geohash the BOM API is keyed by.
//!
//! Three input modes exist, exactly one of which is configured:
//! - **Geohash**: used verbatim
//! - **Static coordinates**: encoded once and cached
//! - **Position sensors**: two live inputs read every cycle, so a moving
//!   device follows its own position
//!
//! Sensor-driven resolution can legitimately have nothing to report yet
//! (no GPS fix since boot). That is not an error: [`ResolvedLocation::valid`]
//! is `false` and the caller skips the cycle.

use std::fmt;
use std::sync::Arc;

/// Geohash length requested from the provider (about 1.2 km × 0.6 km cells).
pub const GEOHASH_PRECISION: usize = 6;

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// An external numeric input such as a GPS latitude channel.
pub trait PositionInput: Send + Sync {
    /// Latest reading, or `None` if the input has never reported one.
    fn current_value(&self) -> Option<f64>;
}

/// Where the hub's location comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum LocationSpec {
    Geohash(String),
    StaticLatLon { lat: f64, lon: f64 },
    /// References to position inputs, bound by id when the resolver is built.
    SensorLatLon { lat_ref: String, lon_ref: String },
}

impl LocationSpec {
    pub fn mode(&self) -> &'static str {
        match self {
            LocationSpec::Geohash(_) => "geohash",
            LocationSpec::StaticLatLon { .. } => "static coordinates",
            LocationSpec::SensorLatLon { .. } => "position sensors",
        }
    }
}

/// Outcome of one resolution attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedLocation {
    pub geohash: String,
    pub valid: bool,
}

impl ResolvedLocation {
    fn ready(geohash: String) -> Self {
        Self {
            geohash,
            valid: true,
        }
    }

    fn unavailable() -> Self {
        Self {
            geohash: String::new(),
            valid: false,
        }
    }
}

/// Encode a coordinate pair as a geohash of `precision` characters.
///
/// Coordinates are clamped to their valid ranges first.
///
/// ```
/// use weather_hub_lib::geo::encode_geohash;
///
/// assert_eq!(encode_geohash(57.64911, 10.40744, 11), "u4pruydqqvj");
/// ```
pub fn encode_geohash(lat: f64, lon: f64, precision: usize) -> String {
    let lat = lat.clamp(-90.0, 90.0);
    let lon = lon.clamp(-180.0, 180.0);

    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lon_lo, mut lon_hi) = (-180.0_f64, 180.0_f64);
    let mut out = String::with_capacity(precision);
    let mut even_bit = true;
    let mut bits = 0u8;
    let mut idx = 0usize;

    while out.len() < precision {
        // Bits alternate longitude, latitude, starting with longitude
        if even_bit {
            let mid = (lon_lo + lon_hi) / 2.0;
            if lon >= mid {
                idx = (idx << 1) | 1;
                lon_lo = mid;
            } else {
                idx <<= 1;
                lon_hi = mid;
            }
        } else {
            let mid = (lat_lo + lat_hi) / 2.0;
            if lat >= mid {
                idx = (idx << 1) | 1;
                lat_lo = mid;
            } else {
                idx <<= 1;
                lat_hi = mid;
            }
        }
        even_bit = !even_bit;
        bits += 1;

        if bits == 5 {
            out.push(BASE32[idx] as char);
            bits = 0;
            idx = 0;
        }
    }

    out
}

/// True if every character is in the geohash base32 alphabet.
pub fn is_valid_geohash(s: &str) -> bool {
    !s.is_empty()
        && s
            .bytes()
            .all(|b| BASE32.contains(&b.to_ascii_lowercase()))
}

enum Source {
    Fixed(String),
    Static { lat: f64, lon: f64, cached: Option<String> },
    Sensors {
        lat: Arc<dyn PositionInput>,
        lon: Arc<dyn PositionInput>,
    },
}

/// Resolves the configured [`LocationSpec`] once per poll cycle.
pub struct GeoResolver {
    spec: LocationSpec,
    source: Source,
}

/// A sensor reference in the location could not be bound to an input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no position input registered as '{0}'")]
pub struct UnknownInput(pub String);

impl GeoResolver {
    /// Build a resolver, binding sensor references through `lookup`.
    ///
    /// `lookup` is only consulted for [`LocationSpec::SensorLatLon`].
    pub fn new<F>(spec: LocationSpec, mut lookup: F) -> Result<Self, UnknownInput>
    where
        F: FnMut(&str) -> Option<Arc<dyn PositionInput>>,
    {
        let source = match &spec {
            LocationSpec::Geohash(g) => Source::Fixed(g.clone()),
            LocationSpec::StaticLatLon { lat, lon } => Source::Static {
                lat: *lat,
                lon: *lon,
                cached: None,
            },
            LocationSpec::SensorLatLon { lat_ref, lon_ref } => Source::Sensors {
                lat: lookup(lat_ref).ok_or_else(|| UnknownInput(lat_ref.clone()))?,
                lon: lookup(lon_ref).ok_or_else(|| UnknownInput(lon_ref.clone()))?,
            },
        };
        Ok(Self { spec, source })
    }

    pub fn spec(&self) -> &LocationSpec {
        &self.spec
    }

    /// Resolve the current location.
    pub fn resolve(&mut self) -> ResolvedLocation {
        match &mut self.source {
            Source::Fixed(g) => ResolvedLocation::ready(g.clone()),
            Source::Static { lat, lon, cached } => {
                let g = cached.get_or_insert_with(|| encode_geohash(*lat, *lon, GEOHASH_PRECISION));
                ResolvedLocation::ready(g.clone())
            }
            Source::Sensors { lat, lon } => {
                match (usable(lat.current_value(), 90.0), usable(lon.current_value(), 180.0)) {
                    (Some(la), Some(lo)) => {
                        ResolvedLocation::ready(encode_geohash(la, lo, GEOHASH_PRECISION))
                    }
                    _ => ResolvedLocation::unavailable(),
                }
            }
        }
    }
}

/// Live readings outside the coordinate range are treated as "no fix".
fn usable(value: Option<f64>, limit: f64) -> Option<f64> {
    value.filter(|v| v.is_finite() && v.abs() <= limit)
}

impl fmt::Debug for GeoResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeoResolver").field("spec", &self.spec).finish()
    }
}
