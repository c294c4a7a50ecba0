//! # Poll Scheduling
//!
//! Drives resolve → fetch → parse → publish on a fixed interval.
//!
//! ## Cycle
//! ```text
//! Idle → Resolving → Fetching(observations) → Fetching(forecast) → Fetching(warnings) → Idle
//! ```
//! Disabled feeds are skipped. If the location cannot be resolved yet the
//! cycle returns to `Idle` straight from `Resolving` without a single
//! request and without touching any field.
//!
//! Feeds run strictly in order and each one is published before the next
//! request starts. A failure in one feed is recorded in the [`CycleReport`]
//! and the next feed runs regardless.
//!
//! ## Deferred locations
//! While the location cannot be resolved the loop retries every
//! [`LOCATION_RETRY`] instead of waiting out the full interval, so a
//! position sensor's first fix is fetched for within seconds. Inputs that can
//! announce their first reading (see `device_io::SharedInput`) use a
//! [`PollTrigger`] and get a cycle straight away.
//!
//! ## Concurrency
//! The scheduler is meant for a current-thread runtime. Cycles never overlap:
//! a tick or a [`PollTrigger`] arriving mid-cycle is held until the cycle
//! finishes, and several of them collapse into one follow-up cycle.

use crate::config::{FeedToggles, HubConfig};
use crate::geo::{GeoResolver, LocationSpec, PositionInput, UnknownInput};
use crate::parse::{parse_location_name, FeedParser};
use crate::provider::{FeedSource, FetchError};
use crate::publish::{PublishRouter, PublishedState};
use crate::{FeedKind, FieldId, FieldValue};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;

/// How often a deferred location is re-resolved, capped by the poll interval.
pub const LOCATION_RETRY: Duration = Duration::from_secs(5);

/// Where the scheduler is within a cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Resolving,
    Fetching(FeedKind),
}

/// What happened to one feed during a cycle.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedOutcome {
    /// Payload parsed with at least one field present; the set holds the
    /// fields whose sinks were updated.
    Published(BTreeSet<FieldId>),
    /// Payload arrived but no field could be extracted.
    Empty,
    Failed(FetchError),
}

/// Summary of one cycle, mostly for logging and tests.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CycleReport {
    /// Geohash used, `None` if the cycle was deferred at `Resolving`
    pub geohash: Option<String>,
    pub feeds: Vec<(FeedKind, FeedOutcome)>,
    /// Meta fields published at the end of the cycle
    pub meta: BTreeSet<FieldId>,
}

impl CycleReport {
    pub fn deferred(&self) -> bool {
        self.geohash.is_none()
    }

    pub fn outcome(&self, kind: FeedKind) -> Option<&FeedOutcome> {
        self.feeds.iter().find(|(k, _)| *k == kind).map(|(_, o)| o)
    }

    /// Every field whose sink received a value this cycle.
    pub fn changed(&self) -> BTreeSet<FieldId> {
        let mut all = self.meta.clone();
        for (_, outcome) in &self.feeds {
            if let FeedOutcome::Published(fields) = outcome {
                all.extend(fields.iter().copied());
            }
        }
        all
    }

    fn summary(&self) -> String {
        let parts: Vec<String> = self
            .feeds
            .iter()
            .map(|(kind, outcome)| match outcome {
                FeedOutcome::Published(f) => format!("{} ok ({} fields)", kind, f.len()),
                FeedOutcome::Empty => format!("{} empty", kind),
                FeedOutcome::Failed(e) => format!("{} failed ({})", kind, e),
            })
            .collect();
        if parts.is_empty() {
            "no feeds enabled".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Handle for requesting an immediate poll, e.g. when a position sensor
/// reports its first fix.
#[derive(Clone, Debug, Default)]
pub struct PollTrigger(Arc<Notify>);

impl PollTrigger {
    /// Ask for a cycle as soon as the scheduler is idle.
    pub fn poll_now(&self) {
        self.0.notify_one();
    }

    async fn requested(&self) {
        self.0.notified().await;
    }
}

/// Why the run loop woke up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Wake {
    Tick,
    Requested,
    LocationRetry,
}

/// The hub's poll loop and everything it owns.
pub struct PollScheduler<S> {
    resolver: GeoResolver,
    source: S,
    parser: FeedParser,
    router: PublishRouter,
    state: PublishedState,
    feeds: FeedToggles,
    interval: Duration,
    phase: CyclePhase,
    /// Place name and the geohash it was looked up for
    place: Option<(String, String)>,
    location_deferred: bool,
    trigger: PollTrigger,
    clock: fn() -> DateTime<Utc>,
}

impl<S: FeedSource> PollScheduler<S> {
    pub fn new(
        resolver: GeoResolver,
        source: S,
        parser: FeedParser,
        router: PublishRouter,
        feeds: FeedToggles,
        interval: Duration,
    ) -> Self {
        Self {
            resolver,
            source,
            parser,
            router,
            state: PublishedState::new(),
            feeds,
            interval,
            phase: CyclePhase::Idle,
            place: None,
            location_deferred: false,
            trigger: PollTrigger::default(),
            clock: Utc::now,
        }
    }

    /// Compose a scheduler from a validated configuration.
    ///
    /// `inputs` binds sensor references in the location to position inputs.
    pub fn from_config<F>(
        config: &HubConfig,
        source: S,
        router: PublishRouter,
        inputs: F,
    ) -> Result<Self, UnknownInput>
    where
        F: FnMut(&str) -> Option<Arc<dyn PositionInput>>,
    {
        let resolver = GeoResolver::new(config.location.clone(), inputs)?;
        Ok(Self::new(
            resolver,
            source,
            FeedParser::new(config.provider.observation_order),
            router,
            config.feeds,
            config.poll_interval,
        ))
    }

    /// Replace the wall clock used for `last_update`.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn trigger(&self) -> PollTrigger {
        self.trigger.clone()
    }

    pub fn state(&self) -> &PublishedState {
        &self.state
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// Log the effective configuration.
    pub fn dump_config(&self) {
        log::info!("Weather hub:");
        log::info!("  Update interval: {}s", self.interval.as_secs());
        match self.resolver.spec() {
            LocationSpec::Geohash(g) => log::info!("  Geohash: {}", g),
            LocationSpec::StaticLatLon { lat, lon } => {
                log::info!("  Static Latitude: {:.6}", lat);
                log::info!("  Static Longitude: {:.6}", lon);
            }
            LocationSpec::SensorLatLon { lat_ref, lon_ref } => {
                log::info!("  Latitude Sensor: {}", lat_ref);
                log::info!("  Longitude Sensor: {}", lon_ref);
            }
        }
        for kind in FeedKind::ALL {
            log::info!(
                "  Feed {}: {}",
                kind,
                if self.feeds.is_enabled(kind) { "enabled" } else { "disabled" }
            );
        }
        let bound = self.router.bound_fields();
        if bound.is_empty() {
            log::info!("  No output fields bound");
        }
        for field in bound {
            log::info!("  Output: {}", field);
        }
    }

    fn enter(&mut self, phase: CyclePhase) {
        log::trace!("{:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// Run one complete poll cycle.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.enter(CyclePhase::Resolving);
        let resolved = self.resolver.resolve();
        if !resolved.valid {
            if self.location_deferred {
                log::debug!("Location still unavailable, skipping poll");
            } else {
                log::warn!(
                    "Location not available yet ({}), deferring poll",
                    self.resolver.spec().mode()
                );
                self.location_deferred = true;
            }
            self.enter(CyclePhase::Idle);
            return CycleReport::default();
        }
        if self.location_deferred {
            log::info!("Location available, using geohash {}", resolved.geohash);
            self.location_deferred = false;
        }

        let geohash = resolved.geohash;
        let mut report = CycleReport {
            geohash: Some(geohash.clone()),
            ..CycleReport::default()
        };

        let enabled: Vec<FeedKind> = self.feeds.enabled().collect();
        let mut any_fetched = false;
        for kind in enabled.iter().copied() {
            self.enter(CyclePhase::Fetching(kind));
            let outcome = match self.source.fetch(kind, &geohash).await {
                Ok(payload) => {
                    any_fetched = true;
                    let record = self.parser.parse(kind, &payload);
                    if record.is_empty() {
                        log::warn!("No usable {} fields this cycle", kind);
                        FeedOutcome::Empty
                    } else {
                        FeedOutcome::Published(self.router.apply(&record, &mut self.state))
                    }
                }
                Err(e) => {
                    log::warn!("{} fetch failed: {}", kind, e);
                    FeedOutcome::Failed(e)
                }
            };
            report.feeds.push((kind, outcome));
        }

        if any_fetched || enabled.is_empty() {
            report.meta = self.publish_meta(&geohash).await;
        } else {
            log::warn!("All feed fetches failed, keeping previous values");
        }

        self.enter(CyclePhase::Idle);
        report
    }

    async fn publish_meta(&mut self, geohash: &str) -> BTreeSet<FieldId> {
        let mut meta = BTreeSet::new();

        if self.router.publish(
            FieldId::OutGeohash,
            FieldValue::from(geohash),
            &mut self.state,
        ) {
            meta.insert(FieldId::OutGeohash);
        }

        if self.router.is_bound(FieldId::LocationName) {
            let known = matches!(&self.place, Some((g, _)) if g == geohash);
            if !known {
                self.look_up_place(geohash).await;
            }
            if let Some((g, name)) = &self.place {
                if g == geohash
                    && self.router.publish(
                        FieldId::LocationName,
                        FieldValue::Text(name.clone()),
                        &mut self.state,
                    )
                {
                    meta.insert(FieldId::LocationName);
                }
            }
        }

        let stamp = (self.clock)().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        if self
            .router
            .publish(FieldId::LastUpdate, FieldValue::Text(stamp), &mut self.state)
        {
            meta.insert(FieldId::LastUpdate);
        }

        meta
    }

    async fn look_up_place(&mut self, geohash: &str) {
        match self.source.fetch_location(geohash).await {
            Ok(payload) => match parse_location_name(&payload) {
                Some(name) => {
                    log::info!("Location name: {}", name);
                    self.place = Some((geohash.to_string(), name));
                }
                None => log::debug!("No name in location record for {}", geohash),
            },
            Err(e) => log::warn!("Location lookup for {} failed: {}", geohash, e),
        }
    }

    /// Poll until `shutdown` fires or its sender is dropped.
    ///
    /// The first cycle runs immediately.
    pub async fn run(mut self, mut shutdown: watch::Receiver<()>) {
        self.dump_config();

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let trigger = self.trigger.clone();
        let retry = self.interval.min(LOCATION_RETRY);
        let mut deferred = false;

        loop {
            let wake = tokio::select! {
                _ = ticker.tick() => Wake::Tick,
                _ = trigger.requested() => Wake::Requested,
                _ = tokio::time::sleep(retry), if deferred => Wake::LocationRetry,
                _ = shutdown.changed() => break,
            };
            if wake == Wake::Requested {
                log::debug!("Immediate poll requested");
            }

            let report = self.run_cycle().await;
            deferred = report.deferred();
            if let Some(geohash) = &report.geohash {
                log::info!("Poll for {} complete: {}", geohash, report.summary());
            }

            if wake != Wake::Tick {
                // Keep a full interval between an off-schedule cycle and the next tick
                ticker.reset();
            }
        }

        log::info!("Weather hub stopped");
    }
}
