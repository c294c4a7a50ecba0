//! Device-side adapters: where published values go and where live
//! positions come from.
//!
//! Values are exposed sysfs-style, one small file per field, so that any
//! other process on the device (a display driver, a shell script) can read
//! them without linking against the hub.

use crate::config::SinkTarget;
use crate::geo::PositionInput;
use crate::publish::{PublishRouter, Sink};
use crate::scheduler::PollTrigger;
use crate::{FieldId, FieldValue};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Writes each published value to the log at info level.
#[derive(Debug)]
pub struct LogSink {
    field: FieldId,
}

impl LogSink {
    pub fn new(field: FieldId) -> Self {
        Self { field }
    }
}

impl Sink for LogSink {
    fn publish(&mut self, value: &FieldValue) {
        log::info!("{} = {}", self.field, value.render(self.field));
    }
}

/// Overwrites a file with the latest value of one field.
#[derive(Debug)]
pub struct FileSink {
    field: FieldId,
    path: PathBuf,
}

impl FileSink {
    pub fn new(field: FieldId, path: impl Into<PathBuf>) -> Self {
        Self {
            field,
            path: path.into(),
        }
    }
}

impl Sink for FileSink {
    fn publish(&mut self, value: &FieldValue) {
        let mut contents = value.plain(self.field);
        contents.push('\n');
        // A sink is always writable as far as the hub is concerned
        if let Err(e) = fs::write(&self.path, contents) {
            log::warn!(
                "Could not write {} to {}: {}",
                self.field,
                self.path.display(),
                e
            );
        }
    }
}

/// Build a router with one sink per configured output binding.
pub fn build_router(outputs: &[(FieldId, SinkTarget)]) -> PublishRouter {
    let mut router = PublishRouter::new();
    for (field, target) in outputs {
        match target {
            SinkTarget::Log => router.bind(*field, Box::new(LogSink::new(*field))),
            SinkTarget::File(path) => router.bind(*field, Box::new(FileSink::new(*field, path))),
        }
    }
    router
}

/// An in-process position input that another task updates.
///
/// Clones share the same reading. A handle built with
/// [`with_trigger`](Self::with_trigger) asks for an immediate poll whenever
/// it gives the input its first reading, so the hub does not sit out a full
/// interval waiting for a location it now has.
#[derive(Clone, Debug, Default)]
pub struct SharedInput {
    reading: Arc<Mutex<Option<f64>>>,
    on_first_reading: Option<PollTrigger>,
}

impl SharedInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a poll through `trigger` when a reading first appears.
    pub fn with_trigger(mut self, trigger: PollTrigger) -> Self {
        self.on_first_reading = Some(trigger);
        self
    }

    pub fn set(&self, value: f64) {
        let first = match self.reading.lock() {
            Ok(mut slot) => slot.replace(value).is_none(),
            Err(_) => false,
        };
        if first {
            if let Some(trigger) = &self.on_first_reading {
                trigger.poll_now();
            }
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.reading.lock() {
            *slot = None;
        }
    }
}

impl PositionInput for SharedInput {
    fn current_value(&self) -> Option<f64> {
        self.reading.lock().ok().and_then(|slot| *slot)
    }
}

/// Reads a position from a file holding a single decimal number,
/// e.g. `/run/gps/latitude` maintained by a GPS daemon.
///
/// A missing, empty or unparsable file means "no reading yet".
#[derive(Clone, Debug)]
pub struct FileInput {
    path: PathBuf,
}

impl FileInput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PositionInput for FileInput {
    fn current_value(&self) -> Option<f64> {
        let raw = fs::read_to_string(&self.path).ok()?;
        match raw.trim().parse::<f64>() {
            Ok(v) => Some(v),
            Err(_) => {
                log::debug!("Ignoring unreadable position in {}", self.path.display());
                None
            }
        }
    }
}
