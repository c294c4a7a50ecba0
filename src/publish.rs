//! # Field Publishing
//!
//! Routes parsed feed records to the sinks bound to each output field and
//! remembers what was last published.
//!
//! The rule this module exists for: **absence never clears**. A field that a
//! record does not carry is left exactly as it was, in [`PublishedState`]
//! and at its sink. Republishing an unchanged value is fine.

use crate::parse::FeedRecord;
use crate::{FieldId, FieldValue};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Consumer of one output field's values.
///
/// Publishing cannot fail from the hub's point of view; a sink that has
/// trouble delivering deals with it itself.
pub trait Sink {
    fn publish(&mut self, value: &FieldValue);
}

/// Last value published for each field since start-up.
///
/// Lives only in memory; every boot starts empty.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PublishedState {
    values: BTreeMap<FieldId, FieldValue>,
}

impl PublishedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: FieldId) -> Option<&FieldValue> {
        self.values.get(&field)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn set(&mut self, field: FieldId, value: FieldValue) {
        self.values.insert(field, value);
    }
}

/// Field-to-sink bindings, fixed at composition time.
#[derive(Default)]
pub struct PublishRouter {
    sinks: HashMap<FieldId, Box<dyn Sink>>,
}

impl PublishRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `sink` to `field`, replacing any previous binding.
    pub fn bind(&mut self, field: FieldId, sink: Box<dyn Sink>) {
        self.sinks.insert(field, sink);
    }

    pub fn is_bound(&self, field: FieldId) -> bool {
        self.sinks.contains_key(&field)
    }

    /// Bound fields in catalogue order.
    pub fn bound_fields(&self) -> Vec<FieldId> {
        let mut fields: Vec<_> = self.sinks.keys().copied().collect();
        fields.sort();
        fields
    }

    /// Publish every present field of `record`.
    ///
    /// Returns the fields whose sinks received a value.
    pub fn apply(&mut self, record: &FeedRecord, state: &mut PublishedState) -> BTreeSet<FieldId> {
        record
            .present_fields()
            .into_iter()
            .filter_map(|(field, value)| self.publish(field, value, state).then_some(field))
            .collect()
    }

    /// Publish a single value. Unbound fields are dropped.
    ///
    /// Returns `true` if a sink received the value.
    pub fn publish(&mut self, field: FieldId, value: FieldValue, state: &mut PublishedState) -> bool {
        match self.sinks.get_mut(&field) {
            Some(sink) => {
                sink.publish(&value);
                state.set(field, value);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for PublishRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishRouter")
            .field("bound", &self.bound_fields())
            .finish()
    }
}
