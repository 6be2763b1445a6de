use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aggregator::{Aggregator, Published, Reduction};
use serde::Serialize;
use solivia_codec::{Family, FieldDescriptor, FieldKind, FieldMap};
use tokio::time::Instant;
use tracing::trace;
use types::{DeviceIdentity, FieldValue, Publication};

/// Monotonic instant for throttle windows plus wall-clock milliseconds for
/// publications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    pub at: Instant,
    pub unix_ms: u64,
}

impl Stamp {
    pub fn now() -> Self {
        Self {
            at: Instant::now(),
            unix_ms: unix_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedValue {
    pub value: FieldValue,
    pub unit: &'static str,
    /// Decimal places worth displaying.
    pub precision: u8,
    pub updated_at_ms: u64,
}

/// Read-only copy of one inverter's state, handed to gateway readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InverterSnapshot {
    pub address: u8,
    pub variant: u8,
    pub family: Family,
    pub values: BTreeMap<&'static str, CachedValue>,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_success_ms: Option<u64>,
}

impl InverterSnapshot {
    /// Field name to last decoded value.
    pub fn field_values(&self) -> BTreeMap<&'static str, FieldValue> {
        self.values
            .iter()
            .map(|(name, cached)| (*name, cached.value.clone()))
            .collect()
    }
}

/// One physical device on the bus. Mutated only by the scheduler.
#[derive(Debug)]
pub struct Inverter {
    identity: DeviceIdentity,
    family: Family,
    enabled: Vec<&'static FieldDescriptor>,
    values: BTreeMap<&'static str, CachedValue>,
    aggregator: Aggregator,
    consecutive_failures: u32,
    total_failures: u64,
    last_success_ms: Option<u64>,
}

impl Inverter {
    pub(crate) fn new(
        identity: DeviceIdentity,
        family: Family,
        fields: Vec<(&'static FieldDescriptor, Duration)>,
    ) -> Self {
        let mut aggregator = Aggregator::new();
        for (field, throttle) in &fields {
            let reduction = match field.kind {
                FieldKind::Measurement => Reduction::Mean,
                FieldKind::Counter | FieldKind::Status => Reduction::Last,
                FieldKind::Identity => continue,
            };
            aggregator.track(field.name, *throttle, reduction);
        }

        Self {
            identity,
            family,
            enabled: fields.into_iter().map(|(field, _)| field).collect(),
            values: BTreeMap::new(),
            aggregator,
            consecutive_failures: 0,
            total_failures: 0,
            last_success_ms: None,
        }
    }

    pub fn address(&self) -> u8 {
        self.identity.address
    }

    pub fn variant(&self) -> u8 {
        self.identity.variant
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn enabled_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.enabled.iter().map(|field| field.name)
    }

    pub fn value(&self, field: &str) -> Option<&CachedValue> {
        self.values.get(field)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Stores every enabled field present in `decoded` and returns what is due
    /// for publication. Fields outside the enabled set are ignored; cached
    /// fields missing from `decoded` keep their previous value.
    pub fn apply(&mut self, decoded: &FieldMap, stamp: Stamp) -> Vec<Publication> {
        let mut publications = Vec::new();

        for field in &self.enabled {
            let Some(value) = decoded.get(field.name) else {
                continue;
            };
            self.values.insert(
                field.name,
                CachedValue {
                    value: value.clone(),
                    unit: field.unit,
                    precision: field.precision,
                    updated_at_ms: stamp.unix_ms,
                },
            );

            match (field.kind, value) {
                (FieldKind::Identity, _) | (_, FieldValue::Text(_)) => {
                    publications.push(self.publication(field, value.clone(), stamp));
                }
                (_, FieldValue::Number(number)) => {
                    if let Some(published) = self.aggregator.observe(field.name, *number, stamp.at) {
                        publications.push(self.aggregated(field, published, stamp));
                    }
                }
            }
        }

        self.consecutive_failures = 0;
        self.last_success_ms = Some(stamp.unix_ms);
        trace!(address = self.address(), published = publications.len(), "values applied");
        publications
    }

    /// Publishes throttle windows that elapsed without a new observation.
    pub fn expire(&mut self, stamp: Stamp) -> Vec<Publication> {
        let family = self.family;
        self.aggregator
            .expire(stamp.at)
            .into_iter()
            .filter_map(|published| {
                family
                    .descriptor(published.field)
                    .map(|field| self.aggregated(field, published, stamp))
            })
            .collect()
    }

    /// Counts a failed exchange; returns the new consecutive count.
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures
    }

    pub fn snapshot(&self) -> InverterSnapshot {
        InverterSnapshot {
            address: self.identity.address,
            variant: self.identity.variant,
            family: self.family,
            values: self.values.clone(),
            consecutive_failures: self.consecutive_failures,
            total_failures: self.total_failures,
            last_success_ms: self.last_success_ms,
        }
    }

    fn aggregated(&self, field: &FieldDescriptor, published: Published, stamp: Stamp) -> Publication {
        self.publication(field, FieldValue::Number(published.value), stamp)
    }

    fn publication(&self, field: &FieldDescriptor, value: FieldValue, stamp: Stamp) -> Publication {
        Publication {
            device: self.identity,
            field: field.name.to_string(),
            value,
            unit: field.unit.to_string(),
            collected_at_ms: stamp.unix_ms,
        }
    }
}

pub(crate) fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
