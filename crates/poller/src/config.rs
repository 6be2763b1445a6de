use std::collections::HashSet;
use std::time::Duration;

use solivia_codec::{family_for, Family, FieldDescriptor, MAX_VARIANT, MIN_VARIANT};
use thiserror::Error;
use tracing::{info, warn};
use types::DeviceIdentity;

use crate::inverter::Inverter;

/// Gateway mode pins the bus cadence to this interval.
pub const GATEWAY_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Standalone intervals below this saturate the bus.
pub const MIN_STANDALONE_POLL_INTERVAL: Duration = Duration::from_millis(1_000);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_THROTTLE: Duration = Duration::from_secs(10);
/// An exchange has to finish well inside one turn on the bus.
pub const MAX_RESPONSE_TIMEOUT: Duration = Duration::from_millis(999);

#[derive(Debug, Clone)]
pub struct BusParams {
    pub has_gateway: bool,
    /// Another master owns the bus: never transmit, decode its traffic instead.
    pub listen_only: bool,
    pub poll_interval: Duration,
    pub response_timeout: Duration,
    pub inter_frame_delay: Duration,
}

impl Default for BusParams {
    fn default() -> Self {
        Self {
            has_gateway: false,
            listen_only: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            inter_frame_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    /// Overrides the inverter's throttle window for this field.
    pub throttle: Option<Duration>,
}

impl FieldSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            throttle: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InverterSpec {
    pub address: u8,
    pub variant: u8,
    pub throttle: Duration,
    /// Fields to decode and publish. Empty enables the whole family table.
    pub fields: Vec<FieldSpec>,
}

impl InverterSpec {
    pub fn new(address: u8, variant: u8) -> Self {
        Self {
            address,
            variant,
            throttle: DEFAULT_THROTTLE,
            fields: Vec::new(),
        }
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(FieldSpec::named).collect();
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("no inverters configured")]
    NoInverters,
    #[error("inverter address {0} is invalid (must be at least 1)")]
    InvalidAddress(u8),
    #[error("inverter address {0} is configured more than once")]
    DuplicateAddress(u8),
    #[error("inverter {address}: variant {variant} is not supported")]
    UnsupportedVariant { address: u8, variant: u8 },
    #[error("inverter {address}: field `{field}` does not exist in the {family} layout")]
    UnknownField {
        address: u8,
        field: String,
        family: &'static str,
    },
    #[error("response timeout must be between 1ms and {max}ms, got {actual}ms", max = MAX_RESPONSE_TIMEOUT.as_millis())]
    InvalidTimeout { actual: u128 },
    #[error("poll interval must be greater than zero")]
    InvalidInterval,
}

/// Validated bus layout: resolved timing plus one [`Inverter`] per address, in
/// configuration order.
#[derive(Debug)]
pub struct BusPlan {
    pub has_gateway: bool,
    pub listen_only: bool,
    /// Round cadence when polling; the receive window when listening.
    pub poll_interval: Duration,
    pub response_timeout: Duration,
    pub inter_frame_delay: Duration,
    pub inverters: Vec<Inverter>,
}

/// Validates the whole configuration before building anything. Either every
/// inverter is constructed or none is.
pub fn configure(bus: BusParams, inverters: Vec<InverterSpec>) -> Result<BusPlan, ConfigError> {
    if inverters.is_empty() {
        return Err(ConfigError::NoInverters);
    }
    if bus.response_timeout.is_zero() || bus.response_timeout > MAX_RESPONSE_TIMEOUT {
        return Err(ConfigError::InvalidTimeout {
            actual: bus.response_timeout.as_millis(),
        });
    }
    if bus.poll_interval.is_zero() {
        return Err(ConfigError::InvalidInterval);
    }

    let mut seen = HashSet::new();
    let mut resolved = Vec::with_capacity(inverters.len());
    for spec in &inverters {
        if spec.address == 0 {
            return Err(ConfigError::InvalidAddress(spec.address));
        }
        if !seen.insert(spec.address) {
            return Err(ConfigError::DuplicateAddress(spec.address));
        }
        resolved.push(resolve_fields(spec)?);
    }

    let poll_interval = resolve_interval(&bus);
    let inverters = inverters
        .iter()
        .zip(resolved)
        .map(|(spec, (family, fields))| {
            info!(
                address = spec.address,
                variant = spec.variant,
                family = family.name(),
                fields = fields.len(),
                throttle_ms = spec.throttle.as_millis() as u64,
                "inverter configured"
            );
            Inverter::new(
                DeviceIdentity {
                    address: spec.address,
                    variant: spec.variant,
                },
                family,
                fields,
            )
        })
        .collect();

    Ok(BusPlan {
        has_gateway: bus.has_gateway,
        listen_only: bus.listen_only,
        poll_interval,
        response_timeout: bus.response_timeout,
        inter_frame_delay: bus.inter_frame_delay,
        inverters,
    })
}

type EnabledFields = Vec<(&'static FieldDescriptor, Duration)>;

fn resolve_fields(spec: &InverterSpec) -> Result<(Family, EnabledFields), ConfigError> {
    let unsupported = ConfigError::UnsupportedVariant {
        address: spec.address,
        variant: spec.variant,
    };
    if !(MIN_VARIANT..=MAX_VARIANT).contains(&spec.variant) {
        return Err(unsupported);
    }
    let family = family_for(spec.variant).ok_or(unsupported)?;

    if spec.fields.is_empty() {
        let all = family
            .fields()
            .iter()
            .map(|field| (field, spec.throttle))
            .collect();
        return Ok((family, all));
    }

    let mut enabled: EnabledFields = Vec::with_capacity(spec.fields.len());
    for field in &spec.fields {
        let descriptor = family
            .descriptor(&field.name)
            .ok_or_else(|| ConfigError::UnknownField {
                address: spec.address,
                field: field.name.clone(),
                family: family.name(),
            })?;
        let throttle = field.throttle.unwrap_or(spec.throttle);
        match enabled.iter_mut().find(|(known, _)| known.name == descriptor.name) {
            Some(existing) => existing.1 = throttle,
            None => enabled.push((descriptor, throttle)),
        }
    }
    Ok((family, enabled))
}

fn resolve_interval(bus: &BusParams) -> Duration {
    if bus.has_gateway {
        if bus.poll_interval != GATEWAY_POLL_INTERVAL {
            warn!(
                requested_ms = bus.poll_interval.as_millis() as u64,
                "fixing poll interval to {}ms in gateway mode",
                GATEWAY_POLL_INTERVAL.as_millis()
            );
        }
        return GATEWAY_POLL_INTERVAL;
    }

    if !bus.listen_only && bus.poll_interval < MIN_STANDALONE_POLL_INTERVAL {
        warn!(
            poll_interval_ms = bus.poll_interval.as_millis() as u64,
            "poll interval below {}ms without a gateway",
            MIN_STANDALONE_POLL_INTERVAL.as_millis()
        );
    }
    bus.poll_interval
}
