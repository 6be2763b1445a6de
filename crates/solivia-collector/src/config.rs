use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use bus_transport::{DriverEnableLine, SerialConfig};
use poller::config::DEFAULT_THROTTLE;
use poller::{configure, BusParams, BusPlan, FieldSpec, InverterSpec};

const DEFAULT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_HTTP_LISTEN: &str = "127.0.0.1:8080";
pub const DEFAULT_KAFKA_TOPIC: &str = "solivia.values";

#[derive(Clone, Debug)]
pub struct CollectorConfig {
    pub serial: SerialConfig,
    pub bus: BusParams,
    pub inverters: Vec<InverterSpec>,
    /// Gateway HTTP listener; `None` disables it.
    pub http_listen: Option<String>,
    pub channel_capacity: usize,
    pub kafka_brokers: Option<String>,
    pub kafka_client_id: Option<String>,
    pub kafka_acks: Option<String>,
    pub kafka_compression: Option<String>,
    pub kafka_timeout_ms: Option<u64>,
    pub kafka_topic: Option<String>,
    pub kafka_enable_idempotence: Option<bool>,
}

impl CollectorConfig {
    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config).context("invalid environment override")?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.serial.port.trim().is_empty() {
            anyhow::bail!("serial.port must be non-empty");
        }
        if self.serial.baud_rate == 0 {
            anyhow::bail!("serial.baud_rate must be >= 1");
        }
        if self.channel_capacity == 0 {
            anyhow::bail!("channel_capacity must be >= 1");
        }
        if let Some(ref listen) = self.http_listen {
            listen
                .parse::<SocketAddr>()
                .with_context(|| format!("http.listen '{listen}' is not a socket address"))?;
        }
        if let Some(timeout_ms) = self.kafka_timeout_ms {
            if timeout_ms == 0 {
                anyhow::bail!("kafka.timeout_ms must be >= 1");
            }
        }
        if let Some(ref brokers) = self.kafka_brokers {
            if brokers.trim().is_empty() {
                anyhow::bail!("kafka.brokers must be non-empty when set");
            }
        }
        if let Some(ref topic) = self.kafka_topic {
            validate_kafka_topic(topic)?;
        }

        self.bus_plan().map(|_| ())
    }

    /// Runs the bus configuration through `poller::configure`.
    pub fn bus_plan(&self) -> Result<BusPlan> {
        configure(self.bus.clone(), self.inverters.clone()).context("invalid bus configuration")
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            bus: BusParams::default(),
            inverters: Vec::new(),
            http_listen: Some(DEFAULT_HTTP_LISTEN.to_string()),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            kafka_brokers: None,
            kafka_client_id: None,
            kafka_acks: None,
            kafka_compression: None,
            kafka_timeout_ms: None,
            kafka_topic: None,
            kafka_enable_idempotence: None,
        }
    }
}

fn apply_env_overrides(config: &mut CollectorConfig) -> Result<()> {
    if let Ok(value) = env::var("SOLIVIA_SERIAL_PORT") {
        config.serial.port = value;
    }
    if let Some(baud_rate) = parse_env("SOLIVIA_BAUD_RATE")? {
        config.serial.baud_rate = baud_rate;
    }
    if let Ok(value) = env::var("SOLIVIA_DRIVER_ENABLE") {
        config.serial.driver_enable =
            parse_driver_enable(&value).context("SOLIVIA_DRIVER_ENABLE")?;
    }

    if let Some(has_gateway) = parse_env("SOLIVIA_HAS_GATEWAY")? {
        config.bus.has_gateway = has_gateway;
    }
    if let Some(listen_only) = parse_env("SOLIVIA_LISTEN_ONLY")? {
        config.bus.listen_only = listen_only;
    }
    if let Some(interval_ms) = parse_env("SOLIVIA_POLL_INTERVAL_MS")? {
        config.bus.poll_interval = Duration::from_millis(interval_ms);
    }
    if let Some(timeout_ms) = parse_env("SOLIVIA_RESPONSE_TIMEOUT_MS")? {
        config.bus.response_timeout = Duration::from_millis(timeout_ms);
    }
    if let Some(delay_ms) = parse_env("SOLIVIA_INTER_FRAME_DELAY_MS")? {
        config.bus.inter_frame_delay = Duration::from_millis(delay_ms);
    }

    if let Ok(value) = env::var("SOLIVIA_INVERTERS") {
        config.inverters = parse_inverter_list(&value).context("SOLIVIA_INVERTERS")?;
    }

    if let Ok(value) = env::var("SOLIVIA_HTTP_LISTEN") {
        config.http_listen = match value.trim() {
            "" | "off" => None,
            listen => Some(listen.to_string()),
        };
    }

    if let Some(capacity) = parse_env("SOLIVIA_CHANNEL_CAPACITY")? {
        config.channel_capacity = capacity;
    }

    config.kafka_brokers = env::var("SOLIVIA_KAFKA_BROKERS").ok().or(config.kafka_brokers.take());
    config.kafka_client_id = env::var("SOLIVIA_KAFKA_CLIENT_ID")
        .ok()
        .or(config.kafka_client_id.take());
    config.kafka_acks = env::var("SOLIVIA_KAFKA_ACKS").ok().or(config.kafka_acks.take());
    config.kafka_compression = env::var("SOLIVIA_KAFKA_COMPRESSION")
        .ok()
        .or(config.kafka_compression.take());
    config.kafka_timeout_ms = parse_env("SOLIVIA_KAFKA_TIMEOUT_MS")?.or(config.kafka_timeout_ms);
    config.kafka_topic = env::var("SOLIVIA_KAFKA_TOPIC").ok().or(config.kafka_topic.take());
    config.kafka_enable_idempotence =
        parse_env("SOLIVIA_KAFKA_IDEMPOTENCE")?.or(config.kafka_enable_idempotence);
    Ok(())
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    serial: Option<FileSerialConfig>,
    bus: Option<FileBusConfig>,
    inverters: Option<Vec<FileInverterConfig>>,
    http: Option<FileHttpConfig>,
    kafka: Option<FileKafkaConfig>,
    channel_capacity: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct FileSerialConfig {
    port: Option<String>,
    baud_rate: Option<u32>,
    driver_enable: Option<DriverEnableLine>,
    turnaround_guard_us: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileBusConfig {
    has_gateway: Option<bool>,
    listen_only: Option<bool>,
    poll_interval_ms: Option<u64>,
    response_timeout_ms: Option<u64>,
    inter_frame_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileInverterConfig {
    address: u8,
    variant: u8,
    throttle_ms: Option<u64>,
    #[serde(default)]
    fields: Vec<FileFieldConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FileFieldConfig {
    Name(String),
    Detailed { name: String, throttle_ms: Option<u64> },
}

#[derive(Debug, Deserialize)]
struct FileHttpConfig {
    listen: Option<String>,
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FileKafkaConfig {
    brokers: Option<String>,
    topic: Option<String>,
    client_id: Option<String>,
    acks: Option<String>,
    compression: Option<String>,
    timeout_ms: Option<u64>,
    enable_idempotence: Option<bool>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("SOLIVIA_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn apply_file_config(config: &mut CollectorConfig, file: FileConfig) {
    if let Some(serial) = file.serial {
        if let Some(port) = serial.port {
            config.serial.port = port;
        }
        if let Some(baud_rate) = serial.baud_rate {
            config.serial.baud_rate = baud_rate;
        }
        if serial.driver_enable.is_some() {
            config.serial.driver_enable = serial.driver_enable;
        }
        if let Some(guard) = serial.turnaround_guard_us {
            config.serial.turnaround_guard_us = guard;
        }
    }

    if let Some(bus) = file.bus {
        if let Some(has_gateway) = bus.has_gateway {
            config.bus.has_gateway = has_gateway;
        }
        if let Some(listen_only) = bus.listen_only {
            config.bus.listen_only = listen_only;
        }
        if let Some(interval_ms) = bus.poll_interval_ms {
            config.bus.poll_interval = Duration::from_millis(interval_ms);
        }
        if let Some(timeout_ms) = bus.response_timeout_ms {
            config.bus.response_timeout = Duration::from_millis(timeout_ms);
        }
        if let Some(delay_ms) = bus.inter_frame_delay_ms {
            config.bus.inter_frame_delay = Duration::from_millis(delay_ms);
        }
    }

    if let Some(inverters) = file.inverters {
        config.inverters = inverters
            .into_iter()
            .map(|inverter| InverterSpec {
                address: inverter.address,
                variant: inverter.variant,
                throttle: inverter
                    .throttle_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_THROTTLE),
                fields: inverter
                    .fields
                    .into_iter()
                    .map(|field| match field {
                        FileFieldConfig::Name(name) => FieldSpec::named(name),
                        FileFieldConfig::Detailed { name, throttle_ms } => FieldSpec {
                            name,
                            throttle: throttle_ms.map(Duration::from_millis),
                        },
                    })
                    .collect(),
            })
            .collect();
    }

    if let Some(http) = file.http {
        if let Some(listen) = http.listen {
            config.http_listen = Some(listen);
        }
        if http.enabled == Some(false) {
            config.http_listen = None;
        }
    }

    if let Some(capacity) = file.channel_capacity {
        config.channel_capacity = capacity;
    }

    if let Some(kafka) = file.kafka {
        if let Some(brokers) = kafka.brokers {
            config.kafka_brokers = Some(brokers);
        }
        if let Some(topic) = kafka.topic {
            config.kafka_topic = Some(topic);
        }
        if let Some(client_id) = kafka.client_id {
            config.kafka_client_id = Some(client_id);
        }
        if let Some(acks) = kafka.acks {
            config.kafka_acks = Some(acks);
        }
        if let Some(compression) = kafka.compression {
            config.kafka_compression = Some(compression);
        }
        if let Some(timeout_ms) = kafka.timeout_ms {
            config.kafka_timeout_ms = Some(timeout_ms);
        }
        if let Some(enable_idempotence) = kafka.enable_idempotence {
            config.kafka_enable_idempotence = Some(enable_idempotence);
        }
    }
}

/// Unset is `None`; set but unparsable is an error.
fn parse_env<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{key}={value:?} is not valid")),
        Err(_) => Ok(None),
    }
}

/// `rts`, `gpio:<n>`, or `none`.
fn parse_driver_enable(value: &str) -> Result<Option<DriverEnableLine>> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("rts") {
        return Ok(Some(DriverEnableLine::Rts));
    }
    if value.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let Some(pin) = value.strip_prefix("gpio:") else {
        anyhow::bail!("driver enable {value:?} is not rts, gpio:<n> or none");
    };
    let pin = pin
        .trim()
        .parse()
        .with_context(|| format!("gpio number {pin:?} is not valid"))?;
    Ok(Some(DriverEnableLine::Gpio(pin)))
}

/// Comma separated `address:variant` pairs, e.g. `5:15,9:212`. Every field of
/// the family is enabled. Any malformed entry rejects the whole list.
fn parse_inverter_list(value: &str) -> Result<Vec<InverterSpec>> {
    value
        .split(',')
        .map(|entry| {
            let entry = entry.trim();
            let Some((address, variant)) = entry.split_once(':') else {
                anyhow::bail!("inverter entry {entry:?} is not address:variant");
            };
            let address = address
                .trim()
                .parse()
                .with_context(|| format!("inverter entry {entry:?}: bad address"))?;
            let variant = variant
                .trim()
                .parse()
                .with_context(|| format!("inverter entry {entry:?}: bad variant"))?;
            Ok(InverterSpec::new(address, variant))
        })
        .collect()
}

fn validate_kafka_topic(topic: &str) -> Result<()> {
    if topic.trim().is_empty() {
        anyhow::bail!("kafka.topic must be non-empty when set");
    }
    if topic.len() > 249 {
        anyhow::bail!("kafka.topic must be <= 249 characters");
    }
    if topic
        .chars()
        .any(|ch| !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-')
    {
        anyhow::bail!("kafka.topic contains invalid characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverter_list_parses_pairs() {
        let specs = parse_inverter_list("5:15, 9:212").unwrap();
        let pairs: Vec<_> = specs.iter().map(|spec| (spec.address, spec.variant)).collect();
        assert_eq!(pairs, vec![(5, 15), (9, 212)]);
    }

    #[test]
    fn inverter_list_rejects_malformed_entries() {
        for list in ["5:15,9:300,12:x", "5:15,garbage", "5:15,7:", "5:15,", ":15"] {
            assert!(parse_inverter_list(list).is_err(), "{list} accepted");
        }
    }

    #[test]
    fn driver_enable_forms() {
        assert_eq!(parse_driver_enable("RTS").unwrap(), Some(DriverEnableLine::Rts));
        assert_eq!(parse_driver_enable("gpio:17").unwrap(), Some(DriverEnableLine::Gpio(17)));
        assert_eq!(parse_driver_enable("none").unwrap(), None);
    }

    #[test]
    fn driver_enable_rejects_typos() {
        for value in ["rst", "gpio:", "gpio:x", "gpio17", ""] {
            assert!(parse_driver_enable(value).is_err(), "{value} accepted");
        }
    }
}
