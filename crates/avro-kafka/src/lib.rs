use std::time::Duration;

use apache_avro::types::Value;
use apache_avro::{Schema, Writer};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use thiserror::Error;
use tracing::debug;
use types::{FieldValue, Publication};

/// Sends throttled inverter values downstream, to Kafka or to the log.
#[derive(Clone)]
pub struct Publisher {
    schema: Schema,
    topic: String,
    producer: Option<FutureProducer>,
    timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub client_id: String,
    pub acks: String,
    pub compression: String,
    pub message_timeout_ms: u64,
    pub enable_idempotence: bool,
}

impl Publisher {
    /// Publisher that only logs what it would send.
    pub fn new_mock(schema: Schema, topic: impl Into<String>) -> Self {
        Self {
            schema,
            topic: topic.into(),
            producer: None,
            timeout: Duration::from_millis(0),
        }
    }

    pub fn new_kafka(
        schema: Schema,
        topic: impl Into<String>,
        config: KafkaConfig,
    ) -> Result<Self, PublishError> {
        let timeout = Duration::from_millis(config.message_timeout_ms);
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("acks", &config.acks)
            .set("compression.type", &config.compression)
            .set(
                "enable.idempotence",
                if config.enable_idempotence { "true" } else { "false" },
            )
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .create()
            .map_err(PublishError::KafkaConfig)?;

        Ok(Self {
            schema,
            topic: topic.into(),
            producer: Some(producer),
            timeout,
        })
    }

    pub fn is_mock(&self) -> bool {
        self.producer.is_none()
    }

    /// Encodes one value and produces it keyed by inverter address, so every
    /// inverter's values stay ordered within a partition.
    pub async fn publish(&self, publication: &Publication) -> Result<(), PublishError> {
        let payload = self.serialize(publication)?;
        let key = publication.device.address.to_string();

        match &self.producer {
            Some(producer) => {
                let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);
                producer
                    .send(record, Timeout::After(self.timeout))
                    .await
                    .map_err(|(err, _)| PublishError::Kafka(err))?;
                Ok(())
            }
            None => {
                debug!(
                    topic = %self.topic,
                    address = publication.device.address,
                    field = %publication.field,
                    value = %publication.value,
                    unit = %publication.unit,
                    bytes = payload.len(),
                    "mock publish"
                );
                Ok(())
            }
        }
    }

    /// Avro container bytes holding one record.
    pub fn serialize(&self, publication: &Publication) -> Result<Vec<u8>, PublishError> {
        let mut writer = Writer::with_codec(&self.schema, Vec::new(), apache_avro::Codec::Deflate);
        writer
            .append(to_record(publication))
            .map_err(|err| PublishError::Encode(err.to_string()))?;
        writer
            .into_inner()
            .map_err(|err| PublishError::Encode(err.to_string()))
    }

    pub fn default_schema() -> Result<Schema, PublishError> {
        Schema::parse_str(DEFAULT_SCHEMA).map_err(|err| PublishError::Schema(err.to_string()))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Flat Avro record for one publication; `value` is a `double`/`string` union.
pub fn to_record(publication: &Publication) -> Value {
    let value = match &publication.value {
        FieldValue::Number(number) => Value::Union(0, Box::new(Value::Double(*number))),
        FieldValue::Text(text) => Value::Union(1, Box::new(Value::String(text.clone()))),
    };

    Value::Record(vec![
        (
            "address".to_string(),
            Value::Int(i32::from(publication.device.address)),
        ),
        (
            "variant".to_string(),
            Value::Int(i32::from(publication.device.variant)),
        ),
        ("field".to_string(), Value::String(publication.field.clone())),
        ("value".to_string(), value),
        ("unit".to_string(), Value::String(publication.unit.clone())),
        (
            "collected_at_ms".to_string(),
            Value::Long(i64::try_from(publication.collected_at_ms).unwrap_or(i64::MAX)),
        ),
    ])
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("avro schema error: {0}")]
    Schema(String),
    #[error("avro encode error: {0}")]
    Encode(String),
    #[error("kafka config error: {0}")]
    KafkaConfig(rdkafka::error::KafkaError),
    #[error("kafka publish error: {0}")]
    Kafka(rdkafka::error::KafkaError),
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            client_id: "solivia-collector".to_string(),
            acks: "all".to_string(),
            compression: "zstd".to_string(),
            message_timeout_ms: 5_000,
            enable_idempotence: true,
        }
    }
}

const DEFAULT_SCHEMA: &str = r#"
{
  "type": "record",
  "name": "InverterValue",
  "namespace": "solivia.telemetry",
  "fields": [
    {"name": "address", "type": "int"},
    {"name": "variant", "type": "int"},
    {"name": "field", "type": "string"},
    {"name": "value", "type": ["double", "string"]},
    {"name": "unit", "type": "string"},
    {"name": "collected_at_ms", "type": "long"}
  ]
}
"#;
