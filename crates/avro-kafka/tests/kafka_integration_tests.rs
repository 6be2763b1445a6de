use avro_kafka::{KafkaConfig, Publisher};
use types::{DeviceIdentity, FieldValue, Publication};

#[tokio::test]
async fn kafka_publish_integration() {
    let brokers = match std::env::var("SOLIVIA_KAFKA_BROKERS") {
        Ok(value) => value,
        Err(_) => return,
    };
    let topic =
        std::env::var("SOLIVIA_KAFKA_TOPIC").unwrap_or_else(|_| "solivia.values".to_string());

    let mut config = KafkaConfig::default();
    config.brokers = brokers;
    config.client_id = std::env::var("SOLIVIA_KAFKA_CLIENT_ID")
        .unwrap_or_else(|_| "solivia-collector-tests".to_string());

    let publisher = Publisher::new_kafka(Publisher::default_schema().unwrap(), &topic, config)
        .expect("publisher init");

    let publication = Publication {
        device: DeviceIdentity {
            address: 2,
            variant: 212,
        },
        field: "supplied_ac_energy_total".to_string(),
        value: FieldValue::Number(12_345.6),
        unit: "kWh".to_string(),
        collected_at_ms: 1_700_000_000_000,
    };

    publisher.publish(&publication).await.expect("publish");
}
