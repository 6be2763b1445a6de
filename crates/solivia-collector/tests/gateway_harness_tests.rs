use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tower::util::ServiceExt;

use avro_kafka::Publisher;
use bus_transport::{MockReply, MockTransport};
use poller::{configure, BusParams, InverterSpec, PollScheduler};
use solivia_codec::{encode_payload, encode_response, Family, FieldMap};
use solivia_collector::{gateway, sink};
use types::FieldValue;

fn frame(address: u8, power: f64) -> Vec<u8> {
    let mut values = FieldMap::new();
    values.insert("ac_power", FieldValue::Number(power));
    values.insert("serial_number", FieldValue::Text("O1S16300109WN".to_string()));
    encode_response(address, &encode_payload(Family::Variant15, &values))
}

fn scheduler(mock: &MockTransport, tx: mpsc::Sender<types::Publication>) -> PollScheduler<MockTransport> {
    let plan = configure(
        BusParams::default(),
        vec![
            InverterSpec::new(5, 15).with_fields(["ac_power", "serial_number"]),
            InverterSpec::new(6, 15).with_fields(["ac_power"]),
        ],
    )
    .expect("plan");
    PollScheduler::new(plan, mock.clone(), tx)
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test(start_paused = true)]
async fn gateway_serves_cached_values() {
    let mock = MockTransport::new();
    mock.set_default(5, MockReply::Frame(frame(5, 2_100.0)));
    mock.set_default(6, MockReply::Silent);
    let (tx, _rx) = mpsc::channel(16);
    let mut scheduler = scheduler(&mock, tx);
    let app = gateway::router(scheduler.gateway(), None);

    scheduler.run_round().await.unwrap();
    let exchanges = mock.sent().len();

    let (status, body) = get_json(app.clone(), "/inverters/5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["address"], 5);
    assert_eq!(body["family"], "variant_15");
    assert_eq!(body["values"]["ac_power"]["value"], 2_100.0);
    assert_eq!(body["values"]["ac_power"]["unit"], "W");
    assert_eq!(body["values"]["ac_power"]["precision"], 0);
    assert_eq!(body["values"]["serial_number"]["value"], "O1S16300109WN");

    let (_, body) = get_json(app.clone(), "/inverters").await;
    let all = body.as_array().unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[1]["consecutive_failures"], 1);
    assert!(all[1]["values"].as_object().unwrap().is_empty());

    let (status, _) = get_json(app.clone(), "/inverters/42").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = get_json(app.clone(), "/state").await;
    assert_eq!(body["state"], "idle");

    // reads never reach the bus
    assert_eq!(mock.sent().len(), exchanges);
}

#[tokio::test(start_paused = true)]
async fn sink_drains_publications_on_shutdown() {
    let mock = MockTransport::new();
    mock.set_default(5, MockReply::Frame(frame(5, 900.0)));
    mock.set_default(6, MockReply::Frame(frame(6, 800.0)));
    let (tx, rx) = mpsc::channel(16);
    let mut scheduler = scheduler(&mock, tx);

    let publisher = Publisher::new_mock(Publisher::default_schema().unwrap(), "solivia.values");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sink = tokio::spawn(sink::sink_task(rx, publisher, shutdown_rx));

    // default throttle keeps ac_power back; serial_number goes out every cycle
    scheduler.run_round().await.unwrap();
    scheduler.run_round().await.unwrap();
    drop(scheduler);
    shutdown_tx.send(true).unwrap();

    assert_eq!(sink.await.unwrap(), 2);
}
