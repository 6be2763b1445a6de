use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use avro_kafka::{KafkaConfig, Publisher};
use bus_transport::SerialTransport;
use poller::{GatewayHandle, PollScheduler};
use solivia_collector::config::DEFAULT_KAFKA_TOPIC;
use solivia_collector::{gateway, sink, CollectorConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = parse_config_arg();
    let config = CollectorConfig::load_with_path(config_path).context("load config failed")?;
    config.validate().context("config validation failed")?;
    let plan = config.bus_plan()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(error = %err, "prometheus recorder install failed");
            None
        }
    };

    let publisher = build_publisher(&config)?;
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let sink_handle = tokio::spawn(sink::sink_task(rx, publisher, shutdown_rx.clone()));

    let transport = SerialTransport::open(config.serial.clone())
        .await
        .with_context(|| format!("open serial port {}", config.serial.port))?;
    let scheduler = PollScheduler::new(plan, transport, tx);
    let gateway_handle = scheduler.gateway();
    let mut poller_handle = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let http_handle = match config.http_listen.as_deref() {
        Some(listen) => Some(
            start_http(listen, gateway_handle, metrics, shutdown_rx.clone())
                .await
                .context("gateway http init failed")?,
        ),
        None => None,
    };

    notify_ready();
    let watchdog_handle = start_watchdog(shutdown_rx.clone());

    let outcome: Result<()> = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "signal handler failed");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            // the exchange in flight completes or times out first
            match (&mut poller_handle).await {
                Ok(result) => result.map_err(anyhow::Error::from),
                Err(err) => Err(anyhow::anyhow!("poller task failed: {err}")),
            }
        }
        joined = &mut poller_handle => {
            let _ = shutdown_tx.send(true);
            match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    warn!(error = %err, "poller stopped");
                    Err(anyhow::Error::from(err))
                }
                Err(err) => Err(anyhow::anyhow!("poller task failed: {err}")),
            }
        }
    };

    if let Some(handle) = http_handle {
        let _ = handle.await;
    }
    match sink_handle.await {
        Ok(delivered) => info!(delivered, "publication sink finished"),
        Err(err) => warn!(error = %err, "sink task join failed"),
    }
    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }
    outcome.context("polling ended with an error")
}

fn build_publisher(config: &CollectorConfig) -> Result<Publisher> {
    let schema = Publisher::default_schema().context("load avro schema")?;
    let topic = config
        .kafka_topic
        .clone()
        .unwrap_or_else(|| DEFAULT_KAFKA_TOPIC.to_string());

    let Some(brokers) = config.kafka_brokers.clone() else {
        info!(topic = %topic, "no kafka brokers configured, logging publications");
        return Ok(Publisher::new_mock(schema, topic));
    };

    let mut kafka_config = KafkaConfig::default();
    kafka_config.brokers = brokers;
    if let Some(client_id) = config.kafka_client_id.clone() {
        kafka_config.client_id = client_id;
    }
    if let Some(acks) = config.kafka_acks.clone() {
        kafka_config.acks = acks;
    }
    if let Some(compression) = config.kafka_compression.clone() {
        kafka_config.compression = compression;
    }
    if let Some(timeout_ms) = config.kafka_timeout_ms {
        kafka_config.message_timeout_ms = timeout_ms;
    }
    if let Some(enable_idempotence) = config.kafka_enable_idempotence {
        kafka_config.enable_idempotence = enable_idempotence;
    }

    Publisher::new_kafka(schema, topic, kafka_config).context("kafka publisher init failed")
}

async fn start_http(
    listen: &str,
    gateway_handle: GatewayHandle,
    metrics: Option<PrometheusHandle>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let addr: SocketAddr = listen.parse().context("parse http listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "gateway http listening");

    let app = gateway::router(gateway_handle, metrics);
    Ok(tokio::spawn(async move {
        let shutdown_signal = async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        };
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
        {
            warn!(error = %err, "gateway http server failed");
        }
    }))
}

fn parse_config_arg() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

#[cfg(target_os = "linux")]
fn start_watchdog(mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
    let interval = watchdog_interval()?;
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
                        warn!(error = %err, "systemd watchdog notify failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn start_watchdog(_shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
    None
}

#[cfg(target_os = "linux")]
fn watchdog_interval() -> Option<Duration> {
    let watchdog_usec = env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Some(pid) = env::var("WATCHDOG_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        if pid != std::process::id() {
            return None;
        }
    }

    let interval = watchdog_usec.saturating_div(2).max(100_000);
    Some(Duration::from_micros(interval))
}
