use avro_kafka::Publisher;
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use types::Publication;

/// Forwards publications to the publisher until shutdown, then drains what is
/// already queued. Returns the number of values delivered.
pub async fn sink_task(
    mut rx: mpsc::Receiver<Publication>,
    publisher: Publisher,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let mut delivered = 0u64;

    loop {
        tokio::select! {
            maybe_publication = rx.recv() => {
                match maybe_publication {
                    Some(publication) => delivered += deliver(&publisher, &publication).await,
                    None => break,
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("sink shutdown requested");
                    break;
                }
            }
        }
    }

    rx.close();
    while let Some(publication) = rx.recv().await {
        delivered += deliver(&publisher, &publication).await;
    }
    info!(delivered, "sink stopped");
    delivered
}

async fn deliver(publisher: &Publisher, publication: &Publication) -> u64 {
    match publisher.publish(publication).await {
        Ok(()) => {
            counter!("solivia_publications_total").increment(1);
            1
        }
        Err(err) => {
            counter!("solivia_publish_failures_total").increment(1);
            warn!(
                address = publication.device.address,
                field = %publication.field,
                error = %err,
                "publish failed"
            );
            0
        }
    }
}
