use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bus_transport::{BusTransport, TransportError};
use metrics::{counter, gauge};
use serde::Serialize;
use solivia_codec::{decode_response, encode_request, FieldMap, FrameError, ENQ};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};
use types::{FieldValue, Publication};

pub mod config;
pub mod inverter;

pub use config::{configure, BusParams, BusPlan, ConfigError, FieldSpec, InverterSpec};
pub use inverter::{CachedValue, Inverter, InverterSnapshot, Stamp};

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("bus transport failed: {0}")]
    Bus(#[from] TransportError),
    #[error("no inverters to poll")]
    NoInverters,
    #[error("bus is listen-only, requests are disabled")]
    ListenOnly,
}

/// Where the scheduler is within the current exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PollState {
    Idle,
    /// Waiting for traffic from another bus master.
    Listening,
    RequestSent { address: u8 },
    AwaitingResponse { address: u8 },
    Decoded { address: u8 },
    Failed { address: u8 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    Timeout,
    Frame(FrameError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Decoded {
        address: u8,
        published: usize,
    },
    Failed {
        address: u8,
        reason: FailureReason,
        consecutive_failures: u32,
    },
}

impl CycleOutcome {
    pub fn address(&self) -> u8 {
        match self {
            CycleOutcome::Decoded { address, .. } | CycleOutcome::Failed { address, .. } => *address,
        }
    }

    pub fn is_decoded(&self) -> bool {
        matches!(self, CycleOutcome::Decoded { .. })
    }
}

pub type GatewayView = BTreeMap<u8, Arc<InverterSnapshot>>;

/// Read side of the scheduler's cache. Every call reads the latest published
/// snapshot and never touches the bus.
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    snapshots: watch::Receiver<GatewayView>,
    state: watch::Receiver<PollState>,
}

impl GatewayHandle {
    /// Last decoded value of every field of the inverter at `address`.
    pub fn snapshot(&self, address: u8) -> Option<BTreeMap<&'static str, FieldValue>> {
        self.snapshots
            .borrow()
            .get(&address)
            .map(|inverter| inverter.field_values())
    }

    pub fn inverter(&self, address: u8) -> Option<Arc<InverterSnapshot>> {
        self.snapshots.borrow().get(&address).cloned()
    }

    pub fn all(&self) -> Vec<Arc<InverterSnapshot>> {
        self.snapshots.borrow().values().cloned().collect()
    }

    pub fn poll_state(&self) -> PollState {
        *self.state.borrow()
    }

    /// Receiver notified on every scheduler state transition.
    pub fn state_changes(&self) -> watch::Receiver<PollState> {
        self.state.clone()
    }
}

/// Drives request/response exchanges over one bus, one at a time.
pub struct PollScheduler<T> {
    transport: T,
    inverters: Vec<Inverter>,
    next: usize,
    has_gateway: bool,
    listen_only: bool,
    poll_interval: Duration,
    response_timeout: Duration,
    inter_frame_delay: Duration,
    publications: mpsc::Sender<Publication>,
    snapshots: watch::Sender<GatewayView>,
    state: watch::Sender<PollState>,
}

impl<T: BusTransport> PollScheduler<T> {
    pub fn new(plan: BusPlan, transport: T, publications: mpsc::Sender<Publication>) -> Self {
        let view = plan
            .inverters
            .iter()
            .map(|inverter| (inverter.address(), Arc::new(inverter.snapshot())))
            .collect();
        let (snapshots, _) = watch::channel(view);
        let (state, _) = watch::channel(PollState::Idle);

        Self {
            transport,
            inverters: plan.inverters,
            next: 0,
            has_gateway: plan.has_gateway,
            listen_only: plan.listen_only,
            poll_interval: plan.poll_interval,
            response_timeout: plan.response_timeout,
            inter_frame_delay: plan.inter_frame_delay,
            publications,
            snapshots,
            state,
        }
    }

    pub fn gateway(&self) -> GatewayHandle {
        GatewayHandle {
            snapshots: self.snapshots.subscribe(),
            state: self.state.subscribe(),
        }
    }

    pub fn state(&self) -> PollState {
        *self.state.borrow()
    }

    pub fn inverters(&self) -> &[Inverter] {
        &self.inverters
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Runs one exchange with the next inverter in round-robin order.
    ///
    /// Timeouts and invalid frames fail the cycle without touching cached
    /// values. Any other transport error is returned and ends polling.
    pub async fn tick(&mut self) -> Result<CycleOutcome, PollerError> {
        if self.listen_only {
            return Err(PollerError::ListenOnly);
        }
        let index = self.next;
        self.next = (self.next + 1) % self.inverters.len().max(1);
        let Some(inverter) = self.inverters.get(index) else {
            return Err(PollerError::NoInverters);
        };
        let address = inverter.address();
        let variant = inverter.variant();

        self.set_state(PollState::RequestSent { address });
        if let Err(err) = self.transport.send(&encode_request(address)).await {
            self.set_state(PollState::Idle);
            return Err(err.into());
        }

        self.set_state(PollState::AwaitingResponse { address });
        let started = Instant::now();
        let received = self.transport.receive(self.response_timeout).await;
        let stamp = Stamp::now();

        let outcome = match received.map(|frame| decode_response(variant, &frame, address)) {
            Ok(Ok(decoded)) => {
                let outcome = self.accept(index, &decoded, stamp);
                debug!(
                    address,
                    variant,
                    fields = decoded.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "response decoded"
                );
                outcome
            }
            Ok(Err(err)) => self.fail(index, FailureReason::Frame(err)),
            Err(err) if err.is_transient() => self.fail(index, FailureReason::Timeout),
            Err(err) => {
                self.set_state(PollState::Idle);
                return Err(err.into());
            }
        };
        self.settle(index, stamp);

        if !self.inter_frame_delay.is_zero() {
            sleep(self.inter_frame_delay).await;
        }
        Ok(outcome)
    }

    /// Waits up to the poll interval for one frame of another master's traffic
    /// and applies it to the configured inverter it came from. Never transmits.
    ///
    /// Returns `None` when the window passes quietly or the frame is a request
    /// or belongs to an address that is not configured.
    pub async fn listen(&mut self) -> Result<Option<CycleOutcome>, PollerError> {
        self.set_state(PollState::Listening);
        let received = self.transport.receive(self.poll_interval).await;
        let stamp = Stamp::now();

        let frame = match received {
            Ok(frame) => frame,
            Err(err) if err.is_transient() => {
                self.expire_windows(stamp);
                self.set_state(PollState::Idle);
                return Ok(None);
            }
            Err(err) => {
                self.set_state(PollState::Idle);
                return Err(err.into());
            }
        };

        let index = frame.get(2).and_then(|address| {
            self.inverters
                .iter()
                .position(|inverter| inverter.address() == *address)
        });
        let Some(index) = index.filter(|_| frame.get(1) != Some(&ENQ)) else {
            trace!(bytes = frame.len(), "ignoring foreign bus traffic");
            self.expire_windows(stamp);
            self.set_state(PollState::Idle);
            return Ok(None);
        };

        let address = self.inverters[index].address();
        let variant = self.inverters[index].variant();
        let outcome = match decode_response(variant, &frame, address) {
            Ok(decoded) => {
                debug!(address, variant, fields = decoded.len(), "overheard response decoded");
                self.accept(index, &decoded, stamp)
            }
            Err(err) => self.fail(index, FailureReason::Frame(err)),
        };
        self.settle(index, stamp);
        Ok(Some(outcome))
    }

    /// One exchange per configured inverter.
    pub async fn run_round(&mut self) -> Result<Vec<CycleOutcome>, PollerError> {
        let mut outcomes = Vec::with_capacity(self.inverters.len());
        for _ in 0..self.inverters.len() {
            outcomes.push(self.tick().await?);
        }
        Ok(outcomes)
    }

    /// Polls rounds on the resolved interval until `shutdown` turns true. The
    /// flag is checked between exchanges, so an exchange in flight always
    /// completes or times out first.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), PollerError> {
        if self.listen_only {
            return self.run_listening(shutdown).await;
        }
        info!(
            inverters = self.inverters.len(),
            gateway = self.has_gateway,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            response_timeout_ms = self.response_timeout.as_millis() as u64,
            "poll scheduler started"
        );

        'rounds: loop {
            let round_start = Instant::now();
            let mut decoded = 0usize;

            for _ in 0..self.inverters.len() {
                if *shutdown.borrow() {
                    break 'rounds;
                }
                if self.tick().await?.is_decoded() {
                    decoded += 1;
                }
            }

            let elapsed = round_start.elapsed();
            let delay = self.poll_interval.saturating_sub(elapsed);
            if elapsed > self.poll_interval {
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    poll_interval_ms = self.poll_interval.as_millis() as u64,
                    "poll round overran its interval"
                );
            }
            debug!(
                decoded,
                inverters = self.inverters.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                delay_ms = delay.as_millis() as u64,
                "poll round complete"
            );

            tokio::select! {
                _ = sleep(delay) => {},
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break 'rounds;
                    }
                }
            }
        }

        info!("poll scheduler shutdown requested");
        Ok(())
    }

    async fn run_listening(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), PollerError> {
        info!(
            inverters = self.inverters.len(),
            window_ms = self.poll_interval.as_millis() as u64,
            "listening to bus traffic"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                outcome = self.listen() => {
                    outcome?;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("bus listener shutdown requested");
        Ok(())
    }

    fn accept(&mut self, index: usize, decoded: &FieldMap, stamp: Stamp) -> CycleOutcome {
        let address = self.inverters[index].address();
        self.set_state(PollState::Decoded { address });
        let publications = self.inverters[index].apply(decoded, stamp);
        let published = self.publish(publications);
        counter!("solivia_exchanges_total", "address" => address.to_string(), "outcome" => "decoded")
            .increment(1);
        CycleOutcome::Decoded { address, published }
    }

    /// Bookkeeping after every exchange, successful or not.
    fn settle(&mut self, index: usize, stamp: Stamp) {
        let inverter = &self.inverters[index];
        gauge!("solivia_consecutive_failures", "address" => inverter.address().to_string())
            .set(f64::from(inverter.consecutive_failures()));
        self.refresh_snapshot(index);
        self.expire_windows(stamp);
        self.set_state(PollState::Idle);
    }

    fn fail(&mut self, index: usize, reason: FailureReason) -> CycleOutcome {
        let inverter = &mut self.inverters[index];
        let address = inverter.address();
        let consecutive_failures = inverter.record_failure();
        self.set_state(PollState::Failed { address });

        let outcome = match &reason {
            FailureReason::Timeout => {
                debug!(address, consecutive_failures, "no response");
                "timeout"
            }
            FailureReason::Frame(err) => {
                warn!(address, consecutive_failures, error = %err, "invalid response frame");
                "invalid_frame"
            }
        };
        counter!("solivia_exchanges_total", "address" => address.to_string(), "outcome" => outcome)
            .increment(1);

        CycleOutcome::Failed {
            address,
            reason,
            consecutive_failures,
        }
    }

    fn publish(&self, publications: Vec<Publication>) -> usize {
        let mut sent = 0;
        for publication in publications {
            match self.publications.try_send(publication) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(dropped)) => {
                    counter!("solivia_publications_dropped_total").increment(1);
                    warn!(
                        address = dropped.device.address,
                        field = %dropped.field,
                        "publication channel full, dropping value"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("publication channel closed");
                    break;
                }
            }
        }
        sent
    }

    fn expire_windows(&mut self, stamp: Stamp) {
        let expired: Vec<Publication> = self
            .inverters
            .iter_mut()
            .flat_map(|inverter| inverter.expire(stamp))
            .collect();
        if !expired.is_empty() {
            self.publish(expired);
        }
    }

    fn refresh_snapshot(&self, index: usize) {
        let inverter = &self.inverters[index];
        let snapshot = Arc::new(inverter.snapshot());
        self.snapshots.send_modify(|view| {
            view.insert(inverter.address(), snapshot);
        });
    }

    fn set_state(&self, state: PollState) {
        self.state.send_replace(state);
    }
}
