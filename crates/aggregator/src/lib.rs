//! Time-windowed smoothing between the poll cadence and the publication cadence.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

/// How a closed window is reduced to one published value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Arithmetic mean of the window's observations.
    Mean,
    /// The most recent observation.
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Published {
    pub field: &'static str,
    pub value: f64,
    /// Observations that went into `value`.
    pub samples: u32,
}

#[derive(Debug, Clone)]
struct Window {
    field: &'static str,
    period: Duration,
    reduction: Reduction,
    opened_at: Option<Instant>,
    sum: f64,
    count: u32,
    last: f64,
    published: Option<f64>,
}

impl Window {
    fn new(field: &'static str, period: Duration, reduction: Reduction) -> Self {
        Self {
            field,
            period,
            reduction,
            opened_at: None,
            sum: 0.0,
            count: 0,
            last: 0.0,
            published: None,
        }
    }

    fn elapsed(&self, now: Instant) -> bool {
        self.opened_at
            .is_some_and(|opened| now.saturating_duration_since(opened) >= self.period)
    }

    fn push(&mut self, value: f64, now: Instant) {
        if self.opened_at.is_none() {
            self.opened_at = Some(now);
        }
        self.sum += value;
        self.count += 1;
        self.last = value;
    }

    fn close(&mut self) -> Option<Published> {
        self.opened_at.take()?;
        let value = match self.reduction {
            Reduction::Mean => self.sum / f64::from(self.count),
            Reduction::Last => self.last,
        };
        let published = Published {
            field: self.field,
            value,
            samples: self.count,
        };
        self.sum = 0.0;
        self.count = 0;
        self.published = Some(value);
        Some(published)
    }
}

/// Per-field throttle windows for one inverter.
///
/// A window opens with its first observation and closes on the first
/// `observe` or `expire` at or after `opened + period`. An observation that
/// arrives after the period has elapsed first closes the old window and then
/// opens a new one with itself. A zero period publishes every observation.
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    windows: BTreeMap<&'static str, Window>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `field`. Observations of untracked fields are dropped.
    pub fn track(&mut self, field: &'static str, period: Duration, reduction: Reduction) {
        self.windows.insert(field, Window::new(field, period, reduction));
    }

    pub fn is_tracked(&self, field: &str) -> bool {
        self.windows.contains_key(field)
    }

    /// Adds one observation and returns the value published by this call, if any.
    pub fn observe(&mut self, field: &str, value: f64, now: Instant) -> Option<Published> {
        let window = self.windows.get_mut(field)?;

        if window.elapsed(now) {
            // the new value belongs to the next window; publish the old one first
            let published = window.close();
            window.push(value, now);
            trace!(field = window.field, "throttle window rolled over");
            return published;
        }

        window.push(value, now);
        if window.period.is_zero() {
            return window.close();
        }
        None
    }

    /// Closes every window whose period has elapsed without a new observation.
    pub fn expire(&mut self, now: Instant) -> Vec<Published> {
        self.windows
            .values_mut()
            .filter(|window| window.elapsed(now))
            .filter_map(Window::close)
            .collect()
    }

    /// Last value published for `field`.
    pub fn current(&self, field: &str) -> Option<f64> {
        self.windows.get(field).and_then(|window| window.published)
    }

    /// Observations waiting in the open window of `field`.
    pub fn pending(&self, field: &str) -> u32 {
        self.windows.get(field).map_or(0, |window| window.count)
    }
}
