//! # Reconnect Backoff
//!
//! The feed connection is a small state machine:
//!
//! ```text
//!  Disconnected --start--> Connecting --succeeded--> Connected
//!                              ^   \                    |
//!                         retry|    \failed        lost |
//!                              |     v                  v
//!                              +--- Backoff(delay) <----+
//!  (any) --stop--> Disconnected
//! ```
//!
//! Every failure waits the current delay and then grows it by the factor, up
//! to the ceiling. A successful connect puts the delay back to its initial
//! value. The defaults are 5 s initial, x1.5, 50 s ceiling.

use std::time::Duration;

/// Delay before the first reconnect.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(5_000);
/// Upper bound for the reconnect delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(50_000);
/// Growth factor applied after every failure.
pub const DEFAULT_FACTOR: f64 = 1.5;

/// Exponential reconnect delay with a ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    failures: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY, DEFAULT_FACTOR)
    }
}

impl Backoff {
    /// Builds a policy. A factor below 1 (or NaN) is treated as 1, and a
    /// ceiling below the initial delay is raised to it.
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        let factor = if factor.is_finite() && factor >= 1.0 { factor } else { 1.0 };
        Self {
            initial,
            max: max.max(initial),
            factor,
            failures: 0,
        }
    }

    /// Delay for the given number of consecutive failures:
    /// `min(initial * factor^failures, max)`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let millis = self.initial.as_secs_f64() * 1000.0 * self.factor.powi(exponent);
        let max_millis = self.max.as_secs_f64() * 1000.0;
        if !millis.is_finite() || millis >= max_millis {
            self.max
        } else {
            // Whole microseconds keep the sequence exact (112.5 ms stays 112.5 ms).
            Duration::from_micros((millis * 1000.0).round() as u64)
        }
    }

    /// The delay the next failure will wait.
    pub fn current(&self) -> Duration {
        self.delay_for(self.failures)
    }

    /// Consecutive failures since the last success.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Records a failure and returns how long to wait before retrying.
    pub fn on_failure(&mut self) -> Duration {
        let wait = self.current();
        self.failures = self.failures.saturating_add(1);
        wait
    }

    /// Records a successful connect.
    pub fn on_success(&mut self) {
        self.failures = 0;
    }
}

/// Where the feed connection currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not running; no reconnect pending.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// The socket is open.
    Connected,
    /// Waiting this long before the next attempt.
    Backoff(Duration),
}

impl ConnectionState {
    /// True only while the socket is open.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// The connection state machine together with its backoff policy.
#[derive(Debug, Clone)]
pub struct LinkMachine {
    state: ConnectionState,
    backoff: Backoff,
}

impl LinkMachine {
    /// Starts in `Disconnected`.
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Backoff policy and failure count.
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// `Disconnected -> Connecting`.
    pub fn start(&mut self) -> ConnectionState {
        if self.state == ConnectionState::Disconnected {
            self.state = ConnectionState::Connecting;
        }
        self.state
    }

    /// `Connecting -> Connected`; resets the delay.
    pub fn connect_succeeded(&mut self) -> ConnectionState {
        if self.state == ConnectionState::Connecting {
            self.backoff.on_success();
            self.state = ConnectionState::Connected;
        }
        self.state
    }

    /// `Connecting | Connected -> Backoff(delay)`.
    ///
    /// Returns the delay to wait, or `None` when the machine was not trying to
    /// be connected (stopped, or already backing off).
    pub fn connection_lost(&mut self) -> Option<Duration> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                let delay = self.backoff.on_failure();
                self.state = ConnectionState::Backoff(delay);
                Some(delay)
            }
            _ => None,
        }
    }

    /// `Backoff -> Connecting`.
    pub fn retry_due(&mut self) -> ConnectionState {
        if let ConnectionState::Backoff(_) = self.state {
            self.state = ConnectionState::Connecting;
        }
        self.state
    }

    /// Any state `-> Disconnected`.
    pub fn stop(&mut self) -> ConnectionState {
        self.state = ConnectionState::Disconnected;
        self.state
    }
}
