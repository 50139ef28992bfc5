//! Moving frames to and from the device, and keeping track of its power state.

use crate::error::{AtcaError, TransportError};
use std::future::Future;
use std::time::Duration;
use strum_macros::Display;
use tokio::time::{Instant, timeout};

pub mod i2c;
pub mod swi;

pub use i2c::{I2cBus, I2cTransport};
pub use swi::{SwiBus, SwiTransport};

// Upper bound for any single bus operation
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

// Pause between polls while the device NACKs because it is still executing
const RX_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A half-duplex link to one device.
///
/// Implementations keep track of the device's power state so that `wake`
/// on an awake device and `sleep` on a sleeping one cost nothing.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Wake the device and check its wake token.
    async fn wake(&mut self) -> Result<(), AtcaError>;

    /// Put the device into idle: TempKey and the RNG seed are kept.
    async fn idle(&mut self) -> Result<(), AtcaError>;

    /// Put the device to sleep: all volatile state is lost.
    async fn sleep(&mut self) -> Result<(), AtcaError>;

    /// Send a complete command frame.
    async fn send(&mut self, frame: &[u8]) -> Result<(), AtcaError>;

    /// Read one response frame into `buffer`, returning its length.
    async fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, AtcaError>;

    /// Forget what we know about the device's state; the next `wake` pulses the line.
    fn desynchronize(&mut self);

    fn power_state(&self) -> PowerState;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PowerState {
    Unknown,
    Awake,
    Idle,
    Asleep,
}

/// Power state as last driven by the host, aged by the device watchdog.
#[derive(Debug, Clone)]
pub struct PowerTracker {
    state: PowerState,
    awake_since: Option<Instant>,
    watchdog: Duration,
}

impl PowerTracker {
    pub fn new(watchdog: Duration) -> Self {
        Self {
            state: PowerState::Unknown,
            awake_since: None,
            watchdog,
        }
    }

    /// Current state; an awake device whose watchdog has run out is asleep.
    pub fn state(&self) -> PowerState {
        match (self.state, self.awake_since) {
            (PowerState::Awake, Some(since)) if since.elapsed() >= self.watchdog => PowerState::Asleep,
            (state, _) => state,
        }
    }

    pub fn set(&mut self, state: PowerState) {
        self.awake_since = match state {
            PowerState::Awake => Some(Instant::now()),
            _ => None,
        };
        self.state = state;
    }
}

/// Run one bus operation under the default timeout.
pub(crate) async fn bus_op<T, F>(operation: F) -> Result<T, AtcaError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    Ok(timeout(DEFAULT_TIMEOUT, operation).await??)
}
