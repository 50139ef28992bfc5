use super::{PowerState, PowerTracker, RX_POLL_INTERVAL, Transport, bus_op};
use crate::config::{DeviceConfig, InterfaceConfig};
use crate::constants::*;
use crate::error::{AtcaError, FramingError, TransportError};
use std::time::Duration;
use tracing::{debug, warn};

/// Single-wire access supplied by the platform.
///
/// `send` transmits bytes over the wire; `receive` collects whatever the
/// device transmits back, returning how many bytes arrived (zero when the
/// device stays silent).
#[allow(async_fn_in_trait)]
pub trait SwiBus {
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    async fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, TransportError>;

    async fn hold_low(&mut self, duration: Duration) -> Result<(), TransportError>;
}

pub struct SwiTransport<B: SwiBus> {
    bus: B,
    wake_delay: Duration,
    rx_retries: u8,
    power: PowerTracker,
}

impl<B: SwiBus> SwiTransport<B> {
    pub fn new(config: &DeviceConfig, bus: B) -> Result<Self, AtcaError> {
        config.validate()?;
        if !matches!(config.interface, InterfaceConfig::Swi { .. }) {
            return Err(AtcaError::BadParameter(
                "single-wire transport needs a single-wire interface configuration".to_string(),
            ));
        }

        Ok(Self {
            bus,
            wake_delay: config.wake_delay(),
            rx_retries: config.rx_retries,
            power: PowerTracker::new(config.device_type.watchdog_period()),
        })
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    async fn send_flag(&mut self, flag: u8) -> Result<(), AtcaError> {
        bus_op(self.bus.send(&[flag])).await
    }

    /// Ask the device to transmit, retrying while it stays silent.
    async fn transmit(&mut self, buffer: &mut [u8]) -> Result<usize, AtcaError> {
        let mut attempts = 0;
        loop {
            self.send_flag(SWI_FLAG_TX).await?;
            let received = bus_op(self.bus.receive(buffer)).await?;
            if received > 0 {
                return Ok(received);
            }
            if attempts >= self.rx_retries {
                return Err(TransportError::Nack.into());
            }
            attempts += 1;
            tokio::time::sleep(RX_POLL_INTERVAL).await;
        }
    }
}

impl<B: SwiBus> Transport for SwiTransport<B> {
    async fn wake(&mut self) -> Result<(), AtcaError> {
        if self.power.state() == PowerState::Awake {
            return Ok(());
        }

        bus_op(self.bus.hold_low(Duration::from_micros(WAKE_LOW_US))).await?;
        tokio::time::sleep(self.wake_delay).await;

        let mut token = [0u8; 4];
        let received = match self.transmit(&mut token).await {
            Ok(n) => n,
            Err(e) => {
                self.power.set(PowerState::Unknown);
                return Err(e);
            }
        };
        if received != token.len() || token != WAKE_TOKEN {
            warn!("Unexpected wake token {}", hex::encode(&token[..received]));
            self.power.set(PowerState::Unknown);
            return Err(TransportError::WakeFailed(token).into());
        }

        debug!("Single-wire device awake");
        self.power.set(PowerState::Awake);
        Ok(())
    }

    async fn idle(&mut self) -> Result<(), AtcaError> {
        if matches!(self.power.state(), PowerState::Idle | PowerState::Asleep) {
            return Ok(());
        }
        self.send_flag(SWI_FLAG_IDLE).await?;
        self.power.set(PowerState::Idle);
        Ok(())
    }

    async fn sleep(&mut self) -> Result<(), AtcaError> {
        if self.power.state() == PowerState::Asleep {
            return Ok(());
        }
        // Flags are not acknowledged on the single wire, so a sleeping
        // device simply ignores this one.
        self.send_flag(SWI_FLAG_SLEEP).await?;
        self.power.set(PowerState::Asleep);
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), AtcaError> {
        let mut message = Vec::with_capacity(frame.len() + 1);
        message.push(SWI_FLAG_CMD);
        message.extend_from_slice(frame);

        bus_op(self.bus.send(&message)).await?;
        debug!("Sent {} bytes: {}", frame.len(), hex::encode(frame));
        Ok(())
    }

    async fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, AtcaError> {
        if buffer.len() < RSP_SIZE_MIN {
            return Err(AtcaError::BadParameter("receive buffer too small".to_string()));
        }

        let received = self.transmit(buffer).await?;
        let count = buffer[0] as usize;
        if count > buffer.len() {
            return Err(FramingError::TooLong {
                max: buffer.len(),
                actual: count,
            }
            .into());
        }
        if count != received {
            return Err(TransportError::ShortTransfer {
                expected: count,
                actual: received,
            }
            .into());
        }
        if count < RSP_SIZE_MIN {
            return Err(FramingError::TooShort {
                expected: RSP_SIZE_MIN,
                actual: count,
            }
            .into());
        }

        debug!("Received {} bytes: {}", count, hex::encode(&buffer[..count]));
        Ok(count)
    }

    fn desynchronize(&mut self) {
        self.power.set(PowerState::Unknown);
    }

    fn power_state(&self) -> PowerState {
        self.power.state()
    }
}
