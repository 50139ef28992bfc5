use super::{PowerState, PowerTracker, RX_POLL_INTERVAL, Transport, bus_op};
use crate::config::{DeviceConfig, InterfaceConfig};
use crate::constants::*;
use crate::error::{AtcaError, FramingError, TransportError};
use std::time::Duration;
use tracing::{debug, warn};

/// Raw I2C access supplied by the platform.
///
/// Addresses are 7-bit. A device that does not acknowledge its address
/// (asleep, or busy executing a command) reports [`TransportError::Nack`].
#[allow(async_fn_in_trait)]
pub trait I2cBus {
    async fn write(&mut self, address: u8, data: &[u8]) -> Result<(), TransportError>;

    async fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<(), TransportError>;

    /// Hold SDA low for `duration`, the wake condition.
    async fn hold_sda_low(&mut self, duration: Duration) -> Result<(), TransportError>;
}

pub struct I2cTransport<B: I2cBus> {
    bus: B,
    address: u8,
    wake_delay: Duration,
    rx_retries: u8,
    power: PowerTracker,
}

impl<B: I2cBus> I2cTransport<B> {
    /// Create a transport for the device described by `config`.
    ///
    /// # Arguments
    /// * `config` - Must describe an I2C-attached device
    /// * `bus` - Platform bus the device sits on
    pub fn new(config: &DeviceConfig, bus: B) -> Result<Self, AtcaError> {
        config.validate()?;
        let InterfaceConfig::I2c { address, .. } = config.interface else {
            return Err(AtcaError::BadParameter(
                "I2C transport needs an I2C interface configuration".to_string(),
            ));
        };

        Ok(Self {
            bus,
            address: address >> 1,
            wake_delay: config.wake_delay(),
            rx_retries: config.rx_retries,
            power: PowerTracker::new(config.device_type.watchdog_period()),
        })
    }

    /// 7-bit address the transport talks to.
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    async fn write_word_address(&mut self, word_address: u8) -> Result<(), AtcaError> {
        bus_op(self.bus.write(self.address, &[word_address])).await
    }

    /// Read into `buffer`, retrying while the device NACKs.
    async fn read_polling(&mut self, buffer: &mut [u8]) -> Result<(), AtcaError> {
        let mut attempts = 0;
        loop {
            match bus_op(self.bus.read(self.address, buffer)).await {
                Err(AtcaError::Transport(TransportError::Nack)) if attempts < self.rx_retries => {
                    attempts += 1;
                    tokio::time::sleep(RX_POLL_INTERVAL).await;
                }
                other => return other,
            }
        }
    }
}

impl<B: I2cBus> Transport for I2cTransport<B> {
    async fn wake(&mut self) -> Result<(), AtcaError> {
        let state = self.power.state();
        if state == PowerState::Awake {
            return Ok(());
        }
        // A device we lost track of may still be awake and ignore the pulse
        if state == PowerState::Unknown {
            if let Err(e) = self.write_word_address(I2C_WORD_IDLE).await {
                debug!("Idle before wake not acknowledged ({}), device not awake", e);
            }
        }

        bus_op(self.bus.hold_sda_low(Duration::from_micros(WAKE_LOW_US))).await?;
        tokio::time::sleep(self.wake_delay).await;

        let mut token = [0u8; 4];
        if let Err(e) = bus_op(self.bus.read(self.address, &mut token)).await {
            self.power.set(PowerState::Unknown);
            return Err(e);
        }
        if token != WAKE_TOKEN {
            warn!("Unexpected wake token {}", hex::encode(token));
            self.power.set(PowerState::Unknown);
            return Err(TransportError::WakeFailed(token).into());
        }

        debug!("Device at {:#04x} awake", self.address);
        self.power.set(PowerState::Awake);
        Ok(())
    }

    async fn idle(&mut self) -> Result<(), AtcaError> {
        let state = self.power.state();
        if matches!(state, PowerState::Idle | PowerState::Asleep) {
            return Ok(());
        }
        match self.write_word_address(I2C_WORD_IDLE).await {
            Ok(()) => {}
            Err(AtcaError::Transport(TransportError::Nack)) if state == PowerState::Unknown => {
                debug!("Device at {:#04x} did not answer idle, assuming asleep", self.address);
                self.power.set(PowerState::Asleep);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        debug!("Device at {:#04x} idle", self.address);
        self.power.set(PowerState::Idle);
        Ok(())
    }

    async fn sleep(&mut self) -> Result<(), AtcaError> {
        let state = self.power.state();
        if state == PowerState::Asleep {
            return Ok(());
        }
        match self.write_word_address(I2C_WORD_SLEEP).await {
            Ok(()) => {}
            // An unknown device that ignores us is already asleep
            Err(AtcaError::Transport(TransportError::Nack)) if state == PowerState::Unknown => {
                debug!("Device at {:#04x} did not answer sleep, assuming asleep", self.address);
            }
            Err(e) => return Err(e),
        }
        debug!("Device at {:#04x} asleep", self.address);
        self.power.set(PowerState::Asleep);
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), AtcaError> {
        let mut message = Vec::with_capacity(frame.len() + 1);
        message.push(I2C_WORD_COMMAND);
        message.extend_from_slice(frame);

        bus_op(self.bus.write(self.address, &message)).await?;
        debug!("Sent {} bytes: {}", frame.len(), hex::encode(frame));
        Ok(())
    }

    async fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, AtcaError> {
        if buffer.len() < RSP_SIZE_MIN {
            return Err(AtcaError::BadParameter("receive buffer too small".to_string()));
        }

        self.read_polling(&mut buffer[..1]).await?;
        let count = buffer[0] as usize;
        if count < RSP_SIZE_MIN {
            return Err(FramingError::TooShort {
                expected: RSP_SIZE_MIN,
                actual: count,
            }
            .into());
        }
        if count > buffer.len() {
            return Err(FramingError::TooLong {
                max: buffer.len(),
                actual: count,
            }
            .into());
        }

        bus_op(self.bus.read(self.address, &mut buffer[1..count])).await?;
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
