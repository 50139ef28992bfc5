use crate::constants::*;
use crate::error::AtcaError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum DeviceType {
    #[strum(to_string = "ATSHA204A")]
    #[serde(rename = "ATSHA204A")]
    Sha204a,
    #[strum(to_string = "ATECC108A")]
    #[serde(rename = "ATECC108A")]
    Ecc108a,
    #[strum(to_string = "ATECC508A")]
    #[serde(rename = "ATECC508A")]
    Ecc508a,
}

/// How the device is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InterfaceConfig {
    I2c {
        /// 8-bit slave address, as printed in the datasheet (0xC0 by default)
        #[serde(default = "default_i2c_address")]
        address: u8,
        #[serde(default)]
        bus: u8,
        #[serde(default = "default_baud")]
        baud: u32,
    },
    Swi {
        #[serde(default)]
        bus: u8,
    },
}

fn default_i2c_address() -> u8 {
    DEFAULT_I2C_ADDRESS
}

fn default_baud() -> u32 {
    400_000
}

impl InterfaceConfig {
    pub fn i2c(address: u8) -> Self {
        InterfaceConfig::I2c {
            address,
            bus: 0,
            baud: default_baud(),
        }
    }

    pub fn swi() -> Self {
        InterfaceConfig::Swi { bus: 0 }
    }
}

/// Everything a device handle needs to know at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_type: DeviceType,
    pub interface: InterfaceConfig,
    /// tWHI in microseconds; defaults to the device type's value
    #[serde(default)]
    pub wake_delay_us: Option<u32>,
    #[serde(default = "default_rx_retries")]
    pub rx_retries: u8,
    #[serde(default = "default_command_retries")]
    pub command_retries: u8,
}

fn default_rx_retries() -> u8 {
    DEFAULT_RX_RETRIES
}

fn default_command_retries() -> u8 {
    DEFAULT_COMMAND_RETRIES
}

impl DeviceConfig {
    pub fn new(device_type: DeviceType, interface: InterfaceConfig) -> Self {
        Self {
            device_type,
            interface,
            wake_delay_us: None,
            rx_retries: DEFAULT_RX_RETRIES,
            command_retries: DEFAULT_COMMAND_RETRIES,
        }
    }

    /// Device on the default I2C address.
    pub fn i2c(device_type: DeviceType) -> Self {
        Self::new(device_type, InterfaceConfig::i2c(DEFAULT_I2C_ADDRESS))
    }

    pub fn swi(device_type: DeviceType) -> Self {
        Self::new(device_type, InterfaceConfig::swi())
    }

    pub fn from_json(json: &str) -> Result<Self, AtcaError> {
        let config: DeviceConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn wake_delay(&self) -> Duration {
        match self.wake_delay_us {
            Some(us) => Duration::from_micros(us as u64),
            None => self.device_type.default_wake_delay(),
        }
    }

    pub fn validate(&self) -> Result<(), AtcaError> {
        if let InterfaceConfig::I2c { address, baud, .. } = self.interface {
            if address & 0x01 != 0 {
                return Err(AtcaError::BadParameter(format!(
                    "I2C address {:#04x} must be the 8-bit write address",
                    address
                )));
            }
            if baud == 0 {
                return Err(AtcaError::BadParameter("I2C baud rate must be nonzero".to_string()));
            }
        }
        if self.wake_delay_us == Some(0) {
            return Err(AtcaError::BadParameter("wake delay must be nonzero".to_string()));
        }
        Ok(())
    }
}
