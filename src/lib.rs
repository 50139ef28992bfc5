//! Command, transport and host-side crypto core for the ATSHA204A, ATECC108A
//! and ATECC508A secure elements.

pub mod command;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod host;
pub mod packet;
pub mod status;
pub mod timing;
pub mod transport;
pub mod zone;

pub use command::{Command, CommandBuilder, Opcode};
pub use config::{DeviceConfig, DeviceType, InterfaceConfig};
pub use device::{Device, Response};
pub use error::{AtcaError, FramingError, TransportError};
pub use packet::Packet;
pub use status::Status;
pub use transport::{I2cBus, SwiBus, Transport};
