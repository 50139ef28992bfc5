use num_enum::{FromPrimitive, IntoPrimitive};
use strum_macros::Display;

/// Status byte returned by the device in a 4-byte response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum Status {
    #[strum(to_string = "success")]
    Success = 0x00,
    #[strum(to_string = "CheckMac or Verify miscompare")]
    Miscompare = 0x01,
    #[strum(to_string = "parse error")]
    ParseError = 0x03,
    // Takes the unused implicit discriminant 0x04
    #[num_enum(catch_all)]
    #[strum(to_string = "unknown status")]
    Unknown(u8),
    #[strum(to_string = "ECC fault")]
    EccFault = 0x05,
    #[strum(to_string = "self test error")]
    SelfTestError = 0x07,
    #[strum(to_string = "health test error")]
    HealthTestError = 0x08,
    #[strum(to_string = "execution error")]
    ExecutionError = 0x0F,
    #[strum(to_string = "after wake")]
    AfterWake = 0x11,
    #[strum(to_string = "watchdog about to expire")]
    WatchdogAboutToExpire = 0xEE,
    #[strum(to_string = "CRC or communication error")]
    CommunicationError = 0xFF,
}

impl Status {
    pub fn is_success(&self) -> bool {
        *self == Status::Success
    }

    /// Advisory codes do not mean the command failed on its own merits; the
    /// command can be resent once the device's watchdog has been reset.
    pub fn is_advisory(&self) -> bool {
        matches!(self, Status::AfterWake | Status::WatchdogAboutToExpire)
    }
}
