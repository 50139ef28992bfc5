// Protocol constants for the ATSHA204A / ATECCx08A command set

/// Bytes in a command frame besides the payload: count, opcode, param1, param2 (2), CRC (2)
pub const CMD_OVERHEAD: usize = 7;

/// Size of the fixed command header (count, opcode, param1, param2)
pub const CMD_HEADER_SIZE: usize = 5;

/// Size of the trailing CRC in every frame
pub const CRC_SIZE: usize = 2;

/// Largest payload any command carries (Verify with external public key)
pub const MAX_PAYLOAD_SIZE: usize = 130;

/// Largest frame on the wire in either direction
pub const MAX_FRAME_SIZE: usize = CMD_OVERHEAD + MAX_PAYLOAD_SIZE;

/// Smallest response frame: count, one status byte, CRC
pub const RSP_SIZE_MIN: usize = 4;

/// Response carrying four data bytes (Read word, Info, Counter)
pub const RSP_SIZE_4: usize = 7;

/// Response carrying 32 data bytes
pub const RSP_SIZE_32: usize = 35;

/// Response carrying 64 data bytes (public key, signature)
pub const RSP_SIZE_64: usize = 67;

/// Index of the status byte in a 4-byte response
pub const RSP_STATUS_INDEX: usize = 1;

/// Response the device sends right after a successful wake
pub const WAKE_TOKEN: [u8; 4] = [0x04, 0x11, 0x33, 0x43];

pub const KEY_SIZE: usize = 32;
pub const BLOCK_SIZE: usize = 32;
pub const WORD_SIZE: usize = 4;
pub const SHA_BLOCK_SIZE: usize = 64;
pub const PUBLIC_KEY_SIZE: usize = 64;
pub const SIGNATURE_SIZE: usize = 64;
pub const NONCE_NUMIN_SIZE: usize = 20;
pub const NONCE_NUMIN_SIZE_PASSTHROUGH: usize = 32;
pub const CHECKMAC_OTHER_DATA_SIZE: usize = 13;
pub const GENKEY_OTHER_DATA_SIZE: usize = 3;
pub const PRIVWRITE_VALUE_SIZE: usize = 36;
pub const OTP_MAC_SIZE: usize = 11;
pub const SERIAL_NUMBER_SIZE: usize = 9;

/// Number of key slots in the data zone
pub const SLOT_COUNT: u16 = 16;

/// Highest key id GenDig accepts as a data-zone slot
pub const GENDIG_MAX_SLOT: u16 = 15;

/// Config zone word address of the lock word (bytes 84..=87)
pub const LOCK_WORD_ADDRESS: u16 = 0x15;

/// Value of a lock byte once its zone has been locked
pub const LOCK_BYTE_LOCKED: u8 = 0x00;

/// Serial number bytes the device always mixes into its digests
pub const SN8: u8 = 0xEE;
pub const SN0: u8 = 0x01;
pub const SN1: u8 = 0x23;

// I2C word addresses
pub const I2C_WORD_RESET: u8 = 0x00;
pub const I2C_WORD_SLEEP: u8 = 0x01;
pub const I2C_WORD_IDLE: u8 = 0x02;
pub const I2C_WORD_COMMAND: u8 = 0x03;

// Single-wire flags
pub const SWI_FLAG_CMD: u8 = 0x77;
pub const SWI_FLAG_TX: u8 = 0x88;
pub const SWI_FLAG_IDLE: u8 = 0xBB;
pub const SWI_FLAG_SLEEP: u8 = 0xCC;

/// Default 8-bit I2C address of a factory-fresh device
pub const DEFAULT_I2C_ADDRESS: u8 = 0xC0;

/// Minimum time the data line must be held low to wake the device (tWLO)
pub const WAKE_LOW_US: u64 = 60;

/// Wake delay (tWHI) for the ECC devices
pub const ECC_WAKE_DELAY_US: u32 = 1500;

/// Wake delay (tWHI) for the ATSHA204A
pub const SHA204A_WAKE_DELAY_US: u32 = 2560;

/// Watchdog period after which an awake ECC device falls asleep on its own
pub const ECC_WATCHDOG_MS: u64 = 1300;

/// Watchdog period of the ATSHA204A
pub const SHA204A_WATCHDOG_MS: u64 = 1700;

/// Default number of NACKed reads tolerated while a command is executing
pub const DEFAULT_RX_RETRIES: u8 = 20;

/// Default number of times a failed send is retried after a fresh wake
pub const DEFAULT_COMMAND_RETRIES: u8 = 2;
