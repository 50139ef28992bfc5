use crate::config::DeviceType;
use crate::constants::*;
use crate::error::AtcaError;
use crate::packet::Packet;
use crate::zone::{LockZone, Zone, ZoneParam};
use bytes::{BufMut, Bytes, BytesMut};
use modular_bitfield::prelude::*;
use num_enum::{FromPrimitive, IntoPrimitive};
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Pause = 0x01,
    Read = 0x02,
    Mac = 0x08,
    Hmac = 0x11,
    Write = 0x12,
    GenDig = 0x15,
    Nonce = 0x16,
    Lock = 0x17,
    Random = 0x1B,
    DeriveKey = 0x1C,
    UpdateExtra = 0x20,
    Counter = 0x24,
    CheckMac = 0x28,
    Info = 0x30,
    GenKey = 0x40,
    Sign = 0x41,
    Ecdh = 0x43,
    Verify = 0x45,
    PrivWrite = 0x46,
    Sha = 0x47,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Mode byte shared by MAC, HMAC and (bit 5 only) CheckMac.
#[bitfield(bits = 8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacMode {
    /// Second 32-byte block comes from TempKey instead of the challenge
    pub block2_tempkey: bool,
    /// First 32-byte block comes from TempKey instead of the slot key
    pub block1_tempkey: bool,
    /// TempKey source flag must be "input" (pass-through nonce) when set
    pub source_flag_match: bool,
    #[skip]
    unused: bool,
    pub include_otp_88: bool,
    pub include_otp_64: bool,
    pub include_sn: bool,
    #[skip]
    unused_high: bool,
}

impl MacMode {
    const MASK: u8 = 0x77;

    pub fn from_byte(mode: u8) -> Self {
        MacMode::from_bytes([mode])
    }

    pub fn to_byte(self) -> u8 {
        self.into_bytes()[0]
    }

    pub fn uses_tempkey(&self) -> bool {
        self.block1_tempkey() || self.block2_tempkey()
    }
}

pub const CHECKMAC_MODE_MASK: u8 = 0x27;
pub const CHECKMAC_MODE_BLOCK2_TEMPKEY: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum NonceMode {
    /// Mix 20 bytes with fresh device randomness, updating the RNG seed
    SeedUpdate,
    /// Mix 20 bytes with device randomness, leaving the seed alone
    NoSeedUpdate,
    /// Load 32 caller bytes straight into TempKey
    PassThrough,
}

impl NonceMode {
    pub fn to_byte(self) -> u8 {
        match self {
            NonceMode::SeedUpdate => 0x00,
            NonceMode::NoSeedUpdate => 0x01,
            NonceMode::PassThrough => 0x03,
        }
    }

    pub fn num_in_size(self) -> usize {
        match self {
            NonceMode::PassThrough => NONCE_NUMIN_SIZE_PASSTHROUGH,
            _ => NONCE_NUMIN_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterMode {
    Read = 0x00,
    Increment = 0x01,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaMode {
    Start,
    Update,
    End,
}

impl ShaMode {
    pub fn to_byte(self) -> u8 {
        match self {
            ShaMode::Start => 0x00,
            ShaMode::Update => 0x01,
            ShaMode::End => 0x02,
        }
    }
}

pub const GENKEY_MODE_PUBLIC: u8 = 0x00;
pub const GENKEY_MODE_PRIVATE: u8 = 0x04;
pub const GENKEY_MODE_DIGEST: u8 = 0x08;
pub const GENKEY_MODE_PUBKEY_DIGEST: u8 = 0x10;

pub const SIGN_MODE_INTERNAL: u8 = 0x00;
pub const SIGN_MODE_INCLUDE_SN: u8 = 0x40;
pub const SIGN_MODE_EXTERNAL: u8 = 0x80;

pub const INFO_MODE_REVISION: u8 = 0x00;
pub const INFO_MODE_KEY_VALID: u8 = 0x01;
pub const INFO_MODE_STATE: u8 = 0x02;

pub const ECDH_PREFIX_MODE: u8 = 0x00;

pub const LOCK_MODE_NO_CRC: u8 = 0x80;

pub const UPDATE_EXTRA_MODE_USER_EXTRA: u8 = 0x00;
pub const UPDATE_EXTRA_MODE_SELECTOR: u8 = 0x01;
pub const UPDATE_EXTRA_MODE_DECREMENT: u8 = 0x02;

pub const DERIVE_KEY_RANDOM_FLAG: u8 = 0x04;

pub const PRIVWRITE_MODE_ENCRYPT: u8 = 0x40;

/// Key type carried in param2 of Verify for P-256 keys
pub const VERIFY_KEY_P256: u16 = 0x0004;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum VerifyMode {
    /// Verify against a public key stored in a slot
    Stored,
    /// Verify against a public key passed with the command
    External,
}

impl VerifyMode {
    pub fn to_byte(self) -> u8 {
        match self {
            VerifyMode::Stored => 0x00,
            VerifyMode::External => 0x02,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckMacParams {
    pub mode: u8,
    pub key_id: u16,
    pub challenge: [u8; 32],
    pub response: [u8; 32],
    pub other_data: [u8; CHECKMAC_OTHER_DATA_SIZE],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterParams {
    pub mode: CounterMode,
    pub counter_id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeriveKeyParams {
    pub mode: u8,
    pub target_key: u16,
    pub mac: Option<[u8; 32]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcdhParams {
    pub key_id: u16,
    pub public_key: [u8; PUBLIC_KEY_SIZE],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenDigParams {
    pub zone: Zone,
    pub key_id: u16,
    /// 4 or 32 bytes for shared-nonce and key-config digests
    pub other_data: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenKeyParams {
    pub mode: u8,
    pub key_id: u16,
    pub other_data: Option<[u8; GENKEY_OTHER_DATA_SIZE]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HmacParams {
    pub mode: u8,
    pub key_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoParams {
    pub mode: u8,
    pub param: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockParams {
    pub zone: LockZone,
    /// CRC over the zone contents; `None` locks without checking it
    pub summary_crc: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacParams {
    pub mode: MacMode,
    pub key_id: u16,
    /// Required unless the mode takes block 2 from TempKey
    pub challenge: Option<[u8; 32]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceParams {
    pub mode: NonceMode,
    pub num_in: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseParams {
    pub selector: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivWriteParams {
    pub encrypted: bool,
    pub key_id: u16,
    pub value: [u8; PRIVWRITE_VALUE_SIZE],
    pub mac: [u8; 32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomParams {
    pub update_seed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadParams {
    pub zone: Zone,
    pub address: u16,
    pub block_access: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaParams {
    pub mode: ShaMode,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignParams {
    pub mode: u8,
    pub key_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateExtraParams {
    pub mode: u8,
    pub value: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyParams {
    pub mode: VerifyMode,
    /// Slot holding the public key, or the key type for external verification
    pub key_id: u16,
    pub signature: [u8; SIGNATURE_SIZE],
    pub public_key: Option<[u8; PUBLIC_KEY_SIZE]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteParams {
    pub zone: Zone,
    pub address: u16,
    /// 4 or 32 bytes; encrypted writes carry ciphertext
    pub value: Bytes,
    /// Input MAC, present only for encrypted writes
    pub mac: Option<[u8; 32]>,
}

/// Every command the device understands, each with its own parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CheckMac(CheckMacParams),
    Counter(CounterParams),
    DeriveKey(DeriveKeyParams),
    Ecdh(EcdhParams),
    GenDig(GenDigParams),
    GenKey(GenKeyParams),
    Hmac(HmacParams),
    Info(InfoParams),
    Lock(LockParams),
    Mac(MacParams),
    Nonce(NonceParams),
    Pause(PauseParams),
    PrivWrite(PrivWriteParams),
    Random(RandomParams),
    Read(ReadParams),
    Sha(ShaParams),
    Sign(SignParams),
    UpdateExtra(UpdateExtraParams),
    Verify(VerifyParams),
    Write(WriteParams),
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::CheckMac(_) => Opcode::CheckMac,
            Command::Counter(_) => Opcode::Counter,
            Command::DeriveKey(_) => Opcode::DeriveKey,
            Command::Ecdh(_) => Opcode::Ecdh,
            Command::GenDig(_) => Opcode::GenDig,
            Command::GenKey(_) => Opcode::GenKey,
            Command::Hmac(_) => Opcode::Hmac,
            Command::Info(_) => Opcode::Info,
            Command::Lock(_) => Opcode::Lock,
            Command::Mac(_) => Opcode::Mac,
            Command::Nonce(_) => Opcode::Nonce,
            Command::Pause(_) => Opcode::Pause,
            Command::PrivWrite(_) => Opcode::PrivWrite,
            Command::Random(_) => Opcode::Random,
            Command::Read(_) => Opcode::Read,
            Command::Sha(_) => Opcode::Sha,
            Command::Sign(_) => Opcode::Sign,
            Command::UpdateExtra(_) => Opcode::UpdateExtra,
            Command::Verify(_) => Opcode::Verify,
            Command::Write(_) => Opcode::Write,
        }
    }
}

fn bad_param(message: impl Into<String>) -> AtcaError {
    AtcaError::BadParameter(message.into())
}

fn check_slot(key_id: u16) -> Result<(), AtcaError> {
    if key_id >= SLOT_COUNT {
        return Err(bad_param(format!("key id {} out of range", key_id)));
    }
    Ok(())
}

/// Turns [`Command`]s into wire-ready [`Packet`]s for one device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBuilder {
    device_type: DeviceType,
}

impl CommandBuilder {
    pub fn new(device_type: DeviceType) -> Self {
        Self { device_type }
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// Validate `command` and lay it out as a packet with its sizes and
    /// execution time filled in.
    pub fn build(&self, command: &Command) -> Result<Packet, AtcaError> {
        let opcode = command.opcode();
        let execution_time = self
            .device_type
            .execution_time(opcode)
            .ok_or(AtcaError::UnsupportedOpcode {
                opcode,
                device_type: self.device_type,
            })?;

        let (param1, param2, payload, rx_size) = match command {
            Command::CheckMac(p) => build_check_mac(p)?,
            Command::Counter(p) => {
                if p.counter_id > 1 {
                    return Err(bad_param(format!("counter id {} out of range", p.counter_id)));
                }
                (p.mode as u8, p.counter_id, Bytes::new(), RSP_SIZE_4)
            }
            Command::DeriveKey(p) => {
                if p.mode & !DERIVE_KEY_RANDOM_FLAG != 0 {
                    return Err(bad_param(format!("DeriveKey mode {:#04x} invalid", p.mode)));
                }
                check_slot(p.target_key)?;
                let payload = p.mac.map(|mac| Bytes::copy_from_slice(&mac)).unwrap_or_default();
                (p.mode, p.target_key, payload, RSP_SIZE_MIN)
            }
            Command::Ecdh(p) => {
                check_slot(p.key_id)?;
                (ECDH_PREFIX_MODE, p.key_id, Bytes::copy_from_slice(&p.public_key), RSP_SIZE_32)
            }
            Command::GenDig(p) => build_gen_dig(p)?,
            Command::GenKey(p) => build_gen_key(p)?,
            Command::Hmac(p) => {
                check_slot(p.key_id)?;
                let mode = MacMode::from_byte(p.mode);
                if mode.block1_tempkey() || mode.block2_tempkey() {
                    return Err(bad_param("HMAC mode may only select source flag, OTP and SN bits"));
                }
                (p.mode, p.key_id, Bytes::new(), RSP_SIZE_32)
            }
            Command::Info(p) => {
                if p.mode > INFO_MODE_STATE {
                    return Err(bad_param(format!("Info mode {:#04x} invalid", p.mode)));
                }
                (p.mode, p.param, Bytes::new(), RSP_SIZE_4)
            }
            Command::Lock(p) => {
                let (mode, crc) = match p.summary_crc {
                    Some(crc) => (p.zone.lock_mode(), crc),
                    None => (p.zone.lock_mode() | LOCK_MODE_NO_CRC, 0),
                };
                (mode, crc, Bytes::new(), RSP_SIZE_MIN)
            }
            Command::Mac(p) => build_mac(p)?,
            Command::Nonce(p) => build_nonce(p)?,
            Command::Pause(p) => (p.selector, 0, Bytes::new(), RSP_SIZE_MIN),
            Command::PrivWrite(p) => {
                check_slot(p.key_id)?;
                let mode = if p.encrypted { PRIVWRITE_MODE_ENCRYPT } else { 0 };
                let mut payload = BytesMut::with_capacity(PRIVWRITE_VALUE_SIZE + 32);
                payload.put_slice(&p.value);
                payload.put_slice(&p.mac);
                (mode, p.key_id, payload.freeze(), RSP_SIZE_MIN)
            }
            Command::Random(p) => {
                let mode = if p.update_seed { 0x00 } else { 0x01 };
                (mode, 0, Bytes::new(), RSP_SIZE_32)
            }
            Command::Read(p) => {
                let param1 = ZoneParam::for_access(p.zone, p.block_access, false).to_byte();
                let rx_size = if p.block_access { RSP_SIZE_32 } else { RSP_SIZE_4 };
                (param1, p.address, Bytes::new(), rx_size)
            }
            Command::Sha(p) => build_sha(p)?,
            Command::Sign(p) => {
                check_slot(p.key_id)?;
                (p.mode, p.key_id, Bytes::new(), RSP_SIZE_64)
            }
            Command::UpdateExtra(p) => {
                if p.mode > UPDATE_EXTRA_MODE_DECREMENT {
                    return Err(bad_param(format!("UpdateExtra mode {:#04x} invalid", p.mode)));
                }
                (p.mode, p.value, Bytes::new(), RSP_SIZE_MIN)
            }
            Command::Verify(p) => build_verify(p)?,
            Command::Write(p) => build_write(p)?,
        };

        let mut packet = Packet::new(opcode, param1, param2, payload);
        packet.rx_size = rx_size;
        packet.execution_time = execution_time;
        Ok(packet)
    }
}

type Layout = (u8, u16, Bytes, usize);

fn build_check_mac(p: &CheckMacParams) -> Result<Layout, AtcaError> {
    if p.mode & !CHECKMAC_MODE_MASK != 0 {
        return Err(bad_param(format!("CheckMac mode {:#04x} invalid", p.mode)));
    }
    check_slot(p.key_id)?;
    let mut payload = BytesMut::with_capacity(32 + 32 + CHECKMAC_OTHER_DATA_SIZE);
    payload.put_slice(&p.challenge);
    payload.put_slice(&p.response);
    payload.put_slice(&p.other_data);
    Ok((p.mode, p.key_id, payload.freeze(), RSP_SIZE_MIN))
}

fn build_gen_dig(p: &GenDigParams) -> Result<Layout, AtcaError> {
    let payload = p.other_data.clone().unwrap_or_default();
    if !matches!(payload.len(), 0 | WORD_SIZE | BLOCK_SIZE) {
        return Err(bad_param(format!("GenDig other data must be 0, 4 or 32 bytes, got {}", payload.len())));
    }
    if p.zone == Zone::Data {
        check_slot(p.key_id)?;
    }
    Ok((p.zone.into(), p.key_id, payload, RSP_SIZE_MIN))
}

fn build_gen_key(p: &GenKeyParams) -> Result<Layout, AtcaError> {
    check_slot(p.key_id)?;
    // Only the public-key digest mode sends OtherData, and it answers with a bare status
    let pubkey_digest = p.mode & GENKEY_MODE_PUBKEY_DIGEST != 0;
    let payload = match (&p.other_data, pubkey_digest) {
        (Some(other), true) => Bytes::copy_from_slice(other),
        (None, true) => return Err(bad_param("GenKey public key digest mode needs 3 bytes of other data")),
        (Some(_), false) => return Err(bad_param("GenKey other data is only used in public key digest mode")),
        (None, false) => Bytes::new(),
    };
    let rx_size = if pubkey_digest { RSP_SIZE_MIN } else { RSP_SIZE_64 };
    Ok((p.mode, p.key_id, payload, rx_size))
}

fn build_mac(p: &MacParams) -> Result<Layout, AtcaError> {
    let mode = p.mode.to_byte();
    if mode & !MacMode::MASK != 0 {
        return Err(bad_param(format!("MAC mode {:#04x} invalid", mode)));
    }
    if !p.mode.block1_tempkey() {
        check_slot(p.key_id)?;
    }
    let payload = match (p.mode.block2_tempkey(), &p.challenge) {
        (false, Some(challenge)) => Bytes::copy_from_slice(challenge),
        (false, None) => return Err(bad_param("MAC needs a challenge unless TempKey supplies block 2")),
        (true, _) => Bytes::new(),
    };
    Ok((mode, p.key_id, payload, RSP_SIZE_32))
}

fn build_nonce(p: &NonceParams) -> Result<Layout, AtcaError> {
    let expected = p.mode.num_in_size();
    if p.num_in.len() != expected {
        return Err(bad_param(format!(
            "Nonce {} mode takes {} input bytes, got {}",
            p.mode,
            expected,
            p.num_in.len()
        )));
    }
    let rx_size = match p.mode {
        NonceMode::PassThrough => RSP_SIZE_MIN,
        _ => RSP_SIZE_32,
    };
    Ok((p.mode.to_byte(), 0, p.num_in.clone(), rx_size))
}

fn build_sha(p: &ShaParams) -> Result<Layout, AtcaError> {
    let len = p.data.len();
    let rx_size = match p.mode {
        ShaMode::Start if len == 0 => RSP_SIZE_MIN,
        ShaMode::Update if len == SHA_BLOCK_SIZE => RSP_SIZE_MIN,
        ShaMode::End if len < SHA_BLOCK_SIZE => RSP_SIZE_32,
        _ => return Err(bad_param(format!("SHA {:?} cannot take {} bytes", p.mode, len))),
    };
    Ok((p.mode.to_byte(), len as u16, p.data.clone(), rx_size))
}

fn build_verify(p: &VerifyParams) -> Result<Layout, AtcaError> {
    let mut payload = BytesMut::with_capacity(SIGNATURE_SIZE + PUBLIC_KEY_SIZE);
    payload.put_slice(&p.signature);
    match (p.mode, &p.public_key) {
        (VerifyMode::External, Some(public_key)) => payload.put_slice(public_key),
        (VerifyMode::External, None) => return Err(bad_param("external Verify needs a public key")),
        (VerifyMode::Stored, Some(_)) => return Err(bad_param("stored-key Verify takes no public key")),
        (VerifyMode::Stored, None) => check_slot(p.key_id)?,
    }
    Ok((p.mode.to_byte(), p.key_id, payload.freeze(), RSP_SIZE_MIN))
}

fn build_write(p: &WriteParams) -> Result<Layout, AtcaError> {
    let block_access = match p.value.len() {
        WORD_SIZE => false,
        BLOCK_SIZE => true,
        n => return Err(bad_param(format!("Write value must be 4 or 32 bytes, got {}", n))),
    };
    if p.mac.is_some() && !block_access {
        return Err(bad_param("encrypted Write needs a 32-byte value"));
    }
    let param1 = ZoneParam::for_access(p.zone, block_access, p.mac.is_some()).to_byte();
    let mut payload = BytesMut::with_capacity(p.value.len() + 32);
    payload.put_slice(&p.value);
    if let Some(mac) = &p.mac {
        payload.put_slice(mac);
    }
    Ok((param1, p.address, payload.freeze(), RSP_SIZE_MIN))
}
