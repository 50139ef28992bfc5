//! Host-side mirror of the device's digest computations.
//!
//! Every function here reproduces, byte for byte, the SHA-256 message the
//! device builds internally, so the host can predict MACs, check responses
//! and decrypt data that the device encrypted under TempKey.

use crate::command::{MacMode, NonceMode, Opcode, PRIVWRITE_MODE_ENCRYPT};
use crate::constants::*;
use crate::error::AtcaError;
use crate::status::Status;
use crate::zone::Zone;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Host shadow of the device's TempKey register and its flags.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct TempKey {
    pub value: [u8; 32],
    /// Slot GenDig last used, meaningful while `gen_data` is set
    pub key_id: u8,
    /// `true` when TempKey came from caller input (pass-through nonce),
    /// `false` when the device's RNG contributed
    pub source_flag: bool,
    /// Set by GenDig over a data-zone slot
    pub gen_data: bool,
    pub check_flag: bool,
    pub valid: bool,
}

impl TempKey {
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Fail the way the device does when TempKey cannot be used.
    fn require_valid(&self) -> Result<(), AtcaError> {
        if !self.valid || self.check_flag {
            return Err(AtcaError::DeviceStatus(Status::ExecutionError));
        }
        Ok(())
    }
}

impl fmt::Debug for TempKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempKey")
            .field("value", &hex::encode(self.value))
            .field("key_id", &self.key_id)
            .field("source_flag", &self.source_flag)
            .field("gen_data", &self.gen_data)
            .field("check_flag", &self.check_flag)
            .field("valid", &self.valid)
            .finish()
    }
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn xor32(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

fn require<'a, T: ?Sized>(value: Option<&'a T>, what: &str) -> Result<&'a T, AtcaError> {
    value.ok_or_else(|| AtcaError::BadParameter(format!("{} is required by this mode", what)))
}

/// Compute TempKey the way Nonce leaves it on the device.
///
/// # Arguments
/// * `mode` - Nonce mode the command was sent with
/// * `num_in` - 20 bytes for the seed modes, 32 for pass-through
/// * `rand_out` - The 32 random bytes the device returned (seed modes only)
///
/// # Returns
/// The new TempKey, valid, with its source flag set per mode
pub fn nonce(mode: NonceMode, num_in: &[u8], rand_out: Option<&[u8; 32]>) -> Result<TempKey, AtcaError> {
    if num_in.len() != mode.num_in_size() {
        return Err(AtcaError::BadParameter(format!(
            "Nonce {} mode takes {} input bytes, got {}",
            mode,
            mode.num_in_size(),
            num_in.len()
        )));
    }

    let (value, source_flag) = match mode {
        NonceMode::SeedUpdate | NonceMode::NoSeedUpdate => {
            let rand_out = require(rand_out, "RandOut")?;
            let mut hasher = Sha256::new();
            hasher.update(rand_out);
            hasher.update(num_in);
            hasher.update([u8::from(Opcode::Nonce), mode.to_byte(), 0x00]);
            (hasher.finalize().into(), false)
        }
        NonceMode::PassThrough => {
            let mut value = [0u8; 32];
            value.copy_from_slice(num_in);
            (value, true)
        }
    };

    Ok(TempKey {
        value,
        key_id: 0,
        source_flag,
        gen_data: false,
        check_flag: false,
        valid: true,
    })
}

/// Fold a stored value into TempKey the way GenDig does.
///
/// # Arguments
/// * `zone` - Zone GenDig was run against
/// * `key_id` - Slot (data zone) or block index
/// * `stored_value` - The 32 bytes the device reads from that location
/// * `temp_key` - TempKey before GenDig, usually straight from [`nonce`]
pub fn gen_dig(zone: Zone, key_id: u16, stored_value: &[u8; 32], temp_key: &TempKey) -> Result<TempKey, AtcaError> {
    temp_key.require_valid()?;

    let mut hasher = Sha256::new();
    hasher.update(stored_value);
    hasher.update([u8::from(Opcode::GenDig), u8::from(zone)]);
    hasher.update(key_id.to_le_bytes());
    hasher.update([SN8, SN0, SN1]);
    hasher.update([0u8; 25]);
    hasher.update(temp_key.value);

    let gen_data = zone == Zone::Data && key_id <= GENDIG_MAX_SLOT;
    Ok(TempKey {
        value: hasher.finalize().into(),
        key_id: if gen_data { key_id as u8 } else { 0 },
        gen_data,
        valid: true,
        ..temp_key.clone()
    })
}

/// Inputs to [`mac`].
#[derive(Debug, Clone, Copy)]
pub struct MacInput<'a> {
    pub mode: MacMode,
    pub key_id: u16,
    /// Slot key, unless the mode takes block 1 from TempKey
    pub key: Option<&'a [u8; 32]>,
    /// Challenge, unless the mode takes block 2 from TempKey
    pub challenge: Option<&'a [u8; 32]>,
    /// OTP zone bytes 0..11, needed for the OTP modes
    pub otp: Option<&'a [u8; OTP_MAC_SIZE]>,
    /// Serial number, needed when the mode includes it
    pub sn: Option<&'a [u8; SERIAL_NUMBER_SIZE]>,
}

/// Check the TempKey flags for a MAC-family command, invalidating on failure.
fn check_tempkey_for_mac(mode: MacMode, temp_key: &mut TempKey) -> Result<(), AtcaError> {
    if let Err(e) = temp_key.require_valid() {
        temp_key.invalidate();
        return Err(e);
    }
    if mode.source_flag_match() != temp_key.source_flag {
        temp_key.invalidate();
        return Err(AtcaError::DeviceStatus(Status::ExecutionError));
    }
    Ok(())
}

/// The 24-byte tail shared by MAC and HMAC: opcode, mode, key id, OTP and SN fields.
fn mac_tail(
    opcode: Opcode,
    mode: MacMode,
    key_id: u16,
    otp: Option<&[u8; OTP_MAC_SIZE]>,
    sn: Option<&[u8; SERIAL_NUMBER_SIZE]>,
) -> Result<Vec<u8>, AtcaError> {
    let mut tail = Vec::with_capacity(24);
    tail.extend_from_slice(&[u8::from(opcode), mode.to_byte()]);
    tail.extend_from_slice(&key_id.to_le_bytes());

    if mode.include_otp_88() {
        tail.extend_from_slice(require(otp, "OTP")?);
    } else {
        if mode.include_otp_64() {
            tail.extend_from_slice(&require(otp, "OTP")?[..8]);
        } else {
            tail.extend_from_slice(&[0u8; 8]);
        }
        tail.extend_from_slice(&[0u8; 3]);
    }

    tail.push(SN8);
    if mode.include_sn() {
        let sn = require(sn, "serial number")?;
        tail.extend_from_slice(&sn[4..8]);
        tail.extend_from_slice(&[SN0, SN1]);
        tail.extend_from_slice(&sn[2..4]);
    } else {
        tail.extend_from_slice(&[0u8; 4]);
        tail.extend_from_slice(&[SN0, SN1]);
        tail.extend_from_slice(&[0u8; 2]);
    }
    Ok(tail)
}

/// Compute the digest MAC returns.
///
/// TempKey is invalidated afterwards, matching the device.
pub fn mac(input: &MacInput<'_>, temp_key: &mut TempKey) -> Result<[u8; 32], AtcaError> {
    let mode = input.mode;
    if mode.uses_tempkey() {
        check_tempkey_for_mac(mode, temp_key)?;
    }

    let block1 = if mode.block1_tempkey() {
        temp_key.value
    } else {
        *require(input.key, "slot key")?
    };
    let block2 = if mode.block2_tempkey() {
        temp_key.value
    } else {
        *require(input.challenge, "challenge")?
    };
    let tail = mac_tail(Opcode::Mac, mode, input.key_id, input.otp, input.sn)?;

    let mut hasher = Sha256::new();
    hasher.update(block1);
    hasher.update(block2);
    hasher.update(&tail);

    temp_key.invalidate();
    Ok(hasher.finalize().into())
}

/// The 13 bytes of "other data" CheckMac needs to re-create a MAC digest:
/// the originating opcode, its mode and key id, the rest zero.
pub fn check_mac_other_data(opcode: Opcode, mode: u8, key_id: u16) -> [u8; CHECKMAC_OTHER_DATA_SIZE] {
    let mut other = [0u8; CHECKMAC_OTHER_DATA_SIZE];
    other[0] = opcode.into();
    other[1] = mode;
    other[2..4].copy_from_slice(&key_id.to_le_bytes());
    other
}

/// Inputs to [`check_mac`].
#[derive(Debug, Clone, Copy)]
pub struct CheckMacInput<'a> {
    pub mode: u8,
    pub key: &'a [u8; 32],
    /// Client challenge, unless the mode takes block 2 from TempKey
    pub challenge: Option<&'a [u8; 32]>,
    pub other_data: &'a [u8; CHECKMAC_OTHER_DATA_SIZE],
    /// OTP bytes 0..8, used when mode bit 5 is set
    pub otp: Option<&'a [u8; 8]>,
}

/// Compute the response CheckMac will accept for the given inputs.
pub fn check_mac(input: &CheckMacInput<'_>, temp_key: &mut TempKey) -> Result<[u8; 32], AtcaError> {
    let mode = MacMode::from_byte(input.mode);
    if mode.uses_tempkey() {
        check_tempkey_for_mac(mode, temp_key)?;
    }

    let block1 = if mode.block1_tempkey() { temp_key.value } else { *input.key };
    let block2 = if mode.block2_tempkey() {
        temp_key.value
    } else {
        *require(input.challenge, "client challenge")?
    };
    let other = input.other_data;

    let mut hasher = Sha256::new();
    hasher.update(block1);
    hasher.update(block2);
    hasher.update(&other[0..4]);
    if mode.include_otp_64() {
        hasher.update(require(input.otp, "OTP")?);
    } else {
        hasher.update([0u8; 8]);
    }
    hasher.update(&other[4..7]);
    hasher.update([SN8]);
    hasher.update(&other[7..11]);
    hasher.update([SN0, SN1]);
    hasher.update(&other[11..13]);
    Ok(hasher.finalize().into())
}

/// Inputs to [`hmac`].
#[derive(Debug, Clone, Copy)]
pub struct HmacInput<'a> {
    pub mode: MacMode,
    pub key_id: u16,
    pub key: &'a [u8; 32],
    pub otp: Option<&'a [u8; OTP_MAC_SIZE]>,
    pub sn: Option<&'a [u8; SERIAL_NUMBER_SIZE]>,
}

/// Compute the HMAC-SHA256 digest the HMAC command returns.
///
/// The message is TempKey preceded by 32 zero bytes and followed by the
/// same opcode/mode/OTP/SN tail MAC uses. TempKey is invalidated afterwards.
pub fn hmac(input: &HmacInput<'_>, temp_key: &mut TempKey) -> Result<[u8; 32], AtcaError> {
    check_tempkey_for_mac(input.mode, temp_key)?;

    let tail = mac_tail(Opcode::Hmac, input.mode, input.key_id, input.otp, input.sn)?;
    let mut hmac = HmacSha256::new_from_slice(input.key)
        .map_err(|_| AtcaError::BadParameter("invalid HMAC key length".to_string()))?;
    hmac.update(&[0u8; 32]);
    hmac.update(&temp_key.value);
    hmac.update(&tail);

    temp_key.invalidate();
    Ok(hmac.finalize().into_bytes().into())
}

/// The key DeriveKey writes into `target_key`.
///
/// # Arguments
/// * `parent_key` - Current value of the parent key (the target slot itself for Roll)
/// * `mode` - DeriveKey mode byte; bit 2 must match TempKey's source flag on the device
/// * `target_key` - Slot receiving the derived key
/// * `temp_key` - TempKey after the preceding Nonce
pub fn derive_key(
    parent_key: &[u8; 32],
    mode: u8,
    target_key: u16,
    temp_key: &TempKey,
) -> Result<[u8; 32], AtcaError> {
    temp_key.require_valid()?;

    let mut hasher = Sha256::new();
    hasher.update(parent_key);
    hasher.update([u8::from(Opcode::DeriveKey), mode]);
    hasher.update(target_key.to_le_bytes());
    hasher.update([SN8, SN0, SN1]);
    hasher.update([0u8; 25]);
    hasher.update(temp_key.value);
    Ok(hasher.finalize().into())
}

/// Authorizing MAC for DeriveKey on slots that require one.
pub fn derive_key_mac(parent_key: &[u8; 32], mode: u8, target_key: u16) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(parent_key);
    hasher.update([u8::from(Opcode::DeriveKey), mode]);
    hasher.update(target_key.to_le_bytes());
    hasher.update([SN8, SN0, SN1]);
    hasher.finalize().into()
}

/// TempKey after GenKey in a digest mode has folded in `public_key`.
pub fn gen_key_digest(
    mode: u8,
    key_id: u16,
    public_key: &[u8; PUBLIC_KEY_SIZE],
    temp_key: &TempKey,
) -> Result<TempKey, AtcaError> {
    temp_key.require_valid()?;

    let mut hasher = Sha256::new();
    hasher.update(temp_key.value);
    hasher.update([u8::from(Opcode::GenKey), mode]);
    hasher.update(key_id.to_le_bytes());
    hasher.update([SN8, SN0, SN1]);
    hasher.update([0u8; 25]);
    hasher.update(public_key);

    Ok(TempKey {
        value: hasher.finalize().into(),
        gen_data: false,
        ..temp_key.clone()
    })
}

/// Ciphertext and input MAC for an encrypted Write.
///
/// # Arguments
/// * `param1` - The Write param1 byte the command will carry
/// * `address` - Word address being written
/// * `plaintext` - The 32 bytes that should land in the slot
/// * `temp_key` - TempKey after GenDig over the slot's write key
///
/// # Returns
/// `(ciphertext, mac)`
pub fn write_auth(
    param1: u8,
    address: u16,
    plaintext: &[u8; 32],
    temp_key: &TempKey,
) -> Result<([u8; 32], [u8; 32]), AtcaError> {
    temp_key.require_valid()?;
    if !temp_key.gen_data {
        return Err(AtcaError::DeviceStatus(Status::ExecutionError));
    }

    let ciphertext = xor32(plaintext, &temp_key.value);

    let mut hasher = Sha256::new();
    hasher.update(temp_key.value);
    hasher.update([u8::from(Opcode::Write), param1]);
    hasher.update(address.to_le_bytes());
    hasher.update([SN8, SN0, SN1]);
    hasher.update([0u8; 25]);
    hasher.update(plaintext);
    Ok((ciphertext, hasher.finalize().into()))
}

/// Recover plaintext from an encrypted Read (or ECDH output written to a slot).
pub fn decrypt(ciphertext: &[u8; 32], temp_key: &TempKey) -> Result<[u8; 32], AtcaError> {
    temp_key.require_valid()?;
    if !temp_key.gen_data {
        return Err(AtcaError::DeviceStatus(Status::ExecutionError));
    }
    Ok(xor32(ciphertext, &temp_key.value))
}

/// Encrypted value and input MAC for PrivWrite.
///
/// The 36-byte value is XORed with TempKey followed by the first four
/// bytes of SHA-256(TempKey).
pub fn privwrite_auth(
    key_id: u16,
    value: &[u8; PRIVWRITE_VALUE_SIZE],
    temp_key: &TempKey,
) -> Result<([u8; PRIVWRITE_VALUE_SIZE], [u8; 32]), AtcaError> {
    temp_key.require_valid()?;
    if !temp_key.gen_data {
        return Err(AtcaError::DeviceStatus(Status::ExecutionError));
    }

    let mut session = [0u8; PRIVWRITE_VALUE_SIZE];
    session[..32].copy_from_slice(&temp_key.value);
    session[32..].copy_from_slice(&sha256(&temp_key.value)[..4]);

    let mut encrypted = [0u8; PRIVWRITE_VALUE_SIZE];
    for (e, (v, s)) in encrypted.iter_mut().zip(value.iter().zip(session.iter())) {
        *e = v ^ s;
    }

    let mut hasher = Sha256::new();
    hasher.update(temp_key.value);
    hasher.update([u8::from(Opcode::PrivWrite), PRIVWRITE_MODE_ENCRYPT]);
    hasher.update(key_id.to_le_bytes());
    hasher.update([SN8, SN0, SN1]);
    hasher.update([0u8; 21]);
    hasher.update(value);
    Ok((encrypted, hasher.finalize().into()))
}
