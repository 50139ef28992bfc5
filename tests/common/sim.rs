//! An emulated secure element behind an I2C bus.
//!
//! The emulator keeps its own TempKey register, slot storage, lock bytes and
//! P-256 keys, and builds its digests independently of `cryptoauth::host`,
//! so the host companion can be checked against it.

#![allow(dead_code)]

use cryptoauth::config::DeviceType;
use cryptoauth::constants::WAKE_TOKEN;
use cryptoauth::error::TransportError;
use cryptoauth::packet::{crc16, encode_response};
use cryptoauth::transport::I2cBus;
use hmac::{Hmac, Mac};
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

pub const SIM_ADDRESS: u8 = 0x60;

const ST_OK: u8 = 0x00;
const ST_MISCOMPARE: u8 = 0x01;
const ST_PARSE: u8 = 0x03;
const ST_EXECUTION: u8 = 0x0F;
const ST_COMM: u8 = 0xFF;

pub const SIM_SERIAL: [u8; 9] = [0x01, 0x23, 0xAB, 0xCD, 0x10, 0x20, 0x30, 0x40, 0xEE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimPower {
    Asleep,
    Idle,
    Awake,
}

/// What a slot allows once the data zone is locked.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotPolicy {
    /// ECDH result goes to slot+1 instead of the response
    pub ecdh_to_next_slot: bool,
    /// Reads come back encrypted under TempKey from GenDig over this key
    pub encrypted_read_key: Option<u16>,
    /// Writes must be encrypted under TempKey from GenDig over this key
    pub write_key: Option<u16>,
    /// Holds a private key: never readable, never writable in the clear
    pub secret: bool,
}

#[derive(Debug, Clone, Default)]
struct SimTempKey {
    value: [u8; 32],
    valid: bool,
    source_input: bool,
    gen_data: bool,
    key_id: u16,
}

pub struct Chip {
    device_type: DeviceType,
    pub power: SimPower,
    awake_since: Option<Instant>,
    output: Vec<u8>,
    cursor: usize,
    config: [u8; 128],
    otp: [u8; 64],
    slots: Vec<[u8; 72]>,
    private_keys: Vec<Option<SecretKey>>,
    pub policies: [SlotPolicy; 16],
    tempkey: SimTempKey,
    counters: [u32; 2],
    rng_counter: u64,
    sha_message: Option<Vec<u8>>,
    /// Number of wake pulses that actually woke the chip
    pub wake_pulses: usize,
    /// Opcodes of every well-formed command received
    pub commands: Vec<u8>,
    /// Status bytes to answer the next commands with instead of executing them
    pub injected_status: VecDeque<u8>,
    /// Flip a CRC bit in the next response
    pub corrupt_next_response: bool,
    /// Reads to NACK after each command, as if it were still executing
    pub busy_reads: usize,
    busy_remaining: usize,
}

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn public_key_bytes(secret: &SecretKey) -> [u8; 64] {
    let point = secret.public_key().to_encoded_point(false);
    let mut out = [0u8; 64];
    out.copy_from_slice(&point.as_bytes()[1..]);
    out
}

fn parse_public_key(raw: &[u8]) -> Option<PublicKey> {
    let mut sec1 = vec![0x04];
    sec1.extend_from_slice(raw);
    PublicKey::from_sec1_bytes(&sec1).ok()
}

impl Chip {
    /// A chip with both zones locked and the slot layout the tests expect:
    /// slot 0 writes its ECDH result to slot 1, slot 1 reads encrypted under
    /// key 4, slot 2 returns ECDH results in the clear, slot 8 takes
    /// encrypted writes under key 4.
    pub fn new(device_type: DeviceType) -> Self {
        let mut config = [0u8; 128];
        config[0..4].copy_from_slice(&SIM_SERIAL[0..4]);
        config[4..8].copy_from_slice(&Self::revision_for(device_type));
        config[8..13].copy_from_slice(&SIM_SERIAL[4..9]);
        config[16] = SIM_ADDRESS << 1;

        let mut slots = Vec::with_capacity(16);
        for i in 0..16u8 {
            let mut slot = [0u8; 72];
            slot[..32].copy_from_slice(&sha256(&[b"sim-slot", &[i]]));
            slots.push(slot);
        }

        let mut policies = [SlotPolicy::default(); 16];
        policies[0] = SlotPolicy {
            ecdh_to_next_slot: true,
            secret: true,
            ..SlotPolicy::default()
        };
        policies[1].encrypted_read_key = Some(4);
        policies[2].secret = true;
        policies[8].write_key = Some(4);

        Self {
            device_type,
            power: SimPower::Asleep,
            awake_since: None,
            output: Vec::new(),
            cursor: 0,
            config,
            otp: [0x5A; 64],
            slots,
            private_keys: vec![None; 16],
            policies,
            tempkey: SimTempKey::default(),
            counters: [0; 2],
            rng_counter: 0,
            sha_message: None,
            wake_pulses: 0,
            commands: Vec::new(),
            injected_status: VecDeque::new(),
            corrupt_next_response: false,
            busy_reads: 0,
            busy_remaining: 0,
        }
    }

    pub fn with_locks(mut self, config_locked: bool, data_locked: bool) -> Self {
        self.config[87] = if config_locked { 0x00 } else { 0x55 };
        self.config[86] = if data_locked { 0x00 } else { 0x55 };
        self
    }

    fn revision_for(device_type: DeviceType) -> [u8; 4] {
        match device_type {
            DeviceType::Sha204a => [0x00, 0x02, 0x00, 0x08],
            DeviceType::Ecc108a => [0x00, 0x00, 0x10, 0x05],
            DeviceType::Ecc508a => [0x00, 0x00, 0x50, 0x00],
        }
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn slot(&self, slot: usize) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.slots[slot][..32]);
        out
    }

    pub fn set_slot(&mut self, slot: usize, value: &[u8; 32]) {
        self.slots[slot][..32].copy_from_slice(value);
    }

    pub fn otp(&self) -> [u8; 64] {
        self.otp
    }

    pub fn config_locked(&self) -> bool {
        self.config[87] == 0x00
    }

    pub fn data_locked(&self) -> bool {
        self.config[86] == 0x00
    }

    pub fn tempkey_valid(&self) -> bool {
        self.tempkey.valid
    }

    fn next_random(&mut self) -> [u8; 32] {
        self.rng_counter += 1;
        sha256(&[b"sim-rng", &self.rng_counter.to_le_bytes()])
    }

    fn respond(&mut self, data: &[u8]) {
        let mut frame = encode_response(data).to_vec();
        if self.corrupt_next_response {
            self.corrupt_next_response = false;
            let last = frame.len() - 1;
            frame[last] ^= 0x01;
        }
        self.output = frame;
        self.cursor = 0;
        self.busy_remaining = self.busy_reads;
    }

    /// Put the chip to sleep once its watchdog has run out.
    fn age(&mut self) {
        if let (SimPower::Awake, Some(since)) = (self.power, self.awake_since) {
            if since.elapsed() >= self.device_type.watchdog_period() {
                self.go_to_sleep();
            }
        }
    }

    fn wake(&mut self) {
        self.age();
        if self.power == SimPower::Awake {
            return;
        }
        self.power = SimPower::Awake;
        self.awake_since = Some(Instant::now());
        self.wake_pulses += 1;
        self.output = WAKE_TOKEN.to_vec();
        self.cursor = 0;
        self.busy_remaining = 0;
    }

    fn go_to_sleep(&mut self) {
        self.power = SimPower::Asleep;
        self.awake_since = None;
        self.tempkey = SimTempKey::default();
        self.sha_message = None;
        self.output.clear();
    }

    fn command(&mut self, frame: &[u8]) {
        if frame.len() < 7 || frame[0] as usize != frame.len() {
            self.respond(&[ST_COMM]);
            return;
        }
        let n = frame.len();
        let crc = u16::from_le_bytes([frame[n - 2], frame[n - 1]]);
        if crc != crc16(&frame[..n - 2]) {
            self.respond(&[ST_COMM]);
            return;
        }

        let opcode = frame[1];
        let p1 = frame[2];
        let p2 = u16::from_le_bytes([frame[3], frame[4]]);
        let data = frame[5..n - 2].to_vec();
        self.commands.push(opcode);

        if let Some(status) = self.injected_status.pop_front() {
            self.respond(&[status]);
            return;
        }

        let result = match opcode {
            0x01 => Ok(vec![ST_OK]),
            0x02 => self.read(p1, p2),
            0x08 => self.mac(p1, p2, &data),
            0x11 => self.hmac(p1, p2),
            0x12 => self.write(p1, p2, &data),
            0x15 => self.gen_dig(p1, p2),
            0x16 => self.nonce(p1, &data),
            0x17 => self.lock(p1, p2),
            0x1B => Ok(self.next_random().to_vec()),
            0x1C => self.derive_key(p1, p2, &data),
            0x20 => self.update_extra(p1, p2),
            0x24 => self.counter(p1, p2),
            0x28 => self.check_mac(p1, p2, &data),
            0x30 => Ok(Self::revision_for(self.device_type).to_vec()),
            0x40 => self.gen_key(p1, p2, &data),
            0x41 => self.sign(p1, p2),
            0x43 => self.ecdh(p2, &data),
            0x45 => self.verify(p1, &data),
            0x46 => self.priv_write(p1, p2, &data),
            0x47 => self.sha(p1, &data),
            _ => Err(ST_PARSE),
        };
        match result {
            Ok(response) => self.respond(&response),
            Err(status) => self.respond(&[status]),
        }
    }

    /// Byte offset of a word address within a zone.
    fn zone_offset(address: u16) -> usize {
        let block = (address >> 3) as usize & 0x1F;
        let offset = (address & 0x07) as usize;
        block * 32 + offset * 4
    }

    fn data_offset(address: u16) -> (usize, usize) {
        let slot = ((address >> 3) & 0x0F) as usize;
        let block = (address >> 8) as usize;
        let offset = (address & 0x07) as usize;
        (slot, block * 32 + offset * 4)
    }

    fn tempkey_is_gen_dig_of(&self, key: u16) -> bool {
        self.tempkey.valid && self.tempkey.gen_data && self.tempkey.key_id == key
    }

    fn read(&mut self, p1: u8, address: u16) -> Result<Vec<u8>, u8> {
        let len = if p1 & 0x80 != 0 { 32 } else { 4 };
        match p1 & 0x03 {
            0x00 => {
                let start = if len == 32 { Self::zone_offset(address & !0x07) } else { Self::zone_offset(address) };
                self.config.get(start..start + len).map(<[u8]>::to_vec).ok_or(ST_EXECUTION)
            }
            0x01 => {
                let start = Self::zone_offset(address);
                self.otp.get(start..start + len).map(<[u8]>::to_vec).ok_or(ST_EXECUTION)
            }
            0x02 => {
                if !self.data_locked() {
                    return Err(ST_EXECUTION);
                }
                let (slot, start) = Self::data_offset(address);
                let policy = self.policies[slot];
                if policy.secret {
                    return Err(ST_EXECUTION);
                }
                let plain = self.slots[slot].get(start..start + len).ok_or(ST_EXECUTION)?.to_vec();
                match policy.encrypted_read_key {
                    None => Ok(plain),
                    Some(key) => {
                        if len != 32 || !self.tempkey_is_gen_dig_of(key) {
                            return Err(ST_EXECUTION);
                        }
                        let out = plain.iter().zip(self.tempkey.value.iter()).map(|(a, b)| a ^ b).collect();
                        self.tempkey.valid = false;
                        Ok(out)
                    }
                }
            }
            _ => Err(ST_PARSE),
        }
    }

    fn write(&mut self, p1: u8, address: u16, data: &[u8]) -> Result<Vec<u8>, u8> {
        let len = if p1 & 0x80 != 0 { 32 } else { 4 };
        let encrypted = p1 & 0x40 != 0;
        let expected = if encrypted { len + 32 } else { len };
        if data.len() != expected {
            return Err(ST_PARSE);
        }
        match p1 & 0x03 {
            0x00 => {
                let start = Self::zone_offset(address);
                if self.config_locked() || start < 16 || (84..88).contains(&start) || start + len > 128 {
                    return Err(ST_EXECUTION);
                }
                self.config[start..start + len].copy_from_slice(data);
            }
            0x01 => {
                let start = Self::zone_offset(address);
                if self.data_locked() || start + len > 64 {
                    return Err(ST_EXECUTION);
                }
                self.otp[start..start + len].copy_from_slice(data);
            }
            0x02 => {
                let (slot, start) = Self::data_offset(address);
                if start + len > 72 {
                    return Err(ST_EXECUTION);
                }
                let policy = self.policies[slot];
                if !self.data_locked() {
                    self.slots[slot][start..start + len].copy_from_slice(&data[..len]);
                    return Ok(vec![ST_OK]);
                }
                if policy.secret {
                    return Err(ST_EXECUTION);
                }
                match policy.write_key {
                    None if !encrypted => self.slots[slot][start..start + len].copy_from_slice(data),
                    None => return Err(ST_EXECUTION),
                    Some(key) => {
                        if !encrypted || !self.tempkey_is_gen_dig_of(key) {
                            return Err(ST_EXECUTION);
                        }
                        let tk = self.tempkey.value;
                        let mut plain = [0u8; 32];
                        for i in 0..32 {
                            plain[i] = data[i] ^ tk[i];
                        }
                        let expected_mac = sha256(&[
                            &tk,
                            &[0x12, p1],
                            &address.to_le_bytes(),
                            &[0xEE, 0x01, 0x23],
                            &[0u8; 25],
                            &plain,
                        ]);
                        self.tempkey.valid = false;
                        if expected_mac[..] != data[32..64] {
                            return Err(ST_EXECUTION);
                        }
                        self.slots[slot][start..start + 32].copy_from_slice(&plain);
                    }
                }
            }
            _ => return Err(ST_PARSE),
        }
        Ok(vec![ST_OK])
    }

    fn nonce(&mut self, mode: u8, num_in: &[u8]) -> Result<Vec<u8>, u8> {
        match mode & 0x03 {
            0x00 | 0x01 if num_in.len() == 20 => {
                let rand_out = self.next_random();
                let value = sha256(&[&rand_out, num_in, &[0x16, mode & 0x03, 0x00]]);
                self.tempkey = SimTempKey {
                    value,
                    valid: true,
                    ..SimTempKey::default()
                };
                Ok(rand_out.to_vec())
            }
            0x03 if num_in.len() == 32 => {
                let mut value = [0u8; 32];
                value.copy_from_slice(num_in);
                self.tempkey = SimTempKey {
                    value,
                    valid: true,
                    source_input: true,
                    ..SimTempKey::default()
                };
                Ok(vec![ST_OK])
            }
            _ => Err(ST_PARSE),
        }
    }

    fn gen_dig(&mut self, zone: u8, key_id: u16) -> Result<Vec<u8>, u8> {
        if !self.tempkey.valid {
            return Err(ST_EXECUTION);
        }
        let stored: [u8; 32] = match zone {
            0x00 => self.config.get(key_id as usize * 32..key_id as usize * 32 + 32),
            0x01 => self.otp.get(key_id as usize * 32..key_id as usize * 32 + 32),
            0x02 => self.slots.get(key_id as usize).map(|slot| &slot[..32]),
            _ => None,
        }
        .ok_or(ST_PARSE)?
        .try_into()
        .map_err(|_| ST_PARSE)?;

        let value = sha256(&[
            &stored,
            &[0x15, zone],
            &key_id.to_le_bytes(),
            &[0xEE, 0x01, 0x23],
            &[0u8; 25],
            &self.tempkey.value,
        ]);
        self.tempkey.value = value;
        self.tempkey.gen_data = zone == 0x02;
        self.tempkey.key_id = key_id;
        Ok(vec![ST_OK])
    }

    /// Check TempKey for a command that consumes it with source-flag matching.
    fn tempkey_usable(&self, mode: u8) -> bool {
        self.tempkey.valid && ((mode & 0x04 != 0) == self.tempkey.source_input)
    }

    /// Opcode, mode, key id, OTP and SN fields shared by MAC and HMAC.
    fn mac_tail(&self, opcode: u8, mode: u8, key_id: u16) -> Vec<u8> {
        let sn = {
            let mut sn = [0u8; 9];
            sn[..4].copy_from_slice(&self.config[0..4]);
            sn[4..].copy_from_slice(&self.config[8..13]);
            sn
        };
        let mut tail = vec![opcode, mode];
        tail.extend_from_slice(&key_id.to_le_bytes());
        if mode & 0x10 != 0 {
            tail.extend_from_slice(&self.otp[..11]);
        } else if mode & 0x20 != 0 {
            tail.extend_from_slice(&self.otp[..8]);
            tail.extend_from_slice(&[0; 3]);
        } else {
            tail.extend_from_slice(&[0; 11]);
        }
        tail.push(0xEE);
        if mode & 0x40 != 0 {
            tail.extend_from_slice(&sn[4..8]);
        } else {
            tail.extend_from_slice(&[0; 4]);
        }
        tail.extend_from_slice(&[0x01, 0x23]);
        if mode & 0x40 != 0 {
            tail.extend_from_slice(&sn[2..4]);
        } else {
            tail.extend_from_slice(&[0; 2]);
        }
        tail
    }

    fn mac(&mut self, mode: u8, key_id: u16, data: &[u8]) -> Result<Vec<u8>, u8> {
        if mode & 0x03 != 0 && !self.tempkey_usable(mode) {
            return Err(ST_EXECUTION);
        }
        let key = self.slot(key_id as usize & 0x0F);
        let block1 = if mode & 0x02 != 0 { self.tempkey.value } else { key };
        let block2: [u8; 32] = if mode & 0x01 != 0 {
            self.tempkey.value
        } else {
            data.try_into().map_err(|_| ST_PARSE)?
        };
        let digest = sha256(&[&block1, &block2, &self.mac_tail(0x08, mode, key_id)]);
        if mode & 0x03 != 0 {
            self.tempkey.valid = false;
        }
        Ok(digest.to_vec())
    }

    fn check_mac(&mut self, mode: u8, key_id: u16, data: &[u8]) -> Result<Vec<u8>, u8> {
        if data.len() != 77 {
            return Err(ST_PARSE);
        }
        if mode & 0x03 != 0 && !self.tempkey_usable(mode) {
            return Err(ST_EXECUTION);
        }
        let key = self.slot(key_id as usize & 0x0F);
        let block1 = if mode & 0x02 != 0 { self.tempkey.value } else { key };
        let block2: [u8; 32] = if mode & 0x01 != 0 {
            self.tempkey.value
        } else {
            data[..32].try_into().map_err(|_| ST_PARSE)?
        };
        let response = &data[32..64];
        let other = &data[64..77];
        let otp: &[u8] = if mode & 0x20 != 0 { &self.otp[..8] } else { &[0u8; 8] };
        let expected = sha256(&[
            &block1,
            &block2,
            &other[0..4],
            otp,
            &other[4..7],
            &[0xEE],
            &other[7..11],
            &[0x01, 0x23],
            &other[11..13],
        ]);
        Ok(vec![if expected[..] == *response { ST_OK } else { ST_MISCOMPARE }])
    }

    fn hmac(&mut self, mode: u8, key_id: u16) -> Result<Vec<u8>, u8> {
        if !self.tempkey_usable(mode) {
            return Err(ST_EXECUTION);
        }
        let key = self.slot(key_id as usize & 0x0F);
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&key).map_err(|_| ST_EXECUTION)?;
        mac.update(&[0u8; 32]);
        mac.update(&self.tempkey.value);
        mac.update(&self.mac_tail(0x11, mode, key_id));
        self.tempkey.valid = false;
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn derive_key(&mut self, mode: u8, target: u16, data: &[u8]) -> Result<Vec<u8>, u8> {
        if !self.tempkey.valid || target > 15 {
            return Err(ST_EXECUTION);
        }
        let parent = self.slot(target as usize);
        if data.len() == 32 {
            let auth = sha256(&[&parent, &[0x1C, mode], &target.to_le_bytes(), &[0xEE, 0x01, 0x23]]);
            if auth[..] != *data {
                return Err(ST_EXECUTION);
            }
        } else if !data.is_empty() {
            return Err(ST_PARSE);
        }
        let derived = sha256(&[
            &parent,
            &[0x1C, mode],
            &target.to_le_bytes(),
            &[0xEE, 0x01, 0x23],
            &[0u8; 25],
            &self.tempkey.value,
        ]);
        self.set_slot(target as usize, &derived);
        self.tempkey.valid = false;
        Ok(vec![ST_OK])
    }

    fn update_extra(&mut self, mode: u8, value: u16) -> Result<Vec<u8>, u8> {
        let index = match mode {
            0x00 => 84,
            0x01 => 85,
            _ => return Err(ST_PARSE),
        };
        if !self.config_locked() || self.config[index] != 0 {
            return Err(ST_EXECUTION);
        }
        self.config[index] = value as u8;
        Ok(vec![ST_OK])
    }

    fn counter(&mut self, mode: u8, id: u16) -> Result<Vec<u8>, u8> {
        let counter = self.counters.get_mut(id as usize).ok_or(ST_PARSE)?;
        match mode {
            0x00 => {}
            0x01 => *counter += 1,
            _ => return Err(ST_PARSE),
        }
        Ok(counter.to_le_bytes().to_vec())
    }

    fn lock(&mut self, mode: u8, summary_crc: u16) -> Result<Vec<u8>, u8> {
        match mode & 0x01 {
            0x00 => {
                if self.config_locked() {
                    return Err(ST_EXECUTION);
                }
                if mode & 0x80 == 0 && crc16(&self.config) != summary_crc {
                    return Err(ST_MISCOMPARE);
                }
                self.config[87] = 0x00;
            }
            _ => {
                if !self.config_locked() || self.data_locked() {
                    return Err(ST_EXECUTION);
                }
                self.config[86] = 0x00;
            }
        }
        Ok(vec![ST_OK])
    }

    fn gen_key(&mut self, mode: u8, key_id: u16, data: &[u8]) -> Result<Vec<u8>, u8> {
        let slot = key_id as usize;
        if slot >= 16 {
            return Err(ST_PARSE);
        }
        let pubkey_digest = mode & 0x10 != 0;
        if data.len() != if pubkey_digest { 3 } else { 0 } {
            return Err(ST_PARSE);
        }
        if mode & 0x04 != 0 && !pubkey_digest {
            let secret = loop {
                let candidate = self.next_random();
                if let Ok(secret) = SecretKey::from_slice(&candidate) {
                    break secret;
                }
            };
            self.private_keys[slot] = Some(secret);
        }
        let secret = self.private_keys[slot].as_ref().ok_or(ST_EXECUTION)?;
        let public_key = public_key_bytes(secret);

        if mode & 0x18 != 0 {
            if !self.tempkey.valid {
                return Err(ST_EXECUTION);
            }
            self.tempkey.value = sha256(&[
                &self.tempkey.value,
                &[0x40, mode],
                &key_id.to_le_bytes(),
                &[SIM_SERIAL[8], SIM_SERIAL[0], SIM_SERIAL[1]],
                &[0u8; 25],
                &public_key,
            ]);
            self.tempkey.gen_data = false;
        }

        if pubkey_digest {
            Ok(vec![ST_OK])
        } else {
            Ok(public_key.to_vec())
        }
    }

    fn sign(&mut self, mode: u8, key_id: u16) -> Result<Vec<u8>, u8> {
        if mode & 0x80 == 0 || !self.tempkey.valid {
            return Err(ST_EXECUTION);
        }
        let secret = self
            .private_keys
            .get(key_id as usize)
            .and_then(Option::as_ref)
            .ok_or(ST_EXECUTION)?;
        let signing_key = SigningKey::from(secret);
        let signature: Signature = signing_key
            .sign_prehash(&self.tempkey.value)
            .map_err(|_| ST_EXECUTION)?;
        self.tempkey.valid = false;
        Ok(signature.to_bytes().to_vec())
    }

    fn verify(&mut self, mode: u8, data: &[u8]) -> Result<Vec<u8>, u8> {
        if mode != 0x02 || data.len() != 128 || !self.tempkey.valid {
            return Err(ST_EXECUTION);
        }
        let public = parse_public_key(&data[64..]).ok_or(ST_EXECUTION)?;
        let verifying_key = VerifyingKey::from(&public);
        let signature = Signature::from_slice(&data[..64]).map_err(|_| ST_MISCOMPARE)?;
        let ok = verifying_key.verify_prehash(&self.tempkey.value, &signature).is_ok();
        self.tempkey.valid = false;
        Ok(vec![if ok { ST_OK } else { ST_MISCOMPARE }])
    }

    fn ecdh(&mut self, key_id: u16, data: &[u8]) -> Result<Vec<u8>, u8> {
        let slot = key_id as usize;
        let secret = self
            .private_keys
            .get(slot)
            .and_then(Option::as_ref)
            .ok_or(ST_EXECUTION)?;
        let public = parse_public_key(data).ok_or(ST_EXECUTION)?;
        let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
        let mut pms = [0u8; 32];
        pms.copy_from_slice(shared.raw_secret_bytes().as_slice());

        if self.policies[slot].ecdh_to_next_slot {
            self.set_slot(slot + 1, &pms);
            Ok(vec![ST_OK])
        } else {
            Ok(pms.to_vec())
        }
    }

    fn priv_write(&mut self, mode: u8, key_id: u16, data: &[u8]) -> Result<Vec<u8>, u8> {
        if data.len() != 68 || key_id > 15 {
            return Err(ST_PARSE);
        }
        let encrypted = mode & 0x40 != 0;
        let mut value = [0u8; 36];
        value.copy_from_slice(&data[..36]);

        if self.data_locked() {
            if !encrypted || !self.tempkey.valid || !self.tempkey.gen_data {
                return Err(ST_EXECUTION);
            }
            let tk = self.tempkey.value;
            let tail = sha256(&[&tk]);
            for i in 0..36 {
                value[i] ^= if i < 32 { tk[i] } else { tail[i - 32] };
            }
            let expected = sha256(&[
                &tk,
                &[0x46, mode],
                &key_id.to_le_bytes(),
                &[0xEE, 0x01, 0x23],
                &[0u8; 21],
                &value,
            ]);
            self.tempkey.valid = false;
            if expected[..] != data[36..] {
                return Err(ST_EXECUTION);
            }
        }

        let secret = SecretKey::from_slice(&value[4..]).map_err(|_| ST_EXECUTION)?;
        self.private_keys[key_id as usize] = Some(secret);
        Ok(vec![ST_OK])
    }

    fn sha(&mut self, mode: u8, data: &[u8]) -> Result<Vec<u8>, u8> {
        match mode {
            0x00 => {
                self.sha_message = Some(Vec::new());
                Ok(vec![ST_OK])
            }
            0x01 => {
                let message = self.sha_message.as_mut().ok_or(ST_EXECUTION)?;
                message.extend_from_slice(data);
                Ok(vec![ST_OK])
            }
            0x02 => {
                let mut message = self.sha_message.take().ok_or(ST_EXECUTION)?;
                message.extend_from_slice(data);
                Ok(sha256(&[&message]).to_vec())
            }
            _ => Err(ST_PARSE),
        }
    }
}

/// Shared handle to an emulated chip, usable as an [`I2cBus`].
#[derive(Clone)]
pub struct SimBus {
    chip: Arc<Mutex<Chip>>,
}

impl SimBus {
    pub fn new(chip: Chip) -> Self {
        Self {
            chip: Arc::new(Mutex::new(chip)),
        }
    }

    pub fn chip(&self) -> MutexGuard<'_, Chip> {
        self.chip.lock().expect("emulator mutex poisoned")
    }
}

impl I2cBus for SimBus {
    async fn write(&mut self, address: u8, data: &[u8]) -> Result<(), TransportError> {
        let mut chip = self.chip();
        chip.age();
        if address != SIM_ADDRESS || chip.power != SimPower::Awake || data.is_empty() {
            return Err(TransportError::Nack);
        }
        match data[0] {
            0x00 => chip.cursor = 0,
            0x01 => chip.go_to_sleep(),
            0x02 => {
                chip.power = SimPower::Idle;
                chip.awake_since = None;
            }
            0x03 => chip.command(&data[1..]),
            _ => return Err(TransportError::Nack),
        }
        Ok(())
    }

    async fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<(), TransportError> {
        let mut chip = self.chip();
        chip.age();
        if address != SIM_ADDRESS || chip.power != SimPower::Awake {
            return Err(TransportError::Nack);
        }
        if chip.busy_remaining > 0 {
            chip.busy_remaining -= 1;
            return Err(TransportError::Nack);
        }
        let remaining = chip.output.len() - chip.cursor;
        if remaining == 0 {
            return Err(TransportError::Nack);
        }
        if buffer.len() > remaining {
            return Err(TransportError::ShortTransfer {
                expected: buffer.len(),
                actual: remaining,
            });
        }
        let start = chip.cursor;
        buffer.copy_from_slice(&chip.output[start..start + buffer.len()]);
        chip.cursor += buffer.len();
        Ok(())
    }

    async fn hold_sda_low(&mut self, duration: Duration) -> Result<(), TransportError> {
        if duration >= Duration::from_micros(60) {
            self.chip().wake();
        }
        Ok(())
    }
}
