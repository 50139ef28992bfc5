use crate::command::*;
use crate::config::{DeviceConfig, DeviceType};
use crate::constants::*;
use crate::error::{AtcaError, FramingError};
use crate::host::{self, TempKey};
use crate::packet::{Packet, parse_response};
use crate::status::Status;
use crate::transport::{I2cBus, I2cTransport, PowerState, SwiBus, SwiTransport, Transport};
use crate::zone::{LockRequirement, LockWord, LockZone, Precondition, Zone, ZoneParam};
use bytes::Bytes;
use tracing::{debug, info, warn};

/// A decoded response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub opcode: Opcode,
    /// Status byte for 4-byte responses, `Success` for data responses
    pub status: Status,
    /// Bytes between the count byte and the CRC
    pub data: Bytes,
}

impl Response {
    pub fn new(opcode: Opcode, data: Bytes) -> Self {
        let status = if data.len() == 1 {
            Status::from(data[0])
        } else {
            Status::Success
        };
        Self { opcode, status, data }
    }

    /// The data as a fixed-size array, failing if the device sent a different length.
    pub fn data_array<const N: usize>(&self) -> Result<[u8; N], AtcaError> {
        <[u8; N]>::try_from(self.data.as_ref()).map_err(|_| {
            FramingError::CountMismatch {
                declared: N + 3,
                actual: self.data.len() + 3,
            }
            .into()
        })
    }
}

/// Handle to one secure element.
///
/// The handle owns its transport and command builder. Once [`destroy`](Self::destroy)
/// has run, every operation fails with [`AtcaError::Destroyed`].
pub struct Device<T: Transport> {
    transport: Option<T>,
    commands: CommandBuilder,
    config: DeviceConfig,
}

impl<B: I2cBus> Device<I2cTransport<B>> {
    /// Create a handle for an I2C-attached device.
    pub fn i2c(config: DeviceConfig, bus: B) -> Result<Self, AtcaError> {
        let transport = I2cTransport::new(&config, bus)?;
        Self::new(config, transport)
    }
}

impl<B: SwiBus> Device<SwiTransport<B>> {
    /// Create a handle for a single-wire device.
    pub fn swi(config: DeviceConfig, bus: B) -> Result<Self, AtcaError> {
        let transport = SwiTransport::new(&config, bus)?;
        Self::new(config, transport)
    }
}

impl<T: Transport> Device<T> {
    pub fn new(config: DeviceConfig, transport: T) -> Result<Self, AtcaError> {
        config.validate()?;
        info!("Created {} handle on {:?}", config.device_type, config.interface);
        Ok(Self {
            transport: Some(transport),
            commands: CommandBuilder::new(config.device_type),
            config,
        })
    }

    pub fn device_type(&self) -> DeviceType {
        self.commands.device_type()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn is_destroyed(&self) -> bool {
        self.transport.is_none()
    }

    pub fn transport(&self) -> Result<&T, AtcaError> {
        self.transport.as_ref().ok_or(AtcaError::Destroyed)
    }

    fn transport_mut(&mut self) -> Result<&mut T, AtcaError> {
        self.transport.as_mut().ok_or(AtcaError::Destroyed)
    }

    pub fn power_state(&self) -> Result<PowerState, AtcaError> {
        Ok(self.transport()?.power_state())
    }

    pub async fn wake(&mut self) -> Result<(), AtcaError> {
        self.transport_mut()?.wake().await
    }

    pub async fn idle(&mut self) -> Result<(), AtcaError> {
        self.transport_mut()?.idle().await
    }

    pub async fn sleep(&mut self) -> Result<(), AtcaError> {
        self.transport_mut()?.sleep().await
    }

    /// Put the device to sleep and release the transport.
    ///
    /// Destroying an already destroyed handle does nothing.
    pub async fn destroy(&mut self) -> Result<(), AtcaError> {
        let Some(mut transport) = self.transport.take() else {
            return Ok(());
        };
        if let Err(e) = transport.sleep().await {
            warn!("Failed to put device to sleep while destroying handle: {}", e);
        }
        info!("Destroyed {} handle", self.config.device_type);
        Ok(())
    }

    /// Lay out `command` for this device without sending it.
    pub fn build(&self, command: &Command) -> Result<Packet, AtcaError> {
        if self.is_destroyed() {
            return Err(AtcaError::Destroyed);
        }
        self.commands.build(command)
    }

    /// Build, send and receive one command.
    ///
    /// The device is woken if needed and left awake afterwards, so TempKey
    /// survives across consecutive calls. A nonzero status byte becomes
    /// [`AtcaError::DeviceStatus`].
    pub async fn execute(&mut self, command: &Command) -> Result<Response, AtcaError> {
        let packet = self.build(command)?;
        self.execute_packet(&packet).await
    }

    /// Send an already-built packet and collect its response.
    pub async fn execute_packet(&mut self, packet: &Packet) -> Result<Response, AtcaError> {
        let retries = self.config.command_retries;
        let frame = packet.to_bytes();
        let transport = self.transport_mut()?;
        let mut attempt = 0;

        loop {
            let sent = match transport.wake().await {
                Ok(()) => transport.send(&frame).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                if matches!(e, AtcaError::Transport(_)) && attempt < retries {
                    attempt += 1;
                    warn!("Sending {} failed ({}), retry {}/{}", packet.opcode, e, attempt, retries);
                    transport.desynchronize();
                    continue;
                }
                return Err(e);
            }

            debug!("Waiting {:?} for {}", packet.execution_time, packet.opcode);
            tokio::time::sleep(packet.execution_time).await;

            let data = receive_response(transport, packet.rx_size.max(RSP_SIZE_MIN)).await?;
            let response = Response::new(packet.opcode, data);
            if response.status.is_advisory() && attempt < retries {
                attempt += 1;
                warn!(
                    "{} answered \"{}\", resetting watchdog and retrying {}/{}",
                    packet.opcode, response.status, attempt, retries
                );
                transport.idle().await?;
                continue;
            }
            if !response.status.is_success() {
                debug!("{} failed with status {}", packet.opcode, response.status);
                return Err(AtcaError::DeviceStatus(response.status));
            }
            return Ok(response);
        }
    }

    /// Send raw bytes as a command frame, bypassing the builder.
    ///
    /// No retries are attempted. Useful for exercising the device's own
    /// framing checks.
    pub async fn execute_raw(&mut self, frame: &[u8], opcode: Opcode) -> Result<Response, AtcaError> {
        let device_type = self.device_type();
        let execution_time = device_type
            .execution_time(opcode)
            .ok_or(AtcaError::UnsupportedOpcode { opcode, device_type })?;
        let transport = self.transport_mut()?;

        transport.wake().await?;
        transport.send(frame).await?;
        tokio::time::sleep(execution_time).await;

        let data = receive_response(transport, MAX_FRAME_SIZE).await?;
        let response = Response::new(opcode, data);
        if !response.status.is_success() {
            return Err(AtcaError::DeviceStatus(response.status));
        }
        Ok(response)
    }

    pub async fn read_word(&mut self, zone: Zone, slot: u16, block: u8, offset: u8) -> Result<[u8; 4], AtcaError> {
        let address = zone.address(slot, block, offset)?;
        let response = self
            .execute(&Command::Read(ReadParams {
                zone,
                address,
                block_access: false,
            }))
            .await?;
        response.data_array()
    }

    pub async fn read_block(&mut self, zone: Zone, slot: u16, block: u8) -> Result<[u8; 32], AtcaError> {
        let address = zone.address(slot, block, 0)?;
        let response = self
            .execute(&Command::Read(ReadParams {
                zone,
                address,
                block_access: true,
            }))
            .await?;
        response.data_array()
    }

    /// Read one config zone word by its word address.
    pub async fn read_config_word(&mut self, address: u16) -> Result<[u8; 4], AtcaError> {
        let response = self
            .execute(&Command::Read(ReadParams {
                zone: Zone::Config,
                address,
                block_access: false,
            }))
            .await?;
        response.data_array()
    }

    /// The device's 9-byte serial number from config bytes 0..4 and 8..13.
    pub async fn serial_number(&mut self) -> Result<[u8; SERIAL_NUMBER_SIZE], AtcaError> {
        let first = self.read_config_word(0x00).await?;
        let second = self.read_config_word(0x02).await?;
        let third = self.read_config_word(0x03).await?;
        let mut sn = [0u8; SERIAL_NUMBER_SIZE];
        sn[..4].copy_from_slice(&first);
        sn[4..8].copy_from_slice(&second);
        sn[8] = third[0];
        Ok(sn)
    }

    pub async fn write_word(
        &mut self,
        zone: Zone,
        slot: u16,
        block: u8,
        offset: u8,
        value: [u8; 4],
    ) -> Result<(), AtcaError> {
        let address = zone.address(slot, block, offset)?;
        self.execute(&Command::Write(WriteParams {
            zone,
            address,
            value: Bytes::copy_from_slice(&value),
            mac: None,
        }))
        .await?;
        Ok(())
    }

    pub async fn write_block(&mut self, zone: Zone, slot: u16, block: u8, value: &[u8; 32]) -> Result<(), AtcaError> {
        let address = zone.address(slot, block, 0)?;
        self.execute(&Command::Write(WriteParams {
            zone,
            address,
            value: Bytes::copy_from_slice(value),
            mac: None,
        }))
        .await?;
        Ok(())
    }

    pub async fn lock_word(&mut self) -> Result<LockWord, AtcaError> {
        let word = self.read_config_word(LOCK_WORD_ADDRESS).await?;
        Ok(LockWord::from_word(word))
    }

    pub async fn is_locked(&mut self, zone: LockZone) -> Result<bool, AtcaError> {
        Ok(self.lock_word().await?.is_locked(zone))
    }

    /// Check lock-state requirements before lock-dependent work.
    ///
    /// An unmet requirement is not an error: the work is inapplicable to
    /// this device as configured.
    pub async fn precondition(&mut self, requirements: &[LockRequirement]) -> Result<Precondition, AtcaError> {
        let word = self.lock_word().await?;
        for requirement in requirements {
            if word.is_locked(requirement.zone) != requirement.locked {
                info!(
                    "{} zone must be {} for this operation, skipping",
                    requirement.zone,
                    if requirement.locked { "locked" } else { "unlocked" }
                );
                return Ok(Precondition::Unmet(*requirement));
            }
        }
        Ok(Precondition::Met)
    }

    /// Run Nonce, returning RandOut for the seed modes.
    pub async fn nonce(&mut self, mode: NonceMode, num_in: &[u8]) -> Result<Option<[u8; 32]>, AtcaError> {
        let response = self
            .execute(&Command::Nonce(NonceParams {
                mode,
                num_in: Bytes::copy_from_slice(num_in),
            }))
            .await?;
        match mode {
            NonceMode::PassThrough => Ok(None),
            _ => Ok(Some(response.data_array()?)),
        }
    }

    /// Run a seed-update Nonce and compute the matching host TempKey.
    pub async fn nonce_with_host(&mut self, num_in: &[u8; NONCE_NUMIN_SIZE]) -> Result<TempKey, AtcaError> {
        let rand_out = self.nonce(NonceMode::SeedUpdate, num_in).await?;
        host::nonce(NonceMode::SeedUpdate, num_in, rand_out.as_ref())
    }

    pub async fn random(&mut self) -> Result<[u8; 32], AtcaError> {
        let response = self.execute(&Command::Random(RandomParams { update_seed: true })).await?;
        response.data_array()
    }

    pub async fn gen_dig(&mut self, zone: Zone, key_id: u16) -> Result<(), AtcaError> {
        self.execute(&Command::GenDig(GenDigParams {
            zone,
            key_id,
            other_data: None,
        }))
        .await?;
        Ok(())
    }

    pub async fn mac(&mut self, mode: MacMode, key_id: u16, challenge: Option<&[u8; 32]>) -> Result<[u8; 32], AtcaError> {
        let response = self
            .execute(&Command::Mac(MacParams {
                mode,
                key_id,
                challenge: challenge.copied(),
            }))
            .await?;
        response.data_array()
    }

    /// Run CheckMac; `Ok(false)` when the device reports a miscompare.
    pub async fn check_mac(&mut self, params: CheckMacParams) -> Result<bool, AtcaError> {
        match self.execute(&Command::CheckMac(params)).await {
            Ok(_) => Ok(true),
            Err(AtcaError::DeviceStatus(Status::Miscompare)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn hmac(&mut self, mode: MacMode, key_id: u16) -> Result<[u8; 32], AtcaError> {
        let response = self
            .execute(&Command::Hmac(HmacParams {
                mode: mode.to_byte(),
                key_id,
            }))
            .await?;
        response.data_array()
    }

    pub async fn derive_key(&mut self, mode: u8, target_key: u16, mac: Option<[u8; 32]>) -> Result<(), AtcaError> {
        self.execute(&Command::DeriveKey(DeriveKeyParams { mode, target_key, mac }))
            .await?;
        Ok(())
    }

    /// Device revision word from Info.
    pub async fn info_revision(&mut self) -> Result<[u8; 4], AtcaError> {
        let response = self
            .execute(&Command::Info(InfoParams {
                mode: INFO_MODE_REVISION,
                param: 0,
            }))
            .await?;
        response.data_array()
    }

    pub async fn counter(&mut self, mode: CounterMode, counter_id: u16) -> Result<u32, AtcaError> {
        let response = self
            .execute(&Command::Counter(CounterParams { mode, counter_id }))
            .await?;
        Ok(u32::from_le_bytes(response.data_array()?))
    }

    /// Create a new private key in `key_id`, returning its public key.
    pub async fn gen_key(&mut self, key_id: u16) -> Result<[u8; PUBLIC_KEY_SIZE], AtcaError> {
        let response = self
            .execute(&Command::GenKey(GenKeyParams {
                mode: GENKEY_MODE_PRIVATE,
                key_id,
                other_data: None,
            }))
            .await?;
        response.data_array()
    }

    /// Public key of the private key already stored in `key_id`.
    pub async fn public_key(&mut self, key_id: u16) -> Result<[u8; PUBLIC_KEY_SIZE], AtcaError> {
        let response = self
            .execute(&Command::GenKey(GenKeyParams {
                mode: GENKEY_MODE_PUBLIC,
                key_id,
                other_data: None,
            }))
            .await?;
        response.data_array()
    }

    /// Sign a 32-byte digest with the private key in `key_id`.
    pub async fn sign_digest(&mut self, key_id: u16, digest: &[u8; 32]) -> Result<[u8; SIGNATURE_SIZE], AtcaError> {
        self.nonce(NonceMode::PassThrough, digest).await?;
        let response = self
            .execute(&Command::Sign(SignParams {
                mode: SIGN_MODE_EXTERNAL,
                key_id,
            }))
            .await?;
        response.data_array()
    }

    /// Verify a signature over a 32-byte digest against an external P-256 key.
    pub async fn verify_external(
        &mut self,
        digest: &[u8; 32],
        signature: &[u8; SIGNATURE_SIZE],
        public_key: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<bool, AtcaError> {
        self.nonce(NonceMode::PassThrough, digest).await?;
        let result = self
            .execute(&Command::Verify(VerifyParams {
                mode: VerifyMode::External,
                key_id: VERIFY_KEY_P256,
                signature: *signature,
                public_key: Some(*public_key),
            }))
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(AtcaError::DeviceStatus(Status::Miscompare)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// ECDH between the private key in `key_id` and `public_key`.
    ///
    /// Returns the shared secret, or `None` when the slot is configured to
    /// write it to the next slot instead of returning it.
    pub async fn ecdh(
        &mut self,
        key_id: u16,
        public_key: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<Option<[u8; 32]>, AtcaError> {
        let response = self
            .execute(&Command::Ecdh(EcdhParams {
                key_id,
                public_key: *public_key,
            }))
            .await?;
        if response.data.len() == 1 {
            return Ok(None);
        }
        Ok(Some(response.data_array()?))
    }

    /// SHA-256 computed by the device.
    pub async fn sha256(&mut self, message: &[u8]) -> Result<[u8; 32], AtcaError> {
        self.execute(&Command::Sha(ShaParams {
            mode: ShaMode::Start,
            data: Bytes::new(),
        }))
        .await?;

        let mut chunks = message.chunks_exact(SHA_BLOCK_SIZE);
        for block in chunks.by_ref() {
            self.execute(&Command::Sha(ShaParams {
                mode: ShaMode::Update,
                data: Bytes::copy_from_slice(block),
            }))
            .await?;
        }

        let response = self
            .execute(&Command::Sha(ShaParams {
                mode: ShaMode::End,
                data: Bytes::copy_from_slice(chunks.remainder()),
            }))
            .await?;
        response.data_array()
    }

    pub async fn pause(&mut self, selector: u8) -> Result<(), AtcaError> {
        self.execute(&Command::Pause(PauseParams { selector })).await?;
        Ok(())
    }

    pub async fn update_extra(&mut self, mode: u8, value: u16) -> Result<(), AtcaError> {
        self.execute(&Command::UpdateExtra(UpdateExtraParams { mode, value }))
            .await?;
        Ok(())
    }

    pub async fn lock(&mut self, zone: LockZone, summary_crc: Option<u16>) -> Result<(), AtcaError> {
        self.execute(&Command::Lock(LockParams { zone, summary_crc })).await?;
        Ok(())
    }

    /// Read a data block that the slot only releases encrypted.
    ///
    /// Runs Nonce and GenDig over the slot's read key on both the device and
    /// the host, then decrypts the block with the resulting TempKey.
    pub async fn read_encrypted(
        &mut self,
        slot: u16,
        block: u8,
        read_key_id: u16,
        read_key: &[u8; 32],
        num_in: &[u8; NONCE_NUMIN_SIZE],
    ) -> Result<[u8; 32], AtcaError> {
        let temp_key = self.nonce_with_host(num_in).await?;
        self.gen_dig(Zone::Data, read_key_id).await?;
        let temp_key = host::gen_dig(Zone::Data, read_key_id, read_key, &temp_key)?;

        let ciphertext = self.read_block(Zone::Data, slot, block).await?;
        host::decrypt(&ciphertext, &temp_key)
    }

    /// Write a data block through the slot's write key.
    pub async fn write_encrypted(
        &mut self,
        slot: u16,
        block: u8,
        plaintext: &[u8; 32],
        write_key_id: u16,
        write_key: &[u8; 32],
        num_in: &[u8; NONCE_NUMIN_SIZE],
    ) -> Result<(), AtcaError> {
        let address = Zone::Data.address(slot, block, 0)?;
        let temp_key = self.nonce_with_host(num_in).await?;
        self.gen_dig(Zone::Data, write_key_id).await?;
        let temp_key = host::gen_dig(Zone::Data, write_key_id, write_key, &temp_key)?;

        let param1 = ZoneParam::for_access(Zone::Data, true, true).to_byte();
        let (ciphertext, mac) = host::write_auth(param1, address, plaintext, &temp_key)?;
        self.execute(&Command::Write(WriteParams {
            zone: Zone::Data,
            address,
            value: Bytes::copy_from_slice(&ciphertext),
            mac: Some(mac),
        }))
        .await?;
        Ok(())
    }
}

/// Read and unframe one response. Any failure leaves the link out of step,
/// so the next exchange starts with a fresh wake.
async fn receive_response<T: Transport>(transport: &mut T, size: usize) -> Result<Bytes, AtcaError> {
    let mut buffer = vec![0u8; size];
    let received = match transport.receive(&mut buffer).await {
        Ok(n) => n,
        Err(e) => {
            transport.desynchronize();
            return Err(e);
        }
    };
    match parse_response(&buffer[..received]) {
        Ok(data) => Ok(data),
        Err(e) => {
            transport.desynchronize();
            Err(e.into())
        }
    }
}
