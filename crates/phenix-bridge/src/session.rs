//! Per-device session state machine.
//!
//! Sans-IO: bytes go in through [`PeerSession::handle_bytes`], time through
//! the `now` arguments, and everything the session wants done comes back as
//! [`SessionAction`]s for the caller to execute.
//!
//! ```text
//! Disconnected --open--> Connecting --Handshake--> Connected --KeyExchange--> Secure
//!                             ^                                                  |
//!                             +---------------- rekey / peer Rekey -------------+
//! any open state --timeout / failure budget / version mismatch--> Failed
//! ```

use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use phenix_crypto::aead::{self, Sealed};
use phenix_crypto::hybrid::{encapsulate, HybridCiphertext, HybridPublicKey, HybridSharedSecret};
use phenix_crypto::kdf::{derive_session_keys, SessionKeys};
use phenix_crypto::rotator::{KeyRotator, RotationConfig};
use phenix_crypto::CryptoError;
use phenix_protocol::codec::{FrameCodec, FramingStats, DEFAULT_BUFFER_CAPACITY, MAX_PAYLOAD_LEN};
use phenix_protocol::messages::{
    self, decode_payload, encode_payload, HandshakePayload, KeyExchangePayload, SecureRecord,
    HANDSHAKE_NONCE_LEN, PROTOCOL_VERSION,
};
use phenix_protocol::{CommandCode, Frame, FrameType, ProtocolError, StatusCode};

use crate::events::{DisconnectReason, EventKind, FailureReason};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CRYPTO_FAILURES: u32 = 3;
pub const DEFAULT_MAX_FRAMING_ERRORS: u32 = 16;

/// AAD bound into every EncryptedData payload.
const ENCRYPTED_AAD: [u8; 1] = [FrameType::EncryptedData as u8];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Secure,
    Failed,
}

impl SessionState {
    /// Status byte reported in answer to GetStatus.
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::Disconnected => StatusCode::Ready,
            Self::Connecting | Self::Connected => StatusCode::Busy,
            Self::Secure => StatusCode::Secure,
            Self::Failed => StatusCode::Error,
        }
    }

    fn is_open(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Secure)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Connecting/Connected longer than this fails the session.
    pub handshake_timeout: Duration,
    /// Consecutive decapsulation or AEAD failures before Failed.
    pub max_crypto_failures: u32,
    /// Consecutive framing errors before Failed (not counted once Secure).
    pub max_framing_errors: u32,
    pub max_payload_len: usize,
    pub buffer_capacity: usize,
    pub rotation: RotationConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_crypto_failures: DEFAULT_MAX_CRYPTO_FAILURES,
            max_framing_errors: DEFAULT_MAX_FRAMING_ERRORS,
            max_payload_len: MAX_PAYLOAD_LEN,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            rotation: RotationConfig::default(),
        }
    }
}

/// Side effects requested by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Encoded frame for the transport.
    Send(Bytes),
    Emit(EventKind),
    /// Session is over; the owner should drop it.
    Close(DisconnectReason),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is not secure (state: {0:?})")]
    NotSecure(SessionState),

    #[error("cannot {op} in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

struct PeerHello {
    nonce: [u8; HANDSHAKE_NONCE_LEN],
    public_key: HybridPublicKey,
}

/// Key exchange in progress. Dropping it zeroizes both secrets.
struct Handshake {
    local_nonce: [u8; HANDSHAKE_NONCE_LEN],
    started: Instant,
    peer: Option<PeerHello>,
    outbound: Option<HybridSharedSecret>,
    inbound: Option<HybridSharedSecret>,
}

impl Handshake {
    fn new(now: Instant) -> Self {
        let mut local_nonce = [0u8; HANDSHAKE_NONCE_LEN];
        rand::thread_rng().fill(&mut local_nonce);
        Self {
            local_nonce,
            started: now,
            peer: None,
            outbound: None,
            inbound: None,
        }
    }
}

pub struct PeerSession {
    state: SessionState,
    config: SessionConfig,
    codec: FrameCodec,
    rotator: KeyRotator,
    handshake: Option<Handshake>,
    keys: Option<SessionKeys>,
    crypto_failures: u32,
    framing_errors: u32,
    last_activity: Instant,
}

impl PeerSession {
    pub fn new(config: SessionConfig, now: Instant) -> Self {
        let codec = FrameCodec::new(config.max_payload_len, config.buffer_capacity);
        let rotator = KeyRotator::new(config.rotation, now);
        Self {
            state: SessionState::Disconnected,
            config,
            codec,
            rotator,
            handshake: None,
            keys: None,
            crypto_failures: 0,
            framing_errors: 0,
            last_activity: now,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn local_fingerprint(&self) -> String {
        self.rotator.current().fingerprint()
    }

    /// Short authentication string of the current Secure session.
    pub fn session_code(&self) -> Option<&str> {
        self.keys.as_ref().map(SessionKeys::session_code)
    }

    pub fn framing_stats(&self) -> FramingStats {
        self.codec.stats()
    }

    pub fn crypto_failures(&self) -> u32 {
        self.crypto_failures
    }

    /// Start the handshake: Disconnected -> Connecting.
    pub fn open(&mut self, now: Instant) -> Result<Vec<SessionAction>, SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(SessionError::InvalidState {
                op: "open",
                state: self.state,
            });
        }
        let mut actions = Vec::new();
        self.restart_handshake(now, &mut actions)?;
        Ok(actions)
    }

    /// Feed transport bytes. Never fails: every problem becomes logging,
    /// an event, or a `Close` action.
    pub fn handle_bytes(&mut self, data: &[u8], now: Instant) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if !self.state.is_open() {
            debug!(state = ?self.state, len = data.len(), "dropping bytes for closed session");
            return actions;
        }

        let results: Vec<_> = self.codec.feed(data).collect();
        for result in results {
            match result {
                Ok(frame) => {
                    self.last_activity = now;
                    self.framing_errors = 0;
                    self.handle_frame(frame, now, &mut actions);
                }
                Err(e) => self.record_framing_error(&e, &mut actions),
            }
            if !self.state.is_open() {
                break;
            }
        }
        actions
    }

    /// Send an application message. Secure only.
    pub fn send_message(
        &mut self,
        message: &[u8],
        now: Instant,
    ) -> Result<Vec<SessionAction>, SessionError> {
        if self.state != SessionState::Secure {
            return Err(SessionError::NotSecure(self.state));
        }
        let bytes = self.seal(&SecureRecord::Message(message.to_vec()))?;
        self.last_activity = now;
        Ok(vec![SessionAction::Send(bytes)])
    }

    /// Send a device command: encrypted once Secure, plaintext during the
    /// handshake.
    pub fn send_command(
        &mut self,
        code: CommandCode,
        data: &[u8],
        now: Instant,
    ) -> Result<Vec<SessionAction>, SessionError> {
        let bytes = match self.state {
            SessionState::Secure => self.seal(&SecureRecord::command(code, data))?,
            SessionState::Connecting | SessionState::Connected => {
                self.codec.encode(&messages::command_frame(code, data)?)?
            }
            state => {
                return Err(SessionError::InvalidState {
                    op: "send a command",
                    state,
                })
            }
        };
        self.last_activity = now;
        Ok(vec![SessionAction::Send(bytes)])
    }

    /// Rotate the local keypair and re-run the key exchange.
    ///
    /// The peer is told through an encrypted Rekey command first, so a
    /// plaintext Handshake can never tear down a Secure session.
    pub fn rekey(&mut self, now: Instant) -> Result<Vec<SessionAction>, SessionError> {
        if self.state != SessionState::Secure {
            return Err(SessionError::NotSecure(self.state));
        }
        let notice = self.seal(&SecureRecord::command(CommandCode::Rekey, Vec::new()))?;
        let mut actions = vec![SessionAction::Send(notice)];
        self.rotator.rotate(now);
        self.restart_handshake(now, &mut actions)?;
        Ok(actions)
    }

    /// Timer input: handshake timeout, key history pruning, due rotation.
    pub fn poll(&mut self, now: Instant) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        self.rotator.prune(now);

        match self.state {
            SessionState::Connecting | SessionState::Connected => {
                let expired = self.handshake.as_ref().is_some_and(|hs| {
                    now.saturating_duration_since(hs.started) >= self.config.handshake_timeout
                });
                if expired {
                    warn!(state = ?self.state, "handshake timed out");
                    self.fail(FailureReason::HandshakeTimeout, &mut actions);
                }
            }
            SessionState::Secure if self.rotator.should_rotate(now) => {
                info!("key rotation due, rekeying");
                match self.rekey(now) {
                    Ok(rekey) => actions.extend(rekey),
                    Err(e) => self.on_error(e, &mut actions),
                }
            }
            _ => {}
        }
        actions
    }

    /// Drop all session secrets. Failed stays Failed; anything else becomes
    /// Disconnected.
    pub fn close(&mut self) {
        self.keys = None;
        self.handshake = None;
        self.codec.reset();
        if self.state != SessionState::Failed {
            self.set_state(SessionState::Disconnected);
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "session state change");
            self.state = next;
        }
    }

    fn fail(&mut self, reason: FailureReason, actions: &mut Vec<SessionAction>) {
        warn!(?reason, state = ?self.state, "session failed");
        self.keys = None;
        self.handshake = None;
        self.set_state(SessionState::Failed);
        actions.push(SessionAction::Close(DisconnectReason::Failed(reason)));
    }

    fn restart_handshake(
        &mut self,
        now: Instant,
        actions: &mut Vec<SessionAction>,
    ) -> Result<(), SessionError> {
        self.keys = None;
        self.crypto_failures = 0;
        self.framing_errors = 0;

        let handshake = Handshake::new(now);
        let frame = self.handshake_frame(&handshake.local_nonce)?;
        self.handshake = Some(handshake);
        self.set_state(SessionState::Connecting);
        actions.push(SessionAction::Send(frame));
        Ok(())
    }

    fn handshake_frame(&self, nonce: &[u8; HANDSHAKE_NONCE_LEN]) -> Result<Bytes, SessionError> {
        let public = self.rotator.current().public_key_ref();
        let payload = HandshakePayload {
            version: PROTOCOL_VERSION,
            nonce: *nonce,
            kem_public_key: public.kem_bytes().to_vec(),
            ec_public_key: public.ec_bytes().to_vec(),
        };
        Ok(self.codec.encode(&payload.to_frame()?)?)
    }

    fn handshake_mut(&mut self) -> Result<&mut Handshake, SessionError> {
        let state = self.state;
        self.handshake.as_mut().ok_or(SessionError::InvalidState {
            op: "continue the handshake",
            state,
        })
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant, actions: &mut Vec<SessionAction>) {
        let result = match (self.state, frame.frame_type()) {
            (SessionState::Secure, FrameType::EncryptedData) => {
                self.on_encrypted(&frame, now, actions)
            }
            (SessionState::Secure, other) => {
                warn!(frame_type = other.name(), "plaintext frame on secure session, dropped");
                Ok(())
            }
            (_, FrameType::Handshake) => self.on_handshake(&frame, now, actions),
            (SessionState::Connected, FrameType::KeyExchange) => {
                self.on_key_exchange(&frame, actions)
            }
            (_, FrameType::Command) => self.on_plain_command(&frame, now, actions),
            (_, FrameType::Response) => self.on_plain_response(&frame, actions),
            (_, FrameType::StatusUpdate) => self.on_plain_status(&frame, actions),
            (state, other) => {
                warn!(?state, frame_type = other.name(), "unexpected frame, dropped");
                Ok(())
            }
        };

        if let Err(e) = result {
            self.on_error(e, actions);
        }
    }

    fn on_error(&mut self, error: SessionError, actions: &mut Vec<SessionAction>) {
        match error {
            SessionError::Protocol(e) if e.is_fatal() => {
                warn!(error = %e, "fatal protocol error");
                self.fail(FailureReason::ProtocolViolation, actions);
            }
            SessionError::Protocol(e) => self.record_framing_error(&e, actions),
            SessionError::Crypto(e) => self.record_crypto_failure(&e, actions),
            other => warn!(error = %other, "dropped frame"),
        }
    }

    fn record_framing_error(&mut self, error: &ProtocolError, actions: &mut Vec<SessionAction>) {
        debug!(error = %error, "recoverable framing error");
        if !matches!(self.state, SessionState::Connecting | SessionState::Connected) {
            return;
        }
        self.framing_errors += 1;
        if self.framing_errors >= self.config.max_framing_errors {
            warn!(count = self.framing_errors, "framing error budget exhausted");
            self.fail(FailureReason::FramingErrors, actions);
        }
    }

    /// Every decapsulation or AEAD failure is surfaced; the budget decides
    /// whether the session survives it.
    fn record_crypto_failure(&mut self, error: &CryptoError, actions: &mut Vec<SessionAction>) {
        self.crypto_failures += 1;
        let consecutive = self.crypto_failures;
        warn!(error = %error, consecutive, "crypto failure");
        actions.push(SessionAction::Emit(EventKind::AuthenticationFailure { consecutive }));
        if consecutive >= self.config.max_crypto_failures {
            self.fail(FailureReason::CryptoFailures, actions);
        }
    }

    fn on_handshake(
        &mut self,
        frame: &Frame,
        now: Instant,
        actions: &mut Vec<SessionAction>,
    ) -> Result<(), SessionError> {
        let hello: HandshakePayload = decode_payload(frame.payload())?;
        hello.check_version()?;
        let public_key = HybridPublicKey::from_bytes(&hello.kem_public_key, &hello.ec_public_key)?;

        let handshake = self.handshake_mut()?;
        if hello.nonce == handshake.local_nonce {
            return Err(CryptoError::ReflectedHandshake.into());
        }
        let known_peer = handshake.peer.as_ref().map(|peer| peer.nonce);
        match known_peer {
            Some(nonce) if nonce == hello.nonce => {
                debug!("duplicate handshake ignored");
                return Ok(());
            }
            Some(_) => {
                info!("peer restarted the handshake");
                self.restart_handshake(now, actions)?;
            }
            None => {}
        }

        actions.push(SessionAction::Emit(EventKind::HandshakeReceived {
            peer_fingerprint: public_key.fingerprint(),
        }));

        let (ciphertext, outbound) = encapsulate(&public_key)?;
        let payload = KeyExchangePayload {
            key_id: ciphertext.key_id(),
            kem_ciphertext: ciphertext.kem_ciphertext().to_vec(),
            ephemeral_public_key: ciphertext.ephemeral_public_key().to_vec(),
            confirmation: ciphertext.confirmation().to_vec(),
        };
        let bytes = self.codec.encode(&payload.to_frame()?)?;

        let handshake = self.handshake_mut()?;
        handshake.peer = Some(PeerHello {
            nonce: hello.nonce,
            public_key,
        });
        handshake.outbound = Some(outbound);
        self.set_state(SessionState::Connected);
        actions.push(SessionAction::Send(bytes));
        self.try_complete(actions)
    }

    fn on_key_exchange(
        &mut self,
        frame: &Frame,
        actions: &mut Vec<SessionAction>,
    ) -> Result<(), SessionError> {
        let payload: KeyExchangePayload = decode_payload(frame.payload())?;
        let ciphertext = HybridCiphertext::from_parts(
            payload.key_id,
            &payload.kem_ciphertext,
            &payload.ephemeral_public_key,
            &payload.confirmation,
        )?;
        let inbound = self.rotator.decapsulate(&ciphertext)?;
        self.crypto_failures = 0;
        self.handshake_mut()?.inbound = Some(inbound);
        self.try_complete(actions)
    }

    /// Connected -> Secure once both directions' secrets exist.
    fn try_complete(&mut self, actions: &mut Vec<SessionAction>) -> Result<(), SessionError> {
        let Some(hs) = self.handshake.as_ref() else {
            return Ok(());
        };
        let (Some(peer), Some(outbound), Some(inbound)) = (&hs.peer, &hs.outbound, &hs.inbound)
        else {
            return Ok(());
        };

        let keys = derive_session_keys(&hs.local_nonce, &peer.nonce, outbound, inbound)?;
        let session_code = keys.session_code().to_owned();
        self.keys = Some(keys);
        self.handshake = None;
        self.crypto_failures = 0;
        self.set_state(SessionState::Secure);
        info!(%session_code, "secure channel established");
        actions.push(SessionAction::Emit(EventKind::SecureChannelEstablished {
            session_code,
        }));
        Ok(())
    }

    fn on_encrypted(
        &mut self,
        frame: &Frame,
        now: Instant,
        actions: &mut Vec<SessionAction>,
    ) -> Result<(), SessionError> {
        let keys = self
            .keys
            .as_ref()
            .ok_or(SessionError::NotSecure(self.state))?;
        let opened = Sealed::from_bytes(frame.payload())
            .and_then(|sealed| sealed.open(keys.encryption_key(), &ENCRYPTED_AAD));

        let plaintext = match opened {
            Ok(plaintext) => plaintext,
            Err(e) => {
                self.record_crypto_failure(&e, actions);
                return Ok(());
            }
        };
        self.crypto_failures = 0;

        match decode_payload::<SecureRecord>(&plaintext)? {
            SecureRecord::Message(message) => {
                actions.push(SessionAction::Emit(EventKind::MessageReceived {
                    message: String::from_utf8_lossy(&message).into_owned(),
                }));
            }
            SecureRecord::Command { code, data } => {
                self.on_command(code, &data, true, now, actions)?;
            }
            SecureRecord::Response { code, data } => {
                actions.push(SessionAction::Emit(EventKind::CommandResponse { code, data }));
            }
            SecureRecord::Status { code, data } => {
                let status = StatusCode::from_byte(code)?;
                actions.push(SessionAction::Emit(EventKind::StatusUpdate {
                    status: status.as_byte(),
                    data,
                }));
            }
        }
        Ok(())
    }

    fn on_plain_command(
        &mut self,
        frame: &Frame,
        now: Instant,
        actions: &mut Vec<SessionAction>,
    ) -> Result<(), SessionError> {
        let (code, data) = frame.split_code()?;
        self.on_command(code, data, false, now, actions)
    }

    fn on_plain_response(
        &mut self,
        frame: &Frame,
        actions: &mut Vec<SessionAction>,
    ) -> Result<(), SessionError> {
        let (code, data) = frame.split_code()?;
        actions.push(SessionAction::Emit(EventKind::CommandResponse {
            code,
            data: data.to_vec(),
        }));
        Ok(())
    }

    fn on_plain_status(
        &mut self,
        frame: &Frame,
        actions: &mut Vec<SessionAction>,
    ) -> Result<(), SessionError> {
        let (code, data) = frame.split_code()?;
        let status = StatusCode::from_byte(code)?;
        actions.push(SessionAction::Emit(EventKind::StatusUpdate {
            status: status.as_byte(),
            data: data.to_vec(),
        }));
        Ok(())
    }

    fn on_command(
        &mut self,
        code: u8,
        data: &[u8],
        encrypted: bool,
        now: Instant,
        actions: &mut Vec<SessionAction>,
    ) -> Result<(), SessionError> {
        let error = [StatusCode::Error.as_byte()];
        let command = match CommandCode::from_byte(code) {
            Ok(command) => command,
            Err(e) => {
                debug!(error = %e, "rejecting command");
                return self.respond(code, &error, actions);
            }
        };

        match command {
            CommandCode::GetStatus => {
                let status = [self.state.status_code().as_byte()];
                self.respond(code, &status, actions)
            }
            CommandCode::SendMessage if encrypted => {
                actions.push(SessionAction::Emit(EventKind::MessageReceived {
                    message: String::from_utf8_lossy(data).into_owned(),
                }));
                Ok(())
            }
            CommandCode::Rekey if encrypted => {
                info!("peer requested rekey");
                self.restart_handshake(now, actions)
            }
            CommandCode::SendMessage | CommandCode::Rekey => {
                warn!(?command, "command requires a secure channel");
                self.respond(code, &error, actions)
            }
            CommandCode::Reset => {
                info!("peer requested reset");
                self.restart_handshake(now, actions)
            }
        }
    }

    fn respond(
        &mut self,
        code: u8,
        data: &[u8],
        actions: &mut Vec<SessionAction>,
    ) -> Result<(), SessionError> {
        let bytes = if self.state == SessionState::Secure {
            self.seal(&SecureRecord::Response {
                code,
                data: data.to_vec(),
            })?
        } else {
            self.codec.encode(&messages::response_frame(code, data)?)?
        };
        actions.push(SessionAction::Send(bytes));
        Ok(())
    }

    fn seal(&self, record: &SecureRecord) -> Result<Bytes, SessionError> {
        let keys = self
            .keys
            .as_ref()
            .ok_or(SessionError::NotSecure(self.state))?;
        let plaintext = encode_payload(record)?;
        let sealed = aead::encrypt(&plaintext, keys.encryption_key(), &ENCRYPTED_AAD)?;
        let frame = Frame::new(FrameType::EncryptedData, sealed.to_bytes())?;
        Ok(self.codec.encode(&frame)?)
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("state", &self.state)
            .field("fingerprint", &self.local_fingerprint())
            .field("crypto_failures", &self.crypto_failures)
            .field("framing_errors", &self.framing_errors)
            .finish_non_exhaustive()
    }
}
