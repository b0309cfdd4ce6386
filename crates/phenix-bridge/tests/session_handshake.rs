//! Two sessions wired back to back, no transport.

use std::time::{Duration, Instant};

use bytes::Bytes;
use phenix_bridge::{
    DisconnectReason, EventKind, FailureReason, PeerSession, SessionAction, SessionConfig,
    SessionError, SessionState,
};
use phenix_crypto::rotator::RotationConfig;
use phenix_protocol::codec::{encode_frame, FrameCodec};
use phenix_protocol::messages::{self, encode_payload, HandshakePayload, KeyExchangePayload};
use phenix_protocol::{CommandCode, Frame, FrameType, PROTOCOL_VERSION};
use proptest::prelude::*;

#[derive(Default)]
struct Outcome {
    events: Vec<EventKind>,
    closed: Option<DisconnectReason>,
}

fn split(actions: Vec<SessionAction>, outcome: &mut Outcome) -> Vec<Bytes> {
    let mut sent = Vec::new();
    for action in actions {
        match action {
            SessionAction::Send(bytes) => sent.push(bytes),
            SessionAction::Emit(kind) => outcome.events.push(kind),
            SessionAction::Close(reason) => outcome.closed = Some(reason),
        }
    }
    sent
}

fn deliver(to: &mut PeerSession, wire: Vec<Bytes>, now: Instant, outcome: &mut Outcome) -> Vec<Bytes> {
    let mut replies = Vec::new();
    for bytes in wire {
        replies.extend(split(to.handle_bytes(&bytes, now), outcome));
    }
    replies
}

/// Shuttle bytes both ways until neither side has anything left to send.
fn pump(
    a: &mut PeerSession,
    b: &mut PeerSession,
    mut to_b: Vec<Bytes>,
    mut to_a: Vec<Bytes>,
    now: Instant,
) -> (Outcome, Outcome) {
    let mut a_out = Outcome::default();
    let mut b_out = Outcome::default();
    for _ in 0..16 {
        if to_a.is_empty() && to_b.is_empty() {
            break;
        }
        let from_b = deliver(b, std::mem::take(&mut to_b), now, &mut b_out);
        let from_a = deliver(a, std::mem::take(&mut to_a), now, &mut a_out);
        to_a.extend(from_b);
        to_b.extend(from_a);
    }
    (a_out, b_out)
}

fn sessions(config: SessionConfig, now: Instant) -> (PeerSession, PeerSession) {
    (PeerSession::new(config.clone(), now), PeerSession::new(config, now))
}

fn establish(config: SessionConfig, now: Instant) -> (PeerSession, PeerSession) {
    let (mut a, mut b) = sessions(config, now);
    let mut scratch = Outcome::default();
    let to_b = split(a.open(now).unwrap(), &mut scratch);
    let to_a = split(b.open(now).unwrap(), &mut scratch);
    pump(&mut a, &mut b, to_b, to_a, now);
    assert_eq!(a.state(), SessionState::Secure);
    assert_eq!(b.state(), SessionState::Secure);
    (a, b)
}

fn frames(wire: &[Bytes]) -> Vec<Frame> {
    let mut codec = FrameCodec::default();
    wire.iter()
        .flat_map(|bytes| codec.feed(bytes).filter_map(Result::ok).collect::<Vec<_>>())
        .collect()
}

/// Re-encode an encrypted frame with one ciphertext byte flipped; the
/// checksum stays valid so only the AEAD tag catches it.
fn tamper(wire: &[Bytes]) -> Bytes {
    let frame = frames(wire)
        .into_iter()
        .find(|f| f.frame_type() == FrameType::EncryptedData)
        .unwrap();
    let mut payload = frame.payload().to_vec();
    let last = payload.len() - 1;
    payload[last] ^= 0x01;
    encode_frame(&Frame::new(FrameType::EncryptedData, payload).unwrap())
}

fn secure_message(from: &mut PeerSession, text: &str, now: Instant) -> Vec<Bytes> {
    split(from.send_message(text.as_bytes(), now).unwrap(), &mut Outcome::default())
}

#[test]
fn handshake_reaches_secure_with_matching_code() {
    let now = Instant::now();
    let (mut a, mut b) = sessions(SessionConfig::default(), now);
    let mut scratch = Outcome::default();
    let to_b = split(a.open(now).unwrap(), &mut scratch);
    let to_a = split(b.open(now).unwrap(), &mut scratch);

    let (a_out, b_out) = pump(&mut a, &mut b, to_b, to_a, now);

    for outcome in [&a_out, &b_out] {
        assert!(outcome.closed.is_none());
        assert!(matches!(outcome.events[0], EventKind::HandshakeReceived { .. }));
        assert!(outcome
            .events
            .iter()
            .any(|e| matches!(e, EventKind::SecureChannelEstablished { .. })));
    }
    match &a_out.events[0] {
        EventKind::HandshakeReceived { peer_fingerprint } => {
            assert_eq!(peer_fingerprint, &b.local_fingerprint())
        }
        _ => panic!("wrong variant"),
    }

    let code_a = a.session_code().unwrap();
    assert_eq!(Some(code_a), b.session_code());
    assert_eq!(code_a.len(), 16);
}

#[test]
fn secure_message_delivered() {
    let now = Instant::now();
    let (mut a, mut b) = establish(SessionConfig::default(), now);

    let wire = secure_message(&mut a, "hello device", now);
    let mut outcome = Outcome::default();
    let replies = deliver(&mut b, wire, now, &mut outcome);

    assert!(replies.is_empty());
    assert_eq!(
        outcome.events,
        vec![EventKind::MessageReceived {
            message: "hello device".into()
        }]
    );
}

#[test]
fn send_before_secure_is_rejected() {
    let now = Instant::now();
    let (mut a, _) = sessions(SessionConfig::default(), now);
    assert!(matches!(
        a.send_message(b"early", now),
        Err(SessionError::NotSecure(SessionState::Disconnected))
    ));
    a.open(now).unwrap();
    assert!(matches!(
        a.send_message(b"early", now),
        Err(SessionError::NotSecure(SessionState::Connecting))
    ));
    assert!(matches!(a.rekey(now), Err(SessionError::NotSecure(_))));
}

#[test]
fn plaintext_dropped_once_secure() {
    let now = Instant::now();
    let (_, mut b) = establish(SessionConfig::default(), now);

    let status = messages::status_frame(phenix_protocol::StatusCode::Busy, b"x").unwrap();
    let command = messages::command_frame(CommandCode::GetStatus, &[]).unwrap();
    let mut outcome = Outcome::default();
    let replies = deliver(
        &mut b,
        vec![encode_frame(&status), encode_frame(&command)],
        now,
        &mut outcome,
    );

    assert!(replies.is_empty());
    assert!(outcome.events.is_empty());
    assert_eq!(b.state(), SessionState::Secure);
}

#[test]
fn authentication_failures_fail_session_after_three() {
    let now = Instant::now();
    let (mut a, mut b) = establish(SessionConfig::default(), now);
    let mut outcome = Outcome::default();

    for expected in 1..=3u32 {
        let bad = tamper(&secure_message(&mut a, "ping", now));
        deliver(&mut b, vec![bad], now, &mut outcome);
        assert_eq!(
            outcome.events.last(),
            Some(&EventKind::AuthenticationFailure {
                consecutive: expected
            })
        );
        if expected < 3 {
            assert_eq!(b.state(), SessionState::Secure);
            assert!(outcome.closed.is_none());
        }
    }

    assert_eq!(b.state(), SessionState::Failed);
    assert_eq!(
        outcome.closed,
        Some(DisconnectReason::Failed(FailureReason::CryptoFailures))
    );
    assert!(b.session_code().is_none());
}

#[test]
fn good_frame_resets_failure_count() {
    let now = Instant::now();
    let (mut a, mut b) = establish(SessionConfig::default(), now);
    let mut outcome = Outcome::default();

    for _ in 0..2 {
        let bad = tamper(&secure_message(&mut a, "ping", now));
        deliver(&mut b, vec![bad], now, &mut outcome);
    }
    assert_eq!(b.crypto_failures(), 2);

    let good = secure_message(&mut a, "pong", now);
    deliver(&mut b, good, now, &mut outcome);
    assert_eq!(b.crypto_failures(), 0);

    let bad = tamper(&secure_message(&mut a, "ping", now));
    deliver(&mut b, vec![bad], now, &mut outcome);
    assert_eq!(
        outcome.events.last(),
        Some(&EventKind::AuthenticationFailure { consecutive: 1 })
    );
    assert_eq!(b.state(), SessionState::Secure);
}

#[test]
fn handshake_times_out() {
    let start = Instant::now();
    let (mut a, _) = sessions(SessionConfig::default(), start);
    a.open(start).unwrap();

    assert!(a.poll(start + Duration::from_secs(4)).is_empty());
    assert_eq!(a.state(), SessionState::Connecting);

    let actions = a.poll(start + Duration::from_secs(5));
    assert_eq!(
        actions,
        vec![SessionAction::Close(DisconnectReason::Failed(
            FailureReason::HandshakeTimeout
        ))]
    );
    assert_eq!(a.state(), SessionState::Failed);

    a.close();
    assert_eq!(a.state(), SessionState::Failed);
}

#[test]
fn version_mismatch_is_protocol_violation() {
    let now = Instant::now();
    let (mut a, _) = sessions(SessionConfig::default(), now);
    a.open(now).unwrap();

    let hello = HandshakePayload {
        version: PROTOCOL_VERSION + 1,
        nonce: [9u8; 32],
        kem_public_key: vec![0u8; 1184],
        ec_public_key: vec![0u8; 32],
    };
    let wire = encode_frame(&hello.to_frame().unwrap());
    let mut outcome = Outcome::default();
    deliver(&mut a, vec![wire], now, &mut outcome);

    assert_eq!(a.state(), SessionState::Failed);
    assert_eq!(
        outcome.closed,
        Some(DisconnectReason::Failed(FailureReason::ProtocolViolation))
    );
}

#[test]
fn reflected_handshake_counts_as_crypto_failure() {
    let now = Instant::now();
    let (mut a, _) = sessions(SessionConfig::default(), now);
    let own = split(a.open(now).unwrap(), &mut Outcome::default());

    let mut outcome = Outcome::default();
    let replies = deliver(&mut a, own, now, &mut outcome);

    assert!(replies.is_empty());
    assert_eq!(
        outcome.events,
        vec![EventKind::AuthenticationFailure { consecutive: 1 }]
    );
    assert_eq!(a.crypto_failures(), 1);
    assert_eq!(a.state(), SessionState::Connecting);
}

#[test]
fn unknown_key_exchange_surfaces_authentication_failures() {
    let now = Instant::now();
    let (mut a, mut b) = sessions(SessionConfig::default(), now);
    a.open(now).unwrap();
    let hello = split(b.open(now).unwrap(), &mut Outcome::default());
    deliver(&mut a, hello, now, &mut Outcome::default());
    assert_eq!(a.state(), SessionState::Connected);

    let stray = KeyExchangePayload {
        key_id: [0u8; 8],
        kem_ciphertext: vec![0u8; 1088],
        ephemeral_public_key: vec![9u8; 32],
        confirmation: vec![0u8; 32],
    };
    let wire = encode_frame(&stray.to_frame().unwrap());

    let mut outcome = Outcome::default();
    for _ in 0..3 {
        deliver(&mut a, vec![wire.clone()], now, &mut outcome);
    }

    assert_eq!(
        outcome.events,
        vec![
            EventKind::AuthenticationFailure { consecutive: 1 },
            EventKind::AuthenticationFailure { consecutive: 2 },
            EventKind::AuthenticationFailure { consecutive: 3 },
        ]
    );
    assert_eq!(a.state(), SessionState::Failed);
    assert_eq!(
        outcome.closed,
        Some(DisconnectReason::Failed(FailureReason::CryptoFailures))
    );
}

#[test]
fn encrypted_data_before_secure_is_dropped() {
    let now = Instant::now();
    // A well-formed EncryptedData frame sealed by an unrelated secure pair.
    let (mut x, _y) = establish(SessionConfig::default(), now);
    let sealed = secure_message(&mut x, "ping", now);

    let (mut a, mut b) = sessions(SessionConfig::default(), now);
    a.open(now).unwrap();
    let hello = split(b.open(now).unwrap(), &mut Outcome::default());

    let mut outcome = Outcome::default();
    let replies = deliver(&mut a, sealed.clone(), now, &mut outcome);
    assert!(replies.is_empty());
    assert!(outcome.events.is_empty());
    assert_eq!(a.state(), SessionState::Connecting);

    deliver(&mut a, hello, now, &mut Outcome::default());
    assert_eq!(a.state(), SessionState::Connected);

    let replies = deliver(&mut a, sealed, now, &mut outcome);
    assert!(replies.is_empty());
    assert!(!outcome
        .events
        .iter()
        .any(|e| matches!(e, EventKind::MessageReceived { .. })));
    assert_eq!(a.state(), SessionState::Connected);
    assert_eq!(a.crypto_failures(), 0);
}

#[test]
fn malformed_public_keys_exhaust_crypto_budget() {
    let now = Instant::now();
    let (mut a, _) = sessions(SessionConfig::default(), now);
    a.open(now).unwrap();

    let mut outcome = Outcome::default();
    for i in 0..3u8 {
        let hello = HandshakePayload {
            version: PROTOCOL_VERSION,
            nonce: [i + 1; 32],
            kem_public_key: vec![1u8; 100],
            ec_public_key: vec![2u8; 32],
        };
        let wire = encode_frame(&hello.to_frame().unwrap());
        deliver(&mut a, vec![wire], now, &mut outcome);
    }

    assert_eq!(a.state(), SessionState::Failed);
    assert_eq!(
        outcome.closed,
        Some(DisconnectReason::Failed(FailureReason::CryptoFailures))
    );
}

#[test]
fn framing_errors_exhaust_budget_during_handshake() {
    let now = Instant::now();
    let config = SessionConfig::default();
    let budget = config.max_framing_errors as usize;
    let (mut a, _) = sessions(config, now);
    a.open(now).unwrap();

    let frame = messages::command_frame(CommandCode::GetStatus, &[]).unwrap();
    let mut corrupt = encode_frame(&frame).to_vec();
    let checksum_at = corrupt.len() - 2;
    corrupt[checksum_at] = corrupt[checksum_at].wrapping_add(1);

    let mut outcome = Outcome::default();
    deliver(
        &mut a,
        vec![Bytes::from(corrupt.repeat(budget - 1))],
        now,
        &mut outcome,
    );
    assert_eq!(a.state(), SessionState::Connecting);
    assert_eq!(a.framing_stats().checksum_errors, (budget - 1) as u64);

    deliver(&mut a, vec![Bytes::from(corrupt)], now, &mut outcome);
    assert_eq!(a.state(), SessionState::Failed);
    assert_eq!(
        outcome.closed,
        Some(DisconnectReason::Failed(FailureReason::FramingErrors))
    );
}

#[test]
fn oversized_frame_is_skipped() {
    let now = Instant::now();
    let config = SessionConfig {
        max_payload_len: 4096,
        buffer_capacity: 4096 + 6,
        ..SessionConfig::default()
    };
    let (mut a, _) = sessions(config, now);
    a.open(now).unwrap();

    // Declares 0x2000 bytes of payload, then a valid GetStatus.
    let mut stream = vec![0xAA, 0x03, 0x00, 0x20];
    let command = messages::command_frame(CommandCode::GetStatus, &[]).unwrap();
    stream.extend_from_slice(&encode_frame(&command));

    let mut outcome = Outcome::default();
    let replies = deliver(&mut a, vec![Bytes::from(stream)], now, &mut outcome);
    assert!(outcome.closed.is_none());
    assert_eq!(a.state(), SessionState::Connecting);
    assert_eq!(a.framing_stats().oversized, 1);
    assert_eq!(frames(&replies)[0].payload().as_ref(), &[0x10, 0x21]);
}

#[test]
fn rekey_reestablishes_with_new_keys() {
    let now = Instant::now();
    let (mut a, mut b) = establish(SessionConfig::default(), now);
    let old_code = a.session_code().unwrap().to_owned();
    let old_fingerprint = a.local_fingerprint();
    let b_fingerprint = b.local_fingerprint();

    let to_b = split(a.rekey(now).unwrap(), &mut Outcome::default());
    assert_eq!(a.state(), SessionState::Connecting);
    assert!(a.session_code().is_none());

    let (a_out, b_out) = pump(&mut a, &mut b, to_b, Vec::new(), now);
    assert!(a_out.closed.is_none() && b_out.closed.is_none());
    assert_eq!(a.state(), SessionState::Secure);
    assert_eq!(b.state(), SessionState::Secure);

    let new_code = a.session_code().unwrap();
    assert_eq!(Some(new_code), b.session_code());
    assert_ne!(new_code, old_code);
    assert_ne!(a.local_fingerprint(), old_fingerprint);
    assert_eq!(b.local_fingerprint(), b_fingerprint);

    let wire = secure_message(&mut b, "after rekey", now);
    let mut outcome = Outcome::default();
    deliver(&mut a, wire, now, &mut outcome);
    assert_eq!(
        outcome.events,
        vec![EventKind::MessageReceived {
            message: "after rekey".into()
        }]
    );
}

#[test]
fn poll_rotates_keys_when_due() {
    let start = Instant::now();
    let config = SessionConfig {
        rotation: RotationConfig {
            interval: Duration::from_secs(1),
            ..RotationConfig::default()
        },
        ..SessionConfig::default()
    };
    let (mut a, mut b) = establish(config, start);
    let fingerprint = a.local_fingerprint();

    let later = start + Duration::from_millis(1100);
    let to_b = split(a.poll(later), &mut Outcome::default());
    assert_eq!(a.state(), SessionState::Connecting);
    assert_ne!(a.local_fingerprint(), fingerprint);

    pump(&mut a, &mut b, to_b, Vec::new(), later);
    assert_eq!(a.state(), SessionState::Secure);
    assert_eq!(a.session_code(), b.session_code());
}

#[test]
fn encrypted_get_status_answers_secure() {
    let now = Instant::now();
    let (mut a, mut b) = establish(SessionConfig::default(), now);

    let to_b = split(
        a.send_command(CommandCode::GetStatus, &[], now).unwrap(),
        &mut Outcome::default(),
    );
    // Requests and replies travel encrypted.
    assert!(frames(&to_b)
        .iter()
        .all(|f| f.frame_type() == FrameType::EncryptedData));

    let (a_out, _) = pump(&mut a, &mut b, to_b, Vec::new(), now);
    assert_eq!(
        a_out.events,
        vec![EventKind::CommandResponse {
            code: 0x10,
            data: vec![0x23]
        }]
    );
}

#[test]
fn plain_command_during_handshake() {
    let now = Instant::now();
    let (mut a, mut b) = sessions(SessionConfig::default(), now);
    a.open(now).unwrap();
    b.open(now).unwrap();

    let to_b = split(
        a.send_command(CommandCode::GetStatus, &[], now).unwrap(),
        &mut Outcome::default(),
    );
    assert_eq!(frames(&to_b)[0].frame_type(), FrameType::Command);

    let mut b_out = Outcome::default();
    let replies = deliver(&mut b, to_b, now, &mut b_out);
    let mut a_out = Outcome::default();
    deliver(&mut a, replies, now, &mut a_out);
    assert_eq!(
        a_out.events,
        vec![EventKind::CommandResponse {
            code: 0x10,
            data: vec![0x21]
        }]
    );
}

#[test]
fn peer_restart_restarts_handshake() {
    let now = Instant::now();
    let (mut a, mut b) = sessions(SessionConfig::default(), now);
    let first_hello = split(a.open(now).unwrap(), &mut Outcome::default());
    b.open(now).unwrap();

    deliver(&mut b, first_hello, now, &mut Outcome::default());
    assert_eq!(b.state(), SessionState::Connected);

    // The device side comes back with a fresh session.
    let mut a2 = PeerSession::new(SessionConfig::default(), now);
    let second_hello = split(a2.open(now).unwrap(), &mut Outcome::default());
    let mut b_out = Outcome::default();
    let to_a2 = deliver(&mut b, second_hello, now, &mut b_out);
    assert!(matches!(
        b_out.events.as_slice(),
        [EventKind::HandshakeReceived { .. }]
    ));

    pump(&mut a2, &mut b, Vec::new(), to_a2, now);
    assert_eq!(a2.state(), SessionState::Secure);
    assert_eq!(b.state(), SessionState::Secure);
    assert_eq!(a2.session_code(), b.session_code());
}

#[test]
fn arbitrary_bytes_never_panic() {
    proptest!(ProptestConfig::with_cases(64), |(chunks in prop::collection::vec(
        prop::collection::vec(any::<u8>(), 0..256),
        0..8,
    ))| {
        let now = Instant::now();
        let mut session = PeerSession::new(SessionConfig::default(), now);
        session.open(now).unwrap();
        for chunk in &chunks {
            session.handle_bytes(chunk, now);
        }
        prop_assert!(session.state() != SessionState::Secure);
        prop_assert!(session.framing_stats().discarded_bytes <= chunks.iter().map(|c| c.len() as u64).sum::<u64>());
    });
}

#[test]
fn structured_payload_garbage_is_recoverable() {
    let now = Instant::now();
    let (mut a, _) = sessions(SessionConfig::default(), now);
    a.open(now).unwrap();

    let junk = Frame::new(FrameType::Handshake, encode_payload(&7u8).unwrap()).unwrap();
    let mut outcome = Outcome::default();
    deliver(&mut a, vec![encode_frame(&junk)], now, &mut outcome);
    assert_eq!(a.state(), SessionState::Connecting);
    assert!(outcome.closed.is_none());
}
