// Copyright (c) 2026 Stickytun Contributors. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Transport sessions for the per-peer crypto state.
//!
//! Sessions are derived from the two static x25519 identities (and an
//! optional preshared key), so a session exists for a peer as soon as both
//! keys are known. A change of the local private key rebuilds every session
//! with fresh keys, counters and replay windows.
//!
//! Inbound datagrams carry a 32-bit receiver token in the clear; the device
//! uses it to find the owning peer before touching any AEAD state. Tokens
//! are derived from the (receiver, sender) key pair, so both sides compute
//! the same value independently.

use blake2::{Blake2s256, Digest};
use bytes::BytesMut;
use parking_lot::Mutex;
use ring::aead::{Aad, CHACHA20_POLY1305, LessSafeKey, Nonce, UnboundKey};
use std::sync::atomic::{AtomicU64, Ordering};
use zerocopy::{IntoBytes, little_endian};

use crate::packet::{DATA_KIND, DataHeader};
use crate::x25519::{PublicKey, StaticSecret};

const LABEL_KEY: &[u8] = b"stickytun key v1";
const LABEL_TOKEN: &[u8] = b"stickytun token v1";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("replayed or expired nonce counter")]
    InvalidCounter,
    #[error("AEAD tag verification failed")]
    InvalidTag,
}

/// Keys and counters for one direction-split peer session.
pub struct Session {
    local_token: u32,
    remote_token: u32,
    sender: LessSafeKey,
    receiver: LessSafeKey,
    sending_counter: AtomicU64,
    receiving_counter: Mutex<ReceivingCounterValidator>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Session: {}<- ->{}", self.local_token, self.remote_token)
    }
}

/// Token a sender must put on the wire so that `receiver_public` can route
/// the datagram back to the right peer.
pub fn receiver_token(receiver_public: &PublicKey, sender_public: &PublicKey) -> u32 {
    let digest = Blake2s256::new()
        .chain_update(LABEL_TOKEN)
        .chain_update(receiver_public.as_bytes())
        .chain_update(sender_public.as_bytes())
        .finalize();
    u32::from_le_bytes(digest[..4].try_into().expect("digest is 32 bytes"))
}

fn derive_key(chain: &[u8; 32], discriminator: u8) -> [u8; 32] {
    Blake2s256::new()
        .chain_update(chain)
        .chain_update([discriminator])
        .finalize()
        .into()
}

impl Session {
    /// Derive the session shared between `local` and `remote_public`.
    ///
    /// Both directions get distinct keys; which side uses which is decided
    /// by comparing the raw public keys, so the two ends agree without any
    /// negotiation.
    pub fn derive(
        local: &StaticSecret,
        local_public: &PublicKey,
        remote_public: &PublicKey,
        preshared_key: Option<&[u8; 32]>,
    ) -> Session {
        let shared = local.diffie_hellman(remote_public);
        let chain: [u8; 32] = Blake2s256::new()
            .chain_update(LABEL_KEY)
            .chain_update(shared.as_bytes())
            .chain_update(preshared_key.unwrap_or(&[0u8; 32]))
            .finalize()
            .into();

        let lesser = derive_key(&chain, 1);
        let greater = derive_key(&chain, 2);
        let (sending_key, receiving_key) = if local_public.as_bytes() < remote_public.as_bytes() {
            (lesser, greater)
        } else {
            (greater, lesser)
        };

        Session {
            local_token: receiver_token(local_public, remote_public),
            remote_token: receiver_token(remote_public, local_public),
            sender: LessSafeKey::new(
                UnboundKey::new(&CHACHA20_POLY1305, &sending_key).expect("32-byte chacha key"),
            ),
            receiver: LessSafeKey::new(
                UnboundKey::new(&CHACHA20_POLY1305, &receiving_key).expect("32-byte chacha key"),
            ),
            sending_counter: AtomicU64::new(0),
            receiving_counter: Mutex::new(Default::default()),
        }
    }

    /// Token under which inbound datagrams for this session arrive.
    pub fn local_token(&self) -> u32 {
        self.local_token
    }

    /// Encapsulate `payload` into a full outer datagram. An empty payload
    /// produces a keepalive.
    pub fn encrypt(&self, payload: &[u8]) -> BytesMut {
        let counter = self.sending_counter.fetch_add(1, Ordering::Relaxed);

        let mut buf = BytesMut::zeroed(DataHeader::OVERHEAD + payload.len());
        let (header, body) = buf.split_at_mut(DataHeader::LEN);
        header.copy_from_slice(
            DataHeader {
                kind: DATA_KIND,
                reserved: [0; 3],
                receiver_token: little_endian::U32::new(self.remote_token),
                counter: little_endian::U64::new(counter),
            }
            .as_bytes(),
        );

        let (ciphertext, tag_out) = body.split_at_mut(payload.len());
        ciphertext.copy_from_slice(payload);
        let tag = self
            .sender
            .seal_in_place_separate_tag(nonce(counter), Aad::empty(), ciphertext)
            .expect("encryption must succeed");
        tag_out.copy_from_slice(tag.as_ref());

        buf
    }

    /// Decapsulate the body of a datagram addressed to this session.
    ///
    /// `body` is ciphertext followed by the tag, as split off by
    /// [`parse_data`](crate::packet::parse_data). The counter is checked
    /// against the replay window before decryption and marked after.
    pub fn decrypt(&self, counter: u64, body: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.receiving_counter.lock().will_accept(counter)?;

        let mut buf = body.to_vec();
        let plaintext_len = self
            .receiver
            .open_in_place(nonce(counter), Aad::empty(), &mut buf)
            .map_err(|_| SessionError::InvalidTag)?
            .len();
        buf.truncate(plaintext_len);

        self.receiving_counter.lock().mark_did_receive(counter)?;
        Ok(buf)
    }
}

fn nonce(counter: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    Nonce::assume_unique_for_key(nonce)
}

// Receiving window constants
const WORD_SIZE: u64 = 64;
const N_WORDS: u64 = 16; // suffices to reorder 64*16 = 1024 packets
const N_BITS: u64 = WORD_SIZE * N_WORDS;

/// Sliding bitmap over received nonce counters: rejects replays while
/// tolerating reordering within the window.
#[derive(Debug, Clone, Default)]
struct ReceivingCounterValidator {
    next: u64,
    bitmap: [u64; N_WORDS as usize],
}

impl ReceivingCounterValidator {
    #[inline(always)]
    fn set_bit(&mut self, idx: u64) {
        let bit_idx = idx % N_BITS;
        self.bitmap[(bit_idx / WORD_SIZE) as usize] |= 1 << (bit_idx % WORD_SIZE);
    }

    #[inline(always)]
    fn clear_bit(&mut self, idx: u64) {
        let bit_idx = idx % N_BITS;
        self.bitmap[(bit_idx / WORD_SIZE) as usize] &= !(1u64 << (bit_idx % WORD_SIZE));
    }

    #[inline(always)]
    fn check_bit(&self, idx: u64) -> bool {
        let bit_idx = idx % N_BITS;
        (self.bitmap[(bit_idx / WORD_SIZE) as usize] >> (bit_idx % WORD_SIZE)) & 1 == 1
    }

    /// Accept a counter that was not yet received and is not too far back.
    fn will_accept(&self, counter: u64) -> Result<(), SessionError> {
        if counter >= self.next {
            return Ok(());
        }
        if counter + N_BITS < self.next {
            return Err(SessionError::InvalidCounter);
        }
        if self.check_bit(counter) {
            return Err(SessionError::InvalidCounter);
        }
        Ok(())
    }

    fn mark_did_receive(&mut self, counter: u64) -> Result<(), SessionError> {
        if counter + N_BITS < self.next {
            return Err(SessionError::InvalidCounter);
        }
        if counter < self.next {
            // out of order within the window
            if self.check_bit(counter) {
                return Err(SessionError::InvalidCounter);
            }
            self.set_bit(counter);
            return Ok(());
        }

        // counter >= next: clear the skipped range, then mark
        if counter - self.next >= N_BITS {
            self.bitmap = [0; N_WORDS as usize];
        } else {
            let mut i = self.next;
            while i < counter {
                self.clear_bit(i);
                i += 1;
            }
        }
        self.set_bit(counter);
        self.next = counter + 1;
        Ok(())
    }
}
