// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-peer AEAD envelope over the rekey machine.
//!
//! Callers hand in one contiguous buffer per packet and everything happens
//! in place: sealing writes the envelope header into the reserved prefix and
//! the tag after the payload; opening decrypts the payload region of the
//! received envelope and returns it as a subslice.

use crate::{
    endpoint::Role,
    open::OpenError,
    rekey::{EpochKeys, Fsm},
    seal::SealError,
};
use tungo_core::packet::{datagram::Datagram, frame::Frame, Epoch, TAG_LEN};

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecryptError {
    /// The envelope names an epoch with no installed keys
    #[error("unknown epoch {0}")]
    UnknownEpoch(Epoch),
    #[error(transparent)]
    Open(#[from] OpenError),
    /// The envelope could not be decoded
    #[error("malformed envelope")]
    Malformed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EncryptError {
    #[error(transparent)]
    Seal(#[from] SealError),
    /// The buffer cannot hold the prefix, payload and tag
    #[error("buffer is too small for the envelope")]
    ShortBuffer,
}

/// Transport-aware encrypt/decrypt for one peer
pub struct CryptoSession {
    fsm: Fsm,
}

impl CryptoSession {
    /// Builds a session at epoch 0 from handshake-derived keys
    pub fn new(role: Role, keys: &EpochKeys) -> Self {
        Self {
            fsm: Fsm::new(role, keys),
        }
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.fsm.role()
    }

    #[inline]
    pub fn fsm(&self) -> &Fsm {
        &self.fsm
    }

    #[inline]
    pub fn fsm_mut(&mut self) -> &mut Fsm {
        &mut self.fsm
    }

    /// Seals a stream envelope in place.
    ///
    /// `buffer` holds the plaintext at `[Frame::HEADER_LEN..][..payload_len]`
    /// with at least [`TAG_LEN`] bytes of slack after it. Returns the total
    /// envelope length.
    pub fn seal_frame(
        &mut self,
        buffer: &mut [u8],
        payload_len: usize,
    ) -> Result<usize, EncryptError> {
        let total = Frame::HEADER_LEN + payload_len + TAG_LEN;
        if buffer.len() < total {
            return Err(EncryptError::ShortBuffer);
        }

        let epoch = self.fsm.send_epoch();
        let sealer = self.fsm.sealer_mut();
        let payload = &mut buffer[Frame::HEADER_LEN..Frame::HEADER_LEN + payload_len];
        let (nonce, tag) = sealer.seal(&[], payload)?;

        Frame::encode_header(buffer, epoch, &nonce);
        buffer[total - TAG_LEN..total].copy_from_slice(&tag);
        Ok(total)
    }

    /// Opens a stream envelope in place, returning the plaintext subslice
    pub fn open_frame<'a>(&mut self, bytes: &'a mut [u8]) -> Result<&'a mut [u8], DecryptError> {
        let frame = Frame::decode(bytes).map_err(|_| DecryptError::Malformed)?;
        let opener = self
            .fsm
            .opener_mut(frame.epoch)
            .ok_or(DecryptError::UnknownEpoch(frame.epoch))?;
        let payload_len = opener.open(&frame.nonce, &[], frame.sealed)?;
        Ok(&mut frame.sealed[..payload_len])
    }

    /// Seals a datagram envelope in place.
    ///
    /// `buffer` holds the plaintext at `[Datagram::HEADER_LEN..][..payload_len]`
    /// with tag slack after it. The route-id is bound as associated data.
    pub fn seal_datagram(
        &mut self,
        route_id: u64,
        buffer: &mut [u8],
        payload_len: usize,
    ) -> Result<usize, EncryptError> {
        let total = Datagram::HEADER_LEN + payload_len + TAG_LEN;
        if buffer.len() < total {
            return Err(EncryptError::ShortBuffer);
        }

        let epoch = self.fsm.send_epoch();
        let sealer = self.fsm.sealer_mut();
        let aad = Datagram::aad(route_id);
        let payload = &mut buffer[Datagram::HEADER_LEN..Datagram::HEADER_LEN + payload_len];
        let (nonce, tag) = sealer.seal(&aad, payload)?;

        Datagram::encode_header(buffer, route_id, epoch, &nonce);
        buffer[total - TAG_LEN..total].copy_from_slice(&tag);
        Ok(total)
    }

    /// Opens a datagram envelope in place, returning the plaintext subslice
    pub fn open_datagram<'a>(
        &mut self,
        bytes: &'a mut [u8],
    ) -> Result<&'a mut [u8], DecryptError> {
        let datagram = Datagram::decode(bytes).map_err(|_| DecryptError::Malformed)?;
        let opener = self
            .fsm
            .opener_mut(datagram.epoch)
            .ok_or(DecryptError::UnknownEpoch(datagram.epoch))?;
        let aad = Datagram::aad(datagram.route_id);
        let payload_len = opener.open(&datagram.nonce, &aad, datagram.sealed)?;
        Ok(&mut datagram.sealed[..payload_len])
    }

    /// Whether the send epoch is close enough to nonce exhaustion that a
    /// rekey should be initiated.
    #[inline]
    pub fn should_rekey(&self) -> bool {
        self.fsm.should_rekey()
    }

    /// Wipes every installed key. The session is unusable afterwards.
    pub fn wipe(&mut self) {
        self.fsm.wipe();
    }
}

impl core::fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("CryptoSession")
            .field("fsm", &self.fsm)
            .finish()
    }
}
