// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::Key;
use chacha20poly1305::{
    aead::{self, AeadInPlace, KeyInit},
    ChaCha20Poly1305, Nonce, Tag,
};
use tungo_core::packet::{NONCE_LEN, TAG_LEN};

/// One keyed AEAD instance.
///
/// The raw key bytes are not retained; the schedule inside the cipher is
/// wiped when the instance drops.
pub(crate) struct Cipher {
    cipher: ChaCha20Poly1305,
}

impl Cipher {
    pub fn new(key: &Key) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_ref().into()),
        }
    }

    /// Encrypts `payload` in place, returning the detached tag
    #[inline]
    pub fn seal(
        &self,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        payload: &mut [u8],
    ) -> Result<[u8; TAG_LEN], aead::Error> {
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(nonce), aad, payload)?;
        Ok(tag.into())
    }

    /// Decrypts `payload` in place against the detached tag
    #[inline]
    pub fn open(
        &self,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        payload: &mut [u8],
        tag: &[u8; TAG_LEN],
    ) -> Result<(), aead::Error> {
        self.cipher.decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            aad,
            payload,
            Tag::from_slice(tag),
        )
    }
}

impl core::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}
