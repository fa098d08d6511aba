// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    io::{Cursor, Read},
    ops::DerefMut,
};

use pbkdf2::pbkdf2_hmac;
use rand::{thread_rng, RngCore};
use sha2::Sha512;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::{
    backup::MegolmV1BackupKey,
    compat::{DecryptionError, Message, PkDecryption},
};
use crate::{sessions::BackedUpRoomKey, types::EncryptedSessionData, utilities};

/// The default iteration count for the passphrase-based key derivation.
pub const DEFAULT_PBKDF2_ROUNDS: u32 = 500_000;

/// Error type for the decoding of a [`RecoveryKey`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The decoded recovery key has an invalid prefix.
    #[error("The decoded recovery key has an invalid prefix: expected {0:?}, got {1:?}")]
    Prefix([u8; 2], [u8; 2]),
    /// The parity byte of the recovery key didn't match.
    #[error("The parity byte of the recovery key doesn't match: expected {0:?}, got {1:?}")]
    Parity(u8, u8),
    /// The recovery key has an invalid length.
    #[error("The decoded recovery key has an invalid length: expected {0}, got {1}")]
    Length(usize, usize),
    /// The recovery key isn't valid base58.
    #[error(transparent)]
    Base58(#[from] bs58::decode::Error),
    /// The recovery key isn't valid base64.
    #[error(transparent)]
    Base64(#[from] utilities::DecodeError),
    /// The recovery key is too short, we couldn't read enough data.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The key, a Curve25519 public key, couldn't be decoded.
    #[error(transparent)]
    PublicKey(#[from] vodozemac::KeyError),
}

/// The private part of the backup key.
///
/// The recovery key is the user-held secret: it can decrypt every room key
/// that was encrypted under the matching [`MegolmV1BackupKey`] and it is what
/// gets transcribed, or re-derived from a passphrase, on a new device.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct RecoveryKey {
    inner: Box<[u8; RecoveryKey::KEY_SIZE]>,
}

impl std::fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RecoveryKey").field(&"...").finish()
    }
}

impl std::fmt::Display for RecoveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let string = Zeroizing::new(self.to_base58());

        let string = Zeroizing::new(
            string
                .chars()
                .collect::<Vec<char>>()
                .chunks(Self::DISPLAY_CHUNK_SIZE)
                .map(|c| c.iter().collect::<String>())
                .collect::<Vec<_>>()
                .join(" "),
        );

        write!(f, "{}", string.as_str())
    }
}

impl TryFrom<String> for RecoveryKey {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_base58(&value)
    }
}

impl RecoveryKey {
    /// The number of bytes the recovery key consists of.
    pub const KEY_SIZE: usize = 32;

    const PREFIX: [u8; 2] = [0x8b, 0x01];
    const PREFIX_PARITY: u8 = Self::PREFIX[0] ^ Self::PREFIX[1];
    const DISPLAY_CHUNK_SIZE: usize = 4;

    fn parity_byte(bytes: &[u8]) -> u8 {
        bytes.iter().fold(Self::PREFIX_PARITY, |acc, x| acc ^ x)
    }

    /// Generate a new random recovery key.
    pub fn new() -> Self {
        let mut rng = thread_rng();

        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        rng.fill_bytes(key.deref_mut());

        Self::from_boxed_bytes(key)
    }

    /// Derive a recovery key from the given passphrase, salt and PBKDF2
    /// iteration count.
    ///
    /// The derivation is deterministic: the same triple always produces the
    /// same key, which is how a new device re-creates the key from the salt
    /// and iteration count the auth data carries.
    pub fn from_passphrase(passphrase: &str, salt: &[u8], rounds: u32) -> Self {
        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        pbkdf2_hmac::<Sha512>(passphrase.as_bytes(), salt, rounds, key.deref_mut());

        Self::from_boxed_bytes(key)
    }

    /// Create a recovery key from the given byte array.
    ///
    /// **Warning**: You need to make sure that the byte array contains
    /// correct random data, either by using a random number generator or by
    /// using an exported version of a previously created [`RecoveryKey`].
    pub fn from_bytes(key: &[u8; Self::KEY_SIZE]) -> Self {
        let mut inner = Box::new([0u8; Self::KEY_SIZE]);
        inner.copy_from_slice(key);

        Self::from_boxed_bytes(inner)
    }

    fn from_boxed_bytes(key: Box<[u8; Self::KEY_SIZE]>) -> Self {
        Self { inner: key }
    }

    /// Get the recovery key as a raw byte representation.
    pub fn as_bytes(&self) -> &[u8; Self::KEY_SIZE] {
        &self.inner
    }

    /// Try to create a [`RecoveryKey`] from a base64 export of the key.
    pub fn from_base64(key: &str) -> Result<Self, DecodeError> {
        let decoded = Zeroizing::new(utilities::decode(key)?);

        if decoded.len() != Self::KEY_SIZE {
            Err(DecodeError::Length(Self::KEY_SIZE, decoded.len()))
        } else {
            let mut key = Box::new([0u8; Self::KEY_SIZE]);
            key.copy_from_slice(&decoded);

            Ok(Self::from_boxed_bytes(key))
        }
    }

    /// Export the [`RecoveryKey`] as a base64 encoded string.
    pub fn to_base64(&self) -> String {
        utilities::encode(self.inner.as_slice())
    }

    /// Try to create a [`RecoveryKey`] from a base58 export of the key.
    ///
    /// Any whitespace the string might contain, in particular the 4-character
    /// grouping [`Display`](std::fmt::Display) produces, is ignored.
    pub fn from_base58(value: &str) -> Result<Self, DecodeError> {
        // Remove any whitespace we might have
        let value: String = value.chars().filter(|c| !c.is_whitespace()).collect();

        let decoded = bs58::decode(value).with_alphabet(bs58::Alphabet::BITCOIN).into_vec()?;
        let mut decoded = Cursor::new(decoded);

        let mut prefix = [0u8; 2];
        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        let mut expected_parity = [0u8; 1];

        decoded.read_exact(&mut prefix)?;
        decoded.read_exact(key.deref_mut())?;
        decoded.read_exact(&mut expected_parity)?;

        let expected_parity = expected_parity[0];
        let parity = Self::parity_byte(key.as_ref());

        let mut remainder = decoded.into_inner();
        remainder.zeroize();

        if prefix != Self::PREFIX {
            Err(DecodeError::Prefix(Self::PREFIX, prefix))
        } else if expected_parity != parity {
            Err(DecodeError::Parity(expected_parity, parity))
        } else {
            Ok(Self::from_boxed_bytes(key))
        }
    }

    /// Export the [`RecoveryKey`] as a base58 encoded string.
    pub fn to_base58(&self) -> String {
        let bytes = Zeroizing::new(
            [
                Self::PREFIX.as_ref(),
                self.inner.as_ref(),
                [Self::parity_byte(self.inner.as_ref())].as_ref(),
            ]
            .concat(),
        );

        bs58::encode(bytes.as_slice()).with_alphabet(bs58::Alphabet::BITCOIN).into_string()
    }

    fn pk_decryption(&self) -> PkDecryption {
        PkDecryption::from_bytes(self.inner.as_ref())
    }

    /// Extract the public key from this [`RecoveryKey`].
    pub fn megolm_v1_public_key(&self) -> MegolmV1BackupKey {
        MegolmV1BackupKey::new(self.pk_decryption().public_key(), None)
    }

    /// Try to decrypt the encrypted payload of a backed up room key.
    pub fn decrypt_session_data(
        &self,
        session_data: &EncryptedSessionData,
    ) -> Result<BackedUpRoomKey, DecryptionError> {
        let message = Message::try_from(session_data)?;
        let pk = self.pk_decryption();

        let decrypted = Zeroizing::new(pk.decrypt(&message)?);

        Ok(serde_json::from_slice(&decrypted)?)
    }

    /// Try to decrypt the given base64 encoded ciphertext parts.
    ///
    /// This will use the `m.megolm_backup.v1.curve25519-aes-sha2` algorithm
    /// to decrypt the given ciphertext.
    pub fn decrypt_v1(
        &self,
        ephemeral_key: &str,
        mac: &str,
        ciphertext: &str,
    ) -> Result<Vec<u8>, DecryptionError> {
        let message = Message::from_base64(ciphertext, mac, ephemeral_key)?;
        let pk = self.pk_decryption();

        pk.decrypt(&message)
    }
}

impl Default for RecoveryKey {
    fn default() -> Self {
        Self::new()
    }
}
