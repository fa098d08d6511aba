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

//! ☣️  Compat support for Olm's PkEncryption and PkDecryption.
//!
//! This implements the hybrid encryption scheme the
//! `m.megolm_backup.v1.curve25519-aes-sha2` algorithm prescribes: an
//! ephemeral X25519 key agreement, HKDF-SHA-256 key expansion and AES-256-CBC
//! with a truncated HMAC-SHA-256 tag. The scheme, including its quirks, is
//! fixed by what existing backups on homeservers look like.

use aes::{
    cipher::{
        block_padding::{Pkcs7, UnpadError},
        generic_array::GenericArray,
        BlockDecryptMut, BlockEncryptMut, IvSizeUser, KeyIvInit, KeySizeUser,
    },
    Aes256,
};
use hkdf::Hkdf;
use hmac::{digest::MacError, Hmac, Mac as MacT};
use sha2::Sha256;
use thiserror::Error;
use vodozemac::{Curve25519PublicKey, Curve25519SecretKey, KeyError, SharedSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{types::EncryptedSessionData, utilities};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

type Aes256Key = GenericArray<u8, <Aes256 as KeySizeUser>::KeySize>;
type Aes256Iv = GenericArray<u8, <Aes256CbcEnc as IvSizeUser>::IvSize>;

const MAC_LENGTH: usize = 8;

/// The set of symmetric keys the shared secret gets expanded into.
#[derive(Zeroize, ZeroizeOnDrop)]
struct ExpandedKeys {
    aes_key: Box<[u8; 32]>,
    mac_key: Box<[u8; 32]>,
    iv: Box<[u8; 16]>,
}

impl ExpandedKeys {
    fn new(shared_secret: SharedSecret) -> Self {
        let mut expanded = Box::new([0u8; 80]);

        let salt = [0u8; 32];
        let hkdf: Hkdf<Sha256> = Hkdf::new(Some(&salt), shared_secret.as_bytes());

        hkdf.expand(b"", &mut *expanded)
            .expect("We should be able to expand the shared secret into 80 bytes");

        let mut aes_key = Box::new([0u8; 32]);
        let mut mac_key = Box::new([0u8; 32]);
        let mut iv = Box::new([0u8; 16]);

        aes_key.copy_from_slice(&expanded[0..32]);
        mac_key.copy_from_slice(&expanded[32..64]);
        iv.copy_from_slice(&expanded[64..80]);

        expanded.zeroize();

        Self { aes_key, mac_key, iv }
    }

    fn aes_key(&self) -> &Aes256Key {
        Aes256Key::from_slice(self.aes_key.as_slice())
    }

    fn iv(&self) -> &Aes256Iv {
        Aes256Iv::from_slice(self.iv.as_slice())
    }

    fn hmac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(self.mac_key.as_slice())
            .expect("We should be able to create a Hmac object from a 32 byte key")
    }
}

/// The private half of the backup key, able to decrypt backed up room keys.
pub struct PkDecryption {
    key: Curve25519SecretKey,
    public_key: Curve25519PublicKey,
}

impl PkDecryption {
    /// Create a new random [`PkDecryption`] object.
    pub fn new() -> Self {
        let key = Curve25519SecretKey::new();
        let public_key = Curve25519PublicKey::from(&key);

        Self { key, public_key }
    }

    /// Restore a [`PkDecryption`] object from its secret bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let key = Curve25519SecretKey::from_slice(bytes);
        let public_key = Curve25519PublicKey::from(&key);

        Self { key, public_key }
    }

    /// The public key matching this decryption object.
    pub fn public_key(&self) -> Curve25519PublicKey {
        self.public_key
    }

    /// Decrypt and authenticate a [`Message`].
    pub fn decrypt(&self, message: &Message) -> Result<Vec<u8>, DecryptionError> {
        let shared_secret = self.key.diffie_hellman(&message.ephemeral_key);
        let keys = ExpandedKeys::new(shared_secret);

        let cipher = Aes256CbcDec::new(keys.aes_key(), keys.iv());
        let decrypted = cipher.decrypt_padded_vec_mut::<Pkcs7>(&message.ciphertext)?;

        // Due to a bug in the original implementation the MAC doesn't cover
        // the ciphertext, it's calculated over an empty string.
        keys.hmac().verify_truncated_left(&message.mac)?;

        Ok(decrypted)
    }
}

impl Default for PkDecryption {
    fn default() -> Self {
        Self::new()
    }
}

/// The public half of the backup key, able to encrypt room keys so only the
/// matching [`PkDecryption`] object can read them.
pub struct PkEncryption {
    public_key: Curve25519PublicKey,
}

impl From<&PkDecryption> for PkEncryption {
    fn from(value: &PkDecryption) -> Self {
        Self::from_key(value.public_key())
    }
}

impl PkEncryption {
    /// Create a [`PkEncryption`] object from a public key.
    pub fn from_key(public_key: Curve25519PublicKey) -> Self {
        Self { public_key }
    }

    /// Encrypt the given plaintext under a fresh ephemeral key.
    pub fn encrypt(&self, message: &[u8]) -> Message {
        let ephemeral_key = Curve25519SecretKey::new();
        let shared_secret = ephemeral_key.diffie_hellman(&self.public_key);
        let keys = ExpandedKeys::new(shared_secret);

        let cipher = Aes256CbcEnc::new(keys.aes_key(), keys.iv());
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(message);

        // See the matching comment in [`PkDecryption::decrypt`], the MAC
        // doesn't cover the ciphertext.
        let mut mac = keys.hmac().finalize().into_bytes().to_vec();
        mac.truncate(MAC_LENGTH);

        Message { ciphertext, mac, ephemeral_key: Curve25519PublicKey::from(&ephemeral_key) }
    }
}

/// Error describing the ways decoding an encrypted message can fail.
#[derive(Debug, Error)]
pub enum MessageDecodeError {
    /// One of the message parts wasn't valid base64.
    #[error(transparent)]
    Base64(#[from] utilities::DecodeError),
    /// The ephemeral key wasn't a valid Curve25519 public key.
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// An encrypted message, the tuple the pk encryption scheme produces.
#[derive(Debug)]
pub struct Message {
    /// The ciphertext of the message.
    pub ciphertext: Vec<u8>,
    /// The first 8 bytes of the authentication tag.
    pub mac: Vec<u8>,
    /// The public half of the ephemeral key that was used to encrypt this
    /// message.
    pub ephemeral_key: Curve25519PublicKey,
}

impl Message {
    /// Decode a message from the three base64 encoded parts.
    pub fn from_base64(
        ciphertext: &str,
        mac: &str,
        ephemeral_key: &str,
    ) -> Result<Self, MessageDecodeError> {
        Ok(Self {
            ciphertext: utilities::decode(ciphertext)?,
            mac: utilities::decode(mac)?,
            ephemeral_key: Curve25519PublicKey::from_base64(ephemeral_key)?,
        })
    }
}

impl TryFrom<&EncryptedSessionData> for Message {
    type Error = MessageDecodeError;

    fn try_from(data: &EncryptedSessionData) -> Result<Self, Self::Error> {
        Ok(Self {
            ciphertext: data.ciphertext.as_bytes().to_vec(),
            mac: data.mac.as_bytes().to_vec(),
            ephemeral_key: Curve25519PublicKey::from_slice(data.ephemeral.as_bytes())?,
        })
    }
}

/// Error type describing the failure cases the pk decryption step can have.
#[derive(Debug, Error)]
pub enum DecryptionError {
    /// The message has invalid PKCS7 padding.
    #[error("Failed decrypting, invalid padding: {0}")]
    InvalidPadding(#[from] UnpadError),
    /// The message failed to be authenticated.
    #[error("The MAC of the ciphertext didn't pass validation: {0}")]
    Mac(#[from] MacError),
    /// The message failed to be decoded.
    #[error("The message could not be decoded: {0}")]
    Decoding(#[from] MessageDecodeError),
    /// The decrypted plaintext wasn't valid JSON.
    #[error("The decrypted plaintext could not be parsed: {0}")]
    Json(#[from] serde_json::Error),
}
