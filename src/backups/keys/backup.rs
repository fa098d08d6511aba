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

use std::sync::{Arc, Mutex};

use ruma::{serde::Base64, CanonicalJsonValue};
use vodozemac::Curve25519PublicKey;
use zeroize::Zeroizing;

use super::{compat::PkEncryption, recovery::DecodeError};
use crate::{
    sessions::InboundGroupSession,
    types::{EncryptedSessionData, KeyBackupData, MEGOLM_BACKUP_V1_ALGORITHM},
};

#[derive(Debug)]
struct InnerBackupKey {
    key: Curve25519PublicKey,
    version: Mutex<Option<String>>,
}

/// The public part of the backup key.
///
/// Room keys are encrypted under this key before they get uploaded. The key
/// only becomes usable once it has been bound to the backup version the
/// server assigned, see [`MegolmV1BackupKey::set_version`].
#[derive(Clone)]
pub struct MegolmV1BackupKey {
    inner: Arc<InnerBackupKey>,
}

impl std::fmt::Debug for MegolmV1BackupKey {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("MegolmV1BackupKey")
            .field("key", &self.to_base64())
            .field("version", &self.backup_version())
            .finish()
    }
}

impl MegolmV1BackupKey {
    pub(crate) fn new(key: Curve25519PublicKey, version: Option<String>) -> Self {
        Self { inner: InnerBackupKey { key, version: Mutex::new(version) }.into() }
    }

    /// Get the full name of the backup algorithm this backup key supports.
    pub fn backup_algorithm(&self) -> &str {
        MEGOLM_BACKUP_V1_ALGORITHM
    }

    /// Try to create a new [`MegolmV1BackupKey`] from a base64 encoded
    /// Curve25519 public key.
    pub fn from_base64(public_key: &str) -> Result<Self, DecodeError> {
        let key = Curve25519PublicKey::from_base64(public_key)?;

        Ok(Self::new(key, None))
    }

    /// The public Curve25519 key itself.
    pub fn public_key(&self) -> Curve25519PublicKey {
        self.inner.key
    }

    /// Convert the [`MegolmV1BackupKey`] to a base64 encoded string.
    pub fn to_base64(&self) -> String {
        self.inner.key.to_base64()
    }

    /// Get the backup version that this key is used with, if any.
    pub fn backup_version(&self) -> Option<String> {
        self.inner.version.lock().unwrap().clone()
    }

    /// Set the backup version that this [`MegolmV1BackupKey`] will be used
    /// with.
    ///
    /// The key won't be able to encrypt room keys unless a version has been
    /// set.
    pub fn set_version(&self, version: String) {
        *self.inner.version.lock().unwrap() = Some(version);
    }

    /// Encrypt the given inbound group session into the wire record that
    /// gets uploaded to the homeserver.
    pub(crate) fn encrypt(
        &self,
        session: &InboundGroupSession,
        is_verified: bool,
    ) -> KeyBackupData {
        let pk = PkEncryption::from_key(self.inner.key);

        let first_message_index = session.first_known_index().into();
        let forwarded_count = (session.forwarded_count() as u32).into();

        // Convert the session to the backup representation and serialize it
        // into canonical JSON.
        let key = session.to_backup();
        let key: CanonicalJsonValue = serde_json::to_value(&key)
            .expect("Can't serialize a backed up room key")
            .try_into()
            .expect("A serialized room key is always canonical");

        // The plaintext copy of the key material shouldn't outlive the
        // encryption step.
        let key = Zeroizing::new(key.to_string().into_bytes());

        let message = pk.encrypt(&key);

        let session_data = EncryptedSessionData {
            ephemeral: Base64::new(message.ephemeral_key.to_vec()),
            ciphertext: Base64::new(message.ciphertext),
            mac: Base64::new(message.mac),
        };

        KeyBackupData { first_message_index, forwarded_count, is_verified, session_data }
    }
}
