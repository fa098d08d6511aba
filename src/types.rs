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

//! Serializable types describing backup versions and the per-session wire
//! records that get uploaded to the homeserver.

use std::collections::BTreeMap;

use ruma::{serde::Base64, CanonicalJsonValue, OwnedDeviceKeyId, OwnedUserId, UInt};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use vodozemac::Curve25519PublicKey;

use crate::error::SignatureError;

/// The algorithm identifier of the only supported backup algorithm.
pub const MEGOLM_BACKUP_V1_ALGORITHM: &str = "m.megolm_backup.v1.curve25519-aes-sha2";

/// Signatures of a signed JSON object, grouped by user and signing key.
pub type Signatures = BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, String>>;

pub(crate) fn deserialize_curve_key<'de, D>(de: D) -> Result<Curve25519PublicKey, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let key: String = Deserialize::deserialize(de)?;
    Curve25519PublicKey::from_base64(&key).map_err(serde::de::Error::custom)
}

pub(crate) fn serialize_curve_key<S>(key: &Curve25519PublicKey, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_str(&key.to_base64())
}

pub(crate) fn deserialize_curve_key_vec<'de, D>(
    de: D,
) -> Result<Vec<Curve25519PublicKey>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let keys: Vec<String> = Deserialize::deserialize(de)?;

    keys.iter()
        .map(|k| Curve25519PublicKey::from_base64(k).map_err(serde::de::Error::custom))
        .collect()
}

pub(crate) fn serialize_curve_key_vec<S>(
    keys: &[Curve25519PublicKey],
    s: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let keys: Vec<String> = keys.iter().map(|k| k.to_base64()).collect();
    keys.serialize(s)
}

/// Auth data for the `m.megolm_backup.v1.curve25519-aes-sha2` backup
/// algorithm as defined in the [spec].
///
/// [spec]: https://spec.matrix.org/unstable/client-server-api/#backup-algorithm-mmegolm_backupv1curve25519-aes-sha2
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MegolmV1AuthData {
    /// The Curve25519 public key used to encrypt the backups.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub public_key: Curve25519PublicKey,

    /// The salt that was used to derive the private key from a passphrase,
    /// present only for passphrase-based backups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_salt: Option<Base64>,

    /// The PBKDF2 iteration count that was used to derive the private key
    /// from a passphrase, present only for passphrase-based backups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_iterations: Option<UInt>,

    /// Signatures of the auth data, as signed JSON.
    #[serde(default, skip_serializing_if = "Signatures::is_empty")]
    pub signatures: Signatures,

    #[serde(flatten)]
    pub(crate) extra: BTreeMap<String, Value>,
}

impl MegolmV1AuthData {
    /// Create a new [`MegolmV1AuthData`] from a public Curve25519 key and the
    /// optional passphrase parameters.
    pub(crate) fn new(
        public_key: Curve25519PublicKey,
        private_key_salt: Option<Base64>,
        private_key_iterations: Option<UInt>,
    ) -> Self {
        Self {
            public_key,
            private_key_salt,
            private_key_iterations,
            signatures: Default::default(),
            extra: Default::default(),
        }
    }

    /// Serialize the auth data into the canonical JSON form which gets signed
    /// by devices, i.e. with the `signatures` and `unsigned` fields removed.
    pub(crate) fn to_canonical_json(&self) -> Result<String, SignatureError> {
        let mut value = serde_json::to_value(self)?;
        let json_object = value.as_object_mut().ok_or(SignatureError::NotAnObject)?;
        json_object.remove("signatures");
        json_object.remove("unsigned");

        let canonical_json: CanonicalJsonValue = value.try_into()?;

        Ok(canonical_json.to_string())
    }
}

/// Information pertaining to a room key backup, can be used to create a new
/// backup version as defined in the [spec].
///
/// [spec]: https://spec.matrix.org/unstable/client-server-api/#post_matrixclientv3room_keysversion
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "BackupInfoHelper")]
pub enum RoomKeyBackupInfo {
    /// The `m.megolm_backup.v1.curve25519-aes-sha2` variant of a backup.
    MegolmBackupV1Curve25519AesSha2(MegolmV1AuthData),
    /// Any other unknown backup variant.
    Other {
        /// The algorithm of the unknown backup variant.
        algorithm: String,
        /// The auth data of the unknown backup variant.
        auth_data: BTreeMap<String, Value>,
    },
}

impl RoomKeyBackupInfo {
    /// The algorithm identifier this backup info uses.
    pub fn algorithm(&self) -> &str {
        match self {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(_) => MEGOLM_BACKUP_V1_ALGORITHM,
            RoomKeyBackupInfo::Other { algorithm, .. } => algorithm,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BackupInfoHelper {
    algorithm: String,
    auth_data: Value,
}

impl TryFrom<BackupInfoHelper> for RoomKeyBackupInfo {
    type Error = serde_json::Error;

    fn try_from(value: BackupInfoHelper) -> Result<Self, Self::Error> {
        Ok(match value.algorithm.as_str() {
            MEGOLM_BACKUP_V1_ALGORITHM => {
                let data: MegolmV1AuthData = serde_json::from_value(value.auth_data)?;
                RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(data)
            }
            _ => RoomKeyBackupInfo::Other {
                algorithm: value.algorithm,
                auth_data: serde_json::from_value(value.auth_data)?,
            },
        })
    }
}

impl Serialize for RoomKeyBackupInfo {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let helper = match self {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(d) => BackupInfoHelper {
                algorithm: MEGOLM_BACKUP_V1_ALGORITHM.to_owned(),
                auth_data: serde_json::to_value(d).map_err(serde::ser::Error::custom)?,
            },
            RoomKeyBackupInfo::Other { algorithm, auth_data } => BackupInfoHelper {
                algorithm: algorithm.to_owned(),
                auth_data: serde_json::to_value(auth_data.clone())
                    .map_err(serde::ser::Error::custom)?,
            },
        };

        helper.serialize(serializer)
    }
}

/// A backup version that has been published on, and fetched from, the
/// homeserver.
///
/// Versions are immutable once created, the only way to rotate the backup key
/// is to create a new version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupVersion {
    /// The algorithm and auth data of this backup version.
    #[serde(flatten)]
    pub algorithm: RoomKeyBackupInfo,

    /// The opaque, server-assigned identifier of this version.
    pub version: String,

    /// The number of keys stored in this backup, as counted by the server.
    #[serde(default)]
    pub count: UInt,

    /// An opaque string representing stored keys in the backup, which changes
    /// whenever keys are added to or removed from the backup.
    #[serde(default)]
    pub etag: String,
}

/// The encrypted payload of a single backed up room key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedSessionData {
    /// The unpadded base64 encoded public half of the ephemeral key.
    pub ephemeral: Base64,

    /// The ciphertext, encrypted using AES-256 in CBC mode with PKCS#7
    /// padding, and encoded in unpadded base64.
    pub ciphertext: Base64,

    /// First 8 bytes of MAC of the ciphertext, encoded in unpadded base64.
    pub mac: Base64,
}

/// The per-session record that gets uploaded to, and stored on, the
/// homeserver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyBackupData {
    /// The index of the first message in the session that the key can
    /// decrypt.
    pub first_message_index: UInt,

    /// The number of times this key has been forwarded via key-sharing
    /// between devices.
    pub forwarded_count: UInt,

    /// Whether the device backing up the key verified the device that the
    /// key is from.
    pub is_verified: bool,

    /// Encrypted data about the session.
    pub session_data: EncryptedSessionData,
}

/// The backed up keys for a single room, grouped by session id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoomKeyBackup {
    /// A map of session IDs to key data.
    pub sessions: BTreeMap<String, KeyBackupData>,
}

impl RoomKeyBackup {
    /// Create a new [`RoomKeyBackup`] holding the given sessions.
    pub fn new(sessions: BTreeMap<String, KeyBackupData>) -> Self {
        Self { sessions }
    }
}
