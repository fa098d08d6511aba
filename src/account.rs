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

//! The signing identity of the device that runs the backup engine.

use std::sync::Arc;

use ruma::{
    CanonicalJsonValue, DeviceId, DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceId,
    OwnedDeviceKeyId, OwnedUserId, UserId,
};
use serde_json::Value;
use vodozemac::{Ed25519Keypair, Ed25519PublicKey, Ed25519Signature};

use crate::{error::SignatureError, store::Device};

/// Strip the fields that are never covered by a signature and serialize the
/// rest into canonical JSON.
pub(crate) fn to_signable_json(mut value: Value) -> Result<String, SignatureError> {
    let json_object = value.as_object_mut().ok_or(SignatureError::NotAnObject)?;
    json_object.remove("signatures");
    json_object.remove("unsigned");

    let canonical_json: CanonicalJsonValue = value.try_into()?;
    Ok(canonical_json.to_string())
}

/// The device-local account the backup engine signs auth data with.
///
/// This is a narrow view of the device's Olm account: the user and device
/// ids plus the long-lived Ed25519 signing key. The full account, including
/// the one-time and identity keys, lives in the surrounding crypto
/// coordinator.
#[derive(Clone)]
pub struct Account {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    signing_key: Arc<Ed25519Keypair>,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("ed25519_key", &self.ed25519_key().to_base64())
            .finish()
    }
}

impl Account {
    /// Create a fresh account with a newly generated signing key.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            signing_key: Ed25519Keypair::new().into(),
        }
    }

    /// The id of the user that owns this account.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The id of the device this account belongs to.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The public Ed25519 key of this account, also known as the device
    /// fingerprint.
    pub fn ed25519_key(&self) -> Ed25519PublicKey {
        self.signing_key.public_key()
    }

    /// The key id our signatures are filed under, `ed25519:<device_id>`.
    pub fn signing_key_id(&self) -> OwnedDeviceKeyId {
        DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id)
    }

    /// Sign the given message with the account's Ed25519 key.
    pub fn sign(&self, message: &str) -> Ed25519Signature {
        self.signing_key.sign(message.as_bytes())
    }

    /// Sign the canonical JSON form of the given value, ignoring any
    /// `signatures` and `unsigned` fields it might contain.
    pub fn sign_json(&self, value: Value) -> Result<Ed25519Signature, SignatureError> {
        let serialized = to_signable_json(value)?;

        Ok(self.sign(&serialized))
    }

    /// The [`Device`] view of this account.
    ///
    /// Our own device is implicitly trusted, the returned device is marked as
    /// locally verified.
    pub fn to_device(&self) -> Device {
        let mut device =
            Device::new(self.user_id.clone(), self.device_id.clone(), self.ed25519_key());
        device.set_local_trust(true);

        device
    }
}
