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

//! The local-store contract the backup engine consumes.
//!
//! The engine never persists anything itself. Group sessions, their
//! backed-up markers, the active backup version and the device list all live
//! in a store provided by the surrounding crypto coordinator. The
//! [`MemoryStore`] is the reference implementation used in tests and by
//! clients that keep everything in memory.

use async_trait::async_trait;
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use thiserror::Error;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::sessions::{ExportedRoomKey, InboundGroupSession};

mod memorystore;

pub use memorystore::MemoryStore;

/// A `Result` alias for the store methods.
pub type Result<T, E = CryptoStoreError> = std::result::Result<T, E>;

/// The error type for failures of the underlying store backend.
#[derive(Debug, Error)]
pub enum CryptoStoreError {
    /// An error occurred in the store backend.
    #[error("The store failed to perform an operation: {0}")]
    Backend(String),

    /// Failed to (de)serialize a stored value.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Struct holding info about how many room keys the store has.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomKeyCounts {
    /// The total number of room keys the store has.
    pub total: usize,
    /// The number of backed up room keys the store has.
    pub backed_up: usize,
}

/// A device belonging to the local user, as far as the backup engine needs
/// to know it.
///
/// The full device-identity and cross-signing machinery lives outside of
/// this crate; the engine only needs the Ed25519 fingerprint to check auth
/// data signatures and the local trust state to decide whether a signature
/// makes a backup usable.
#[derive(Clone, Debug)]
pub struct Device {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    ed25519_key: Ed25519PublicKey,
    curve25519_key: Option<Curve25519PublicKey>,
    display_name: Option<String>,
    locally_trusted: bool,
}

impl Device {
    /// Create a new device with the given ids and fingerprint.
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        ed25519_key: Ed25519PublicKey,
    ) -> Self {
        Self {
            user_id,
            device_id,
            ed25519_key,
            curve25519_key: None,
            display_name: None,
            locally_trusted: false,
        }
    }

    /// The id of the user this device belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The unique id of this device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The Ed25519 fingerprint key of this device.
    pub fn ed25519_key(&self) -> Ed25519PublicKey {
        self.ed25519_key
    }

    /// The Curve25519 identity key of this device, if known.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        self.curve25519_key
    }

    /// Set the Curve25519 identity key of this device.
    pub fn set_curve25519_key(&mut self, key: Curve25519PublicKey) {
        self.curve25519_key = Some(key);
    }

    /// The human-readable name the owner gave this device, if any.
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Set the human-readable name of this device.
    pub fn set_display_name(&mut self, name: Option<String>) {
        self.display_name = name;
    }

    /// Has the local user marked this device as verified?
    pub fn is_locally_trusted(&self) -> bool {
        self.locally_trusted
    }

    /// Change the local verification state of this device.
    pub fn set_local_trust(&mut self, trusted: bool) {
        self.locally_trusted = trusted;
    }
}

/// A storage backend for the backup engine.
///
/// All methods must serialize against each other; in particular marking
/// sessions as backed up and resetting the markers must never interleave
/// with a concurrent enumeration of the pending sessions.
#[async_trait]
pub trait BackupStore: std::fmt::Debug + Send + Sync {
    /// Get a batch of inbound group sessions that haven't been backed up
    /// yet.
    ///
    /// The iteration order is deterministic but otherwise unspecified.
    async fn inbound_group_sessions_for_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<InboundGroupSession>>;

    /// Get the total number of stored sessions and how many of them have
    /// been backed up.
    async fn inbound_group_session_counts(&self) -> Result<RoomKeyCounts>;

    /// Mark the session with the given id and sender key as backed up.
    async fn mark_backed_up(
        &self,
        session_id: &str,
        sender_key: Curve25519PublicKey,
    ) -> Result<()>;

    /// Clear the backed-up marker of every stored session.
    ///
    /// This happens whenever a backup version is created or adopted; the
    /// markers only ever describe the active version.
    async fn reset_backup_state(&self) -> Result<()>;

    /// Load the id of the backup version the markers refer to.
    async fn load_backup_version(&self) -> Result<Option<String>>;

    /// Persist the id of the backup version the markers refer to.
    async fn save_backup_version(&self, version: Option<String>) -> Result<()>;

    /// Look a single session up by its id and sender key.
    async fn get_inbound_group_session(
        &self,
        session_id: &str,
        sender_key: Curve25519PublicKey,
    ) -> Result<Option<InboundGroupSession>>;

    /// Import a list of room keys that were restored from a backup.
    ///
    /// Keys the store already has are skipped. If `backed_up` is true the
    /// imported sessions are marked as already present in the active backup,
    /// otherwise the next upload run will pick them up.
    ///
    /// Returns the number of sessions that were actually imported.
    async fn import_room_keys(
        &self,
        keys: Vec<ExportedRoomKey>,
        backed_up: bool,
    ) -> Result<usize>;

    /// Look a device of the given user up by its device id.
    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<Device>>;

    /// Look a device of the given user up by its Curve25519 identity key.
    async fn get_device_from_curve_key(
        &self,
        user_id: &UserId,
        curve_key: Curve25519PublicKey,
    ) -> Result<Option<Device>>;
}
