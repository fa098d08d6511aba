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

//! The homeserver contract the backup engine consumes.
//!
//! The HTTP transport lives outside of this crate; implementations of
//! [`BackupApiClient`] translate these calls into the `/room_keys` endpoints
//! of the client-server API and map the Matrix error codes back into
//! [`ApiError`] variants.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ruma::{OwnedRoomId, RoomId};
use thiserror::Error;

use crate::types::{BackupVersion, RoomKeyBackup, RoomKeyBackupInfo};

/// The error type for failed homeserver requests.
///
/// The variants carry enough structure for the engine to tell apart the
/// cases it reacts to: a missing object, a superseded backup version, a
/// transient transport problem, and everything else.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The requested object doesn't exist on the homeserver, `M_NOT_FOUND`.
    #[error("The requested object was not found on the homeserver")]
    NotFound,

    /// The version we tried to upload to has been superseded,
    /// `M_WRONG_ROOM_KEYS_VERSION`.
    #[error("The backup version was superseded, the server is on version {current_version}")]
    WrongRoomKeysVersion {
        /// The backup version that is currently active on the homeserver.
        current_version: String,
    },

    /// The homeserver couldn't be reached.
    #[error("The homeserver could not be reached: {0}")]
    Network(String),

    /// The homeserver returned some other protocol-level error.
    #[error("The homeserver returned an error: {errcode} {error}")]
    Protocol {
        /// The Matrix error code.
        errcode: String,
        /// The human-readable error message.
        error: String,
    },
}

/// A client for the server-side key backup endpoints.
#[async_trait]
pub trait BackupApiClient: std::fmt::Debug + Send + Sync {
    /// Create a new backup version from the given backup info.
    ///
    /// Returns the version id the server assigned to the new backup.
    async fn create_version(&self, info: &RoomKeyBackupInfo) -> Result<String, ApiError>;

    /// Delete the backup version with the given id.
    async fn delete_version(&self, version: &str) -> Result<(), ApiError>;

    /// Get the backup version with the given id.
    async fn get_version(&self, version: &str) -> Result<BackupVersion, ApiError>;

    /// Get the backup version that is currently active on the homeserver.
    async fn get_latest_version(&self) -> Result<BackupVersion, ApiError>;

    /// Store a batch of encrypted room keys, grouped by room, under the
    /// given backup version.
    async fn upload_keys(
        &self,
        version: &str,
        rooms: BTreeMap<OwnedRoomId, RoomKeyBackup>,
    ) -> Result<(), ApiError>;

    /// Fetch encrypted room keys from the given backup version, optionally
    /// scoped to a single room or a single session.
    async fn fetch_keys(
        &self,
        version: &str,
        room_id: Option<&RoomId>,
        session_id: Option<&str>,
    ) -> Result<BTreeMap<OwnedRoomId, RoomKeyBackup>, ApiError>;
}
