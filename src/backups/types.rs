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

use std::{collections::BTreeMap, time::Duration};

use ruma::OwnedDeviceId;
use serde::{Deserialize, Serialize};

use crate::{backups::keys::DEFAULT_PBKDF2_ROUNDS, store::RoomKeyCounts};

/// The lifecycle states of the backup engine.
///
/// State changes are delivered, in order, to every subscriber of
/// [`BackupMachine::state_stream`](crate::backups::BackupMachine::state_stream).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackupState {
    /// We haven't talked to the homeserver yet, nothing is known about the
    /// backup situation.
    #[default]
    Unknown,

    /// We are asking the homeserver whether a backup version exists and
    /// whether we can trust it.
    Checking,

    /// No backup is active on this device; either the server doesn't have a
    /// version or the active one was torn down.
    Disabled,

    /// The server has a backup version but its auth data isn't signed by
    /// any device we trust, so we won't upload to it.
    NotTrusted,

    /// A new backup version is being created on the homeserver.
    Enabling,

    /// The backup is active and every known room key has been uploaded.
    ReadyToBackUp,

    /// New room keys are pending and an upload has been scheduled.
    WillBackUp,

    /// A chunk of room keys is being uploaded right now.
    BackingUp,

    /// The homeserver told us that our active version has been superseded
    /// by a newer one; uploading stopped until the new version is adopted.
    WrongBackupVersion,
}

impl BackupState {
    /// Is the backup able to accept and upload room keys in this state?
    pub fn is_enabled(&self) -> bool {
        matches!(
            self,
            BackupState::ReadyToBackUp | BackupState::WillBackUp | BackupState::BackingUp
        )
    }
}

/// The states the key upload of an ongoing
/// [`wait_for_steady_state`](crate::backups::BackupMachine::wait_for_steady_state)
/// request can be in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UploadState {
    /// No upload is happening right now.
    #[default]
    Idle,

    /// A chunk was uploaded; the counts tell how far along we are.
    Uploading(RoomKeyCounts),

    /// The upload failed, either because the homeserver couldn't be reached
    /// or because the backup got disabled.
    Error,

    /// Every room key the store knows about has been uploaded.
    Done,
}

/// The result of a single signature check over the backup auth data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SignatureState {
    /// The signature is missing.
    #[default]
    Missing,

    /// The signature is invalid.
    Invalid,

    /// The signature is valid but the device that created it is not
    /// trusted.
    ValidButNotTrusted,

    /// The signature is valid and the device that created it is trusted.
    ValidAndTrusted,
}

impl SignatureState {
    /// Is the state considered to be trusted?
    pub fn trusted(self) -> bool {
        self == SignatureState::ValidAndTrusted
    }

    /// Did we find a valid signature?
    pub fn signed(self) -> bool {
        self == SignatureState::ValidButNotTrusted || self == SignatureState::ValidAndTrusted
    }
}

/// The trust evaluation of a backup version's auth data.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupVersionTrust {
    /// Should this device upload room keys to the backup version?
    ///
    /// This is true iff at least one signature was made by a device of ours
    /// that the local user has verified.
    pub usable: bool,

    /// The per-device results of the signature checks, keyed by the device
    /// id the signature claims to come from.
    pub signatures: BTreeMap<OwnedDeviceId, SignatureState>,
}

/// The result of a restore operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoomKeyImportResult {
    /// The number of room keys that were found in the backup.
    pub total_count: usize,

    /// The number of room keys that were imported into the store.
    ///
    /// Keys that failed to decrypt and keys the store already knew about
    /// are not counted.
    pub imported_count: usize,
}

/// Tunables of the backup engine.
#[derive(Clone, Debug)]
pub struct BackupSettings {
    /// The upper bound of the random delay between a new room key arriving
    /// and the upload that includes it.
    ///
    /// The jitter spreads the uploads of many clients that receive the same
    /// room keys at the same time.
    pub upload_delay: Duration,

    /// The PBKDF2 iteration count used when a new backup is created from a
    /// passphrase.
    pub pbkdf2_rounds: u32,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self { upload_delay: Duration::from_secs(10), pbkdf2_rounds: DEFAULT_PBKDF2_ROUNDS }
    }
}
