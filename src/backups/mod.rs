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

//! Server-side backup support for room keys.
//!
//! This module implements support for server-side key backups using the
//! `m.megolm_backup.v1.curve25519-aes-sha2` backup algorithm as defined in
//! the [spec].
//!
//! The [`BackupMachine`] drives the whole lifecycle: it prepares and creates
//! backup versions, decides whether a version found on the homeserver can be
//! trusted, uploads room keys in bounded chunks, and restores them on a new
//! device from either the recovery key or the original passphrase.
//!
//! [spec]: https://spec.matrix.org/unstable/client-server-api/#server-side-key-backups

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock as StdRwLock},
    time::Duration,
};

use rand::{thread_rng, Rng, RngCore};
use ruma::{
    serde::Base64, DeviceId, DeviceKeyAlgorithm, OwnedRoomId, RoomId, UInt,
};
use tokio::sync::Mutex;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, instrument, trace, warn};
use vodozemac::Ed25519Signature;

use crate::{
    account::Account,
    api::{ApiError, BackupApiClient},
    error::BackupError,
    sessions::{ExportedRoomKey, InboundGroupSession},
    store::{BackupStore, RoomKeyCounts},
    types::{
        BackupVersion, MegolmV1AuthData, RoomKeyBackup, RoomKeyBackupInfo,
        MEGOLM_BACKUP_V1_ALGORITHM,
    },
    utilities::ChannelObservable,
};

pub mod futures;
pub mod keys;
mod types;

use self::futures::WaitForSteadyState;
use self::keys::{MegolmV1BackupKey, RecoveryKey};
pub use self::types::{
    BackupSettings, BackupState, BackupVersionTrust, RoomKeyImportResult, SignatureState,
    UploadState,
};

/// Everything needed to create a new backup version.
///
/// Produced by [`BackupMachine::prepare_keys_backup_version`] and consumed by
/// [`BackupMachine::create_keys_backup_version`]. Only the auth data ever
/// leaves the device; the recovery key is meant to be shown to the user
/// exactly once.
pub struct BackupCreationInfo {
    /// The signed auth data that will be uploaded to the homeserver.
    pub auth_data: MegolmV1AuthData,

    /// The private half of the backup key, to be handed to the user.
    pub recovery_key: RecoveryKey,
}

impl std::fmt::Debug for BackupCreationInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupCreationInfo").field("auth_data", &self.auth_data).finish()
    }
}

impl BackupCreationInfo {
    /// The algorithm identifier of the backup that will be created.
    pub fn algorithm(&self) -> &str {
        MEGOLM_BACKUP_V1_ALGORITHM
    }

    /// The request body that creates this backup version on the homeserver.
    pub fn to_backup_info(&self) -> RoomKeyBackupInfo {
        RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(self.auth_data.clone())
    }
}

/// A state machine that handles backing up room keys.
///
/// The machine is cheap to clone; clones share all of their state. All entry
/// points can be called from any task, state changes are observed in order
/// through [`BackupMachine::state_stream`].
#[derive(Clone, Debug)]
pub struct BackupMachine {
    account: Account,
    store: Arc<dyn BackupStore>,
    client: Arc<dyn BackupApiClient>,
    state: ChannelObservable<BackupState>,
    upload_progress: ChannelObservable<UploadState>,
    backup_key: Arc<StdRwLock<Option<MegolmV1BackupKey>>>,
    upload_delay: Arc<StdRwLock<Duration>>,
    pbkdf2_rounds: u32,
    upload_lock: Arc<Mutex<()>>,
}

impl BackupMachine {
    /// The number of room keys a single upload request may carry.
    const BACKUP_BATCH_SIZE: usize = 100;

    /// Create a new [`BackupMachine`] with the default [`BackupSettings`].
    pub fn new(
        account: Account,
        store: Arc<dyn BackupStore>,
        client: Arc<dyn BackupApiClient>,
    ) -> Self {
        Self::with_settings(account, store, client, BackupSettings::default())
    }

    /// Create a new [`BackupMachine`] with the given [`BackupSettings`].
    pub fn with_settings(
        account: Account,
        store: Arc<dyn BackupStore>,
        client: Arc<dyn BackupApiClient>,
        settings: BackupSettings,
    ) -> Self {
        Self {
            account,
            store,
            client,
            state: ChannelObservable::new(BackupState::Unknown),
            upload_progress: ChannelObservable::new(UploadState::Idle),
            backup_key: StdRwLock::new(None).into(),
            upload_delay: StdRwLock::new(settings.upload_delay).into(),
            pbkdf2_rounds: settings.pbkdf2_rounds,
            upload_lock: Mutex::new(()).into(),
        }
    }

    /// The current state of the backup.
    pub fn state(&self) -> BackupState {
        self.state.get()
    }

    /// Get a stream of updates to the [`BackupState`].
    ///
    /// The current state is always emitted as the first item. Updates are
    /// delivered in the order the transitions happen, intermediate states
    /// are never skipped.
    pub fn state_stream(
        &self,
    ) -> impl futures_core::Stream<Item = Result<BackupState, BroadcastStreamRecvError>> {
        self.state.subscribe()
    }

    /// Are we able to back up room keys to the server?
    pub fn is_enabled(&self) -> bool {
        self.state().is_enabled()
    }

    /// The backup key that is currently used to encrypt room keys, if any.
    pub fn backup_key(&self) -> Option<MegolmV1BackupKey> {
        self.backup_key.read().unwrap().clone()
    }

    /// Get the number of backed up room keys and the total number of room
    /// keys.
    pub async fn room_key_counts(&self) -> Result<RoomKeyCounts, BackupError> {
        Ok(self.store.inbound_group_session_counts().await?)
    }

    /// Replace the upper bound of the upload jitter, returning the previous
    /// value.
    pub fn set_upload_delay(&self, delay: Duration) -> Duration {
        std::mem::replace(&mut *self.upload_delay.write().unwrap(), delay)
    }

    fn set_state(&self, new_state: BackupState) {
        let old_state = self.state.set(new_state);

        if old_state != new_state {
            info!(?old_state, ?new_state, "Backup state changed");
        }

        // A backup that just got torn down can't make progress anymore, any
        // aggregate waiter gets resolved as failed.
        if matches!(new_state, BackupState::Disabled | BackupState::WrongBackupVersion) {
            self.upload_progress.set(UploadState::Error);
        }
    }

    /// Generate the key material and signed auth data for a new backup
    /// version.
    ///
    /// If a `password` is given the private key is derived from it and the
    /// salt and iteration count are included in the auth data, so any future
    /// device can re-derive the key from the same password. Otherwise the
    /// private key is randomly generated.
    ///
    /// Nothing is uploaded or persisted until the returned
    /// [`BackupCreationInfo`] is passed to
    /// [`BackupMachine::create_keys_backup_version`].
    pub async fn prepare_keys_backup_version(
        &self,
        password: Option<&str>,
    ) -> Result<BackupCreationInfo, BackupError> {
        let (recovery_key, salt, rounds) = if let Some(password) = password {
            let password = password.to_owned();
            let rounds = self.pbkdf2_rounds;

            // The key derivation is deliberately expensive, keep it off the
            // async executor.
            let (key, salt) = tokio::task::spawn_blocking(move || {
                let mut salt = [0u8; 32];
                thread_rng().fill_bytes(&mut salt);

                let key = RecoveryKey::from_passphrase(&password, &salt, rounds);

                (key, salt)
            })
            .await
            .expect("The key derivation task should never panic");

            (key, Some(Base64::new(salt.to_vec())), Some(UInt::from(rounds)))
        } else {
            (RecoveryKey::new(), None, None)
        };

        let public_key = recovery_key.megolm_v1_public_key();
        let mut auth_data = MegolmV1AuthData::new(public_key.public_key(), salt, rounds);

        let signature = self.account.sign_json(serde_json::to_value(&auth_data)?)?;
        auth_data
            .signatures
            .entry(self.account.user_id().to_owned())
            .or_default()
            .insert(self.account.signing_key_id(), signature.to_base64());

        Ok(BackupCreationInfo { auth_data, recovery_key })
    }

    /// Publish a prepared backup version on the homeserver and activate it.
    ///
    /// On success every backed-up marker is reset, the returned version
    /// becomes the active one and the upload loop is armed.
    #[instrument(skip_all)]
    pub async fn create_keys_backup_version(
        &self,
        info: &BackupCreationInfo,
    ) -> Result<String, BackupError> {
        self.set_state(BackupState::Enabling);

        let result = async {
            let version = self.client.create_version(&info.to_backup_info()).await?;

            // Markers only ever describe the active version, the new version
            // starts out with every session unknown to it.
            self.store.reset_backup_state().await?;
            self.store.save_backup_version(Some(version.clone())).await?;

            let backup_key = info.recovery_key.megolm_v1_public_key();
            backup_key.set_version(version.clone());
            *self.backup_key.write().unwrap() = Some(backup_key);

            Ok(version)
        }
        .await;

        match &result {
            Ok(version) => {
                info!(version = version.as_str(), "Created a new backup version");
                self.set_state(BackupState::ReadyToBackUp);
                self.schedule_upload();
            }
            Err(e) => {
                warn!(error = ?e, "Couldn't create a new backup version");
                self.set_state(BackupState::Disabled);
            }
        }

        result
    }

    /// Delete the given backup version from the homeserver.
    ///
    /// A version that is already gone counts as successfully deleted.
    pub async fn delete_backup_version(&self, version: &str) -> Result<(), BackupError> {
        match self.client.delete_version(version).await {
            Ok(()) | Err(ApiError::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Disable the backup locally.
    ///
    /// This forgets the backup key and the active version and resets the
    /// backed-up marker of every room key.
    #[instrument(skip_all)]
    pub async fn disable_backup(&self) -> Result<(), BackupError> {
        self.disable_backup_locally().await?;
        self.set_state(BackupState::Disabled);

        Ok(())
    }

    async fn disable_backup_locally(&self) -> Result<(), BackupError> {
        debug!("Disabling key backup and resetting backup state for room keys");

        self.backup_key.write().unwrap().take();
        self.store.save_backup_version(None).await?;
        self.store.reset_backup_state().await?;

        Ok(())
    }

    /// Check on the homeserver whether a backup exists, whether we can trust
    /// it, and if so make it the active one.
    ///
    /// This is the startup entry point: a fresh login calls this once the
    /// sync is running and whenever the device verification state changed.
    #[instrument(skip_all)]
    pub async fn check_and_start_keys_backup(&self) -> Result<(), BackupError> {
        if self.is_enabled() {
            debug!("The backup is already enabled, nothing to check");
            return Ok(());
        }

        self.set_state(BackupState::Checking);

        let result = self.check_and_start_inner().await;

        if result.is_err() {
            // A failed check leaves us as clueless as before it started.
            self.set_state(BackupState::Unknown);
        }

        result
    }

    async fn check_and_start_inner(&self) -> Result<(), BackupError> {
        let Some(version) = self.get_current_version().await? else {
            info!("No backup version was found on the homeserver");
            self.disable_backup_locally().await?;
            self.set_state(BackupState::Disabled);

            return Ok(());
        };

        let trust = self.verify_backup(&version).await?;

        if !trust.usable {
            info!(
                version = version.version.as_str(),
                ?trust,
                "Found a backup version but it's not signed by any trusted device"
            );
            self.set_state(BackupState::NotTrusted);

            return Ok(());
        }

        let RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data) = &version.algorithm
        else {
            warn!(
                algorithm = version.algorithm.algorithm(),
                "Found a trusted backup version with an unsupported algorithm"
            );
            self.set_state(BackupState::NotTrusted);

            return Ok(());
        };

        let active_version = self.store.load_backup_version().await?;

        if active_version.as_deref() != Some(version.version.as_str()) {
            // Switching to another version invalidates every marker, they
            // only ever refer to the active version.
            self.disable_backup_locally().await?;
            self.store.save_backup_version(Some(version.version.clone())).await?;
        }

        let backup_key =
            MegolmV1BackupKey::new(auth_data.public_key, Some(version.version.clone()));
        *self.backup_key.write().unwrap() = Some(backup_key);

        info!(version = version.version.as_str(), "Activated a trusted backup version");
        self.set_state(BackupState::ReadyToBackUp);
        self.schedule_upload();

        Ok(())
    }

    async fn get_current_version(&self) -> Result<Option<BackupVersion>, BackupError> {
        match self.client.get_latest_version().await {
            Ok(version) => Ok(Some(version)),
            // No backup exists, that's not an error.
            Err(ApiError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Verify the auth data of a backup version we downloaded from the
    /// server.
    ///
    /// Only signatures filed under our own user id are considered. The
    /// backup is usable iff at least one signature verifies against the
    /// Ed25519 key of a device the local user has marked as verified.
    pub async fn verify_backup(
        &self,
        version: &BackupVersion,
    ) -> Result<BackupVersionTrust, BackupError> {
        trace!(version = version.version.as_str(), "Verifying backup auth data");

        let RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data) = &version.algorithm
        else {
            return Ok(BackupVersionTrust::default());
        };

        let serialized = match auth_data.to_canonical_json() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = ?e, "Error while verifying backup, can't canonicalize auth data");
                return Ok(BackupVersionTrust::default());
            }
        };

        let mut signatures = BTreeMap::new();

        if let Some(user_signatures) = auth_data.signatures.get(self.account.user_id()) {
            for (key_id, signature) in user_signatures {
                if key_id.algorithm() != DeviceKeyAlgorithm::Ed25519 {
                    continue;
                }

                let device_id = key_id.key_name();
                let state = self.check_device_signature(device_id, signature, &serialized).await?;

                signatures.insert(device_id.to_owned(), state);
            }
        }

        let usable = signatures.values().any(|s| s.trusted());

        if !usable && signatures.values().any(|s| s.signed()) {
            info!(
                version = version.version.as_str(),
                "The backup auth data is correctly signed, but only by devices the user hasn't \
                 verified"
            );
        }

        Ok(BackupVersionTrust { usable, signatures })
    }

    async fn check_device_signature(
        &self,
        device_id: &DeviceId,
        signature: &str,
        canonical_auth_data: &str,
    ) -> Result<SignatureState, BackupError> {
        trace!(?device_id, "Checking backup auth data for device");

        let device = self.store.get_device(self.account.user_id(), device_id).await?;

        let Some(device) = device else {
            trace!(?device_id, "Device not found, can't check signature");
            return Ok(SignatureState::Missing);
        };

        let Ok(signature) = Ed25519Signature::from_base64(signature) else {
            return Ok(SignatureState::Invalid);
        };

        let state = if device
            .ed25519_key()
            .verify(canonical_auth_data.as_bytes(), &signature)
            .is_ok()
        {
            if device.is_locally_trusted() {
                SignatureState::ValidAndTrusted
            } else {
                SignatureState::ValidButNotTrusted
            }
        } else {
            SignatureState::Invalid
        };

        Ok(state)
    }

    /// A debounced trigger for the upload loop.
    ///
    /// The surrounding coordinator calls this whenever a new room key
    /// arrives. If the backup state is still unknown the homeserver is
    /// checked first; if the backup is ready an upload is scheduled after a
    /// random delay. In every other state this is a no-op.
    pub async fn maybe_backup_keys(&self) {
        match self.state() {
            BackupState::Unknown => {
                if let Err(e) = self.check_and_start_keys_backup().await {
                    warn!(error = ?e, "Couldn't check the backup status on the homeserver");
                }
            }
            BackupState::ReadyToBackUp => self.schedule_upload(),
            _ => {
                trace!(state = ?self.state(), "Not scheduling a backup");
            }
        }
    }

    /// Transition to `WillBackUp` and run the upload loop after a uniformly
    /// random delay in `[0, upload_delay)`.
    ///
    /// The jitter spreads the load of many clients receiving the same room
    /// keys at the same time. Only valid to call while the state is
    /// `ReadyToBackUp`.
    fn schedule_upload(&self) {
        self.set_state(BackupState::WillBackUp);

        let delay = *self.upload_delay.read().unwrap();
        let jitter = if delay.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_millis(thread_rng().gen_range(0..delay.as_millis() as u64))
        };

        trace!(?jitter, "Scheduling an upload of the pending room keys");

        let machine = self.clone();

        tokio::spawn(async move {
            tokio::time::sleep(jitter).await;

            if let Err(e) = machine.backup_keys().await {
                warn!(error = ?e, "Couldn't upload the pending room keys");
            }
        });
    }

    /// Upload every pending room key, one bounded chunk at a time.
    ///
    /// At most one chunk is in flight at any time; calling this while an
    /// upload is already running is a no-op. Calling it without an active
    /// backup key and version fails with [`BackupError::NotEnabled`].
    /// Transient errors leave the machine in `ReadyToBackUp`, the next
    /// [`maybe_backup_keys`](BackupMachine::maybe_backup_keys) trigger
    /// retries.
    #[instrument(skip_all)]
    pub async fn backup_keys(&self) -> Result<(), BackupError> {
        let Ok(_guard) = self.upload_lock.try_lock() else {
            trace!("A backup upload is already in progress");
            return Ok(());
        };

        loop {
            let Some(backup_key) = self.backup_key() else {
                warn!("Trying to back up room keys but no backup key was found");
                return Err(BackupError::NotEnabled);
            };

            let Some(version) = backup_key.backup_version() else {
                warn!("Trying to back up room keys but the backup key wasn't uploaded");
                return Err(BackupError::NotEnabled);
            };

            let sessions =
                self.store.inbound_group_sessions_for_backup(Self::BACKUP_BATCH_SIZE).await?;

            if sessions.is_empty() {
                trace!("No room keys need to be backed up");
                self.set_state(BackupState::ReadyToBackUp);
                self.upload_progress.set(UploadState::Done);

                return Ok(());
            }

            self.set_state(BackupState::BackingUp);

            let chunk_was_full = sessions.len() == Self::BACKUP_BATCH_SIZE;
            let rooms = self.encrypt_chunk(&backup_key, &sessions).await?;

            info!(
                key_count = sessions.len(),
                version = version.as_str(),
                "Uploading a chunk of room keys"
            );

            match self.client.upload_keys(&version, rooms).await {
                Ok(()) => {
                    // Markers are only set for chunks the server
                    // acknowledged, and before we leave the `BackingUp`
                    // state.
                    for session in &sessions {
                        self.store
                            .mark_backed_up(session.session_id(), session.sender_key())
                            .await?;
                    }

                    let counts = self.store.inbound_group_session_counts().await?;
                    trace!(?counts, "Marked room keys as backed up");
                    self.upload_progress.set(UploadState::Uploading(counts));

                    if chunk_was_full {
                        self.set_state(BackupState::WillBackUp);
                    } else {
                        self.set_state(BackupState::ReadyToBackUp);
                        self.upload_progress.set(UploadState::Done);

                        return Ok(());
                    }
                }
                Err(ApiError::WrongRoomKeysVersion { current_version }) => {
                    warn!(
                        current_version = current_version.as_str(),
                        "Our backup version was superseded on the homeserver, disabling backups"
                    );

                    self.disable_backup_locally().await?;
                    self.set_state(BackupState::WrongBackupVersion);

                    return Err(BackupError::WrongBackupVersion);
                }
                Err(ApiError::NotFound) => {
                    warn!("The backup was deleted on the homeserver, disabling backups");

                    self.disable_backup_locally().await?;
                    self.set_state(BackupState::Disabled);

                    return Err(ApiError::NotFound.into());
                }
                Err(e) => {
                    warn!(error = ?e, "Couldn't upload a chunk of room keys, will retry");

                    self.set_state(BackupState::ReadyToBackUp);
                    self.upload_progress.set(UploadState::Error);

                    return Err(e.into());
                }
            }
        }
    }

    async fn encrypt_chunk(
        &self,
        backup_key: &MegolmV1BackupKey,
        sessions: &[InboundGroupSession],
    ) -> Result<BTreeMap<OwnedRoomId, RoomKeyBackup>, BackupError> {
        let mut backup: BTreeMap<OwnedRoomId, RoomKeyBackup> = BTreeMap::new();

        for session in sessions {
            let sender_device = self
                .store
                .get_device_from_curve_key(self.account.user_id(), session.sender_key())
                .await?;
            let is_verified = sender_device.is_some_and(|d| d.is_locally_trusted());

            let key_backup_data = backup_key.encrypt(session, is_verified);

            backup
                .entry(session.room_id().to_owned())
                .or_default()
                .sessions
                .insert(session.session_id().to_owned(), key_backup_data);
        }

        Ok(backup)
    }

    /// Returns a future that resolves once every room key the store knows
    /// about has been uploaded, along with a stream of per-chunk progress
    /// updates.
    ///
    /// Awaiting the future kicks the upload loop; only one waiter observes a
    /// given run, a new call supersedes the progress of the previous one.
    pub fn wait_for_steady_state(&self) -> WaitForSteadyState<'_> {
        WaitForSteadyState {
            machine: self,
            progress: self.upload_progress.clone(),
            timeout: None,
        }
    }

    /// Download room keys from the given backup version and import them into
    /// the store, decrypting them with the given recovery key.
    ///
    /// The optional `room_id` and `session_id` narrow the restore down to a
    /// single room or a single session.
    ///
    /// Fails with [`BackupError::InvalidRecoveryKey`] if the recovery key
    /// string doesn't decode, and with
    /// [`BackupError::InvalidRecoveryKeyOrPassword`] if records were found
    /// but none of them could be decrypted.
    pub async fn restore_with_recovery_key(
        &self,
        version: &str,
        recovery_key: &str,
        room_id: Option<&RoomId>,
        session_id: Option<&str>,
    ) -> Result<RoomKeyImportResult, BackupError> {
        let recovery_key = RecoveryKey::from_base58(recovery_key)?;

        self.restore_with_key(version, recovery_key, room_id, session_id).await
    }

    /// Download room keys from the given backup version and import them into
    /// the store, re-deriving the recovery key from the given passphrase.
    ///
    /// Fails with [`BackupError::NoPasswordSupport`] if the version wasn't
    /// created from a passphrase.
    pub async fn restore_with_password(
        &self,
        version: &str,
        password: &str,
        room_id: Option<&RoomId>,
        session_id: Option<&str>,
    ) -> Result<RoomKeyImportResult, BackupError> {
        let backup_version = self.client.get_version(version).await?;

        let RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data) =
            &backup_version.algorithm
        else {
            return Err(BackupError::NoPasswordSupport);
        };

        let (Some(salt), Some(rounds)) =
            (auth_data.private_key_salt.clone(), auth_data.private_key_iterations)
        else {
            return Err(BackupError::NoPasswordSupport);
        };

        let password = password.to_owned();
        let rounds = u32::try_from(u64::from(rounds)).unwrap_or(u32::MAX);

        let recovery_key = tokio::task::spawn_blocking(move || {
            RecoveryKey::from_passphrase(&password, salt.as_bytes(), rounds)
        })
        .await
        .expect("The key derivation task should never panic");

        self.restore_with_key(version, recovery_key, room_id, session_id).await
    }

    #[instrument(skip(self, recovery_key))]
    async fn restore_with_key(
        &self,
        version: &str,
        recovery_key: RecoveryKey,
        room_id: Option<&RoomId>,
        session_id: Option<&str>,
    ) -> Result<RoomKeyImportResult, BackupError> {
        let rooms = self.client.fetch_keys(version, room_id, session_id).await?;

        let mut total_count = 0;
        let mut room_keys: Vec<ExportedRoomKey> = Vec::new();

        for (room_id, room_key_backup) in rooms {
            for (session_id, key_backup_data) in room_key_backup.sessions {
                total_count += 1;

                match recovery_key.decrypt_session_data(&key_backup_data.session_data) {
                    Ok(room_key) => {
                        // The ids of the wire record win over anything the
                        // encrypted payload might claim.
                        room_keys.push(ExportedRoomKey::from_backed_up_room_key(
                            room_id.clone(),
                            session_id,
                            room_key,
                        ));
                    }
                    Err(e) => {
                        warn!(
                            session_id = session_id.as_str(),
                            error = ?e,
                            "Couldn't decrypt a room key we downloaded from the backup"
                        );
                    }
                }
            }
        }

        if total_count > 0 && room_keys.is_empty() {
            return Err(BackupError::InvalidRecoveryKeyOrPassword);
        }

        // Keys restored from the active version are already on the server,
        // re-uploading them would be wasted work. Keys from any other version
        // still need to make it into the active backup.
        let active_version = self.store.load_backup_version().await?;
        let backed_up = active_version.as_deref() == Some(version);

        let imported_count = self.store.import_room_keys(room_keys, backed_up).await?;

        info!(total_count, imported_count, "Restored room keys from the backup");

        Ok(RoomKeyImportResult { total_count, imported_count })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        RwLock as StdRwLock,
    };

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use futures_util::{FutureExt, StreamExt};
    use ruma::{device_id, room_id, user_id};
    use serde_json::json;
    use vodozemac::{Curve25519PublicKey, Curve25519SecretKey};

    use super::{futures::SteadyStateError, *};
    use crate::store::MemoryStore;

    #[derive(Debug, Default)]
    struct FakeHomeserver {
        versions: StdRwLock<BTreeMap<String, RoomKeyBackupInfo>>,
        keys: StdRwLock<BTreeMap<String, BTreeMap<OwnedRoomId, RoomKeyBackup>>>,
        latest: StdRwLock<Option<String>>,
        next_version: AtomicU64,
        fail_creates: AtomicBool,
        fail_uploads: AtomicBool,
        uploads_in_flight: AtomicUsize,
        max_concurrent_uploads: AtomicUsize,
    }

    impl FakeHomeserver {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn version(&self, version: &str) -> Option<BackupVersion> {
            let algorithm = self.versions.read().unwrap().get(version)?.clone();
            let count = self
                .keys
                .read()
                .unwrap()
                .get(version)
                .map(|rooms| rooms.values().map(|r| r.sessions.len()).sum::<usize>())
                .unwrap_or_default();

            Some(BackupVersion {
                algorithm,
                version: version.to_owned(),
                count: UInt::try_from(count as u64).unwrap_or_default(),
                etag: count.to_string(),
            })
        }
    }

    #[async_trait]
    impl BackupApiClient for FakeHomeserver {
        async fn create_version(&self, info: &RoomKeyBackupInfo) -> Result<String, ApiError> {
            if self.fail_creates.load(Ordering::SeqCst) {
                return Err(ApiError::Network("connection refused".to_owned()));
            }

            let version = (self.next_version.fetch_add(1, Ordering::SeqCst) + 1).to_string();

            self.versions.write().unwrap().insert(version.clone(), info.clone());
            self.keys.write().unwrap().insert(version.clone(), Default::default());
            *self.latest.write().unwrap() = Some(version.clone());

            Ok(version)
        }

        async fn delete_version(&self, version: &str) -> Result<(), ApiError> {
            if self.versions.write().unwrap().remove(version).is_none() {
                return Err(ApiError::NotFound);
            }

            self.keys.write().unwrap().remove(version);

            let mut latest = self.latest.write().unwrap();
            if latest.as_deref() == Some(version) {
                *latest = None;
            }

            Ok(())
        }

        async fn get_version(&self, version: &str) -> Result<BackupVersion, ApiError> {
            self.version(version).ok_or(ApiError::NotFound)
        }

        async fn get_latest_version(&self) -> Result<BackupVersion, ApiError> {
            let latest = self.latest.read().unwrap().clone().ok_or(ApiError::NotFound)?;

            self.version(&latest).ok_or(ApiError::NotFound)
        }

        async fn upload_keys(
            &self,
            version: &str,
            rooms: BTreeMap<OwnedRoomId, RoomKeyBackup>,
        ) -> Result<(), ApiError> {
            let in_flight = self.uploads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent_uploads.fetch_max(in_flight, Ordering::SeqCst);

            // Make the request take a moment so overlapping uploads would be
            // visible to the concurrency assertions.
            tokio::time::sleep(Duration::from_millis(5)).await;

            let result = if self.fail_uploads.load(Ordering::SeqCst) {
                Err(ApiError::Network("connection reset by peer".to_owned()))
            } else {
                let latest = self.latest.read().unwrap().clone();

                match latest {
                    None => Err(ApiError::NotFound),
                    Some(latest) if latest != version => {
                        Err(ApiError::WrongRoomKeysVersion { current_version: latest })
                    }
                    Some(_) => {
                        let mut keys = self.keys.write().unwrap();
                        let stored = keys.entry(version.to_owned()).or_default();

                        for (room_id, backup) in rooms {
                            stored.entry(room_id).or_default().sessions.extend(backup.sessions);
                        }

                        Ok(())
                    }
                }
            };

            self.uploads_in_flight.fetch_sub(1, Ordering::SeqCst);

            result
        }

        async fn fetch_keys(
            &self,
            version: &str,
            room_id: Option<&RoomId>,
            session_id: Option<&str>,
        ) -> Result<BTreeMap<OwnedRoomId, RoomKeyBackup>, ApiError> {
            let keys = self.keys.read().unwrap();
            let rooms = keys.get(version).ok_or(ApiError::NotFound)?;

            let mut result = BTreeMap::new();

            for (id, backup) in rooms {
                if room_id.is_some_and(|r| **id != *r) {
                    continue;
                }

                let sessions: BTreeMap<_, _> = backup
                    .sessions
                    .iter()
                    .filter(|(id, _)| session_id.map_or(true, |s| s == id.as_str()))
                    .map(|(id, data)| (id.clone(), data.clone()))
                    .collect();

                if !sessions.is_empty() {
                    result.insert(id.clone(), RoomKeyBackup::new(sessions));
                }
            }

            Ok(result)
        }
    }

    fn alice_account() -> Account {
        Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"))
    }

    fn test_settings() -> BackupSettings {
        BackupSettings { upload_delay: Duration::ZERO, pbkdf2_rounds: 1_000 }
    }

    fn machine_with_account(
        account: &Account,
        client: Arc<FakeHomeserver>,
    ) -> (BackupMachine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.add_device(account.to_device());

        let machine =
            BackupMachine::with_settings(account.clone(), store.clone(), client, test_settings());

        (machine, store)
    }

    fn session(room_id: &RoomId) -> InboundGroupSession {
        let sender_key = Curve25519PublicKey::from(&Curve25519SecretKey::new());

        let mut bytes = [0u8; 32];
        thread_rng().fill_bytes(&mut bytes);
        let session_id = crate::utilities::encode(bytes);

        let mut key_material = [0u8; 64];
        thread_rng().fill_bytes(&mut key_material);

        let key = ExportedRoomKey {
            algorithm: "m.megolm.v1.aes-sha2".to_owned(),
            room_id: room_id.to_owned(),
            sender_key,
            session_id,
            session_key: crate::utilities::encode(key_material),
            sender_claimed_keys: BTreeMap::from([(
                DeviceKeyAlgorithm::Ed25519,
                "F7tUngTREHPSJTitqcGMCODvRTRM9eKqDqDPBpQf/6c".to_owned(),
            )]),
            forwarding_curve25519_key_chain: Vec::new(),
        };

        InboundGroupSession::new(key, 0)
    }

    fn drain_states(
        stream: &mut (impl futures_core::Stream<
            Item = Result<BackupState, BroadcastStreamRecvError>,
        > + Unpin),
    ) -> Vec<BackupState> {
        let mut states = Vec::new();

        while let Some(Some(Ok(state))) = stream.next().now_or_never() {
            states.push(state);
        }

        states
    }

    fn assert_subsequence(states: &[BackupState], expected: &[BackupState]) {
        let mut iter = states.iter();

        for expected_state in expected {
            assert!(
                iter.any(|s| s == expected_state),
                "The observed state changes {states:?} should contain {expected:?} in order"
            );
        }
    }

    #[tokio::test]
    async fn backup_flow() {
        let server = FakeHomeserver::new();
        let account = alice_account();
        let (machine, store) = machine_with_account(&account, server.clone());

        store.add_inbound_group_session(session(room_id!("!test:localhost")));
        store.add_inbound_group_session(session(room_id!("!test2:localhost")));

        let counts = machine.room_key_counts().await.unwrap();
        assert_eq!(counts, RoomKeyCounts { total: 2, backed_up: 0 });

        let mut states = machine.state_stream();

        let info = machine.prepare_keys_backup_version(None).await.unwrap();
        let version = machine.create_keys_backup_version(&info).await.unwrap();
        assert_eq!(version, "1");
        assert!(machine.is_enabled());

        machine
            .wait_for_steady_state()
            .await
            .expect("We should be able to wait for the upload to finish");

        let counts = machine.room_key_counts().await.unwrap();
        assert_eq!(counts, RoomKeyCounts { total: 2, backed_up: 2 });

        let observed = drain_states(&mut states);
        assert_subsequence(
            &observed,
            &[
                BackupState::Enabling,
                BackupState::ReadyToBackUp,
                BackupState::WillBackUp,
                BackupState::BackingUp,
                BackupState::ReadyToBackUp,
            ],
        );

        let uploaded = server.fetch_keys(&version, None, None).await.unwrap();
        let uploaded: usize = uploaded.values().map(|r| r.sessions.len()).sum();
        assert_eq!(uploaded, 2, "Both room keys should have ended up on the server");
    }

    #[tokio::test]
    async fn failed_creation_disables_the_backup() {
        let server = FakeHomeserver::new();
        let (machine, _store) = machine_with_account(&alice_account(), server.clone());

        server.fail_creates.store(true, Ordering::SeqCst);

        let info = machine.prepare_keys_backup_version(None).await.unwrap();
        machine
            .create_keys_backup_version(&info)
            .await
            .expect_err("Creating a version on an unreachable server should fail");

        assert_eq!(machine.state(), BackupState::Disabled);
        assert!(!machine.is_enabled());
        assert!(machine.backup_key().is_none());
    }

    #[tokio::test]
    async fn check_with_no_backup_on_the_server() {
        let server = FakeHomeserver::new();
        let (machine, _store) = machine_with_account(&alice_account(), server);

        machine.check_and_start_keys_backup().await.unwrap();

        assert_eq!(machine.state(), BackupState::Disabled);
        assert!(!machine.is_enabled());
    }

    #[tokio::test]
    async fn transient_upload_errors_self_heal() {
        let server = FakeHomeserver::new();
        let account = alice_account();
        let (machine, store) = machine_with_account(&account, server.clone());

        let info = machine.prepare_keys_backup_version(None).await.unwrap();
        machine.create_keys_backup_version(&info).await.unwrap();
        machine.wait_for_steady_state().await.unwrap();

        // Let the scheduled upload task wind down before injecting the
        // failure.
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.fail_uploads.store(true, Ordering::SeqCst);
        store.add_inbound_group_session(session(room_id!("!test:localhost")));

        let error = machine
            .backup_keys()
            .await
            .expect_err("Uploading to an unreachable server should fail");
        assert_matches!(error, BackupError::Api(ApiError::Network(_)));

        assert_eq!(machine.state(), BackupState::ReadyToBackUp);
        assert!(machine.is_enabled(), "A transient error shouldn't disable the backup");

        let counts = machine.room_key_counts().await.unwrap();
        assert_eq!(counts.backed_up, 0, "A failed chunk must not set any markers");

        // The next trigger retries and succeeds.
        server.fail_uploads.store(false, Ordering::SeqCst);
        machine.wait_for_steady_state().await.unwrap();

        let counts = machine.room_key_counts().await.unwrap();
        assert_eq!(counts, RoomKeyCounts { total: 1, backed_up: 1 });
    }

    #[tokio::test]
    async fn superseded_version_disables_the_backup() {
        let server = FakeHomeserver::new();
        let account = alice_account();
        let (machine, store) = machine_with_account(&account, server.clone());

        store.add_inbound_group_session(session(room_id!("!test:localhost")));
        store.add_inbound_group_session(session(room_id!("!test2:localhost")));

        let info = machine.prepare_keys_backup_version(None).await.unwrap();
        machine.create_keys_backup_version(&info).await.unwrap();
        machine.wait_for_steady_state().await.unwrap();

        // Another client creates a new version behind our back.
        let new_info = machine.prepare_keys_backup_version(None).await.unwrap();
        server.create_version(&new_info.to_backup_info()).await.unwrap();

        store.reset_backup_state().await.unwrap();

        let error = machine
            .wait_for_steady_state()
            .await
            .expect_err("Uploading to a superseded version should fail");
        assert_matches!(error, SteadyStateError::BackupDisabled);

        assert_eq!(machine.state(), BackupState::WrongBackupVersion);
        assert!(!machine.is_enabled());
        assert!(machine.backup_key().is_none());
    }

    #[tokio::test]
    async fn restore_with_recovery_key() {
        let server = FakeHomeserver::new();
        let account = alice_account();
        let (machine, store) = machine_with_account(&account, server.clone());

        let sessions =
            vec![session(room_id!("!test:localhost")), session(room_id!("!test2:localhost"))];
        store.add_inbound_group_sessions(sessions.clone());

        let info = machine.prepare_keys_backup_version(None).await.unwrap();
        let recovery_key = info.recovery_key.to_string();
        let version = machine.create_keys_backup_version(&info).await.unwrap();
        machine.wait_for_steady_state().await.unwrap();

        // A fresh device of the same user.
        let new_account = Account::new(user_id!("@alice:localhost"), device_id!("NEWDEVICE"));
        let (new_machine, new_store) = machine_with_account(&new_account, server.clone());

        let result = new_machine
            .restore_with_recovery_key(&version, &recovery_key, None, None)
            .await
            .expect("We should be able to restore with the correct recovery key");
        assert_eq!(result, RoomKeyImportResult { total_count: 2, imported_count: 2 });

        for session in &sessions {
            let restored = new_store
                .get_inbound_group_session(session.session_id(), session.sender_key())
                .await
                .unwrap()
                .expect("The restored session should be found in the store");

            let restored = restored.export();
            let original = session.export();

            assert_eq!(restored.room_id, original.room_id);
            assert_eq!(restored.algorithm, original.algorithm);
            assert_eq!(restored.session_key, original.session_key);
            assert_eq!(restored.sender_claimed_keys, original.sender_claimed_keys);
            assert_eq!(
                restored.forwarding_curve25519_key_chain,
                original.forwarding_curve25519_key_chain
            );
        }

        // The restore happened from a version this device isn't backing up
        // to, the keys still need to reach the active backup.
        let counts = new_store.inbound_group_session_counts().await.unwrap();
        assert_eq!(counts, RoomKeyCounts { total: 2, backed_up: 0 });
    }

    #[tokio::test]
    async fn restore_with_the_wrong_recovery_key() {
        let server = FakeHomeserver::new();
        let account = alice_account();
        let (machine, store) = machine_with_account(&account, server.clone());

        store.add_inbound_group_session(session(room_id!("!test:localhost")));
        store.add_inbound_group_session(session(room_id!("!test2:localhost")));

        let info = machine.prepare_keys_backup_version(None).await.unwrap();
        let version = machine.create_keys_backup_version(&info).await.unwrap();
        machine.wait_for_steady_state().await.unwrap();

        let new_account = Account::new(user_id!("@alice:localhost"), device_id!("NEWDEVICE"));
        let (new_machine, new_store) = machine_with_account(&new_account, server.clone());

        // Well-formed, but not the key this backup was created with.
        const WRONG_KEY: &str = "EsTc LW2K PGiF wKEA 3As5 g5c4 BXwk qeeJ ZJV8 Q9fu gUMN UE4d";

        let error = new_machine
            .restore_with_recovery_key(&version, WRONG_KEY, None, None)
            .await
            .expect_err("Restoring with the wrong recovery key should fail");
        assert_matches!(error, BackupError::InvalidRecoveryKeyOrPassword);

        let counts = new_store.inbound_group_session_counts().await.unwrap();
        assert_eq!(counts.total, 0, "No sessions should have been imported");

        // A string that doesn't even decode fails earlier and differently.
        let error = new_machine
            .restore_with_recovery_key(&version, "definitely not a recovery key", None, None)
            .await
            .expect_err("Restoring with a malformed recovery key should fail");
        assert_matches!(error, BackupError::InvalidRecoveryKey(_));
    }

    #[tokio::test]
    async fn scoped_restore() {
        let server = FakeHomeserver::new();
        let account = alice_account();
        let (machine, store) = machine_with_account(&account, server.clone());

        let first_room = room_id!("!test:localhost");
        let second_room = room_id!("!test2:localhost");

        let first = session(first_room);
        let second = session(second_room);
        store.add_inbound_group_sessions([first.clone(), second.clone()]);

        let info = machine.prepare_keys_backup_version(None).await.unwrap();
        let recovery_key = info.recovery_key.to_string();
        let version = machine.create_keys_backup_version(&info).await.unwrap();
        machine.wait_for_steady_state().await.unwrap();

        let new_account = Account::new(user_id!("@alice:localhost"), device_id!("NEWDEVICE"));
        let (new_machine, _new_store) = machine_with_account(&new_account, server.clone());

        let result = new_machine
            .restore_with_recovery_key(&version, &recovery_key, Some(first_room), None)
            .await
            .unwrap();
        assert_eq!(result, RoomKeyImportResult { total_count: 1, imported_count: 1 });

        let result = new_machine
            .restore_with_recovery_key(
                &version,
                &recovery_key,
                Some(second_room),
                Some(second.session_id()),
            )
            .await
            .unwrap();
        assert_eq!(result, RoomKeyImportResult { total_count: 1, imported_count: 1 });
    }

    #[tokio::test]
    async fn password_backup_and_restore() {
        let server = FakeHomeserver::new();
        let account = alice_account();
        let (machine, store) = machine_with_account(&account, server.clone());

        store.add_inbound_group_session(session(room_id!("!test:localhost")));
        store.add_inbound_group_session(session(room_id!("!test2:localhost")));

        let info = machine.prepare_keys_backup_version(Some("password")).await.unwrap();
        assert!(
            info.auth_data.private_key_salt.is_some(),
            "A passphrase-based backup should advertise its salt"
        );
        assert_eq!(info.auth_data.private_key_iterations.map(u64::from), Some(1_000));

        let recovery_key = info.recovery_key.to_string();
        let version = machine.create_keys_backup_version(&info).await.unwrap();
        machine.wait_for_steady_state().await.unwrap();

        let new_account = Account::new(user_id!("@alice:localhost"), device_id!("NEWDEVICE"));
        let (new_machine, _new_store) = machine_with_account(&new_account, server.clone());

        let error = new_machine
            .restore_with_password(&version, "passw0rd", None, None)
            .await
            .expect_err("Restoring with the wrong password should fail");
        assert_matches!(error, BackupError::InvalidRecoveryKeyOrPassword);

        let result = new_machine
            .restore_with_password(&version, "password", None, None)
            .await
            .expect("We should be able to restore with the original password");
        assert_eq!(result, RoomKeyImportResult { total_count: 2, imported_count: 2 });

        // The recovery key that was handed out at creation time works too.
        let third_account = Account::new(user_id!("@alice:localhost"), device_id!("THIRDDEVICE"));
        let (third_machine, _third_store) = machine_with_account(&third_account, server.clone());

        let result = third_machine
            .restore_with_recovery_key(&version, &recovery_key, None, None)
            .await
            .unwrap();
        assert_eq!(result.imported_count, 2);
    }

    #[tokio::test]
    async fn password_restore_needs_password_support() {
        let server = FakeHomeserver::new();
        let account = alice_account();
        let (machine, store) = machine_with_account(&account, server.clone());

        store.add_inbound_group_session(session(room_id!("!test:localhost")));

        // A backup created without a passphrase carries no salt or iteration
        // count.
        let info = machine.prepare_keys_backup_version(None).await.unwrap();
        let version = machine.create_keys_backup_version(&info).await.unwrap();
        machine.wait_for_steady_state().await.unwrap();

        let new_account = Account::new(user_id!("@alice:localhost"), device_id!("NEWDEVICE"));
        let (new_machine, _new_store) = machine_with_account(&new_account, server.clone());

        let error = new_machine
            .restore_with_password(&version, "password", None, None)
            .await
            .expect_err("A key-only backup can't be restored with a password");
        assert_matches!(error, BackupError::NoPasswordSupport);
    }

    #[tokio::test]
    async fn restore_from_the_active_version_skips_rebackup() {
        let server = FakeHomeserver::new();
        let account = alice_account();
        let (machine, store) = machine_with_account(&account, server.clone());

        store.add_inbound_group_session(session(room_id!("!test:localhost")));
        store.add_inbound_group_session(session(room_id!("!test2:localhost")));

        let info = machine.prepare_keys_backup_version(None).await.unwrap();
        let recovery_key = info.recovery_key.to_string();
        let version = machine.create_keys_backup_version(&info).await.unwrap();
        machine.wait_for_steady_state().await.unwrap();

        // The new device trusts the old one and adopts the active version
        // before restoring.
        let new_account = Account::new(user_id!("@alice:localhost"), device_id!("NEWDEVICE"));
        let (new_machine, new_store) = machine_with_account(&new_account, server.clone());
        new_store.add_device(account.to_device());

        new_machine.check_and_start_keys_backup().await.unwrap();
        assert!(new_machine.is_enabled());
        assert_eq!(new_store.load_backup_version().await.unwrap(), Some(version.clone()));

        let result = new_machine
            .restore_with_recovery_key(&version, &recovery_key, None, None)
            .await
            .unwrap();
        assert_eq!(result.imported_count, 2);

        // Restoring from the active version must not schedule a re-upload.
        let counts = new_store.inbound_group_session_counts().await.unwrap();
        assert_eq!(counts, RoomKeyCounts { total: 2, backed_up: 2 });
    }

    #[tokio::test]
    async fn resume_on_a_new_device() {
        let server = FakeHomeserver::new();
        let account = alice_account();
        let (machine, store) = machine_with_account(&account, server.clone());

        store.add_inbound_group_session(session(room_id!("!test:localhost")));

        let info = machine.prepare_keys_backup_version(None).await.unwrap();
        let version = machine.create_keys_backup_version(&info).await.unwrap();
        machine.wait_for_steady_state().await.unwrap();

        // A fresh login that doesn't know the old device yet.
        let new_account = Account::new(user_id!("@alice:localhost"), device_id!("NEWDEVICE"));
        let (new_machine, new_store) = machine_with_account(&new_account, server.clone());

        new_machine.check_and_start_keys_backup().await.unwrap();
        assert_eq!(new_machine.state(), BackupState::NotTrusted);
        assert!(!new_machine.is_enabled());

        // The devices verify each other; the new device now knows and
        // trusts the one that signed the backup.
        new_store.add_device(account.to_device());

        new_machine.check_and_start_keys_backup().await.unwrap();
        assert!(new_machine.is_enabled());
        assert_eq!(
            new_machine.backup_key().and_then(|k| k.backup_version()),
            Some(version.clone()),
            "The new device should upload to the same version"
        );

        new_store.add_inbound_group_session(session(room_id!("!test2:localhost")));
        new_machine.wait_for_steady_state().await.unwrap();

        let counts = new_store.inbound_group_session_counts().await.unwrap();
        assert_eq!(counts.backed_up, counts.total);

        let uploaded = server.fetch_keys(&version, None, None).await.unwrap();
        let uploaded: usize = uploaded.values().map(|r| r.sessions.len()).sum();
        assert_eq!(uploaded, 2, "Both devices should have uploaded to the same version");
    }

    #[tokio::test]
    async fn verify_auth_data() {
        let server = FakeHomeserver::new();
        let account = alice_account();
        let (machine, _store) = machine_with_account(&account, server);

        fn version_with(info: RoomKeyBackupInfo) -> BackupVersion {
            BackupVersion {
                algorithm: info,
                version: "1".to_owned(),
                count: 0u32.into(),
                etag: String::new(),
            }
        }

        // Unsigned auth data is never usable.
        let unsigned: RoomKeyBackupInfo = serde_json::from_value(json!({
            "algorithm": "m.megolm_backup.v1.curve25519-aes-sha2",
            "auth_data": {
                "public_key": "XjhWTCjW7l59pbfx9tlCBQolfnIQWARoKOzjTOPSlWM",
            }
        }))
        .unwrap();

        let trust = machine.verify_backup(&version_with(unsigned)).await.unwrap();
        assert!(!trust.usable);
        assert!(trust.signatures.is_empty());

        // Signed by our own, implicitly trusted, device.
        let info = machine.prepare_keys_backup_version(None).await.unwrap();
        let trust = machine.verify_backup(&version_with(info.to_backup_info())).await.unwrap();
        assert!(trust.usable);
        assert_eq!(
            trust.signatures.get(account.device_id()),
            Some(&SignatureState::ValidAndTrusted)
        );

        // The same auth data seen by a device that doesn't know the signer.
        let stranger = Account::new(user_id!("@alice:localhost"), device_id!("STRANGER"));
        let (stranger_machine, stranger_store) =
            machine_with_account(&stranger, FakeHomeserver::new());

        let trust =
            stranger_machine.verify_backup(&version_with(info.to_backup_info())).await.unwrap();
        assert!(!trust.usable, "A signature from an unknown device makes nothing usable");
        assert_eq!(trust.signatures.get(account.device_id()), Some(&SignatureState::Missing));

        // Known, but not verified.
        let mut device = account.to_device();
        device.set_local_trust(false);
        stranger_store.add_device(device);

        let trust =
            stranger_machine.verify_backup(&version_with(info.to_backup_info())).await.unwrap();
        assert!(!trust.usable, "A signature from an unverified device makes nothing usable");
        assert_eq!(
            trust.signatures.get(account.device_id()),
            Some(&SignatureState::ValidButNotTrusted)
        );

        // Known and verified.
        let mut device = account.to_device();
        device.set_local_trust(true);
        stranger_store.add_device(device);

        let trust =
            stranger_machine.verify_backup(&version_with(info.to_backup_info())).await.unwrap();
        assert!(trust.usable, "A signature from a verified device makes the backup usable");

        // Tampered auth data invalidates the signature.
        let mut tampered = info.auth_data.clone();
        tampered.public_key =
            Curve25519PublicKey::from_base64("XjhWTCjW7l59pbfx9tlCBQolfnIQWARoKOzjTOPSlWM")
                .unwrap();

        let trust = machine
            .verify_backup(&version_with(RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(
                tampered,
            )))
            .await
            .unwrap();
        assert!(!trust.usable);
        assert_eq!(trust.signatures.get(account.device_id()), Some(&SignatureState::Invalid));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn only_one_chunk_in_flight() {
        let server = FakeHomeserver::new();
        let account = alice_account();
        let (machine, store) = machine_with_account(&account, server.clone());

        let room_id = room_id!("!test:localhost");
        for _ in 0..150 {
            store.add_inbound_group_session(session(room_id));
        }

        let info = machine.prepare_keys_backup_version(None).await.unwrap();
        machine.create_keys_backup_version(&info).await.unwrap();

        // Hammer the upload loop from several tasks at once.
        let mut handles = Vec::new();
        for _ in 0..4 {
            let machine = machine.clone();
            handles.push(tokio::spawn(async move { machine.backup_keys().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        machine.wait_for_steady_state().await.unwrap();

        let counts = machine.room_key_counts().await.unwrap();
        assert_eq!(counts, RoomKeyCounts { total: 150, backed_up: 150 });

        assert_eq!(
            server.max_concurrent_uploads.load(Ordering::SeqCst),
            1,
            "At most one upload chunk should ever be in flight"
        );
    }

    #[tokio::test]
    async fn backing_up_while_disabled_fails() {
        let server = FakeHomeserver::new();
        let (machine, store) = machine_with_account(&alice_account(), server);

        store.add_inbound_group_session(session(room_id!("!test:localhost")));

        let error = machine
            .backup_keys()
            .await
            .expect_err("Uploading without an active backup version should fail");
        assert_matches!(error, BackupError::NotEnabled);

        let counts = machine.room_key_counts().await.unwrap();
        assert_eq!(counts.backed_up, 0, "Nothing should have been marked as backed up");
    }

    #[tokio::test]
    async fn waiting_while_disabled_fails() {
        let server = FakeHomeserver::new();
        let (machine, _store) = machine_with_account(&alice_account(), server);

        let error = machine
            .wait_for_steady_state()
            .await
            .expect_err("Waiting for a disabled backup should fail");
        assert_matches!(error, SteadyStateError::BackupDisabled);
    }

    #[tokio::test]
    async fn deleting_a_deleted_version_is_fine() {
        let server = FakeHomeserver::new();
        let (machine, _store) = machine_with_account(&alice_account(), server.clone());

        let info = machine.prepare_keys_backup_version(None).await.unwrap();
        let version = machine.create_keys_backup_version(&info).await.unwrap();

        machine.delete_backup_version(&version).await.unwrap();
        machine
            .delete_backup_version(&version)
            .await
            .expect("Deleting an already deleted version shouldn't error");
    }
}
