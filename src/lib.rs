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

//! A server-side key backup engine for Matrix clients.
//!
//! A device accumulates inbound Megolm group sessions while it decrypts room
//! messages. If the device is lost, or the user signs in elsewhere, those
//! sessions are gone and with them the ability to read old messages. This
//! crate implements the `m.megolm_backup.v1.curve25519-aes-sha2` backup
//! algorithm from the [spec]: every session key is encrypted under a
//! user-held public key and uploaded to the homeserver, organized by room
//! and session, from where a later login can restore it with the recovery
//! key or the original passphrase.
//!
//! The [`BackupMachine`] is the main entry point. It is handed three
//! collaborators and otherwise self-contained:
//!
//! * an [`Account`], the device's signing identity,
//! * a [`store::BackupStore`], the local session/device store of the
//!   surrounding crypto coordinator,
//! * an [`api::BackupApiClient`], a thin client for the `/room_keys`
//!   endpoints.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use matrix_keys_backup::{store::MemoryStore, Account, BackupMachine};
//! use ruma::{device_id, user_id};
//!
//! # async fn example(
//! #     client: Arc<dyn matrix_keys_backup::api::BackupApiClient>,
//! # ) -> Result<(), matrix_keys_backup::BackupError> {
//! let account = Account::new(user_id!("@alice:example.org"), device_id!("DEVICEID"));
//! let store = Arc::new(MemoryStore::new());
//!
//! let machine = BackupMachine::new(account, store, client);
//!
//! let info = machine.prepare_keys_backup_version(None).await?;
//! println!("Your recovery key: {}", info.recovery_key);
//!
//! machine.create_keys_backup_version(&info).await?;
//! machine.wait_for_steady_state().await.unwrap();
//! # Ok(())
//! # }
//! ```
//!
//! [spec]: https://spec.matrix.org/unstable/client-server-api/#server-side-key-backups

#![warn(missing_docs, missing_debug_implementations)]

mod account;
mod error;
mod utilities;

pub mod api;
pub mod backups;
pub mod sessions;
pub mod store;
pub mod types;

pub use account::Account;
pub use backups::{
    BackupCreationInfo, BackupMachine, BackupSettings, BackupState, BackupVersionTrust,
    RoomKeyImportResult, SignatureState, UploadState,
};
pub use error::{BackupError, SignatureError};
