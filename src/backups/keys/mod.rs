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

//! Module for the keys that are used to back up room keys.
//!
//! The backup key is split into two parts:
//!
//! ```text
//!                 ┌─────────────────────────────────┐
//!                 │  RecoveryKey | MegolmV1BackupKey │
//!                 └─────────────────────────────────┘
//! ```
//!
//! 1. [`RecoveryKey`], a private Curve25519 key that is used to decrypt
//!    backed up room keys. It can be randomly generated or derived from a
//!    passphrase and is presented to the user as a base58 encoded string.
//!
//! 2. [`MegolmV1BackupKey`], the public part of the recovery key. This one
//!    is uploaded to the homeserver as part of the backup version's auth
//!    data and is used to encrypt every room key that gets backed up.
//!
//! To regain access to backed up room keys on a new device the user either
//! re-enters the passphrase, transcribes the base58 recovery key, or
//! receives the key through some secret-sharing mechanism of the
//! surrounding system.

mod backup;
mod compat;
mod recovery;

pub use backup::MegolmV1BackupKey;
pub use compat::{DecryptionError, MessageDecodeError};
pub use recovery::{DecodeError, RecoveryKey, DEFAULT_PBKDF2_ROUNDS};
