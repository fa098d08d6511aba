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

//! Error types used by the backup engine.

use ruma::CanonicalJsonError;
use thiserror::Error;

use crate::{
    api::ApiError,
    backups::keys::{DecodeError, DecryptionError},
    store::CryptoStoreError,
};

/// Error type describing the failure cases of signed canonical JSON handling.
///
/// Signature checks themselves don't error, they are reported as
/// [`SignatureState`](crate::SignatureState) values; this type only covers
/// failures to produce the signed byte string.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// The signed object couldn't be treated as a JSON object.
    #[error("The signed object isn't a valid JSON object")]
    NotAnObject,

    /// The object couldn't be converted into canonical JSON.
    #[error(transparent)]
    CanonicalJson(#[from] CanonicalJsonError),

    /// The object couldn't be serialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Error type for the high-level backup operations.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The recovery key couldn't be decoded, it is either malformed or its
    /// checksum didn't match.
    #[error(transparent)]
    InvalidRecoveryKey(#[from] DecodeError),

    /// Records were found on the homeserver but none of them could be
    /// decrypted with the given recovery key or passphrase.
    #[error(
        "None of the fetched room keys could be decrypted with the given \
         recovery key or passphrase"
    )]
    InvalidRecoveryKeyOrPassword,

    /// A passphrase-based restore was requested for a backup version that
    /// wasn't created from a passphrase.
    #[error("The backup version doesn't support passphrase-based recovery")]
    NoPasswordSupport,

    /// The homeserver reported that the version we're uploading to has been
    /// superseded by a newer one.
    #[error("The currently active backup version was superseded on the homeserver")]
    WrongBackupVersion,

    /// An operation that requires an enabled backup was called while the
    /// backup was disabled.
    #[error("Backups are not enabled")]
    NotEnabled,

    /// A lower-level cryptographic primitive failed.
    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    /// Signing or verifying the backup auth data failed.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// The local store returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// The homeserver returned an error.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// A JSON payload couldn't be serialized or deserialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
