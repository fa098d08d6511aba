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

//! The engine-side view of an inbound Megolm group session.
//!
//! The backup engine doesn't ratchet or decrypt anything itself, it only
//! needs the session metadata and the exported key material so it can be
//! encrypted under the backup key. The Megolm pipeline that produces these
//! sessions lives outside of this crate.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use ruma::{DeviceKeyAlgorithm, OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use vodozemac::Curve25519PublicKey;

use crate::types::{
    deserialize_curve_key, deserialize_curve_key_vec, serialize_curve_key,
    serialize_curve_key_vec,
};

/// An exported version of an inbound group session.
///
/// This can be used to share the session with another device or to import it
/// into a store.
#[derive(Clone, Deserialize, Serialize)]
#[allow(missing_debug_implementations)]
pub struct ExportedRoomKey {
    /// The encryption algorithm that the session uses.
    pub algorithm: String,

    /// The room where the session is used.
    pub room_id: OwnedRoomId,

    /// The Curve25519 key of the device which initiated the session
    /// originally.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The ID of the session that the key is for.
    pub session_id: String,

    /// The key for the session.
    pub session_key: String,

    /// The Ed25519 key of the device which initiated the session originally.
    #[serde(default)]
    pub sender_claimed_keys: BTreeMap<DeviceKeyAlgorithm, String>,

    /// Chain of Curve25519 keys through which this session was forwarded, via
    /// `m.forwarded_room_key` events.
    #[serde(
        default,
        deserialize_with = "deserialize_curve_key_vec",
        serialize_with = "serialize_curve_key_vec"
    )]
    pub forwarding_curve25519_key_chain: Vec<Curve25519PublicKey>,
}

impl ExportedRoomKey {
    /// Create an `ExportedRoomKey` from a `BackedUpRoomKey`.
    ///
    /// The room id and session id of the outer backup record are
    /// authoritative and override anything the encrypted payload might have
    /// claimed.
    pub fn from_backed_up_room_key(
        room_id: OwnedRoomId,
        session_id: String,
        room_key: BackedUpRoomKey,
    ) -> Self {
        let BackedUpRoomKey {
            algorithm,
            sender_key,
            session_key,
            sender_claimed_keys,
            forwarding_curve25519_key_chain,
        } = room_key;

        Self {
            algorithm,
            room_id,
            sender_key,
            session_id,
            session_key,
            sender_claimed_keys,
            forwarding_curve25519_key_chain,
        }
    }
}

/// A backed up version of an inbound group session.
///
/// This is the plaintext that gets encrypted under the backup public key; the
/// room id and session id are carried by the enclosing wire record instead.
#[derive(Clone, Deserialize, Serialize)]
#[allow(missing_debug_implementations)]
pub struct BackedUpRoomKey {
    /// The encryption algorithm that the session uses.
    pub algorithm: String,

    /// The Curve25519 key of the device which initiated the session
    /// originally.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The key for the session.
    pub session_key: String,

    /// The Ed25519 key of the device which initiated the session originally.
    pub sender_claimed_keys: BTreeMap<DeviceKeyAlgorithm, String>,

    /// Chain of Curve25519 keys through which this session was forwarded, via
    /// `m.forwarded_room_key` events.
    #[serde(
        deserialize_with = "deserialize_curve_key_vec",
        serialize_with = "serialize_curve_key_vec"
    )]
    pub forwarding_curve25519_key_chain: Vec<Curve25519PublicKey>,
}

impl From<ExportedRoomKey> for BackedUpRoomKey {
    fn from(k: ExportedRoomKey) -> Self {
        Self {
            algorithm: k.algorithm,
            sender_key: k.sender_key,
            session_key: k.session_key,
            sender_claimed_keys: k.sender_claimed_keys,
            forwarding_curve25519_key_chain: k.forwarding_curve25519_key_chain,
        }
    }
}

struct InnerSession {
    key: ExportedRoomKey,
    first_known_index: u32,
    backed_up: AtomicBool,
}

/// An inbound Megolm group session as the backup engine sees it.
///
/// Cloning is cheap and clones share the backed-up marker, mirroring how the
/// session is shared between the store and the engine.
#[derive(Clone)]
pub struct InboundGroupSession {
    inner: Arc<InnerSession>,
}

impl std::fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("room_id", &self.room_id())
            .field("session_id", &self.session_id())
            .field("sender_key", &self.sender_key().to_base64())
            .finish()
    }
}

impl InboundGroupSession {
    /// Wrap an exported room key into a session the engine can track.
    pub fn new(key: ExportedRoomKey, first_known_index: u32) -> Self {
        Self {
            inner: Arc::new(InnerSession {
                key,
                first_known_index,
                backed_up: AtomicBool::new(false),
            }),
        }
    }

    /// The id of the room this session belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.inner.key.room_id
    }

    /// The unique id of this session.
    pub fn session_id(&self) -> &str {
        &self.inner.key.session_id
    }

    /// The Curve25519 identity key of the device that created this session.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.inner.key.sender_key
    }

    /// The lowest message index this session is able to decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.inner.first_known_index
    }

    /// How many times this session was re-shared before it reached us.
    pub fn forwarded_count(&self) -> usize {
        self.inner.key.forwarding_curve25519_key_chain.len()
    }

    /// Has this session been uploaded to the currently active backup?
    pub fn backed_up(&self) -> bool {
        self.inner.backed_up.load(Ordering::SeqCst)
    }

    /// Flag this session as uploaded to the currently active backup.
    pub fn mark_as_backed_up(&self) {
        self.inner.backed_up.store(true, Ordering::SeqCst);
    }

    /// Clear the backed-up flag, the session will be picked up by the next
    /// upload run.
    pub fn reset_backup_state(&self) {
        self.inner.backed_up.store(false, Ordering::SeqCst);
    }

    /// Convert the session to the plaintext form that gets encrypted under
    /// the backup key.
    pub fn to_backup(&self) -> BackedUpRoomKey {
        self.inner.key.clone().into()
    }

    /// Export the session including its room and session ids.
    pub fn export(&self) -> ExportedRoomKey {
        self.inner.key.clone()
    }
}

impl From<ExportedRoomKey> for InboundGroupSession {
    fn from(key: ExportedRoomKey) -> Self {
        Self::new(key, 0)
    }
}
