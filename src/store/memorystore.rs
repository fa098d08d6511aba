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

use std::{
    collections::BTreeMap,
    sync::RwLock,
};

use async_trait::async_trait;
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use vodozemac::Curve25519PublicKey;

use super::{BackupStore, Device, Result, RoomKeyCounts};
use crate::sessions::{ExportedRoomKey, InboundGroupSession};

/// An in-memory [`BackupStore`] implementation.
///
/// Nothing survives a restart; this is meant for tests and for clients that
/// treat every run as a fresh login.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Sessions keyed by (sender key, session id).
    inbound_group_sessions: RwLock<BTreeMap<(String, String), InboundGroupSession>>,
    devices: RwLock<BTreeMap<(OwnedUserId, OwnedDeviceId), Device>>,
    backup_version: RwLock<Option<String>>,
}

impl MemoryStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn session_key(session: &InboundGroupSession) -> (String, String) {
        (session.sender_key().to_base64(), session.session_id().to_owned())
    }

    /// Add an inbound group session to the store.
    ///
    /// Sessions the store already knows about are left untouched, including
    /// their backed-up marker.
    pub fn add_inbound_group_session(&self, session: InboundGroupSession) -> bool {
        let key = Self::session_key(&session);
        let mut sessions = self.inbound_group_sessions.write().unwrap();

        if sessions.contains_key(&key) {
            false
        } else {
            sessions.insert(key, session);
            true
        }
    }

    /// Add a batch of inbound group sessions to the store.
    pub fn add_inbound_group_sessions(
        &self,
        sessions: impl IntoIterator<Item = InboundGroupSession>,
    ) {
        for session in sessions {
            self.add_inbound_group_session(session);
        }
    }

    /// Add or replace a device of the local user.
    pub fn add_device(&self, device: Device) {
        self.devices
            .write()
            .unwrap()
            .insert((device.user_id().to_owned(), device.device_id().to_owned()), device);
    }
}

#[async_trait]
impl BackupStore for MemoryStore {
    async fn inbound_group_sessions_for_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<InboundGroupSession>> {
        Ok(self
            .inbound_group_sessions
            .read()
            .unwrap()
            .values()
            .filter(|s| !s.backed_up())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn inbound_group_session_counts(&self) -> Result<RoomKeyCounts> {
        let sessions = self.inbound_group_sessions.read().unwrap();
        let backed_up = sessions.values().filter(|s| s.backed_up()).count();

        Ok(RoomKeyCounts { total: sessions.len(), backed_up })
    }

    async fn mark_backed_up(
        &self,
        session_id: &str,
        sender_key: Curve25519PublicKey,
    ) -> Result<()> {
        let key = (sender_key.to_base64(), session_id.to_owned());

        if let Some(session) = self.inbound_group_sessions.read().unwrap().get(&key) {
            session.mark_as_backed_up();
        }

        Ok(())
    }

    async fn reset_backup_state(&self) -> Result<()> {
        for session in self.inbound_group_sessions.read().unwrap().values() {
            session.reset_backup_state();
        }

        Ok(())
    }

    async fn load_backup_version(&self) -> Result<Option<String>> {
        Ok(self.backup_version.read().unwrap().clone())
    }

    async fn save_backup_version(&self, version: Option<String>) -> Result<()> {
        *self.backup_version.write().unwrap() = version;

        Ok(())
    }

    async fn get_inbound_group_session(
        &self,
        session_id: &str,
        sender_key: Curve25519PublicKey,
    ) -> Result<Option<InboundGroupSession>> {
        let key = (sender_key.to_base64(), session_id.to_owned());

        Ok(self.inbound_group_sessions.read().unwrap().get(&key).cloned())
    }

    async fn import_room_keys(
        &self,
        keys: Vec<ExportedRoomKey>,
        backed_up: bool,
    ) -> Result<usize> {
        let mut imported = 0;

        for key in keys {
            let session = InboundGroupSession::from(key);

            if backed_up {
                session.mark_as_backed_up();
            }

            if self.add_inbound_group_session(session) {
                imported += 1;
            }
        }

        Ok(imported)
    }

    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<Device>> {
        Ok(self
            .devices
            .read()
            .unwrap()
            .get(&(user_id.to_owned(), device_id.to_owned()))
            .cloned())
    }

    async fn get_device_from_curve_key(
        &self,
        user_id: &UserId,
        curve_key: Curve25519PublicKey,
    ) -> Result<Option<Device>> {
        Ok(self
            .devices
            .read()
            .unwrap()
            .values()
            .find(|d| d.user_id() == user_id && d.curve25519_key() == Some(curve_key))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use ruma::room_id;
    use serde_json::json;
    use vodozemac::Curve25519SecretKey;

    use super::*;

    fn session(room: &str, index: u8) -> InboundGroupSession {
        let sender_key =
            Curve25519PublicKey::from(&Curve25519SecretKey::new()).to_base64();

        let key: ExportedRoomKey = serde_json::from_value(json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "room_id": room,
            "sender_key": sender_key,
            "session_id": format!("session_{index}"),
            "session_key": "AQAAAABvWMNZjKFtebYIePKieQguozuoLgzeY6wKcyJjLJcJtQgy1dPqTBD1",
            "sender_claimed_keys": {},
            "forwarding_curve25519_key_chain": []
        }))
        .unwrap();

        InboundGroupSession::new(key, 0)
    }

    #[tokio::test]
    async fn marker_accounting() {
        let store = MemoryStore::new();
        let sessions: Vec<_> = (0..10).map(|i| session("!test:localhost", i)).collect();
        store.add_inbound_group_sessions(sessions.clone());

        let counts = store.inbound_group_session_counts().await.unwrap();
        assert_eq!(counts, RoomKeyCounts { total: 10, backed_up: 0 });

        store
            .mark_backed_up(sessions[0].session_id(), sessions[0].sender_key())
            .await
            .unwrap();

        let counts = store.inbound_group_session_counts().await.unwrap();
        assert_eq!(counts, RoomKeyCounts { total: 10, backed_up: 1 });
        assert_eq!(
            store.inbound_group_sessions_for_backup(usize::MAX).await.unwrap().len(),
            9
        );

        store.reset_backup_state().await.unwrap();

        let counts = store.inbound_group_session_counts().await.unwrap();
        assert_eq!(counts, RoomKeyCounts { total: 10, backed_up: 0 });
        assert_eq!(
            store.inbound_group_sessions_for_backup(usize::MAX).await.unwrap().len(),
            10
        );
    }

    #[tokio::test]
    async fn count_difference_matches_pending() {
        let store = MemoryStore::new();
        store.add_inbound_group_sessions((0..5).map(|i| session("!test:localhost", i)));

        for session in store.inbound_group_sessions_for_backup(2).await.unwrap() {
            store.mark_backed_up(session.session_id(), session.sender_key()).await.unwrap();
        }

        let counts = store.inbound_group_session_counts().await.unwrap();
        let pending = store.inbound_group_sessions_for_backup(usize::MAX).await.unwrap();

        assert_eq!(counts.total - counts.backed_up, pending.len());
    }

    #[tokio::test]
    async fn import_skips_known_sessions() {
        let store = MemoryStore::new();
        let session = session("!test:localhost", 0);
        store.add_inbound_group_session(session.clone());

        let imported = store
            .import_room_keys(vec![session.export()], false)
            .await
            .unwrap();
        assert_eq!(imported, 0, "A known session shouldn't be imported again");

        let other = self::session(room_id!("!other:localhost").as_str(), 1);
        let imported = store.import_room_keys(vec![other.export()], true).await.unwrap();
        assert_eq!(imported, 1);

        let counts = store.inbound_group_session_counts().await.unwrap();
        assert_eq!(counts, RoomKeyCounts { total: 2, backed_up: 1 });
    }
}
