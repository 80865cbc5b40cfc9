use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;

use super::redis_store::endpoint_info;
use super::{
    client_auth_disabled, keys, rfc3339, score, EndpointInfo, EndpointKind, SessionRecord,
    SessionStore, StoreError,
};

#[derive(Default)]
struct Data {
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, BTreeSet<String>>,
    zsets: HashMap<String, BTreeMap<String, i64>>,
}

impl Data {
    fn hset(&mut self, key: &str, field: &str, value: impl Into<String>) {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.into());
    }

    fn hget(&self, key: &str, field: &str) -> Option<&String> {
        self.hashes.get(key)?.get(field)
    }

    fn sadd(&mut self, key: &str, member: &str) {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
    }

    fn srem(&mut self, key: &str, member: &str) {
        if let Some(set) = self.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                self.sets.remove(key);
            }
        }
    }

    fn zadd(&mut self, key: &str, member: &str, score: i64, only_new: bool) {
        let zset = self.zsets.entry(key.to_string()).or_default();
        if only_new && zset.contains_key(member) {
            return;
        }
        zset.insert(member.to_string(), score);
    }
}

/// In-process [`SessionStore`] using the same key layout as
/// [`super::RedisStore`]. Every operation mutates under one lock, so
/// multi-key writes are atomic.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<Data>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_token(&self, token: &str, backend_id: &str) {
        self.data.lock().hset(keys::BACKEND_TOKENS, token, backend_id);
    }

    pub fn set_backend_field(&self, backend_id: &str, field: &str, value: &str) {
        self.data.lock().hset(&keys::backend(backend_id), field, value);
    }

    pub fn add_valid_certificate(&self, backend_id: &str, fingerprint: &str) {
        self.data
            .lock()
            .sadd(&keys::valid_certificates(backend_id), fingerprint);
    }

    /// Makes every subsequent call fail as if the store were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn hash(&self, key: &str) -> Option<HashMap<String, String>> {
        self.data.lock().hashes.get(key).cloned()
    }

    pub fn members(&self, key: &str) -> Vec<String> {
        self.data
            .lock()
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn zscore(&self, key: &str, member: &str) -> Option<i64> {
        self.data.lock().zsets.get(key)?.get(member).copied()
    }

    /// All keys currently holding data, sorted.
    pub fn keys(&self) -> Vec<String> {
        let data = self.data.lock();
        let mut keys: Vec<String> = data
            .hashes
            .keys()
            .chain(data.sets.keys())
            .chain(data.zsets.keys())
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "memory store marked unavailable",
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn backend_id_from_token(&self, token: &str) -> Result<String, StoreError> {
        self.check()?;
        self.data
            .lock()
            .hget(keys::BACKEND_TOKENS, token)
            .cloned()
            .ok_or(StoreError::UnknownToken)
    }

    async fn register_connection(&self, session: &SessionRecord) -> Result<(), StoreError> {
        self.check()?;
        let fields = session.fields()?;
        let mut data = self.data.lock();
        let key = keys::session(&session.id);
        for (field, value) in fields {
            data.hset(&key, field, value);
        }
        data.zadd(
            keys::SESSIONS_CONNECTED,
            &session.id,
            score(session.connected_at),
            false,
        );
        data.sadd(&keys::node_sessions(&session.node_id), &session.id);
        data.sadd(&keys::backend_sessions(&session.backend_id), &session.id);
        Ok(())
    }

    async fn register_disconnection(&self, session: &SessionRecord) -> Result<(), StoreError> {
        self.check()?;
        let now = OffsetDateTime::now_utc();
        let disconnected_at = rfc3339(now)?;
        let mut data = self.data.lock();
        data.zadd(keys::SESSIONS_DISCONNECTED, &session.id, score(now), false);
        data.srem(&keys::node_sessions(&session.node_id), &session.id);
        data.srem(&keys::backend_sessions(&session.backend_id), &session.id);
        data.hset(&keys::session(&session.id), "disconnected_at", disconnected_at);
        Ok(())
    }

    async fn register_endpoints(&self, session: &SessionRecord) -> Result<(), StoreError> {
        self.check()?;
        let connected_at = rfc3339(session.connected_at)?;
        let last_seen_at = rfc3339(OffsetDateTime::now_utc())?;
        let mut data = self.data.lock();
        for endpoint in &session.endpoints {
            let entry = endpoint.entry();
            data.sadd(&keys::backend_endpoints(&session.backend_id), &entry);
            let key = keys::backend_endpoint(&session.backend_id, &entry);
            data.hset(&key, "cluster", session.cluster.as_str());
            data.hset(&key, "connected_at", connected_at.as_str());
            data.hset(&key, "last_seen_at", last_seen_at.as_str());
            data.hset(&key, "region", session.region.as_str());
        }
        data.hset(
            &keys::session(&session.id),
            "endpoints",
            session.endpoint_list(),
        );
        Ok(())
    }

    async fn unregister_endpoints(&self, session: &SessionRecord) -> Result<(), StoreError> {
        self.check()?;
        let mut data = self.data.lock();
        for endpoint in &session.endpoints {
            let entry = endpoint.entry();
            data.srem(&keys::backend_endpoints(&session.backend_id), &entry);
            data.hashes
                .remove(&keys::backend_endpoint(&session.backend_id, &entry));
        }
        Ok(())
    }

    async fn touch_endpoints(&self, session: &SessionRecord) -> Result<(), StoreError> {
        self.check()?;
        let last_seen_at = rfc3339(OffsetDateTime::now_utc())?;
        let mut data = self.data.lock();
        for endpoint in &session.endpoints {
            let key = keys::backend_endpoint(&session.backend_id, &endpoint.entry());
            data.hset(&key, "last_seen_at", last_seen_at.as_str());
        }
        Ok(())
    }

    async fn register_release(&self, session: &SessionRecord) -> Result<(), StoreError> {
        self.check()?;
        let Some(release) = &session.release else {
            return Ok(());
        };
        let now = OffsetDateTime::now_utc();
        let created_at = rfc3339(now)?;
        let mut data = self.data.lock();
        data.zadd(
            &keys::backend_releases(&session.backend_id),
            &release.id,
            score(now),
            true,
        );
        let key = keys::backend_release(&session.backend_id, &release.id);
        for (field, value) in release.fields() {
            data.hset(&key, field, value);
        }
        data.hset(&key, "created_at", created_at);
        Ok(())
    }

    async fn requires_client_auth(&self, backend_id: &str) -> Result<bool, StoreError> {
        self.check()?;
        let data = self.data.lock();
        let flag = data.hget(&keys::backend(backend_id), "client_auth_disabled");
        Ok(!client_auth_disabled(flag.map(String::as_str)))
    }

    async fn client_cas(&self, backend_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check()?;
        Ok(self
            .data
            .lock()
            .hget(&keys::backend(backend_id), "client_auth_chain")
            .filter(|pem| !pem.is_empty())
            .map(|pem| pem.as_bytes().to_vec()))
    }

    async fn valid_certificate(
        &self,
        backend_id: &str,
        fingerprint: &str,
    ) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self
            .data
            .lock()
            .sets
            .get(&keys::valid_certificates(backend_id))
            .is_some_and(|set| set.contains(fingerprint)))
    }

    async fn backend_endpoints(&self, backend_id: &str) -> Result<Vec<EndpointInfo>, StoreError> {
        self.check()?;
        let data = self.data.lock();
        let tag = EndpointKind::Tls.tag();
        let Some(entries) = data.sets.get(&keys::backend_endpoints(backend_id)) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .iter()
            .filter_map(|entry| {
                let address = entry.strip_prefix(tag)?;
                let fields = data
                    .hashes
                    .get(&keys::backend_endpoint(backend_id, entry))
                    .cloned()
                    .unwrap_or_default();
                Some(endpoint_info(address, fields))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Endpoint;
    use wormhole_core::Release;

    fn record() -> SessionRecord {
        SessionRecord {
            id: "abc123".into(),
            node_id: "node-1".into(),
            backend_id: "1".into(),
            client_addr: "10.0.0.9:51000".into(),
            client_version: "0.1.0".into(),
            cluster: "wormhole.example".into(),
            region: "ams".into(),
            endpoints: vec![
                Endpoint::tcp("node-1:40001"),
                Endpoint::tls("abc123.wormhole.example:443"),
            ],
            release: None,
            connected_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn token_lookup_distinguishes_unknown_and_unavailable() {
        let store = MemoryStore::new();
        store.add_token("fly_token", "1");
        assert_eq!(store.backend_id_from_token("fly_token").await.unwrap(), "1");
        assert!(matches!(
            store.backend_id_from_token("nope").await,
            Err(StoreError::UnknownToken)
        ));
        store.set_unavailable(true);
        assert!(matches!(
            store.backend_id_from_token("fly_token").await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn connection_lifecycle_keeps_audit_hash() {
        let store = MemoryStore::new();
        let session = record();
        store.register_connection(&session).await.unwrap();
        store.register_endpoints(&session).await.unwrap();

        assert!(store.zscore("sessions:connected", "abc123").is_some());
        assert_eq!(store.members("node:node-1:sessions"), vec!["abc123"]);
        assert_eq!(store.members("backend:1:sessions"), vec!["abc123"]);
        assert_eq!(
            store.members("backend:1:endpoints"),
            vec!["node-1:40001", "tls:abc123.wormhole.example:443"]
        );
        let hash = store.hash("session:abc123").unwrap();
        assert_eq!(hash["backend_id"], "1");
        assert_eq!(
            hash["endpoints"],
            "node-1:40001,tls:abc123.wormhole.example:443"
        );

        store.unregister_endpoints(&session).await.unwrap();
        store.register_disconnection(&session).await.unwrap();

        assert!(store.members("backend:1:endpoints").is_empty());
        assert!(store.hash("backend:1:endpoint:node-1:40001").is_none());
        assert!(store.members("backend:1:sessions").is_empty());
        assert!(store.zscore("sessions:disconnected", "abc123").is_some());
        let hash = store.hash("session:abc123").unwrap();
        assert!(hash.contains_key("disconnected_at"));
    }

    #[tokio::test]
    async fn backend_endpoints_lists_tls_entries_only() {
        let store = MemoryStore::new();
        let session = record();
        store.register_endpoints(&session).await.unwrap();

        let endpoints = store.backend_endpoints("1").await.unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].address, "abc123.wormhole.example:443");
        assert_eq!(endpoints[0].cluster, "wormhole.example");
        assert!(!endpoints[0].last_seen_at.is_empty());
    }

    #[tokio::test]
    async fn release_is_recorded_once() {
        let store = MemoryStore::new();
        let mut session = record();
        session.release = Some(Release {
            id: "v1".into(),
            branch: "main".into(),
            ..Release::default()
        });
        store.register_release(&session).await.unwrap();
        let first = store.zscore("backend:1:releases", "v1").unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.register_release(&session).await.unwrap();
        assert_eq!(store.zscore("backend:1:releases", "v1"), Some(first));
        assert_eq!(store.hash("backend:1:release:v1").unwrap()["branch"], "main");
    }

    #[tokio::test]
    async fn client_auth_settings() {
        let store = MemoryStore::new();
        assert!(store.requires_client_auth("1").await.unwrap());
        store.set_backend_field("1", "client_auth_disabled", "true");
        assert!(!store.requires_client_auth("1").await.unwrap());
        assert_eq!(store.client_cas("1").await.unwrap(), None);

        store.add_valid_certificate("1", "ab12");
        assert!(store.valid_certificate("1", "ab12").await.unwrap());
        assert!(!store.valid_certificate("1", "cd34").await.unwrap());
    }
}
