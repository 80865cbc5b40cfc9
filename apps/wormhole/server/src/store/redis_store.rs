use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use time::OffsetDateTime;
use tracing::debug;

use super::{
    client_auth_disabled, keys, rfc3339, score, EndpointInfo, EndpointKind, SessionRecord,
    SessionStore, StoreError,
};

/// [`SessionStore`] backed by Redis. Multi-key writes run as `MULTI`/`EXEC`
/// pipelines.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn backend_id_from_token(&self, token: &str) -> Result<String, StoreError> {
        let mut conn = self.redis.clone();
        let backend: Option<String> = conn.hget(keys::BACKEND_TOKENS, token).await?;
        backend.ok_or(StoreError::UnknownToken)
    }

    async fn register_connection(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let fields = session.fields()?;
        redis::pipe()
            .atomic()
            .hset_multiple(keys::session(&session.id), fields.as_slice())
            .ignore()
            .zadd(
                keys::SESSIONS_CONNECTED,
                &session.id,
                score(session.connected_at),
            )
            .ignore()
            .sadd(keys::node_sessions(&session.node_id), &session.id)
            .ignore()
            .sadd(keys::backend_sessions(&session.backend_id), &session.id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        debug!(session_id = %session.id, "registered connection");
        Ok(())
    }

    async fn register_disconnection(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let now = OffsetDateTime::now_utc();
        redis::pipe()
            .atomic()
            .zadd(keys::SESSIONS_DISCONNECTED, &session.id, score(now))
            .ignore()
            .srem(keys::node_sessions(&session.node_id), &session.id)
            .ignore()
            .srem(keys::backend_sessions(&session.backend_id), &session.id)
            .ignore()
            .hset(keys::session(&session.id), "disconnected_at", rfc3339(now)?)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        debug!(session_id = %session.id, "registered disconnection");
        Ok(())
    }

    async fn register_endpoints(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let connected_at = rfc3339(session.connected_at)?;
        let last_seen_at = rfc3339(OffsetDateTime::now_utc())?;
        let endpoints_key = keys::backend_endpoints(&session.backend_id);

        let mut pipe = redis::pipe();
        pipe.atomic();
        for endpoint in &session.endpoints {
            let entry = endpoint.entry();
            pipe.sadd(&endpoints_key, &entry)
                .ignore()
                .hset_multiple(
                    keys::backend_endpoint(&session.backend_id, &entry),
                    &[
                        ("cluster", session.cluster.as_str()),
                        ("connected_at", connected_at.as_str()),
                        ("last_seen_at", last_seen_at.as_str()),
                        ("region", session.region.as_str()),
                    ],
                )
                .ignore();
        }
        pipe.hset(keys::session(&session.id), "endpoints", session.endpoint_list())
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn unregister_endpoints(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let endpoints_key = keys::backend_endpoints(&session.backend_id);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for endpoint in &session.endpoints {
            let entry = endpoint.entry();
            pipe.srem(&endpoints_key, &entry)
                .ignore()
                .del(keys::backend_endpoint(&session.backend_id, &entry))
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn touch_endpoints(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let last_seen_at = rfc3339(OffsetDateTime::now_utc())?;
        let mut pipe = redis::pipe();
        for endpoint in &session.endpoints {
            pipe.hset(
                keys::backend_endpoint(&session.backend_id, &endpoint.entry()),
                "last_seen_at",
                &last_seen_at,
            )
            .ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn register_release(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let Some(release) = &session.release else {
            return Ok(());
        };
        let mut conn = self.redis.clone();
        let now = OffsetDateTime::now_utc();
        let mut fields: Vec<(&str, String)> = release
            .fields()
            .iter()
            .map(|(name, value)| (*name, value.to_string()))
            .collect();
        fields.push(("created_at", rfc3339(now)?));

        redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(keys::backend_releases(&session.backend_id))
            .arg("NX")
            .arg(score(now))
            .arg(&release.id)
            .ignore()
            .hset_multiple(
                keys::backend_release(&session.backend_id, &release.id),
                fields.as_slice(),
            )
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn requires_client_auth(&self, backend_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let flag: Option<String> = conn
            .hget(keys::backend(backend_id), "client_auth_disabled")
            .await?;
        Ok(!client_auth_disabled(flag.as_deref()))
    }

    async fn client_cas(&self, backend_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.redis.clone();
        let chain: Option<Vec<u8>> = conn
            .hget(keys::backend(backend_id), "client_auth_chain")
            .await?;
        Ok(chain.filter(|pem| !pem.is_empty()))
    }

    async fn valid_certificate(
        &self,
        backend_id: &str,
        fingerprint: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn
            .sismember(keys::valid_certificates(backend_id), fingerprint)
            .await?)
    }

    async fn backend_endpoints(&self, backend_id: &str) -> Result<Vec<EndpointInfo>, StoreError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.smembers(keys::backend_endpoints(backend_id)).await?;
        let tag = EndpointKind::Tls.tag();
        let mut endpoints = Vec::new();
        for entry in entries {
            let Some(address) = entry.strip_prefix(tag) else {
                continue;
            };
            let fields: HashMap<String, String> = conn
                .hgetall(keys::backend_endpoint(backend_id, &entry))
                .await?;
            endpoints.push(endpoint_info(address, fields));
        }
        endpoints.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(endpoints)
    }
}

pub(super) fn endpoint_info(address: &str, mut fields: HashMap<String, String>) -> EndpointInfo {
    EndpointInfo {
        address: address.to_string(),
        cluster: fields.remove("cluster").unwrap_or_default(),
        connected_at: fields.remove("connected_at").unwrap_or_default(),
        last_seen_at: fields.remove("last_seen_at").unwrap_or_default(),
    }
}
