// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Redis-backed session store.
//!
//! One hash per session key, expiry via `EXPIRE`, counters via `HINCRBY`,
//! discovery via cursor `SCAN MATCH`. Creation uses `HSETNX` on the identity
//! field so two instances racing to create the same session resolve without
//! a lock. Every command runs under the store deadline; a breach reports
//! `StoreError::Timeout` and the caller degrades to memory-only.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{
    session_key, session_key_pattern, Protocol, PutOutcome, SessionRecord, SessionStats,
    SessionStatus, SessionStore, StatField, StoreError, TouchOutcome, GLOBAL_STATS_KEY,
};

pub struct RedisSessionStore {
    manager: ConnectionManager,
    op_timeout: Duration,
}

impl RedisSessionStore {
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let manager = tokio::time::timeout(op_timeout, client.get_connection_manager())
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            manager,
            op_timeout,
        })
    }

    async fn run<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let key = session_key(proto, inbox_id_hash);
        let mut conn = self.conn();
        let fields: HashMap<String, String> = self.run(conn.hgetall(&key)).await?;
        Ok(SessionRecord::from_fields(
            fields.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        ))
    }

    async fn put_new(
        &self,
        proto: Protocol,
        record: &SessionRecord,
    ) -> Result<PutOutcome, StoreError> {
        let key = session_key(proto, &record.inbox_id_hash);
        let mut conn = self.conn();
        // HSETNX on the identity field decides who creates the record.
        let created: bool = self
            .run(conn.hset_nx(&key, "inbox_id_hash", &record.inbox_id_hash))
            .await?;
        if !created {
            return Ok(PutOutcome::AlreadyExists);
        }
        let fields: Vec<(String, String)> = record
            .to_fields()
            .into_iter()
            .filter(|(name, _)| name != "inbox_id_hash")
            .collect();
        let () = self.run(conn.hset_multiple(&key, &fields)).await?;
        let _: bool = self
            .run(conn.expire(&key, record.ttl_seconds as i64))
            .await?;
        Ok(PutOutcome::Created)
    }

    async fn touch(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
        ttl: Duration,
    ) -> Result<TouchOutcome, StoreError> {
        let key = session_key(proto, inbox_id_hash);
        let mut conn = self.conn();
        let exists: bool = self.run(conn.expire(&key, ttl.as_secs() as i64)).await?;
        if !exists {
            return Ok(TouchOutcome::Missing);
        }
        let now = Utc::now().timestamp_millis().to_string();
        let () = self.run(conn.hset(&key, "last_used_at", now)).await?;
        Ok(TouchOutcome::Touched)
    }

    async fn refresh(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
        ttl: Duration,
    ) -> Result<TouchOutcome, StoreError> {
        let key = session_key(proto, inbox_id_hash);
        let mut conn = self.conn();
        let exists: bool = self.run(conn.expire(&key, ttl.as_secs() as i64)).await?;
        if !exists {
            return Ok(TouchOutcome::Missing);
        }
        let now = Utc::now().timestamp_millis().to_string();
        let () = self.run(conn.hset(&key, "last_refreshed_at", now)).await?;
        Ok(TouchOutcome::Touched)
    }

    async fn set_status(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
        status: SessionStatus,
    ) -> Result<TouchOutcome, StoreError> {
        let key = session_key(proto, inbox_id_hash);
        let mut conn = self.conn();
        let exists: bool = self.run(conn.exists(&key)).await?;
        if !exists {
            return Ok(TouchOutcome::Missing);
        }
        let () = self.run(conn.hset(&key, "status", status.as_str())).await?;
        Ok(TouchOutcome::Touched)
    }

    async fn incr_stat(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
        field: StatField,
        delta: i64,
    ) -> Result<(), StoreError> {
        let key = session_key(proto, inbox_id_hash);
        let mut conn = self.conn();
        let _: i64 = self.run(conn.hincr(&key, field.as_str(), delta)).await?;
        Ok(())
    }

    async fn incr_global(&self, field: StatField, delta: i64) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: i64 = self
            .run(conn.hincr(GLOBAL_STATS_KEY, field.as_str(), delta))
            .await?;
        Ok(())
    }

    async fn global_stats(&self) -> Result<SessionStats, StoreError> {
        let mut conn = self.conn();
        let fields: HashMap<String, String> = self.run(conn.hgetall(GLOBAL_STATS_KEY)).await?;
        let get = |name: &str| {
            fields
                .get(name)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0u64)
        };
        Ok(SessionStats {
            hits: get("hits"),
            misses: get("misses"),
            noops_ok: get("noops_ok"),
            noops_fail: get("noops_fail"),
        })
    }

    async fn scan_active(
        &self,
        proto: Protocol,
    ) -> Result<Vec<(String, SessionRecord)>, StoreError> {
        let pattern = session_key_pattern(proto);
        let prefix = session_key(proto, "");

        // SCAN walks the whole cursor space before any HGETALL; the keyspace
        // for session records is small by construction (bounded by the fleet's
        // live inbox count).
        let mut conn = self.conn();
        let keys: Vec<String> = tokio::time::timeout(self.op_timeout, async {
            let mut found = Vec::new();
            let mut iter = conn.scan_match::<_, String>(&pattern).await?;
            while let Some(key) = iter.next_item().await {
                found.push(key);
            }
            redis::RedisResult::Ok(found)
        })
        .await
        .map_err(|_| StoreError::Timeout)?
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut sessions = Vec::with_capacity(keys.len());
        for key in keys {
            let mut conn = self.conn();
            let fields: HashMap<String, String> = self.run(conn.hgetall(&key)).await?;
            let record = SessionRecord::from_fields(
                fields.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            );
            match record {
                Some(record) if record.status != SessionStatus::Retired => {
                    let hash = key.strip_prefix(&prefix).unwrap_or(&key).to_string();
                    sessions.push((hash, record));
                }
                Some(_) => {}
                None => {
                    // Identity-less hash: a counter increment recreated the
                    // key after expiry. It carries no TTL, so reap it here.
                    debug!("session_cleaned key={} reason=orphan", key);
                    let _: i64 = self.run(conn.del(&key)).await?;
                }
            }
        }
        Ok(sessions)
    }

    async fn remove(&self, proto: Protocol, inbox_id_hash: &str) -> Result<(), StoreError> {
        let key = session_key(proto, inbox_id_hash);
        let mut conn = self.conn();
        let _: i64 = self.run(conn.del(&key)).await?;
        Ok(())
    }
}
