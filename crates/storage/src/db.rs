use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use tokio::time::{Duration, Instant};
use tracing::debug;

use hotdeal_common::StorageError;

use crate::keyspace::Keyspace;
use crate::options::{KeyTtl, SetOptions};
use crate::script::Script;
use crate::stream::{ReadFrom, StreamEntry, StreamId};

/// Estado compartilhado entre todos os handles.
struct SharedState {
    keyspace: Keyspace,
    /// Comandos comuns pegam leitura; scripts pegam escrita.
    gate: RwLock<()>,
    scripts: RwLock<HashMap<String, Arc<dyn Script>>>,
}

/// Handle para o store in-memory.
#[derive(Clone)]
pub struct Db {
    shared: Arc<SharedState>,
}

impl Db {
    pub fn new() -> Self {
        let db = Db {
            shared: Arc::new(SharedState {
                keyspace: Keyspace::new(),
                gate: RwLock::new(()),
                scripts: RwLock::new(HashMap::new()),
            }),
        };

        // Spawn background task para purgar keys expiradas
        let shared = db.shared.clone();
        tokio::spawn(async move {
            purge_expired_keys(shared).await;
        });

        db
    }

    fn read<R>(&self, op: impl FnOnce(&Keyspace) -> R) -> R {
        let _gate = self.shared.gate.read().unwrap_or_else(PoisonError::into_inner);
        op(&self.shared.keyspace)
    }

    // --- Keys ---

    pub fn del(&self, keys: &[String]) -> usize {
        self.read(|ks| ks.del(keys))
    }

    pub fn exists(&self, keys: &[String]) -> usize {
        self.read(|ks| ks.exists(keys))
    }

    pub fn ttl(&self, key: &str) -> KeyTtl {
        self.read(|ks| ks.ttl(key))
    }

    // --- String operations ---

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.read(|ks| ks.get(key))
    }

    pub fn set(&self, key: String, value: Bytes, options: &SetOptions) -> Result<bool, StorageError> {
        self.read(|ks| ks.set(key, value, options))
    }

    pub fn incr(&self, key: &str) -> Result<i64, StorageError> {
        self.read(|ks| ks.incr(key))
    }

    pub fn decr(&self, key: &str) -> Result<i64, StorageError> {
        self.read(|ks| ks.decr(key))
    }

    pub fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StorageError> {
        self.read(|ks| ks.incr_by(key, delta))
    }

    // --- Hash operations ---

    pub fn hset(&self, key: &str, fields: &[(String, Bytes)]) -> Result<usize, StorageError> {
        self.read(|ks| ks.hset(key, fields))
    }

    pub fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>, StorageError> {
        self.read(|ks| ks.hget(key, field))
    }

    pub fn hgetall(&self, key: &str) -> Result<HashMap<String, Bytes>, StorageError> {
        self.read(|ks| ks.hgetall(key))
    }

    // --- Set operations ---

    pub fn sadd(&self, key: &str, members: &[String]) -> Result<usize, StorageError> {
        self.read(|ks| ks.sadd(key, members))
    }

    pub fn srem(&self, key: &str, members: &[String]) -> Result<usize, StorageError> {
        self.read(|ks| ks.srem(key, members))
    }

    pub fn sismember(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        self.read(|ks| ks.sismember(key, member))
    }

    pub fn scard(&self, key: &str) -> Result<usize, StorageError> {
        self.read(|ks| ks.scard(key))
    }

    // --- Sorted set operations ---

    pub fn zadd(&self, key: &str, members: &[(f64, String)]) -> Result<usize, StorageError> {
        self.read(|ks| ks.zadd(key, members))
    }

    pub fn zrem(&self, key: &str, members: &[String]) -> Result<usize, StorageError> {
        self.read(|ks| ks.zrem(key, members))
    }

    pub fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StorageError> {
        self.read(|ks| ks.zscore(key, member))
    }

    pub fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<(String, f64)>, StorageError> {
        self.read(|ks| ks.zrange(key, start, stop))
    }

    pub fn zrevrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<(String, f64)>, StorageError> {
        self.read(|ks| ks.zrevrange(key, start, stop))
    }

    // --- Bitmap operations ---

    pub fn setbit(&self, key: &str, offset: u64, on: bool) -> Result<bool, StorageError> {
        self.read(|ks| ks.setbit(key, offset, on))
    }

    pub fn getbit(&self, key: &str, offset: u64) -> Result<bool, StorageError> {
        self.read(|ks| ks.getbit(key, offset))
    }

    pub fn bitfield_get_u(&self, key: &str, bits: u32, offset: u64) -> Result<u64, StorageError> {
        self.read(|ks| ks.bitfield_get_u(key, bits, offset))
    }

    // --- Stream operations ---

    pub fn xadd(&self, key: &str, fields: Vec<(String, Bytes)>) -> Result<StreamId, StorageError> {
        self.read(|ks| ks.xadd(key, fields))
    }

    pub fn xgroup_create(
        &self,
        key: &str,
        group: &str,
        start: &str,
        mkstream: bool,
    ) -> Result<(), StorageError> {
        self.read(|ks| ks.xgroup_create(key, group, start, mkstream))
    }

    pub fn xreadgroup(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        from: ReadFrom,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        self.read(|ks| ks.xreadgroup(key, group, consumer, count, from))
    }

    /// XREADGROUP ... BLOCK: espera até `block` por entradas novas.
    /// Retorna vazio no timeout.
    pub async fn xreadgroup_blocking(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        let deadline = Instant::now() + block;
        loop {
            // Registrar interesse antes de ler, para não perder um XADD no meio
            let notified = self.shared.keyspace.notify_stream.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.xreadgroup(key, group, consumer, count, ReadFrom::New)?;
            if !entries.is_empty() {
                return Ok(entries);
            }

            tokio::select! {
                _ = &mut notified => continue,
                _ = tokio::time::sleep_until(deadline) => return Ok(vec![]),
            }
        }
    }

    pub fn xack(&self, key: &str, group: &str, ids: &[StreamId]) -> Result<usize, StorageError> {
        self.read(|ks| ks.xack(key, group, ids))
    }

    pub fn xpending_count(&self, key: &str, group: &str) -> Result<usize, StorageError> {
        self.read(|ks| ks.xpending_count(key, group))
    }

    pub fn xdelivery_count(&self, key: &str, group: &str, id: StreamId) -> Result<Option<u64>, StorageError> {
        self.read(|ks| ks.xdelivery_count(key, group, id))
    }

    pub fn xlen(&self, key: &str) -> Result<usize, StorageError> {
        self.read(|ks| ks.xlen(key))
    }

    // --- Scripts ---

    /// SCRIPT LOAD: registra o script e devolve o nome para o EVALSHA.
    pub fn script_load(&self, script: Arc<dyn Script>) -> String {
        let name = script.name().to_string();
        let mut scripts = self
            .shared
            .scripts
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        scripts.insert(name.clone(), script);
        debug!("script registrado: {name}");
        name
    }

    pub fn script_exists(&self, name: &str) -> bool {
        let scripts = self.shared.scripts.read().unwrap_or_else(PoisonError::into_inner);
        scripts.contains_key(name)
    }

    /// EVALSHA: executa um script registrado.
    pub fn evalsha(&self, name: &str, keys: &[String], args: &[String]) -> Result<i64, StorageError> {
        let script = {
            let scripts = self.shared.scripts.read().unwrap_or_else(PoisonError::into_inner);
            scripts
                .get(name)
                .cloned()
                .ok_or_else(|| StorageError::NoScript(name.to_string()))?
        };
        self.eval(script.as_ref(), keys, args)
    }

    /// EVAL: executa o script com acesso exclusivo ao keyspace.
    pub fn eval(&self, script: &dyn Script, keys: &[String], args: &[String]) -> Result<i64, StorageError> {
        let _gate = self.shared.gate.write().unwrap_or_else(PoisonError::into_inner);
        script.call(&self.shared.keyspace, keys, args)
    }
}

impl Default for Db {
    fn default() -> Self {
        Self::new()
    }
}

/// Background task que purga chaves expiradas.
async fn purge_expired_keys(shared: Arc<SharedState>) {
    loop {
        match shared.keyspace.next_expiry() {
            Some(when) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(when) => {}
                    _ = shared.keyspace.notify_expiry.notified() => { continue; }
                }
            }
            None => {
                shared.keyspace.notify_expiry.notified().await;
                continue;
            }
        }

        purge_due(&shared);
    }
}

fn purge_due(shared: &SharedState) {
    let _gate = shared.gate.read().unwrap_or_else(PoisonError::into_inner);
    let removed = shared.keyspace.purge_expired(Instant::now());
    if removed > 0 {
        debug!("{removed} keys expiradas purgadas");
    }
}
