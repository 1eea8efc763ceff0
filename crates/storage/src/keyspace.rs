use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::mapref::one::{Ref, RefMut};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use hotdeal_common::StorageError;

use crate::entry::{Entry, Value};
use crate::options::{KeyTtl, SetCondition, SetOptions};
use crate::stream::{ReadFrom, Stream, StreamEntry, StreamId};
use crate::zset::SortedSet;

/// Maior offset aceito por SETBIT (2^32 bits, como no Redis).
const MAX_BIT_OFFSET: u64 = 1 << 32;

/// Item no BTreeSet de expiração: (instante, chave).
/// Ordenado por instante para purga eficiente.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd)]
struct ExpiryEntry(Instant, String);

/// Os dados do store, sem controle de concorrência entre comandos.
///
/// Cada operação individual é atômica por chave (DashMap). Atomicidade entre
/// várias operações fica a cargo do [`Db`](crate::Db), que só entrega o
/// keyspace a um [`Script`](crate::Script) com acesso exclusivo.
pub struct Keyspace {
    data: DashMap<String, Entry>,
    expiry: Mutex<BTreeSet<ExpiryEntry>>,
    pub(crate) notify_expiry: Notify,
    pub(crate) notify_stream: Notify,
}

impl Keyspace {
    pub(crate) fn new() -> Self {
        Self {
            data: DashMap::new(),
            expiry: Mutex::new(BTreeSet::new()),
            notify_expiry: Notify::new(),
            notify_stream: Notify::new(),
        }
    }

    // --- Helpers ---

    fn track_expiry(&self, key: &str, at: Instant) {
        let mut expiry = self.expiry.lock().unwrap_or_else(PoisonError::into_inner);
        expiry.insert(ExpiryEntry(at, key.to_string()));
        drop(expiry);
        self.notify_expiry.notify_one();
    }

    /// Leitura com expiração preguiçosa.
    fn live(&self, key: &str) -> Option<Ref<'_, String, Entry>> {
        let entry = self.data.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.data.remove_if(key, |_, e| e.is_expired());
            return None;
        }
        Some(entry)
    }

    fn live_mut(&self, key: &str) -> Option<RefMut<'_, String, Entry>> {
        let entry = self.data.get_mut(key)?;
        if entry.is_expired() {
            drop(entry);
            self.data.remove_if(key, |_, e| e.is_expired());
            return None;
        }
        Some(entry)
    }

    /// Entrada mutável; cria (ou recria, se expirada) com `init`.
    fn upsert(&self, key: &str, init: impl Fn() -> Value) -> RefMut<'_, String, Entry> {
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(init(), None));
        if entry.is_expired() {
            *entry = Entry::new(init(), None);
        }
        entry
    }

    pub(crate) fn next_expiry(&self) -> Option<Instant> {
        let expiry = self.expiry.lock().unwrap_or_else(PoisonError::into_inner);
        expiry.iter().next().map(|e| e.0)
    }

    /// Remove as chaves cujo prazo já passou. Retorna quantas saíram.
    pub(crate) fn purge_expired(&self, now: Instant) -> usize {
        let mut expiry = self.expiry.lock().unwrap_or_else(PoisonError::into_inner);
        let due: Vec<ExpiryEntry> = expiry.iter().take_while(|e| e.0 <= now).cloned().collect();

        let mut removed = 0;
        for entry in &due {
            expiry.remove(entry);
            // Só remove se realmente expirou (pode ter sido re-setado)
            if self.data.remove_if(&entry.1, |_, e| e.is_expired()).is_some() {
                debug!("key expirada removida: {}", entry.1);
                removed += 1;
            }
        }
        removed
    }

    // --- Keys ---

    pub fn del(&self, keys: &[String]) -> usize {
        let mut count = 0;
        for key in keys {
            if let Some((_, entry)) = self.data.remove(key)
                && !entry.is_expired()
            {
                count += 1;
            }
        }
        count
    }

    pub fn exists(&self, keys: &[String]) -> usize {
        keys.iter().filter(|key| self.live(key).is_some()).count()
    }

    pub fn ttl(&self, key: &str) -> KeyTtl {
        match self.live(key) {
            None => KeyTtl::Missing,
            Some(entry) => match entry.expires_at {
                None => KeyTtl::Persistent,
                Some(at) => KeyTtl::Expires(at.saturating_duration_since(Instant::now())),
            },
        }
    }

    // --- Strings ---

    pub fn get(&self, key: &str) -> Option<Bytes> {
        let entry = self.live(key)?;
        match &entry.value {
            Value::String(data) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn set(&self, key: String, value: Bytes, options: &SetOptions) -> Result<bool, StorageError> {
        let expires_at = options.expire.map(|ttl| Instant::now() + ttl);
        let entry = Entry::new(Value::String(value), expires_at);

        // Checagem NX/XX e escrita sob o mesmo lock do shard
        match self.data.entry(key.clone()) {
            MapEntry::Occupied(mut occupied) => {
                let exists = !occupied.get().is_expired();
                if !condition_met(options.condition, exists) {
                    return Ok(false);
                }
                occupied.insert(entry);
            }
            MapEntry::Vacant(vacant) => {
                if !condition_met(options.condition, false) {
                    return Ok(false);
                }
                vacant.insert(entry);
            }
        }

        if let Some(at) = expires_at {
            self.track_expiry(&key, at);
        }
        Ok(true)
    }

    pub fn incr(&self, key: &str) -> Result<i64, StorageError> {
        self.incr_by(key, 1)
    }

    pub fn decr(&self, key: &str) -> Result<i64, StorageError> {
        self.incr_by(key, -1)
    }

    pub fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StorageError> {
        let mut entry = self.upsert(key, || Value::String(Bytes::from("0")));

        match &mut entry.value {
            Value::String(data) => {
                let s = std::str::from_utf8(data).map_err(|_| StorageError::NotAnInteger)?;
                let n: i64 = s.parse().map_err(|_| StorageError::NotAnInteger)?;
                let new_val = n.checked_add(delta).ok_or(StorageError::NotAnInteger)?;
                *data = Bytes::from(new_val.to_string());
                Ok(new_val)
            }
            _ => Err(StorageError::WrongType),
        }
    }

    // --- Hashes ---

    pub fn hset(&self, key: &str, fields: &[(String, Bytes)]) -> Result<usize, StorageError> {
        let mut entry = self.upsert(key, || Value::Hash(HashMap::new()));
        match &mut entry.value {
            Value::Hash(map) => {
                let mut added = 0;
                for (field, value) in fields {
                    if map.insert(field.clone(), value.clone()).is_none() {
                        added += 1;
                    }
                }
                Ok(added)
            }
            _ => Err(StorageError::WrongType),
        }
    }

    pub fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>, StorageError> {
        let Some(entry) = self.live(key) else {
            return Ok(None);
        };
        match &entry.value {
            Value::Hash(map) => Ok(map.get(field).cloned()),
            _ => Err(StorageError::WrongType),
        }
    }

    pub fn hgetall(&self, key: &str) -> Result<HashMap<String, Bytes>, StorageError> {
        let Some(entry) = self.live(key) else {
            return Ok(HashMap::new());
        };
        match &entry.value {
            Value::Hash(map) => Ok(map.clone()),
            _ => Err(StorageError::WrongType),
        }
    }

    // --- Sets ---

    pub fn sadd(&self, key: &str, members: &[String]) -> Result<usize, StorageError> {
        let mut entry = self.upsert(key, || Value::Set(HashSet::new()));
        match &mut entry.value {
            Value::Set(set) => Ok(members.iter().filter(|m| set.insert((*m).clone())).count()),
            _ => Err(StorageError::WrongType),
        }
    }

    pub fn srem(&self, key: &str, members: &[String]) -> Result<usize, StorageError> {
        let Some(mut entry) = self.live_mut(key) else {
            return Ok(0);
        };
        match &mut entry.value {
            Value::Set(set) => {
                let removed = members.iter().filter(|m| set.remove(m.as_str())).count();
                // Limpar chave se o set ficou vazio
                if set.is_empty() {
                    drop(entry);
                    self.data.remove(key);
                }
                Ok(removed)
            }
            _ => Err(StorageError::WrongType),
        }
    }

    pub fn sismember(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        let Some(entry) = self.live(key) else {
            return Ok(false);
        };
        match &entry.value {
            Value::Set(set) => Ok(set.contains(member)),
            _ => Err(StorageError::WrongType),
        }
    }

    pub fn scard(&self, key: &str) -> Result<usize, StorageError> {
        let Some(entry) = self.live(key) else {
            return Ok(0);
        };
        match &entry.value {
            Value::Set(set) => Ok(set.len()),
            _ => Err(StorageError::WrongType),
        }
    }

    // --- Sorted sets ---

    pub fn zadd(&self, key: &str, members: &[(f64, String)]) -> Result<usize, StorageError> {
        if members.iter().any(|(score, _)| score.is_nan()) {
            return Err(StorageError::InvalidScriptArgument("score NaN".into()));
        }
        let mut entry = self.upsert(key, || Value::ZSet(SortedSet::new()));
        match &mut entry.value {
            Value::ZSet(zset) => Ok(members
                .iter()
                .filter(|(score, member)| zset.insert(member.clone(), *score))
                .count()),
            _ => Err(StorageError::WrongType),
        }
    }

    pub fn zrem(&self, key: &str, members: &[String]) -> Result<usize, StorageError> {
        let Some(mut entry) = self.live_mut(key) else {
            return Ok(0);
        };
        match &mut entry.value {
            Value::ZSet(zset) => {
                let removed = members.iter().filter(|m| zset.remove(m)).count();
                if zset.is_empty() {
                    drop(entry);
                    self.data.remove(key);
                }
                Ok(removed)
            }
            _ => Err(StorageError::WrongType),
        }
    }

    pub fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StorageError> {
        let Some(entry) = self.live(key) else {
            return Ok(None);
        };
        match &entry.value {
            Value::ZSet(zset) => Ok(zset.score(member)),
            _ => Err(StorageError::WrongType),
        }
    }

    /// Membros por posição (score crescente), índices no estilo Redis.
    pub fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<(String, f64)>, StorageError> {
        self.zrange_inner(key, start, stop, false)
    }

    /// Como `zrange`, mas em score decrescente.
    pub fn zrevrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<(String, f64)>, StorageError> {
        self.zrange_inner(key, start, stop, true)
    }

    fn zrange_inner(
        &self,
        key: &str,
        start: i64,
        stop: i64,
        reverse: bool,
    ) -> Result<Vec<(String, f64)>, StorageError> {
        let Some(entry) = self.live(key) else {
            return Ok(vec![]);
        };
        match &entry.value {
            Value::ZSet(zset) => Ok(match normalize_range(zset.len(), start, stop) {
                Some((s, e)) => zset.range(s, e, reverse),
                None => vec![],
            }),
            _ => Err(StorageError::WrongType),
        }
    }

    // --- Bitmaps ---

    /// Liga/desliga um bit. Retorna o valor anterior.
    pub fn setbit(&self, key: &str, offset: u64, on: bool) -> Result<bool, StorageError> {
        if offset >= MAX_BIT_OFFSET {
            return Err(StorageError::InvalidBitRange);
        }
        let mut entry = self.upsert(key, || Value::String(Bytes::new()));
        match &mut entry.value {
            Value::String(data) => {
                let byte = (offset / 8) as usize;
                let mask = 0x80u8 >> (offset % 8);
                let mut buf = data.to_vec();
                if buf.len() <= byte {
                    buf.resize(byte + 1, 0);
                }
                let previous = buf[byte] & mask != 0;
                if on {
                    buf[byte] |= mask;
                } else {
                    buf[byte] &= !mask;
                }
                *data = Bytes::from(buf);
                Ok(previous)
            }
            _ => Err(StorageError::WrongType),
        }
    }

    pub fn getbit(&self, key: &str, offset: u64) -> Result<bool, StorageError> {
        let Some(entry) = self.live(key) else {
            return Ok(false);
        };
        match &entry.value {
            Value::String(data) => Ok(bit_at(data, offset)),
            _ => Err(StorageError::WrongType),
        }
    }

    /// BITFIELD GET u<bits> <offset>: inteiro sem sinal, bit mais
    /// significativo primeiro.
    pub fn bitfield_get_u(&self, key: &str, bits: u32, offset: u64) -> Result<u64, StorageError> {
        if bits == 0 || bits > 63 {
            return Err(StorageError::InvalidBitRange);
        }
        let Some(entry) = self.live(key) else {
            return Ok(0);
        };
        match &entry.value {
            Value::String(data) => Ok((0..bits as u64).fold(0u64, |acc, i| {
                (acc << 1) | u64::from(bit_at(data, offset + i))
            })),
            _ => Err(StorageError::WrongType),
        }
    }

    // --- Streams ---

    pub fn xadd(&self, key: &str, fields: Vec<(String, Bytes)>) -> Result<StreamId, StorageError> {
        let mut entry = self.upsert(key, || Value::Stream(Stream::new()));
        let id = match &mut entry.value {
            Value::Stream(stream) => stream.append(fields, now_ms()),
            _ => return Err(StorageError::WrongType),
        };
        drop(entry);
        self.notify_stream.notify_waiters();
        Ok(id)
    }

    /// XGROUP CREATE. `start` aceita um id ou `$` (último id atual).
    pub fn xgroup_create(
        &self,
        key: &str,
        group: &str,
        start: &str,
        mkstream: bool,
    ) -> Result<(), StorageError> {
        let mut entry = if mkstream {
            self.upsert(key, || Value::Stream(Stream::new()))
        } else {
            self.live_mut(key)
                .ok_or_else(|| StorageError::NoGroup(group.to_string()))?
        };
        match &mut entry.value {
            Value::Stream(stream) => {
                let start = if start == "$" {
                    stream.last_id()
                } else {
                    start.parse()?
                };
                stream.create_group(group, start)
            }
            _ => Err(StorageError::WrongType),
        }
    }

    pub fn xreadgroup(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        from: ReadFrom,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        let mut entry = self
            .live_mut(key)
            .ok_or_else(|| StorageError::NoGroup(group.to_string()))?;
        match &mut entry.value {
            Value::Stream(stream) => stream.read_group(group, consumer, count, from),
            _ => Err(StorageError::WrongType),
        }
    }

    pub fn xack(&self, key: &str, group: &str, ids: &[StreamId]) -> Result<usize, StorageError> {
        let Some(mut entry) = self.live_mut(key) else {
            return Ok(0);
        };
        match &mut entry.value {
            Value::Stream(stream) => stream.ack(group, ids),
            _ => Err(StorageError::WrongType),
        }
    }

    pub fn xpending_count(&self, key: &str, group: &str) -> Result<usize, StorageError> {
        let entry = self
            .live(key)
            .ok_or_else(|| StorageError::NoGroup(group.to_string()))?;
        match &entry.value {
            Value::Stream(stream) => stream.pending_count(group),
            _ => Err(StorageError::WrongType),
        }
    }

    pub fn xdelivery_count(&self, key: &str, group: &str, id: StreamId) -> Result<Option<u64>, StorageError> {
        let Some(entry) = self.live(key) else {
            return Ok(None);
        };
        match &entry.value {
            Value::Stream(stream) => Ok(stream.delivery_count(group, id)),
            _ => Err(StorageError::WrongType),
        }
    }

    pub fn xlen(&self, key: &str) -> Result<usize, StorageError> {
        let Some(entry) = self.live(key) else {
            return Ok(0);
        };
        match &entry.value {
            Value::Stream(stream) => Ok(stream.len()),
            _ => Err(StorageError::WrongType),
        }
    }
}

fn condition_met(condition: Option<SetCondition>, exists: bool) -> bool {
    match condition {
        Some(SetCondition::Nx) => !exists,
        Some(SetCondition::Xx) => exists,
        None => true,
    }
}

fn bit_at(data: &[u8], offset: u64) -> bool {
    let byte = (offset / 8) as usize;
    data.get(byte)
        .map(|b| b & (0x80u8 >> (offset % 8)) != 0)
        .unwrap_or(false)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Normaliza índices negativos (estilo Redis) para um intervalo inclusivo.
fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    if len == 0 {
        return None;
    }
    let s = if start < 0 { (len + start).max(0) } else { start };
    let e = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if s > e || s >= len {
        return None;
    }
    Some((s as usize, e as usize))
}
