use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use tokio::time::Instant;

use crate::stream::Stream;
use crate::zset::SortedSet;

/// Tipo do valor armazenado.
#[derive(Debug, Clone)]
pub enum Value {
    /// Strings também servem de bitmap (SETBIT/GETBIT/BITFIELD).
    String(Bytes),
    Hash(HashMap<String, Bytes>),
    Set(HashSet<String>),
    ZSet(SortedSet),
    Stream(Stream),
}

/// Entrada no store: valor + TTL opcional.
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Value,
    pub expires_at: Option<Instant>,
}

impl Entry {
    pub fn new(value: Value, expires_at: Option<Instant>) -> Self {
        Self { value, expires_at }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|t| Instant::now() >= t)
            .unwrap_or(false)
    }
}
