use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use hotdeal_common::StorageError;

/// Id de entrada no stream: `<ms>-<seq>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StorageError::InvalidStreamId(s.to_string());
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        Ok(StreamId {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// Entrada lida de um stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: Vec<(String, Bytes)>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&Bytes> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }
}

/// Posição de leitura do XREADGROUP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// `>`: entradas nunca entregues ao grupo.
    New,
    /// Pending list do consumidor, a partir do id (exclusivo).
    Pending(StreamId),
}

#[derive(Debug, Clone)]
struct PendingEntry {
    consumer: String,
    delivery_count: u64,
}

#[derive(Debug, Clone, Default)]
struct ConsumerGroup {
    last_delivered: StreamId,
    pending: BTreeMap<StreamId, PendingEntry>,
}

/// Log append-only com grupos de consumidores.
#[derive(Debug, Clone, Default)]
pub struct Stream {
    entries: BTreeMap<StreamId, Vec<(String, Bytes)>>,
    last_id: StreamId,
    groups: HashMap<String, ConsumerGroup>,
}

impl Stream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adiciona uma entrada com id estritamente maior que o último.
    pub fn append(&mut self, fields: Vec<(String, Bytes)>, now_ms: u64) -> StreamId {
        let id = if now_ms > self.last_id.ms {
            StreamId::new(now_ms, 0)
        } else {
            StreamId::new(self.last_id.ms, self.last_id.seq + 1)
        };
        self.entries.insert(id, fields);
        self.last_id = id;
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_id(&self) -> StreamId {
        self.last_id
    }

    pub fn create_group(&mut self, name: &str, start: StreamId) -> Result<(), StorageError> {
        if self.groups.contains_key(name) {
            return Err(StorageError::GroupExists(name.to_string()));
        }
        self.groups.insert(
            name.to_string(),
            ConsumerGroup {
                last_delivered: start,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn read_group(
        &mut self,
        group: &str,
        consumer: &str,
        count: usize,
        from: ReadFrom,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        let state = self
            .groups
            .get_mut(group)
            .ok_or_else(|| StorageError::NoGroup(group.to_string()))?;

        match from {
            ReadFrom::New => {
                let start = std::ops::Bound::Excluded(state.last_delivered);
                let delivered: Vec<StreamEntry> = self
                    .entries
                    .range((start, std::ops::Bound::Unbounded))
                    .take(count)
                    .map(|(id, fields)| StreamEntry {
                        id: *id,
                        fields: fields.clone(),
                    })
                    .collect();

                for entry in &delivered {
                    state.last_delivered = entry.id;
                    state.pending.insert(
                        entry.id,
                        PendingEntry {
                            consumer: consumer.to_string(),
                            delivery_count: 1,
                        },
                    );
                }
                Ok(delivered)
            }
            ReadFrom::Pending(after) => {
                let start = std::ops::Bound::Excluded(after);
                let mut redelivered = Vec::new();
                for (id, pending) in state
                    .pending
                    .range_mut((start, std::ops::Bound::Unbounded))
                    .filter(|(_, p)| p.consumer == consumer)
                    .take(count)
                {
                    pending.delivery_count += 1;
                    // Entrada removida do log continua pendente, mas sem campos
                    let fields = self.entries.get(id).cloned().unwrap_or_default();
                    redelivered.push(StreamEntry { id: *id, fields });
                }
                Ok(redelivered)
            }
        }
    }

    pub fn ack(&mut self, group: &str, ids: &[StreamId]) -> Result<usize, StorageError> {
        let state = self
            .groups
            .get_mut(group)
            .ok_or_else(|| StorageError::NoGroup(group.to_string()))?;
        let mut acked = 0;
        for id in ids {
            if state.pending.remove(id).is_some() {
                acked += 1;
            }
        }
        Ok(acked)
    }

    pub fn pending_count(&self, group: &str) -> Result<usize, StorageError> {
        self.groups
            .get(group)
            .map(|state| state.pending.len())
            .ok_or_else(|| StorageError::NoGroup(group.to_string()))
    }

    /// Quantas vezes a entrada pendente já foi entregue.
    pub fn delivery_count(&self, group: &str, id: StreamId) -> Option<u64> {
        self.groups
            .get(group)?
            .pending
            .get(&id)
            .map(|p| p.delivery_count)
    }
}
