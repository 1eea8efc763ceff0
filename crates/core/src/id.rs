use chrono::{DateTime, Utc};

use hotdeal_common::{BEGIN_TIMESTAMP, COUNT_BITS, HotdealResult, ID_KEY_PREFIX};
use hotdeal_storage::Db;

/// Gerador de ids globais baseado em INCR.
///
/// Layout: bit de sinal, 31 bits de segundos desde 2022-01-01 UTC e 32 bits
/// de contador. O contador vive em `icr:<prefixo>:<yyyy:MM:dd>`, então reinicia
/// todo dia e serve também para contar pedidos por dia.
#[derive(Clone)]
pub struct IdGenerator {
    db: Db,
}

impl IdGenerator {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn next_id(&self, prefix: &str) -> HotdealResult<i64> {
        self.next_id_at(prefix, Utc::now())
    }

    /// Como `next_id`, com o instante informado pelo chamador.
    ///
    /// Mais de 2^32 ids no mesmo dia para o mesmo prefixo transbordam para os
    /// bits de timestamp; esse teto é aceito e não é verificado.
    pub fn next_id_at(&self, prefix: &str, now: DateTime<Utc>) -> HotdealResult<i64> {
        let timestamp = now.timestamp() - BEGIN_TIMESTAMP;
        let date = now.format("%Y:%m:%d");
        let count = self.db.incr(&format!("{ID_KEY_PREFIX}{prefix}:{date}"))?;
        Ok((timestamp << COUNT_BITS) | count)
    }
}

/// Separa um id em (segundos desde o epoch customizado, contador).
pub fn decompose(id: i64) -> (i64, u32) {
    (id >> COUNT_BITS, (id & 0xFFFF_FFFF) as u32)
}
