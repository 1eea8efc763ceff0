use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use hotdeal_common::{
    CACHE_NULL_TTL, HotdealError, HotdealResult, LOCK_CACHE_LEASE, MUTEX_MAX_RETRIES,
    MUTEX_RETRY_INTERVAL, REBUILD_QUEUE_CAPACITY, REBUILD_WORKERS,
};
use hotdeal_storage::{Db, SetOptions};

use crate::lock::LockClient;
use crate::rebuild::RebuildPool;

/// Configuração do cliente de cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// TTL do marcador de "não existe".
    pub null_ttl: Duration,
    /// Lease do lock de reconstrução.
    pub rebuild_lease: Duration,
    pub rebuild_workers: usize,
    pub rebuild_queue_capacity: usize,
    pub mutex_retry_interval: Duration,
    pub mutex_max_retries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            null_ttl: CACHE_NULL_TTL,
            rebuild_lease: LOCK_CACHE_LEASE,
            rebuild_workers: REBUILD_WORKERS,
            rebuild_queue_capacity: REBUILD_QUEUE_CAPACITY,
            mutex_retry_interval: MUTEX_RETRY_INTERVAL,
            mutex_max_retries: MUTEX_MAX_RETRIES,
        }
    }
}

impl CacheConfig {
    pub fn with_null_ttl(mut self, ttl: Duration) -> Self {
        self.null_ttl = ttl;
        self
    }

    pub fn with_rebuild_lease(mut self, lease: Duration) -> Self {
        self.rebuild_lease = lease;
        self
    }

    pub fn with_rebuild_workers(mut self, workers: usize) -> Self {
        self.rebuild_workers = workers;
        self
    }

    pub fn with_rebuild_queue_capacity(mut self, capacity: usize) -> Self {
        self.rebuild_queue_capacity = capacity;
        self
    }

    pub fn with_mutex_retry(mut self, interval: Duration, max_retries: usize) -> Self {
        self.mutex_retry_interval = interval;
        self.mutex_max_retries = max_retries;
        self
    }
}

/// Valor gravado no modo de expiração lógica: o dado mais o instante em que
/// deixa de ser fresco. A chave em si não tem TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalEntry<T> {
    pub data: T,
    pub expire_time: DateTime<Utc>,
}

/// Estado de uma chave no modo pass-through.
enum Cached<T> {
    Miss,
    /// Marcador de nulo (payload vazio).
    Null,
    Hit(T),
}

/// Cliente de cache genérico sobre o store.
///
/// Cada padrão de chave deve usar uma única estratégia: pass-through e
/// mutex gravam o payload cru com TTL, expiração lógica grava um
/// `LogicalEntry` sem TTL.
#[derive(Clone)]
pub struct CacheClient {
    db: Db,
    locks: LockClient,
    pool: RebuildPool,
    config: CacheConfig,
}

impl CacheClient {
    pub fn new(db: Db) -> Self {
        Self::with_config(db, CacheConfig::default())
    }

    pub fn with_config(db: Db, config: CacheConfig) -> Self {
        Self {
            locks: LockClient::new(db.clone()),
            pool: RebuildPool::new(config.rebuild_workers, config.rebuild_queue_capacity),
            db,
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Grava `value` serializado com expiração no store.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> HotdealResult<()> {
        let payload = serde_json::to_vec(value)?;
        self.db
            .set(key.to_string(), Bytes::from(payload), &SetOptions::with_ttl(ttl))?;
        Ok(())
    }

    /// Grava `value` com expiração lógica `now + ttl` e sem TTL no store.
    pub fn set_with_logical_expire<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> HotdealResult<()> {
        write_logical(&self.db, key, value, ttl)
    }

    /// Cache-aside com cache de nulos (defesa contra penetração).
    ///
    /// Não há lock: vários misses simultâneos podem consultar o banco.
    pub async fn query_with_pass_through<T, ID, F, Fut>(
        &self,
        prefix: &str,
        id: ID,
        loader: F,
        ttl: Duration,
    ) -> HotdealResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        ID: Display,
        F: FnOnce(ID) -> Fut,
        Fut: Future<Output = HotdealResult<Option<T>>>,
    {
        let key = format!("{prefix}{id}");
        match self.lookup(&key)? {
            Cached::Hit(value) => return Ok(Some(value)),
            Cached::Null => return Ok(None),
            Cached::Miss => {}
        }

        debug!("cache miss: {key}");
        self.load_and_store(&key, id, loader, ttl).await
    }

    /// Stale-while-revalidate para chaves quentes pré-aquecidas.
    ///
    /// Chave fria retorna `None` sem consultar o banco. Chave expirada devolve
    /// o valor antigo na hora e, se conseguir o lock da chave, agenda a
    /// reconstrução no pool.
    pub async fn query_with_logical_expire<T, ID, F, Fut>(
        &self,
        prefix: &str,
        id: ID,
        loader: F,
        ttl: Duration,
    ) -> HotdealResult<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        ID: Display + Send + 'static,
        F: FnOnce(ID) -> Fut + Send + 'static,
        Fut: Future<Output = HotdealResult<Option<T>>> + Send + 'static,
    {
        let key = format!("{prefix}{id}");
        let raw = match self.db.get(&key) {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Ok(None),
        };

        let entry: LogicalEntry<T> = serde_json::from_slice(&raw)?;
        if entry.expire_time > Utc::now() {
            return Ok(Some(entry.data));
        }

        let Some(guard) = self
            .locks
            .lock(&key)
            .try_acquire(self.config.rebuild_lease)?
        else {
            debug!("rebuild de {key} já em andamento");
            return Ok(Some(entry.data));
        };

        let db = self.db.clone();
        let job_key = key.clone();
        let job = Box::pin(async move {
            // O guard vive dentro do job: solta o lock ao terminar ou se o
            // job for descartado
            let _guard = guard;
            match loader(id).await {
                Ok(Some(fresh)) => {
                    if let Err(e) = write_logical(&db, &job_key, &fresh, ttl) {
                        error!("falha ao gravar rebuild de {job_key}: {e}");
                    } else {
                        debug!("cache reconstruído: {job_key}");
                    }
                }
                Ok(None) => warn!("rebuild de {job_key}: registro sumiu do banco, mantendo valor antigo"),
                Err(e) => error!("rebuild de {job_key} falhou: {e}"),
            }
        });

        if let Err(job) = self.pool.submit(job) {
            drop(job);
            warn!("fila de rebuild cheia, descartando rebuild de {key}");
        }

        Ok(Some(entry.data))
    }

    /// Cache-aside com lock na reconstrução (penetração + stampede).
    ///
    /// Quem perde a disputa dorme `mutex_retry_interval` e consulta de novo;
    /// após `mutex_max_retries` tentativas falha com `LockTimeout`.
    pub async fn query_with_mutex<T, ID, F, Fut>(
        &self,
        prefix: &str,
        id: ID,
        loader: F,
        ttl: Duration,
    ) -> HotdealResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        ID: Display,
        F: FnOnce(ID) -> Fut,
        Fut: Future<Output = HotdealResult<Option<T>>>,
    {
        let key = format!("{prefix}{id}");

        // Pelo menos uma consulta, mesmo com zero tentativas configuradas
        for attempt in 0..self.config.mutex_max_retries.max(1) {
            match self.lookup(&key)? {
                Cached::Hit(value) => return Ok(Some(value)),
                Cached::Null => return Ok(None),
                Cached::Miss => {}
            }

            if let Some(_guard) = self
                .locks
                .lock(&key)
                .try_acquire(self.config.rebuild_lease)?
            {
                // Outro pode ter reconstruído entre a leitura e o lock
                match self.lookup(&key)? {
                    Cached::Hit(value) => return Ok(Some(value)),
                    Cached::Null => return Ok(None),
                    Cached::Miss => {}
                }
                return self.load_and_store(&key, id, loader, ttl).await;
            }

            debug!("lock de {key} ocupado (tentativa {attempt})");
            tokio::time::sleep(self.config.mutex_retry_interval).await;
        }

        Err(HotdealError::LockTimeout(key))
    }

    /// Remove a chave após o dono atualizar o registro no banco.
    pub fn invalidate<ID: Display>(&self, prefix: &str, id: ID) -> bool {
        self.db.del(&[format!("{prefix}{id}")]) > 0
    }

    /// Pré-aquece uma chave de expiração lógica. Retorna `false` se o
    /// registro não existe no banco.
    pub async fn warm_up<T, ID, F, Fut>(
        &self,
        prefix: &str,
        id: ID,
        loader: F,
        ttl: Duration,
    ) -> HotdealResult<bool>
    where
        T: Serialize,
        ID: Display,
        F: FnOnce(ID) -> Fut,
        Fut: Future<Output = HotdealResult<Option<T>>>,
    {
        let key = format!("{prefix}{id}");
        match loader(id).await? {
            Some(value) => {
                self.set_with_logical_expire(&key, &value, ttl)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn lookup<T: DeserializeOwned>(&self, key: &str) -> HotdealResult<Cached<T>> {
        match self.db.get(key) {
            None => Ok(Cached::Miss),
            Some(raw) if raw.is_empty() => Ok(Cached::Null),
            Some(raw) => Ok(Cached::Hit(serde_json::from_slice(&raw)?)),
        }
    }

    async fn load_and_store<T, ID, F, Fut>(
        &self,
        key: &str,
        id: ID,
        loader: F,
        ttl: Duration,
    ) -> HotdealResult<Option<T>>
    where
        T: Serialize,
        F: FnOnce(ID) -> Fut,
        Fut: Future<Output = HotdealResult<Option<T>>>,
    {
        match loader(id).await? {
            Some(value) => {
                self.set(key, &value, ttl)?;
                Ok(Some(value))
            }
            None => {
                self.db.set(
                    key.to_string(),
                    Bytes::new(),
                    &SetOptions::with_ttl(self.config.null_ttl),
                )?;
                Ok(None)
            }
        }
    }
}

fn write_logical<T: Serialize>(db: &Db, key: &str, value: &T, ttl: Duration) -> HotdealResult<()> {
    let expire_time = TimeDelta::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    let payload = serde_json::to_vec(&LogicalEntry {
        data: value,
        expire_time,
    })?;
    db.set(key.to_string(), Bytes::from(payload), &SetOptions::default())?;
    Ok(())
}
