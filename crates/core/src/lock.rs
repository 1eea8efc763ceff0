use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tracing::warn;
use uuid::Uuid;

use hotdeal_common::{HotdealResult, LOCK_KEY_PREFIX, StorageError};
use hotdeal_storage::script::arg;
use hotdeal_storage::{Db, Keyspace, Script, SetOptions};

const UNLOCK_SCRIPT: &str = "unlock";

/// Compare-and-delete: só apaga a chave se ela ainda guarda o token de quem
/// está liberando. Retorna 1 se liberou, 0 caso contrário.
struct UnlockScript;

impl Script for UnlockScript {
    fn name(&self) -> &str {
        UNLOCK_SCRIPT
    }

    fn call(&self, ks: &Keyspace, keys: &[String], args: &[String]) -> Result<i64, StorageError> {
        let key = keys
            .first()
            .ok_or_else(|| StorageError::InvalidScriptArgument("chave do lock ausente".into()))?;
        let token = arg(args, 0)?;
        if ks.get(key).as_deref() == Some(token.as_bytes()) {
            return Ok(ks.del(std::slice::from_ref(key)) as i64);
        }
        Ok(0)
    }
}

/// Fábrica de locks distribuídos.
///
/// Cada cliente tem um prefixo único (UUID) e cada lock criado recebe um
/// sequencial, formando o token do dono.
#[derive(Clone)]
pub struct LockClient {
    db: Db,
    token_prefix: Arc<str>,
    seq: Arc<AtomicU64>,
}

impl LockClient {
    pub fn new(db: Db) -> Self {
        if !db.script_exists(UNLOCK_SCRIPT) {
            db.script_load(Arc::new(UnlockScript));
        }
        Self {
            db,
            token_prefix: Uuid::new_v4().simple().to_string().into(),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Lock sobre o recurso `name` (chave `lock:<name>`).
    pub fn lock(&self, name: &str) -> DistributedLock {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        DistributedLock {
            db: self.db.clone(),
            key: format!("{LOCK_KEY_PREFIX}{name}"),
            token: format!("{}-{seq}", self.token_prefix),
        }
    }
}

/// Mutex distribuído com lease.
///
/// Não há renovação nem fencing: se o lease vence com o dono ainda
/// trabalhando, outro pode entrar. Serve para suprimir duplicidade.
#[derive(Clone)]
pub struct DistributedLock {
    db: Db,
    key: String,
    token: String,
}

impl DistributedLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// SET NX PX. Nunca bloqueia nem tenta de novo.
    pub fn try_lock(&self, lease: Duration) -> HotdealResult<bool> {
        let acquired = self.db.set(
            self.key.clone(),
            Bytes::from(self.token.clone()),
            &SetOptions::nx_with_ttl(lease),
        )?;
        Ok(acquired)
    }

    /// Libera o lock se ainda for nosso. Retorna se algo foi apagado.
    pub fn unlock(&self) -> HotdealResult<bool> {
        let released = self.db.evalsha(
            UNLOCK_SCRIPT,
            std::slice::from_ref(&self.key),
            std::slice::from_ref(&self.token),
        )?;
        Ok(released == 1)
    }

    /// `try_lock` que devolve um guard liberado no drop.
    pub fn try_acquire(self, lease: Duration) -> HotdealResult<Option<LockGuard>> {
        if self.try_lock(lease)? {
            Ok(Some(LockGuard { lock: self }))
        } else {
            Ok(None)
        }
    }
}

/// Libera o lock em qualquer saída do escopo, inclusive erro ou panic.
pub struct LockGuard {
    lock: DistributedLock,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        self.lock.key()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            warn!("falha ao liberar lock {}: {e}", self.lock.key);
        }
    }
}
