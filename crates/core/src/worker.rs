use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use hotdeal_common::{
    HotdealResult, LOCK_ORDER_PREFIX, ORDER_CONSUMER, ORDER_GROUP, ORDER_LOCK_LEASE, ORDER_STREAM,
    POLL_BLOCK, RECOVERY_BACKOFF, StorageError,
};
use hotdeal_storage::{Db, ReadFrom, StreamEntry, StreamId};

use crate::lock::LockClient;
use crate::model::SeckillIntent;
use crate::repository::OrderRepository;

/// Configuração do worker de pedidos.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    /// Lease do lock por usuário durante a materialização.
    ///
    /// Se um worker cai segurando o lock, a chave `order:<userId>` só some
    /// quando o lease vence. Um reinício dentro dessa janela reprocessa a
    /// pendência, encontra o lock ocupado e descarta a entrada (`LockBusy`).
    pub lock_lease: Duration,
    /// Espera máxima de cada leitura bloqueante.
    pub poll_block: Duration,
    /// Pausa entre varreduras de pendentes que falharam.
    pub recovery_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stream: ORDER_STREAM.to_string(),
            group: ORDER_GROUP.to_string(),
            consumer: ORDER_CONSUMER.to_string(),
            lock_lease: ORDER_LOCK_LEASE,
            poll_block: POLL_BLOCK,
            recovery_backoff: RECOVERY_BACKOFF,
        }
    }
}

impl WorkerConfig {
    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }

    pub fn with_consumer(mut self, group: impl Into<String>, consumer: impl Into<String>) -> Self {
        self.group = group.into();
        self.consumer = consumer.into();
        self
    }

    pub fn with_poll_block(mut self, block: Duration) -> Self {
        self.poll_block = block;
        self
    }

    pub fn with_recovery_backoff(mut self, backoff: Duration) -> Self {
        self.recovery_backoff = backoff;
        self
    }

    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }
}

/// O que aconteceu com uma intent entregue ao worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialization {
    Created,
    /// Já existe pedido para (usuário, voucher): reentrega, descartada.
    Duplicate,
    /// Outro worker está materializando pedido do mesmo usuário.
    LockBusy,
    /// Estoque do banco zerado.
    NoStock,
    /// Mensagem ilegível, reconhecida e descartada.
    Discarded,
}

/// Consumidor do stream de intents que grava os pedidos no banco.
///
/// Entrega at-least-once: a entrada só é reconhecida depois de processada.
/// Reentregas são absorvidas pela checagem de pedido existente.
#[derive(Clone)]
pub struct OrderWorker {
    db: Db,
    locks: LockClient,
    repo: Arc<dyn OrderRepository>,
    config: WorkerConfig,
}

/// Handle do worker em background.
///
/// Descartar o handle também encerra o worker.
pub struct WorkerHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Pede o encerramento e espera o loop terminar. Entradas em
    /// processamento ficam pendentes para o próximo worker.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            error!("worker de pedidos terminou com erro: {e}");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl OrderWorker {
    pub fn new(db: Db, repo: Arc<dyn OrderRepository>) -> Self {
        Self::with_config(db, repo, WorkerConfig::default())
    }

    pub fn with_config(db: Db, repo: Arc<dyn OrderRepository>, config: WorkerConfig) -> Self {
        Self {
            locks: LockClient::new(db.clone()),
            db,
            repo,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// XGROUP CREATE ... 0 MKSTREAM, ignorando grupo já existente.
    pub fn ensure_group(&self) -> HotdealResult<()> {
        match self
            .db
            .xgroup_create(&self.config.stream, &self.config.group, "0", true)
        {
            Ok(()) => {
                info!(
                    "grupo {} criado no stream {}",
                    self.config.group, self.config.stream
                );
                Ok(())
            }
            Err(StorageError::GroupExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Garante o grupo e sobe o loop numa task dedicada.
    pub fn spawn(self) -> HotdealResult<WorkerHandle> {
        self.ensure_group()?;
        let (shutdown, rx) = broadcast::channel(1);
        let task = tokio::spawn(self.run(rx));
        Ok(WorkerHandle { shutdown, task })
    }

    /// Loop principal. Começa por uma varredura de pendentes, para reaproveitar
    /// o que um worker anterior leu e não reconheceu.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "worker de pedidos iniciado: stream={} grupo={} consumidor={}",
            self.config.stream, self.config.group, self.config.consumer
        );

        if !self.recover(&mut shutdown).await {
            return;
        }

        loop {
            let polled = tokio::select! {
                _ = shutdown.recv() => None,
                result = self.poll_once() => Some(result),
            };
            let Some(result) = polled else {
                info!("worker de pedidos encerrado");
                return;
            };

            if let Err(e) = result {
                error!("erro processando pedido, entrando em recuperação: {e}");
                if !self.recover(&mut shutdown).await {
                    return;
                }
            }
        }
    }

    /// Uma leitura bloqueante de até uma entrada nova. `None` no timeout.
    pub async fn poll_once(&self) -> HotdealResult<Option<Materialization>> {
        let entries = self
            .db
            .xreadgroup_blocking(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer,
                1,
                self.config.poll_block,
            )
            .await?;
        let Some(entry) = entries.into_iter().next() else {
            return Ok(None);
        };
        Ok(Some(self.handle(&entry).await?))
    }

    /// Reprocessa a pending list deste consumidor, do início, até esvaziar.
    /// Retorna quantas entradas foram tratadas.
    pub async fn drain_pending(&self) -> HotdealResult<usize> {
        let mut cursor = StreamId::ZERO;
        let mut handled = 0;
        loop {
            let entries = self.db.xreadgroup(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer,
                1,
                ReadFrom::Pending(cursor),
            )?;
            let Some(entry) = entries.into_iter().next() else {
                return Ok(handled);
            };
            cursor = entry.id;
            self.handle(&entry).await?;
            handled += 1;
        }
    }

    /// Repete `drain_pending` com backoff até conseguir. Sem limite de
    /// tentativas: desistir perderia um pedido aceito. Retorna `false` se
    /// o encerramento foi pedido no meio.
    async fn recover(&self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        loop {
            match self.drain_pending().await {
                Ok(0) => return true,
                Ok(n) => {
                    info!("recuperação concluída: {n} pedidos pendentes reprocessados");
                    return true;
                }
                Err(e) => {
                    error!("erro na recuperação de pendentes: {e}");
                    let stop = tokio::select! {
                        _ = shutdown.recv() => true,
                        _ = tokio::time::sleep(self.config.recovery_backoff) => false,
                    };
                    if stop {
                        info!("worker de pedidos encerrado durante recuperação");
                        return false;
                    }
                }
            }
        }
    }

    /// Materializa a entrada e reconhece. Erro antes do XACK deixa a
    /// entrada pendente.
    async fn handle(&self, entry: &StreamEntry) -> HotdealResult<Materialization> {
        let outcome = match SeckillIntent::from_entry(entry) {
            Ok(intent) => self.create_voucher_order(intent).await?,
            Err(e) => {
                error!("descartando entrada {}: {e}", entry.id);
                Materialization::Discarded
            }
        };
        self.db
            .xack(&self.config.stream, &self.config.group, &[entry.id])?;
        debug!("entrada {} reconhecida: {outcome:?}", entry.id);
        Ok(outcome)
    }

    /// Grava o pedido sob o lock do usuário.
    pub async fn create_voucher_order(&self, intent: SeckillIntent) -> HotdealResult<Materialization> {
        let lock = self
            .locks
            .lock(&format!("{LOCK_ORDER_PREFIX}{}", intent.user_id));
        let Some(_guard) = lock.try_acquire(self.config.lock_lease)? else {
            warn!(
                "usuário {} já tem pedido em processamento, descartando pedido {}",
                intent.user_id, intent.order_id
            );
            return Ok(Materialization::LockBusy);
        };

        if self
            .repo
            .count_orders(intent.user_id, intent.voucher_id)
            .await?
            > 0
        {
            debug!(
                "pedido de {} no voucher {} já existe, ignorando reentrega",
                intent.user_id, intent.voucher_id
            );
            return Ok(Materialization::Duplicate);
        }

        // Baixa e inserção numa transação: uma falha não consome estoque
        if !self.repo.create_order(&intent.into_order(Utc::now())).await? {
            error!(
                "estoque do voucher {} esgotado no banco, pedido {} não criado",
                intent.voucher_id, intent.order_id
            );
            return Ok(Materialization::NoStock);
        }
        info!(
            "pedido {} criado: usuário {} voucher {}",
            intent.order_id, intent.user_id, intent.voucher_id
        );
        Ok(Materialization::Created)
    }
}
