use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error};

/// Tarefa de reconstrução de cache enfileirada no pool.
pub type RebuildJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Pool de tamanho fixo para reconstruir entradas de cache em background.
///
/// `workers` tasks consomem de uma fila limitada; quem submete nunca espera.
/// Os workers encerram quando todos os handles do pool são descartados.
#[derive(Clone)]
pub struct RebuildPool {
    tx: mpsc::Sender<RebuildJob>,
}

impl RebuildPool {
    pub fn new(workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<RebuildJob>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    // Segura o receiver só o tempo de tirar um job da fila
                    let job = rx.lock().await.recv().await;
                    let Some(job) = job else {
                        debug!("worker de rebuild {worker} encerrado");
                        return;
                    };
                    // Panic no loader não derruba o worker
                    if let Err(e) = tokio::spawn(job).await {
                        error!("job de rebuild abortou no worker {worker}: {e}");
                    }
                }
            });
        }

        Self { tx }
    }

    /// Enfileira o job sem esperar. Fila cheia (ou pool encerrado) devolve o
    /// job para o chamador decidir o que fazer.
    pub fn submit(&self, job: RebuildJob) -> Result<(), RebuildJob> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => job,
        })
    }
}
