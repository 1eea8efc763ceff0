use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use hotdeal_common::{
    HotdealError, HotdealResult, ORDER_ID_PREFIX, ORDER_STREAM, SECKILL_ORDER_KEY,
    SECKILL_STOCK_KEY, StorageError,
};
use hotdeal_storage::script::int_arg;
use hotdeal_storage::{Db, Keyspace, Script, SetOptions};

use crate::id::IdGenerator;
use crate::model::{SeckillIntent, SeckillVoucher, UserContext};
use crate::repository::OrderRepository;

const SECKILL_SCRIPT: &str = "seckill";

const CODE_ACCEPTED: i64 = 0;
const CODE_NO_STOCK: i64 = 1;
const CODE_DUPLICATE: i64 = 2;

/// Checagem de elegibilidade + reserva + enfileiramento, tudo atômico.
///
/// KEYS: `[stream]`. ARGV: `[voucherId, userId, orderId]`.
/// Retorna 0 (aceito), 1 (sem estoque) ou 2 (usuário já comprou). Com
/// retorno diferente de 0 nada é alterado.
struct SeckillScript;

impl Script for SeckillScript {
    fn name(&self) -> &str {
        SECKILL_SCRIPT
    }

    fn call(&self, ks: &Keyspace, keys: &[String], args: &[String]) -> Result<i64, StorageError> {
        let stream = keys
            .first()
            .ok_or_else(|| StorageError::InvalidScriptArgument("chave do stream ausente".into()))?;
        let intent = SeckillIntent {
            voucher_id: int_arg(args, 0)?,
            user_id: int_arg(args, 1)?,
            order_id: int_arg(args, 2)?,
        };

        let stock_key = format!("{SECKILL_STOCK_KEY}{}", intent.voucher_id);
        let order_key = format!("{SECKILL_ORDER_KEY}{}", intent.voucher_id);
        let member = intent.user_id.to_string();

        // Valida tudo antes da primeira escrita: erro no meio deixaria
        // estoque descontado sem intent no stream
        ks.xlen(stream)?;
        let stock = match ks.get(&stock_key) {
            None => 0,
            Some(raw) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or(StorageError::NotAnInteger)?,
        };
        if stock <= 0 {
            return Ok(CODE_NO_STOCK);
        }
        if ks.sismember(&order_key, &member)? {
            return Ok(CODE_DUPLICATE);
        }

        ks.incr_by(&stock_key, -1)?;
        ks.sadd(&order_key, &[member])?;
        ks.xadd(stream, intent.to_fields())?;
        Ok(CODE_ACCEPTED)
    }
}

/// Motivo da recusa de uma compra.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NoStock,
    Duplicate,
}

impl Rejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::NoStock => "estoque insuficiente",
            Rejection::Duplicate => "não é permitido comprar mais de uma vez",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Resultado síncrono de uma tentativa de compra.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseOutcome {
    /// Reserva feita; o pedido é materializado depois pelo worker.
    Accepted { order_id: i64 },
    Rejected(Rejection),
}

impl PurchaseOutcome {
    pub fn order_id(&self) -> Option<i64> {
        match self {
            PurchaseOutcome::Accepted { order_id } => Some(*order_id),
            PurchaseOutcome::Rejected(_) => None,
        }
    }
}

/// Porta de entrada das compras de flash sale.
#[derive(Clone)]
pub struct SeckillCoordinator {
    db: Db,
    ids: IdGenerator,
    repo: Arc<dyn OrderRepository>,
    stream: String,
}

impl SeckillCoordinator {
    pub fn new(db: Db, repo: Arc<dyn OrderRepository>) -> Self {
        if !db.script_exists(SECKILL_SCRIPT) {
            db.script_load(Arc::new(SeckillScript));
        }
        Self {
            ids: IdGenerator::new(db.clone()),
            db,
            repo,
            stream: ORDER_STREAM.to_string(),
        }
    }

    /// Publica as intents em outro stream.
    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Cadastra o voucher no banco e semeia o estoque no store.
    pub async fn register_voucher(&self, voucher: &SeckillVoucher) -> HotdealResult<()> {
        self.repo.save_voucher(voucher).await?;
        self.db.set(
            format!("{SECKILL_STOCK_KEY}{}", voucher.voucher_id),
            Bytes::from(voucher.stock.to_string()),
            &SetOptions::default(),
        )?;
        info!("voucher {} cadastrado com estoque {}", voucher.voucher_id, voucher.stock);
        Ok(())
    }

    /// Tenta comprar `voucher_id` para o usuário do contexto.
    ///
    /// Recusas voltam como `PurchaseOutcome::Rejected`, não como erro.
    pub fn attempt_purchase(&self, ctx: &UserContext, voucher_id: i64) -> HotdealResult<PurchaseOutcome> {
        let order_id = self.ids.next_id(ORDER_ID_PREFIX)?;
        let code = self.db.evalsha(
            SECKILL_SCRIPT,
            std::slice::from_ref(&self.stream),
            &[
                voucher_id.to_string(),
                ctx.user_id.to_string(),
                order_id.to_string(),
            ],
        )?;

        let outcome = match code {
            CODE_ACCEPTED => PurchaseOutcome::Accepted { order_id },
            CODE_NO_STOCK => PurchaseOutcome::Rejected(Rejection::NoStock),
            CODE_DUPLICATE => PurchaseOutcome::Rejected(Rejection::Duplicate),
            code => {
                return Err(HotdealError::UnexpectedScriptCode {
                    script: SECKILL_SCRIPT.to_string(),
                    code,
                });
            }
        };
        debug!("compra de {} no voucher {voucher_id}: {outcome:?}", ctx.user_id);
        Ok(outcome)
    }

    /// Estoque restante no store (0 se o voucher não foi semeado).
    pub fn remaining_stock(&self, voucher_id: i64) -> HotdealResult<i64> {
        let Some(raw) = self.db.get(&format!("{SECKILL_STOCK_KEY}{voucher_id}")) else {
            return Ok(0);
        };
        std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| StorageError::NotAnInteger.into())
    }
}
