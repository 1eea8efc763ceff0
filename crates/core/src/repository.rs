use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use hotdeal_common::RepositoryError;

use crate::model::{SeckillVoucher, VoucherOrder};

/// Contrato do banco relacional consumido pelo pipeline de pedidos.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn get_voucher(&self, voucher_id: i64) -> Result<Option<SeckillVoucher>, RepositoryError>;

    async fn save_voucher(&self, voucher: &SeckillVoucher) -> Result<(), RepositoryError>;

    /// `UPDATE ... SET stock = stock - 1 WHERE voucher_id = ? AND stock > 0`.
    /// Retorna o número de linhas afetadas.
    async fn decrement_stock(&self, voucher_id: i64) -> Result<u64, RepositoryError>;

    async fn insert_order(&self, order: &VoucherOrder) -> Result<(), RepositoryError>;

    /// Baixa de estoque e inserção do pedido numa única transação.
    /// `Ok(false)` quando não há estoque; qualquer erro desfaz a baixa.
    async fn create_order(&self, order: &VoucherOrder) -> Result<bool, RepositoryError>;

    /// `SELECT COUNT(*) ... WHERE user_id = ? AND voucher_id = ?`
    async fn count_orders(&self, user_id: i64, voucher_id: i64) -> Result<u64, RepositoryError>;
}

/// Implementação in-memory, usada pelo CLI e pelos testes.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    vouchers: Arc<DashMap<i64, SeckillVoucher>>,
    orders: Arc<DashMap<i64, VoucherOrder>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn orders_for_voucher(&self, voucher_id: i64) -> Vec<VoucherOrder> {
        let mut orders: Vec<VoucherOrder> = self
            .orders
            .iter()
            .filter(|o| o.voucher_id == voucher_id)
            .map(|o| o.value().clone())
            .collect();
        orders.sort_by_key(|o| o.id);
        orders
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }
}

#[async_trait]
impl OrderRepository for MemoryRepository {
    async fn get_voucher(&self, voucher_id: i64) -> Result<Option<SeckillVoucher>, RepositoryError> {
        Ok(self.vouchers.get(&voucher_id).map(|v| v.value().clone()))
    }

    async fn save_voucher(&self, voucher: &SeckillVoucher) -> Result<(), RepositoryError> {
        self.vouchers.insert(voucher.voucher_id, voucher.clone());
        Ok(())
    }

    async fn decrement_stock(&self, voucher_id: i64) -> Result<u64, RepositoryError> {
        // Condição e escrita sob o lock do shard, como o UPDATE condicional
        match self.vouchers.get_mut(&voucher_id) {
            Some(mut voucher) if voucher.stock > 0 => {
                voucher.stock -= 1;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn insert_order(&self, order: &VoucherOrder) -> Result<(), RepositoryError> {
        match self.orders.entry(order.id) {
            Entry::Occupied(_) => Err(RepositoryError::DuplicateKey(format!(
                "voucher_order.id = {}",
                order.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(order.clone());
                Ok(())
            }
        }
    }

    async fn create_order(&self, order: &VoucherOrder) -> Result<bool, RepositoryError> {
        // Lock do voucher segurado até a inserção: baixa e pedido juntos
        let Some(mut voucher) = self.vouchers.get_mut(&order.voucher_id) else {
            return Ok(false);
        };
        if voucher.stock <= 0 {
            return Ok(false);
        }
        match self.orders.entry(order.id) {
            Entry::Occupied(_) => Err(RepositoryError::DuplicateKey(format!(
                "voucher_order.id = {}",
                order.id
            ))),
            Entry::Vacant(slot) => {
                voucher.stock -= 1;
                slot.insert(order.clone());
                Ok(true)
            }
        }
    }

    async fn count_orders(&self, user_id: i64, voucher_id: i64) -> Result<u64, RepositoryError> {
        Ok(self
            .orders
            .iter()
            .filter(|o| o.user_id == user_id && o.voucher_id == voucher_id)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn order(id: i64, user_id: i64, voucher_id: i64) -> VoucherOrder {
        VoucherOrder {
            id,
            user_id,
            voucher_id,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn conditional_decrement_never_negative() {
        let repo = MemoryRepository::new();
        repo.save_voucher(&SeckillVoucher {
            voucher_id: 1,
            stock: 2,
        })
        .await
        .unwrap();

        assert_eq!(repo.decrement_stock(1).await.unwrap(), 1);
        assert_eq!(repo.decrement_stock(1).await.unwrap(), 1);
        assert_eq!(repo.decrement_stock(1).await.unwrap(), 0);
        assert_eq!(repo.get_voucher(1).await.unwrap().unwrap().stock, 0);
        // Voucher inexistente: nenhuma linha afetada
        assert_eq!(repo.decrement_stock(42).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn insert_and_count_orders() {
        let repo = MemoryRepository::new();
        repo.insert_order(&order(1, 10, 5)).await.unwrap();
        repo.insert_order(&order(2, 11, 5)).await.unwrap();
        repo.insert_order(&order(3, 10, 6)).await.unwrap();

        assert_eq!(repo.count_orders(10, 5).await.unwrap(), 1);
        assert_eq!(repo.count_orders(12, 5).await.unwrap(), 0);
        assert_eq!(repo.orders_for_voucher(5).len(), 2);
        assert_eq!(repo.order_count(), 3);
    }

    #[tokio::test]
    async fn create_order_decrements_and_inserts_together() {
        let repo = MemoryRepository::new();
        repo.save_voucher(&SeckillVoucher {
            voucher_id: 5,
            stock: 1,
        })
        .await
        .unwrap();

        assert!(repo.create_order(&order(1, 10, 5)).await.unwrap());
        assert_eq!(repo.get_voucher(5).await.unwrap().unwrap().stock, 0);
        assert_eq!(repo.count_orders(10, 5).await.unwrap(), 1);

        // Sem estoque: nada gravado
        assert!(!repo.create_order(&order(2, 11, 5)).await.unwrap());
        assert_eq!(repo.order_count(), 1);
        // Voucher inexistente
        assert!(!repo.create_order(&order(3, 11, 99)).await.unwrap());
    }

    #[tokio::test]
    async fn create_order_failure_keeps_stock() {
        let repo = MemoryRepository::new();
        repo.save_voucher(&SeckillVoucher {
            voucher_id: 5,
            stock: 2,
        })
        .await
        .unwrap();
        repo.create_order(&order(1, 10, 5)).await.unwrap();

        assert!(matches!(
            repo.create_order(&order(1, 11, 5)).await,
            Err(RepositoryError::DuplicateKey(_))
        ));
        assert_eq!(repo.get_voucher(5).await.unwrap().unwrap().stock, 1);
        assert_eq!(repo.order_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_primary_key_rejected() {
        let repo = MemoryRepository::new();
        repo.insert_order(&order(1, 10, 5)).await.unwrap();
        assert!(matches!(
            repo.insert_order(&order(1, 11, 5)).await,
            Err(RepositoryError::DuplicateKey(_))
        ));
    }
}
