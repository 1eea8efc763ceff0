use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hotdeal_common::{HotdealError, HotdealResult};
use hotdeal_storage::StreamEntry;

/// Contexto da requisição: quem está comprando.
///
/// Passado explicitamente pela cadeia de chamadas, sem estado global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: i64,
}

impl UserContext {
    pub fn new(user_id: i64) -> Self {
        Self { user_id }
    }
}

/// Linha do voucher de flash sale no banco relacional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeckillVoucher {
    pub voucher_id: i64,
    pub stock: i64,
}

/// Pedido persistido. Um por (usuário, voucher).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherOrder {
    pub id: i64,
    pub user_id: i64,
    pub voucher_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Compra aceita pelo script, publicada no stream de pedidos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeckillIntent {
    pub voucher_id: i64,
    pub user_id: i64,
    pub order_id: i64,
}

impl SeckillIntent {
    pub const FIELD_USER: &'static str = "userId";
    pub const FIELD_VOUCHER: &'static str = "voucherId";
    pub const FIELD_ORDER: &'static str = "id";

    pub fn to_fields(&self) -> Vec<(String, Bytes)> {
        vec![
            (Self::FIELD_USER.into(), Bytes::from(self.user_id.to_string())),
            (Self::FIELD_VOUCHER.into(), Bytes::from(self.voucher_id.to_string())),
            (Self::FIELD_ORDER.into(), Bytes::from(self.order_id.to_string())),
        ]
    }

    pub fn from_entry(entry: &StreamEntry) -> HotdealResult<Self> {
        let field = |name: &str| -> HotdealResult<i64> {
            let raw = entry.field(name).ok_or_else(|| {
                HotdealError::MalformedIntent(format!("{}: campo '{name}' ausente", entry.id))
            })?;
            std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    HotdealError::MalformedIntent(format!("{}: campo '{name}' não numérico", entry.id))
                })
        };
        Ok(Self {
            voucher_id: field(Self::FIELD_VOUCHER)?,
            user_id: field(Self::FIELD_USER)?,
            order_id: field(Self::FIELD_ORDER)?,
        })
    }

    pub fn into_order(self, created_at: DateTime<Utc>) -> VoucherOrder {
        VoucherOrder {
            id: self.order_id,
            user_id: self.user_id,
            voucher_id: self.voucher_id,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotdeal_storage::StreamId;

    #[test]
    fn intent_fields_decode() {
        let intent = SeckillIntent {
            voucher_id: 7,
            user_id: 1010,
            order_id: 99,
        };
        let entry = StreamEntry {
            id: StreamId::new(1, 0),
            fields: intent.to_fields(),
        };
        assert_eq!(SeckillIntent::from_entry(&entry).unwrap(), intent);
    }

    #[test]
    fn intent_missing_field() {
        let entry = StreamEntry {
            id: StreamId::new(1, 0),
            fields: vec![("userId".into(), Bytes::from("1"))],
        };
        let err = SeckillIntent::from_entry(&entry).unwrap_err();
        assert!(matches!(err, HotdealError::MalformedIntent(_)));
        assert!(err.to_string().contains("voucherId"));
    }

    #[test]
    fn intent_non_numeric_field() {
        let entry = StreamEntry {
            id: StreamId::new(1, 0),
            fields: vec![
                ("userId".into(), Bytes::from("abc")),
                ("voucherId".into(), Bytes::from("1")),
                ("id".into(), Bytes::from("2")),
            ],
        };
        assert!(matches!(
            SeckillIntent::from_entry(&entry),
            Err(HotdealError::MalformedIntent(_))
        ));
    }

    #[test]
    fn order_serializes_camel_case() {
        let order = SeckillIntent {
            voucher_id: 2,
            user_id: 3,
            order_id: 4,
        }
        .into_order(DateTime::from_timestamp(0, 0).unwrap());
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["userId"], 3);
        assert_eq!(json["voucherId"], 2);
        assert_eq!(json["id"], 4);
    }
}
