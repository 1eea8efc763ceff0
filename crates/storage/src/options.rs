use std::time::Duration;

/// Condição para SET (NX ou XX).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SetCondition {
    /// Só seta se a chave não existir.
    Nx,
    /// Só seta se a chave já existir.
    Xx,
}

/// Opções do comando SET.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOptions {
    pub expire: Option<Duration>,
    pub condition: Option<SetCondition>,
}

impl SetOptions {
    /// SET key value PX ttl
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            expire: Some(ttl),
            condition: None,
        }
    }

    /// SET key value NX PX ttl
    pub fn nx_with_ttl(ttl: Duration) -> Self {
        Self {
            expire: Some(ttl),
            condition: Some(SetCondition::Nx),
        }
    }
}

/// Resultado do TTL/PTTL.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeyTtl {
    /// -2: chave não existe.
    Missing,
    /// -1: chave sem expiração.
    Persistent,
    Expires(Duration),
}
