/// Erros do armazenamento chave-valor.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("operação contra chave com tipo errado")]
    WrongType,
    #[error("valor não é um inteiro válido ou está fora do intervalo")]
    NotAnInteger,
    #[error("offset ou largura de bit inválidos")]
    InvalidBitRange,
    #[error("id de stream inválido: {0}")]
    InvalidStreamId(String),
    #[error("grupo de consumidores inexistente: {0}")]
    NoGroup(String),
    #[error("grupo de consumidores já existe: {0}")]
    GroupExists(String),
    #[error("script não registrado: {0}")]
    NoScript(String),
    #[error("argumento de script inválido: {0}")]
    InvalidScriptArgument(String),
    /// Falha de transporte de um store remoto. O `Db` in-memory nunca
    /// produz este erro.
    #[error("store indisponível: {0}")]
    Unavailable(String),
}

/// Erros do banco relacional (linhas de voucher e pedidos).
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("banco relacional indisponível: {0}")]
    Unavailable(String),
    #[error("chave duplicada: {0}")]
    DuplicateKey(String),
}

/// Erro top-level do hotdeal.
#[derive(Debug, thiserror::Error)]
pub enum HotdealError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("falha de serialização: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("falha ao carregar do banco: {0}")]
    Loader(String),
    #[error("timeout aguardando lock '{0}'")]
    LockTimeout(String),
    #[error("mensagem de pedido malformada: {0}")]
    MalformedIntent(String),
    #[error("código de retorno inesperado do script '{script}': {code}")]
    UnexpectedScriptCode { script: String, code: i64 },
}

/// Result type alias.
pub type HotdealResult<T> = Result<T, HotdealError>;
