use hotdeal_common::StorageError;

use crate::Keyspace;

/// Script atômico executado no servidor.
///
/// Equivalente a um script Lua registrado: roda com acesso exclusivo ao
/// keyspace inteiro, então nenhuma outra operação intercala com ele.
/// Argumentos e retorno seguem o contrato do EVALSHA (strings in, inteiro out).
pub trait Script: Send + Sync {
    /// Nome sob o qual o script é registrado (faz o papel do SHA).
    fn name(&self) -> &str;

    fn call(&self, ks: &Keyspace, keys: &[String], args: &[String]) -> Result<i64, StorageError>;
}

/// Argumento posicional obrigatório.
pub fn arg<'a>(args: &'a [String], index: usize) -> Result<&'a str, StorageError> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| StorageError::InvalidScriptArgument(format!("argumento {index} ausente")))
}

/// Argumento posicional interpretado como inteiro.
pub fn int_arg(args: &[String], index: usize) -> Result<i64, StorageError> {
    let raw = arg(args, index)?;
    raw.parse()
        .map_err(|_| StorageError::InvalidScriptArgument(format!("'{raw}' não é inteiro")))
}
