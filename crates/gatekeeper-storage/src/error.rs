pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("key cipher error: {0}")]
    Cipher(#[from] gatekeeper_cipher::KeyCipherError),
    #[error("row not found")]
    NotFound,
}
