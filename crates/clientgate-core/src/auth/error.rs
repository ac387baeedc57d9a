use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid email address: {0:?}")]
    InvalidEmail(String),

    #[error("Invalid portal URL: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
