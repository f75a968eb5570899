mod campaign;
mod journal;
mod log;
mod settings;
mod subscriber;

pub use campaign::*;
pub use journal::*;
pub use log::*;
pub use settings::*;
pub use subscriber::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Database(sqlx::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("conflict")]
    Conflict,
}

impl From<sqlx::Error> for Error {
    fn from(sql: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &sql {
            if db_err.is_unique_violation() {
                return Error::Conflict;
            }
        }
        if matches!(sql, sqlx::Error::RowNotFound) {
            return Error::NotFound("row");
        }
        Error::Database(sql)
    }
}
