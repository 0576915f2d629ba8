pub mod connection;
pub mod error;
pub mod executor;
pub mod grants;

pub use connection::{Database, DatabaseConfig};
pub use error::{DatabaseError, Result};
pub use executor::{Executor, PgExecutor, SqlRow, SqlValue, SqliteExecutor, WriteStatement};
pub use grants::GrantRepository;
