pub mod error;
pub mod memory;
pub mod postgres_store;
pub mod store;
pub mod views;

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use postgres_store::PostgresStore;
pub use store::{is_open, StateStore};
pub use views::{ActiveJobRow, JobProgressRow};
