//! Resource storage backends

mod memory;
mod postgres;
mod traits;

pub use memory::{BatchHold, InMemoryResourceStore};
pub use postgres::PostgresResourceStore;
pub use traits::ResourceStore;
