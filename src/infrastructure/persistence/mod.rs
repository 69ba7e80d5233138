//! Store backends - Postgres for deployment, in-memory for tests

mod memory;
mod postgres;

pub use memory::{
    InMemoryConfigStore, InMemoryGameplayStore, InMemoryPromptStore, InMemoryResultStore,
};
pub use postgres::{
    PostgresConfigStore, PostgresGameplayStore, PostgresPromptStore, PostgresResultStore,
};
