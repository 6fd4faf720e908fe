//! Infrastructure layer: the persistent repo iterator and its stores.

pub mod iterator;


pub use iterator::{
    Checkout, ErrorLedger, FailPoint, InMemoryIteratorStore, IterationConfig, IterationError,
    IteratorError, IteratorRecord, IteratorStore, IteratorTransaction, Pass,
    PersistentRepoIterator, PostgresIteratorStore, StoreError, TerminalHook,
};
