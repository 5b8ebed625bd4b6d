pub mod store;

pub use store::{Store, StoreError, StoreResult};
