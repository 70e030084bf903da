pub mod hero_store;
pub mod kv_store;

pub use hero_store::HeroStore;
pub use kv_store::{KeyValueStore, NullKvStore, SessionKvStore, StoreError};
