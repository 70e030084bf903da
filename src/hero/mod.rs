//! Pool selection, normalization and the bus-driven rotation manager.

pub mod candidate;
pub mod item_normalizer;
pub mod pool_builder;
pub mod rotation_manager;
pub mod selection_planner;

pub use pool_builder::{current_hero, BuildError, HeroPool, PoolBuilder, PoolRequest, PoolSource};
pub use rotation_manager::RotationManager;
