//! Collaborator contracts consumed by the engine.

pub mod executor;
pub mod observer;
pub mod publisher;
pub mod store;

pub use executor::Executor;
pub use observer::Observer;
pub use publisher::Publisher;
pub use store::TaskStore;
