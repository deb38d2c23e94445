#[macro_use]
extern crate tracing;

mod engine;
mod error;
mod listener;

pub use engine::Engine;
pub use error::EngineError;
pub use listener::CommitListener;
pub use search_index;
