mod context;
mod engine;
mod model;

pub use context::*;
pub use engine::*;
pub use model::*;
