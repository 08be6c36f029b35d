mod error;
mod validate;

pub use error::GraphError;
pub use validate::{validate, ResolvedForest};
