//! Image references, content types and the association graph of mirrored images

mod association;
mod mapping;
mod reference;
mod types;

pub use association::*;
pub use mapping::*;
pub use reference::*;
pub use types::*;
