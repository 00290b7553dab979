//! Shared types: identifiers, permission masks, attributes, and errors.

pub mod attr;
pub mod errors;
pub mod flags;
pub mod ids;

pub use self::{attr::*, errors::*, flags::*, ids::*};
