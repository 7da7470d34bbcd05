#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod atom;
mod cache;
mod ctx;
mod error;
mod scheduler;
mod spy;

pub use atom::*;
pub use cache::*;
pub use ctx::*;
pub use error::*;
pub use scheduler::*;
pub use spy::*;
