//! Core domain types for the exit engine.

pub mod account;
pub mod order;
pub mod position;
pub mod tick;

pub use account::*;
pub use order::*;
pub use position::*;
pub use tick::*;
