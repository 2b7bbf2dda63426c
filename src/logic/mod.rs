pub mod optimistic;

pub use optimistic::*;
