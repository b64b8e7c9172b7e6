#![allow(dead_code)]
pub mod candle;
pub mod order;
pub mod state;

pub use candle::*;
pub use order::*;
pub use state::*;
