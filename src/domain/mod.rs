pub mod candle;
pub mod event;
pub mod order;

pub use candle::*;
pub use event::*;
pub use order::*;
