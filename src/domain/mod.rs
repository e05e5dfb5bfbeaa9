pub mod control;
pub mod plan;
pub mod request;

pub use control::*;
pub use plan::*;
pub use request::*;
