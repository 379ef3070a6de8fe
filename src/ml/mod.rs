pub mod autodiff;
mod random;
pub mod transformer;

pub use autodiff::*;
pub use random::*;
