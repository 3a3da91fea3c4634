pub mod builders;
pub mod faults;
pub mod strategies;

pub use builders::*;
pub use faults::*;
