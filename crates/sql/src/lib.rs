// MODULE DECLARATIONS
mod constant;
mod range;

// PUBLIC API EXPORTS
pub use constant::{Constant, ConstantType, TypeError, TypeResult};
pub use range::ConstantRange;
