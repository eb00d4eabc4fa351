mod loader;
mod parser;
mod validator;

pub use loader::UnitLoader;
pub use parser::{RawUnitDef, UnitDef};
pub use validator::{UnitValidator, ValidationError, ValidationResult, ValidationWarning};
