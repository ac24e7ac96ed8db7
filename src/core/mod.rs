pub mod error;
pub mod value;

pub use error::{Result, SagaError};
pub use value::{Params, Value};
