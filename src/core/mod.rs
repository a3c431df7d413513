pub mod error;
pub mod types;
pub mod value;

pub use error::{EngineError, EngineResult, ErrorCode, Result, StoreError};
pub use types::Row;
pub use value::Value;
