pub mod error;
pub mod source;
pub mod time;

pub use error::{CubeError, Result};
pub use source::SourceSystem;
pub use time::unix_millis;
