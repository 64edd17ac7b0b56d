pub mod types;

pub use types::{AppError, RecorderError, ResolveError, StreamError};
