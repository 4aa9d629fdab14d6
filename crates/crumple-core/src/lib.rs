pub mod cache;
pub mod clicks;
pub mod error;
pub mod image_data;
pub mod progress;
pub mod request;
pub mod result;
pub mod retry;
pub mod stats;
mod transform_types;

pub use error::{classify, ErrorKind, TransformError, TransportFailure};
pub use progress::TransformPhase;
pub use request::{RequestKey, TransformOptions, TransformParams, TransformRequest};
pub use result::{TransformHistory, TransformResult, TransformState};
pub use transform_types::{TransformPreset, TransformProfiles, TransformType};
