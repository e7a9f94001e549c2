pub mod checkpoint;
pub mod error;
pub mod model;
pub mod preprocess;
pub mod service;
pub mod vit;

pub use error::InferenceError;
pub use service::InferenceService;
