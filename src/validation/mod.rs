//! Validation module for pre-streaming checks.
//!
//! The validation pipeline runs before the first tile to catch setup errors
//! early and report all of them at once.

pub mod pipeline;
pub mod stages;

pub use pipeline::ValidationPipeline;
pub use stages::{GeometryValidation, PlaceholderValidation, ServeSetup, TensorValidation, ValidationStage};
