//! Core building blocks shared by every part of the assembler.
//!
//! - Error handling
//! - Configuration and input validation

pub mod errors;
pub mod validation;

pub use errors::{Img2SeqError, ProcessingStage};
