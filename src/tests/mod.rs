//! Cross module tests of the quantization loop
//!
//! Module level behavior is tested next to each module; these exercise the
//! loop as a whole through [`crate::QuantizationLoop`] and the outer loop.

pub mod fixtures;
