//! Error types for the quantization loop
//!
//! Search non-convergence and gain/scalefactor saturation are normal outcomes
//! of the rate loop and never show up here. These types cover configuration
//! validation, malformed granule input and broken reservoir bookkeeping.

use thiserror::Error;

/// Main error type for the quantizer
#[derive(Debug, Error)]
pub enum QuantizerError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Input data validation errors
    #[error("Input data error: {0}")]
    InputData(#[from] InputDataError),

    /// Rate loop errors
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

/// Configuration validation errors
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// Unsupported sample rate
    #[error("Unsupported sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    /// Bitrate not available for the MPEG version of the sample rate
    #[error("Incompatible sample rate ({sample_rate} Hz) and bitrate ({bitrate} kbps) combination")]
    IncompatibleRateCombination { sample_rate: u32, bitrate: u32 },

    /// Integer code outside the range of a configuration enum
    #[error("Invalid {name} code: {value}")]
    InvalidCode { name: &'static str, value: u8 },

    /// VBR minimum above maximum
    #[error("Invalid VBR bitrate range: {min} kbps > {max} kbps")]
    InvalidVbrRange { min: u32, max: u32 },

    /// ABR mean bitrate outside the VBR range
    #[error("ABR mean bitrate {mean} kbps outside {min}..={max} kbps")]
    AbrMeanOutOfRange { mean: u32, min: u32, max: u32 },

    /// Band factor tables must be finite and non-negative
    #[error("Invalid masking factor at band {band}: {value}")]
    InvalidMaskingFactor { band: usize, value: f32 },

    /// Quality level outside 0..=9
    #[error("Invalid quality level: {0}")]
    InvalidQuality(u8),
}

/// Input data validation errors
#[derive(Debug, Error, PartialEq)]
pub enum InputDataError {
    /// Frame carries the wrong number of granules
    #[error("Invalid granule count: expected {expected}, got {actual}")]
    InvalidGranuleCount { expected: usize, actual: usize },

    /// Granule carries the wrong number of channels
    #[error("Invalid channel count: expected {expected}, got {actual}")]
    InvalidChannelCount { expected: usize, actual: usize },

    /// Spectral data contains NaN or infinity
    #[error("Non-finite spectral value at granule {granule}, channel {channel}, line {line}")]
    NonFiniteSpectrum {
        granule: usize,
        channel: usize,
        line: usize,
    },

    /// Mixed blocks are only meaningful for short block granules
    #[error("Mixed block flag set on a non-short block at granule {granule}, channel {channel}")]
    MixedNonShortBlock { granule: usize, channel: usize },
}

/// Rate loop errors
#[derive(Debug, Error, PartialEq)]
pub enum EncodingError {
    /// Reservoir bookkeeping produced an impossible state
    #[error("Bit reservoir invariant violated: {0}")]
    ReservoirInvariant(String),

    /// No bitrate in the allowed range can hold the encoded frame
    #[error("No bitrate can hold {used_bits} bits (largest frame holds {available_bits})")]
    FrameOverflow { used_bits: i32, available_bits: i32 },
}

/// Specialized result types for different modules
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
pub type InputResult<T> = std::result::Result<T, InputDataError>;
pub type EncodingResult<T> = std::result::Result<T, EncodingError>;
