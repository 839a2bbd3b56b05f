//! # MP3 Quantizer
//!
//! The rate/distortion loop of an MPEG Layer III encoder. Given the MDCT
//! spectrum and psychoacoustic masking data of a frame, it chooses global
//! gains, scalefactors and bitrates so that quantization noise stays under
//! the allowed distortion within the frame's bit budget.
//!
//! ```no_run
//! use mp3_quantizer::{FrameInput, QuantConfig, QuantizationLoop};
//!
//! # fn frames() -> Vec<FrameInput> { Vec::new() }
//! let mut session = QuantizationLoop::new(QuantConfig::new())?;
//! for frame in frames() {
//!     let result = session.encode_frame(&frame)?;
//!     println!("{} kbps, {} main data bits", result.bitrate_kbps, result.main_data_bits);
//! }
//! # Ok::<(), mp3_quantizer::QuantizerError>(())
//! ```

pub mod amplify;
pub mod ath;
pub mod compare;
pub mod config;
#[cfg(feature = "diagnostics")]
pub mod diagnostics;
pub mod error;
pub mod huffman;
pub mod iteration;
pub mod noise;
pub mod outer_loop;
pub mod quantize;
pub mod reservoir;
pub mod scalefac;
pub mod search;
pub mod tables;
pub mod types;

#[cfg(test)]
mod tests;

pub use config::{Channels, MpegVersion, NoiseShaping, NoiseShapingAmp, QuantConfig, RateMode};
pub use error::{ConfigError, EncodingError, InputDataError, QuantizerError};
pub use huffman::{BitCounter, HuffmanEstimator};
pub use iteration::{ChannelInput, FrameInput, FrameResult, GranuleInput, QuantizationLoop};
pub use types::{BlockType, GranuleInfo, PsyRatio, SideInfo, SubstepShaping};

pub type Result<T> = std::result::Result<T, QuantizerError>;
