//! Configuration for the quantization loop
//!
//! This module provides the rate/distortion settings of an encoding session
//! and their validation: stream layout, rate mode, noise shaping policy,
//! masking adjustments, ATH shape and reservoir switches. The loop reads the
//! configuration but never mutates it.

use crate::compare::QuantCompare;
use crate::error::{ConfigError, ConfigResult};
use crate::tables::{bitrate_index, bitrate_table, sample_rate_index};
use crate::types::{SubstepShaping, SBMAX_L, SBMAX_S};

/// Complete session configuration
#[derive(Debug, Clone, Default)]
pub struct QuantConfig {
    pub stream: StreamConfig,
    pub shaping: ShapingConfig,
    pub masking: MaskingConfig,
    pub ath: AthConfig,
    pub reservoir: ReservoirConfig,
}

/// Stream layout and rate control
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Output sample rate in Hz
    pub sample_rate: u32,
    pub channels: Channels,
    /// Bitrate in kbps for CBR
    pub bitrate_kbps: u32,
    /// CRC protected frames carry two extra side info bytes
    pub error_protection: bool,
    pub mode: RateMode,
    /// Smallest bitrate VBR and ABR may select
    pub vbr_min_kbps: u32,
    /// Largest bitrate VBR and ABR may select
    pub vbr_max_kbps: u32,
    /// Never go below `vbr_min_kbps`, even for analog silence
    pub vbr_hard_min: bool,
    /// Average bitrate target in kbps for ABR
    pub abr_mean_kbps: u32,
    /// Overrides the compression ratio derived from the ABR mean
    pub compression_ratio: Option<f32>,
}

/// Noise shaping policy
#[derive(Debug, Clone)]
pub struct ShapingConfig {
    /// Comparison strategy for long, start and stop blocks
    pub quant_comp: QuantCompare,
    /// Comparison strategy for short blocks
    pub quant_comp_short: QuantCompare,
    pub noise_shaping: NoiseShaping,
    pub noise_shaping_amp: NoiseShapingAmp,
    /// User substep switches (`RESERVOIR_PRESSURE` is ignored here)
    pub substep_shaping: SubstepShaping,
    /// Allow subblock gain escalation on short blocks
    pub subblock_gain: bool,
    /// Disable the early-stop heuristics of the outer loop
    pub full_outer_loop: bool,
    /// Shape noise above the last scalefactor band; `None` picks the
    /// default for the rate mode
    pub sfb21_extra: Option<bool>,
}

/// Masking threshold adjustments
#[derive(Debug, Clone)]
pub struct MaskingConfig {
    /// Masking adjustment in dB for long blocks
    pub mask_adjust: f32,
    /// Masking adjustment in dB for short blocks
    pub mask_adjust_short: f32,
    /// Use the ATH alone as allowed distortion
    pub ath_only: bool,
    /// Use the ATH alone for short blocks
    pub ath_short: bool,
    pub use_temporal_masking: bool,
    /// Decay between short windows; `None` derives it from a 10 ms sustain
    pub temporal_decay: Option<f32>,
    /// Allowed distortion factor per long band
    pub long_factor: [f32; SBMAX_L],
    /// Allowed distortion factor per short band
    pub short_factor: [f32; SBMAX_S],
}

/// Absolute threshold of hearing shape
#[derive(Debug, Clone)]
pub struct AthConfig {
    /// Curve parameter of the ATH formula
    pub curve: f32,
    /// Lowers the ATH by this many dB
    pub lower_db: f32,
    /// Linear scale applied to the ATH
    pub adjust: f32,
    /// Replace the ATH by -200 dB
    pub disabled: bool,
}

/// Bit reservoir switches
#[derive(Debug, Clone, Default)]
pub struct ReservoirConfig {
    pub disabled: bool,
    /// Limit the reservoir buffer to the size of a 320 kbps frame
    pub strict_iso: bool,
}

/// Number of audio channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channels {
    /// Mono audio (1 channel)
    Mono = 1,
    /// Stereo audio (2 channels)
    Stereo = 2,
}

/// MPEG version enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpegVersion {
    /// MPEG-1
    Mpeg1,
    /// MPEG-2
    Mpeg2,
    /// MPEG-2.5
    Mpeg25,
}

/// Rate control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateMode {
    /// Constant bitrate
    Cbr,
    /// Average bitrate
    Abr,
    /// Variable bitrate, bit budget bisection per granule
    VbrRh,
    /// Variable bitrate with ATH adjusted thresholds
    VbrMtrh,
}

/// Noise shaping level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NoiseShaping {
    /// Gain search only
    Disabled = 0,
    /// Amplify distorted bands
    Standard = 1,
    /// Amplify and escalate to scalefac_scale or subblock gain
    Extended = 2,
}

/// Band selection of the scalefactor amplifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseShapingAmp {
    /// Amplify all bands above the allowed noise
    Iso = 0,
    /// Amplify bands within 50 % of the worst band on a dB scale
    HalfMax = 1,
    /// Amplify the worst band only
    SingleBand = 2,
    /// Broad pass with `HalfMax`, refine pass with `SingleBand`
    TwoPassRefine = 3,
}

macro_rules! impl_try_from_code {
    ($ty:ty, $name:literal, [$($code:literal => $variant:expr),+ $(,)?]) => {
        impl TryFrom<u8> for $ty {
            type Error = ConfigError;

            fn try_from(value: u8) -> ConfigResult<Self> {
                match value {
                    $($code => Ok($variant),)+
                    _ => Err(ConfigError::InvalidCode { name: $name, value }),
                }
            }
        }
    };
}

impl_try_from_code!(RateMode, "rate mode", [0 => RateMode::Cbr, 1 => RateMode::Abr, 2 => RateMode::VbrRh, 3 => RateMode::VbrMtrh]);
impl_try_from_code!(NoiseShaping, "noise shaping", [0 => NoiseShaping::Disabled, 1 => NoiseShaping::Standard, 2 => NoiseShaping::Extended]);
impl_try_from_code!(NoiseShapingAmp, "noise shaping amplitude", [
    0 => NoiseShapingAmp::Iso,
    1 => NoiseShapingAmp::HalfMax,
    2 => NoiseShapingAmp::SingleBand,
    3 => NoiseShapingAmp::TwoPassRefine,
]);

impl TryFrom<u8> for Channels {
    type Error = ConfigError;

    fn try_from(value: u8) -> ConfigResult<Self> {
        match value {
            1 => Ok(Channels::Mono),
            2 => Ok(Channels::Stereo),
            _ => Err(ConfigError::InvalidCode { name: "channel count", value }),
        }
    }
}

impl From<Channels> for usize {
    fn from(channels: Channels) -> Self {
        channels as usize
    }
}

impl QuantConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one of the encoder quality levels (0 best, 9 fastest)
    pub fn with_quality(mut self, quality: u8) -> ConfigResult<Self> {
        let shaping = &mut self.shaping;
        let enable_shaping = |shaping: &mut ShapingConfig| {
            if shaping.noise_shaping == NoiseShaping::Disabled {
                shaping.noise_shaping = NoiseShaping::Standard;
            }
        };
        let default_substep = |shaping: &mut ShapingConfig| {
            if shaping.substep_shaping.is_empty() {
                shaping.substep_shaping = SubstepShaping::PSEUDO_HALF_STEPS;
            }
        };

        match quality {
            7..=9 => {
                shaping.noise_shaping = NoiseShaping::Disabled;
                shaping.noise_shaping_amp = NoiseShapingAmp::Iso;
            }
            4..=6 => {
                enable_shaping(shaping);
                shaping.noise_shaping_amp = NoiseShapingAmp::Iso;
            }
            3 => {
                enable_shaping(shaping);
                shaping.noise_shaping_amp = NoiseShapingAmp::HalfMax;
            }
            2 => {
                enable_shaping(shaping);
                default_substep(shaping);
                shaping.noise_shaping_amp = NoiseShapingAmp::HalfMax;
            }
            0 | 1 => {
                enable_shaping(shaping);
                default_substep(shaping);
                shaping.noise_shaping_amp = NoiseShapingAmp::SingleBand;
            }
            _ => return Err(ConfigError::InvalidQuality(quality)),
        }
        shaping.full_outer_loop = false;
        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        let stream = &self.stream;
        if sample_rate_index(stream.sample_rate).is_none() {
            return Err(ConfigError::UnsupportedSampleRate(stream.sample_rate));
        }
        let version = self.mpeg_version();
        let incompatible = |bitrate| ConfigError::IncompatibleRateCombination {
            sample_rate: stream.sample_rate,
            bitrate,
        };

        match stream.mode {
            RateMode::Cbr => {
                bitrate_index(version, stream.bitrate_kbps).ok_or_else(|| incompatible(stream.bitrate_kbps))?;
            }
            RateMode::Abr | RateMode::VbrRh | RateMode::VbrMtrh => {
                bitrate_index(version, stream.vbr_min_kbps).ok_or_else(|| incompatible(stream.vbr_min_kbps))?;
                bitrate_index(version, stream.vbr_max_kbps).ok_or_else(|| incompatible(stream.vbr_max_kbps))?;
                if stream.vbr_min_kbps > stream.vbr_max_kbps {
                    return Err(ConfigError::InvalidVbrRange {
                        min: stream.vbr_min_kbps,
                        max: stream.vbr_max_kbps,
                    });
                }
                if stream.mode == RateMode::Abr
                    && !(stream.vbr_min_kbps..=stream.vbr_max_kbps).contains(&stream.abr_mean_kbps)
                {
                    return Err(ConfigError::AbrMeanOutOfRange {
                        mean: stream.abr_mean_kbps,
                        min: stream.vbr_min_kbps,
                        max: stream.vbr_max_kbps,
                    });
                }
            }
        }

        let masking = &self.masking;
        let factors = masking.long_factor.iter().chain(masking.short_factor.iter());
        for (band, &value) in factors.enumerate() {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidMaskingFactor { band, value });
            }
        }
        Ok(())
    }

    /// Get the MPEG version based on sample rate
    pub fn mpeg_version(&self) -> MpegVersion {
        match self.stream.sample_rate {
            44100 | 48000 | 32000 => MpegVersion::Mpeg1,
            22050 | 24000 | 16000 => MpegVersion::Mpeg2,
            _ => MpegVersion::Mpeg25,
        }
    }

    /// Granules per frame
    pub fn granules(&self) -> usize {
        match self.mpeg_version() {
            MpegVersion::Mpeg1 => 2,
            MpegVersion::Mpeg2 | MpegVersion::Mpeg25 => 1,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.stream.channels.into()
    }

    /// Get the number of samples per frame
    pub fn samples_per_frame(&self) -> usize {
        576 * self.granules()
    }

    /// Frame header plus side info length in bytes
    pub fn side_info_len(&self) -> i32 {
        let base = match (self.mpeg_version(), self.stream.channels) {
            (MpegVersion::Mpeg1, Channels::Mono) => 4 + 17,
            (MpegVersion::Mpeg1, Channels::Stereo) => 4 + 32,
            (_, Channels::Mono) => 4 + 9,
            (_, Channels::Stereo) => 4 + 17,
        };
        if self.stream.error_protection {
            base + 2
        } else {
            base
        }
    }

    /// Whether the loop works with ATH adjusted, VBR style thresholds
    pub fn is_vbr(&self) -> bool {
        matches!(self.stream.mode, RateMode::VbrRh | RateMode::VbrMtrh)
    }

    /// Effective sfb21 noise shaping switch
    pub fn sfb21_extra(&self) -> bool {
        if !self.is_vbr() {
            return false;
        }
        self.shaping.sfb21_extra.unwrap_or(self.stream.sample_rate > 44000)
    }

    /// Effective temporal masking decay between short windows
    pub fn temporal_decay(&self) -> f32 {
        const SUSTAIN_SEC: f64 = 0.01;
        self.masking.temporal_decay.unwrap_or_else(|| {
            let blocks = SUSTAIN_SEC * self.stream.sample_rate as f64 / 192.0;
            (-std::f64::consts::LN_10 / blocks).exp() as f32
        })
    }

    /// Effective ABR compression ratio
    pub fn compression_ratio(&self) -> f32 {
        self.stream.compression_ratio.unwrap_or_else(|| {
            let kbps = self.stream.abr_mean_kbps.max(1) as f32;
            self.stream.sample_rate as f32 * 16.0 * self.channel_count() as f32 / (1000.0 * kbps)
        })
    }

    /// Bitrate index range allowed for VBR and ABR frames
    pub fn vbr_index_range(&self) -> (usize, usize) {
        let version = self.mpeg_version();
        let min = bitrate_index(version, self.stream.vbr_min_kbps).unwrap_or(1);
        let max = bitrate_index(version, self.stream.vbr_max_kbps).unwrap_or(bitrate_table(version).len() - 1);
        (min, max)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: Channels::Stereo,
            bitrate_kbps: 128,
            error_protection: false,
            mode: RateMode::Cbr,
            vbr_min_kbps: 32,
            vbr_max_kbps: 320,
            vbr_hard_min: false,
            abr_mean_kbps: 128,
            compression_ratio: None,
        }
    }
}

impl Default for ShapingConfig {
    fn default() -> Self {
        Self {
            quant_comp: QuantCompare::OverSsdThenBits,
            quant_comp_short: QuantCompare::OverSsdThenBits,
            noise_shaping: NoiseShaping::Extended,
            noise_shaping_amp: NoiseShapingAmp::HalfMax,
            substep_shaping: SubstepShaping::empty(),
            subblock_gain: true,
            full_outer_loop: false,
            sfb21_extra: None,
        }
    }
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            mask_adjust: 0.0,
            mask_adjust_short: 0.0,
            ath_only: false,
            ath_short: false,
            use_temporal_masking: true,
            temporal_decay: None,
            long_factor: [1.0; SBMAX_L],
            short_factor: [1.0; SBMAX_S],
        }
    }
}

impl Default for AthConfig {
    fn default() -> Self {
        Self {
            curve: 4.0,
            lower_db: 0.0,
            adjust: 1.0,
            disabled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    prop_compose! {
        fn valid_sample_rate()(rate in prop::sample::select(vec![
            44100u32, 48000, 32000,  // MPEG-1
            22050, 24000, 16000,     // MPEG-2
            11025, 12000, 8000,      // MPEG-2.5
        ])) -> u32 {
            rate
        }
    }

    fn compatible_cbr_config() -> impl Strategy<Value = QuantConfig> {
        (valid_sample_rate(), prop::sample::select(vec![Channels::Mono, Channels::Stereo]))
            .prop_flat_map(|(sample_rate, channels)| {
                let bitrate_strategy = match sample_rate {
                    44100 | 48000 | 32000 => prop::sample::select(vec![32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320]),
                    22050 | 24000 | 16000 => prop::sample::select(vec![8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160]),
                    _ => prop::sample::select(vec![8, 16, 24, 32, 40, 48, 56, 64]),
                };
                (Just(sample_rate), Just(channels), bitrate_strategy)
            })
            .prop_map(|(sample_rate, channels, bitrate_kbps)| {
                let mut config = QuantConfig::new();
                config.stream.sample_rate = sample_rate;
                config.stream.channels = channels;
                config.stream.bitrate_kbps = bitrate_kbps;
                config
            })
    }

    prop_compose! {
        fn invalid_sample_rate()(rate in prop::num::u32::ANY.prop_filter("Must be invalid", |&rate| {
            !matches!(rate, 44100 | 48000 | 32000 | 22050 | 24000 | 16000 | 11025 | 12000 | 8000)
        })) -> u32 {
            rate
        }
    }

    proptest! {
        #[test]
        fn test_valid_cbr_configs_pass(config in compatible_cbr_config()) {
            prop_assert!(config.validate().is_ok(), "Valid configuration should pass validation");
            prop_assert!(config.side_info_len() >= 13);
            prop_assert_eq!(config.samples_per_frame(), 576 * config.granules());
        }

        #[test]
        fn test_invalid_sample_rate_rejected(rate in invalid_sample_rate()) {
            let mut config = QuantConfig::new();
            config.stream.sample_rate = rate;
            prop_assert_eq!(config.validate(), Err(ConfigError::UnsupportedSampleRate(rate)));
        }

        #[test]
        fn test_quality_levels_keep_config_valid(quality in 0u8..=9) {
            let config = QuantConfig::new().with_quality(quality).unwrap();
            prop_assert!(config.validate().is_ok());
            prop_assert_eq!(config.shaping.noise_shaping == NoiseShaping::Disabled, quality >= 7);
        }
    }

    #[test]
    fn test_side_info_lengths() {
        let mut config = QuantConfig::new();
        assert_eq!(config.side_info_len(), 36);
        config.stream.channels = Channels::Mono;
        assert_eq!(config.side_info_len(), 21);
        config.stream.sample_rate = 22050;
        assert_eq!(config.side_info_len(), 13);
        config.stream.channels = Channels::Stereo;
        config.stream.error_protection = true;
        assert_eq!(config.side_info_len(), 23);
    }

    #[test]
    fn test_mpeg2_rejects_mpeg1_bitrate() {
        let mut config = QuantConfig::new();
        config.stream.sample_rate = 16000;
        config.stream.bitrate_kbps = 320;
        assert_eq!(
            config.validate(),
            Err(ConfigError::IncompatibleRateCombination { sample_rate: 16000, bitrate: 320 })
        );
    }

    #[test]
    fn test_vbr_range_checks() {
        let mut config = QuantConfig::new();
        config.stream.mode = RateMode::VbrRh;
        config.stream.vbr_min_kbps = 256;
        config.stream.vbr_max_kbps = 128;
        assert_eq!(config.validate(), Err(ConfigError::InvalidVbrRange { min: 256, max: 128 }));

        config.stream.mode = RateMode::Abr;
        config.stream.vbr_min_kbps = 32;
        config.stream.abr_mean_kbps = 200;
        assert!(matches!(config.validate(), Err(ConfigError::AbrMeanOutOfRange { .. })));
    }

    #[test]
    fn test_masking_factor_validation() {
        let mut config = QuantConfig::new();
        config.masking.short_factor[2] = f32::NAN;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMaskingFactor { band, .. }) if band == SBMAX_L + 2
        ));
    }

    #[test]
    fn test_enum_codes() {
        assert_eq!(NoiseShapingAmp::try_from(3), Ok(NoiseShapingAmp::TwoPassRefine));
        assert_eq!(RateMode::try_from(2), Ok(RateMode::VbrRh));
        assert_eq!(
            NoiseShaping::try_from(7),
            Err(ConfigError::InvalidCode { name: "noise shaping", value: 7 })
        );
        assert!(Channels::try_from(0).is_err());
        assert_eq!(usize::from(Channels::Stereo), 2);
    }

    #[test]
    fn test_sfb21_extra_defaults() {
        let mut config = QuantConfig::new();
        config.stream.sample_rate = 48000;
        assert!(!config.sfb21_extra(), "CBR never shapes sfb21");
        config.stream.mode = RateMode::VbrRh;
        assert!(config.sfb21_extra());
        config.stream.sample_rate = 44100;
        assert!(!config.sfb21_extra());
        config.shaping.sfb21_extra = Some(true);
        assert!(config.sfb21_extra());
    }

    #[test]
    fn test_derived_defaults() {
        let config = QuantConfig::new();
        let decay = config.temporal_decay();
        assert!(decay > 0.0 && decay < 1.0);
        // 44.1 kHz stereo at 128 kbps compresses about 11:1
        assert!((config.compression_ratio() - 11.025).abs() < 1e-3);
        assert_eq!(config.vbr_index_range(), (1, 14));
        assert!(QuantConfig::new().with_quality(10).is_err());
    }
}
