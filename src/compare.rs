//! Candidate quantization comparison strategies
//!
//! The outer loop keeps the best quantization seen so far and asks a
//! strategy whether a new candidate beats it. Every strategy is a pure
//! predicate over two [`NoiseResult`]s; Klemm's metric first replaces the
//! candidate's max noise with a smooth sum over all bands.

use crate::error::{ConfigError, ConfigResult};
use crate::noise::{klemm_noise, NoiseResult};
use crate::tables::approx_eq;
use crate::types::{GranuleInfo, SFBMAX};

/// Decides whether a candidate quantization replaces the current best
pub trait NoiseComparator {
    fn is_better(&self, best: &NoiseResult, calc: &NoiseResult) -> bool;
}

/// Comparison strategy of the outer loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "diagnostics", derive(serde::Serialize, serde::Deserialize))]
pub enum QuantCompare {
    /// Fewer distorted bands, then less over noise, then less total noise
    OverCountThenNoise = 0,
    /// Lower worst band noise
    MaxNoise = 1,
    /// Lower total noise
    TotalNoise = 2,
    /// Lower total and worst band noise
    TotalAndMaxNoise = 3,
    /// Weighted max/total/over noise tradeoff
    Weighted = 4,
    /// Less over noise, then less total noise
    OverNoiseThenTotal = 5,
    /// Less over noise, then lower worst band, then less total noise
    OverNoiseThenMax = 6,
    /// Fewer distorted bands or less over noise
    OverCountOrNoise = 7,
    /// Klemm's smooth noise level
    Klemm = 8,
    /// Squared over noise while distorted, otherwise noise and bits
    OverSsdThenBits = 9,
}

impl TryFrom<u8> for QuantCompare {
    type Error = ConfigError;

    fn try_from(value: u8) -> ConfigResult<Self> {
        use QuantCompare::*;
        const ALL: [QuantCompare; 10] = [
            OverCountThenNoise,
            MaxNoise,
            TotalNoise,
            TotalAndMaxNoise,
            Weighted,
            OverNoiseThenTotal,
            OverNoiseThenMax,
            OverCountOrNoise,
            Klemm,
            OverSsdThenBits,
        ];
        ALL.get(value as usize)
            .copied()
            .ok_or(ConfigError::InvalidCode { name: "quantization comparison", value })
    }
}

impl NoiseComparator for QuantCompare {
    fn is_better(&self, best: &NoiseResult, calc: &NoiseResult) -> bool {
        let better = match self {
            QuantCompare::OverCountThenNoise => {
                calc.over_count < best.over_count
                    || (calc.over_count == best.over_count && calc.over_noise < best.over_noise)
                    || (calc.over_count == best.over_count
                        && approx_eq(calc.over_noise, best.over_noise)
                        && calc.tot_noise < best.tot_noise)
            }
            QuantCompare::MaxNoise | QuantCompare::Klemm => calc.max_noise < best.max_noise,
            QuantCompare::TotalNoise => calc.tot_noise < best.tot_noise,
            QuantCompare::TotalAndMaxNoise => {
                calc.tot_noise < best.tot_noise && calc.max_noise < best.max_noise
            }
            QuantCompare::Weighted => weighted(best, calc),
            QuantCompare::OverNoiseThenTotal => {
                calc.over_noise < best.over_noise
                    || (approx_eq(calc.over_noise, best.over_noise) && calc.tot_noise < best.tot_noise)
            }
            QuantCompare::OverNoiseThenMax => {
                calc.over_noise < best.over_noise
                    || (approx_eq(calc.over_noise, best.over_noise)
                        && (calc.max_noise < best.max_noise
                            || (approx_eq(calc.max_noise, best.max_noise) && calc.tot_noise <= best.tot_noise)))
            }
            QuantCompare::OverCountOrNoise => {
                calc.over_count < best.over_count || calc.over_noise < best.over_noise
            }
            QuantCompare::OverSsdThenBits => {
                if best.over_count > 0 {
                    if calc.over_ssd == best.over_ssd {
                        calc.bits < best.bits
                    } else {
                        calc.over_ssd < best.over_ssd
                    }
                } else {
                    calc.max_noise < 0.0
                        && calc.max_noise * 10.0 + calc.bits as f32 <= best.max_noise * 10.0 + best.bits as f32
                }
            }
        };

        // once nothing is distorted only cheaper candidates count
        if best.over_count == 0 {
            better && calc.bits < best.bits
        } else {
            better
        }
    }
}

fn weighted(best: &NoiseResult, calc: &NoiseResult) -> bool {
    (calc.max_noise <= 0.0 && best.max_noise > 0.2)
        || (calc.max_noise <= 0.0
            && best.max_noise < 0.0
            && best.max_noise > calc.max_noise - 0.2
            && calc.tot_noise < best.tot_noise)
        || (calc.max_noise <= 0.0
            && best.max_noise > 0.0
            && best.max_noise > calc.max_noise - 0.2
            && calc.tot_noise < best.tot_noise + best.over_noise)
        || (calc.max_noise > 0.0
            && best.max_noise > -0.05
            && best.max_noise > calc.max_noise - 0.1
            && calc.tot_noise + calc.over_noise < best.tot_noise + best.over_noise)
        || (calc.max_noise > 0.0
            && best.max_noise > -0.1
            && best.max_noise > calc.max_noise - 0.15
            && calc.tot_noise + calc.over_noise + calc.over_noise
                < best.tot_noise + best.over_noise + best.over_noise)
}

/// Compare a candidate against the best quantization so far.
///
/// Klemm's strategy rewrites `calc.max_noise` from the candidate's band
/// distortions before comparing.
pub fn quant_compare(
    strategy: QuantCompare,
    best: &NoiseResult,
    calc: &mut NoiseResult,
    gi: &GranuleInfo,
    distort: &[f32; SFBMAX],
) -> bool {
    if strategy == QuantCompare::Klemm {
        calc.max_noise = klemm_noise(distort, gi);
    }
    strategy.is_better(best, calc)
}
