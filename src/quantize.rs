//! Nonuniform quantization of a granule
//!
//! Coefficients are raised to the 3/4 power once per granule (`xrpow`);
//! quantizing at a global gain is then a multiply by the inverse step and a
//! table driven rounding to the 4/3-power decision points.

use crate::config::ShapingConfig;
use crate::huffman::BitCounter;
use crate::tables::{ScalefacBands, QUANT_TABLES};
use crate::types::{GranuleInfo, SubstepShaping, GRANULE_SIZE, IXMAX_VAL, LARGE_BITS, SFBMAX};

/// Smallest coefficient kept in a pseudo half step band, relative to the step
const PSEUDO_HALF_ROUNDFAC: f32 = 0.634521682242439;

/// Quantizer settings shared by every stage of the outer loop
#[derive(Clone, Copy)]
pub struct QuantContext<'a> {
    pub counter: &'a dyn BitCounter,
    pub bands: &'a ScalefacBands,
    pub shaping: &'a ShapingConfig,
    /// Effective substep switches, user flags plus reservoir pressure
    pub substep: SubstepShaping,
    /// Granules per frame, selects MPEG-1 or MPEG-2 scalefactor coding
    pub granules: usize,
    /// Stop shaping once the band above the last scalefactor is distorted
    pub sfb21_extra: bool,
    /// VBR keeps the unamplified spectrum for the next bit budget try
    pub vbr: bool,
}

/// Mutable spectrum state of one granule while it is being searched
#[derive(Debug, Clone)]
pub struct Workspace {
    /// |xr|^(3/4), amplified in place as scalefactors grow
    pub xrpow: [f32; GRANULE_SIZE],
    /// Bands currently quantized at half step resolution
    pub pseudohalf: [bool; SFBMAX],
}

impl Default for Workspace {
    fn default() -> Self {
        Self {
            xrpow: [0.0; GRANULE_SIZE],
            pseudohalf: [false; SFBMAX],
        }
    }
}

/// Quantize `xrpow` with inverse step `istep` into `ix`.
///
/// Callers guarantee `xrpow * istep <= IXMAX_VAL`.
pub fn quantize_xrpow(xrpow: &[f32; GRANULE_SIZE], ix: &mut [i32; GRANULE_SIZE], istep: f32) {
    let adj43 = &QUANT_TABLES.adj43;
    for (q, &x) in ix.iter_mut().zip(xrpow.iter()) {
        let scaled = x * istep;
        let index = (scaled as usize).min(adj43.len() - 1);
        *q = (scaled + adj43[index]) as i32;
    }
}

/// Quantize at the granule's global gain and count the Huffman bits.
///
/// Returns [`LARGE_BITS`] without touching `l3_enc` when the largest value
/// would exceed the table range.
pub fn count_bits(ctx: &QuantContext<'_>, gi: &mut GranuleInfo, ws: &Workspace) -> i32 {
    let istep = QUANT_TABLES.ipow20(gi.global_gain);
    if gi.xrpow_max > IXMAX_VAL as f32 / istep {
        return LARGE_BITS;
    }
    quantize_xrpow(&ws.xrpow, &mut gi.l3_enc, istep);

    if ctx.substep.contains(SubstepShaping::PSEUDO_HALF_STEPS) {
        let roundfac = PSEUDO_HALF_ROUNDFAC / QUANT_TABLES.ipow20(gi.global_gain + gi.scalefac_scale);
        let mut j = 0;
        for sfb in 0..gi.sfbmax {
            let width = gi.width[sfb];
            if ws.pseudohalf[sfb] {
                for k in j..j + width {
                    if ws.xrpow[k] < roundfac {
                        gi.l3_enc[k] = 0;
                    }
                }
            }
            j += width;
        }
    }

    ctx.counter.count_bits(gi)
}
