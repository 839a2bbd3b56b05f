//! Scalefactor amplification of distorted bands
//!
//! Amplifying a band raises its scalefactor, which moves quantization noise
//! out of that band at the cost of bits. When the scalefactors no longer fit
//! their coding range the amplifier escalates: first to a coarser
//! scalefactor resolution, then to per-window subblock gain on short blocks.
//! The ladder only moves forward within one outer loop run.

use crate::config::{NoiseShaping, NoiseShapingAmp};
use crate::quantize::{QuantContext, Workspace};
use crate::scalefac::scale_bitcount;
use crate::tables::{PRETAB, QUANT_TABLES};
use crate::types::{GranuleInfo, SubstepShaping, SFBMAX};

/// One scalefactor step at `scalefac_scale == 0`, 2^(0.75 * 0.5)
const IFQSTEP34_FINE: f32 = 1.296_839_6;
/// One scalefactor step at `scalefac_scale == 1`, 2^(0.75 * 1)
const IFQSTEP34_COARSE: f32 = 1.681_792_8;

/// Escalation stage reached by [`balance_noise`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceState {
    /// Plain band amplification fits the scalefactor range
    Amplifying,
    /// Fits after switching to coarse scalefactor steps
    PromotingScaleScale,
    /// Fits after raising a short block subblock gain
    RaisingSubblockGain,
    /// Nothing left to amplify
    Exhausted,
}

impl BalanceState {
    pub fn is_exhausted(self) -> bool {
        self == BalanceState::Exhausted
    }
}

/// Multiply the coefficients `range` of `xrpow` and keep `xrpow_max` current
fn amplify_lines(ws: &mut Workspace, xrpow_max: &mut f32, range: std::ops::Range<usize>, factor: f32) {
    for x in &mut ws.xrpow[range] {
        *x *= factor;
        if *x > *xrpow_max {
            *xrpow_max = *x;
        }
    }
}

/// Raise the scalefactors of the bands selected by the amplification mode
pub fn amp_scalefac_bands(
    ctx: &QuantContext<'_>,
    gi: &mut GranuleInfo,
    distort: &[f32; SFBMAX],
    ws: &mut Workspace,
    refine: bool,
) {
    let ifqstep34 = if gi.scalefac_scale == 0 {
        IFQSTEP34_FINE
    } else {
        IFQSTEP34_COARSE
    };
    let configured = ctx.shaping.noise_shaping_amp;

    let mut trigger = distort[..gi.sfbmax].iter().copied().fold(0.0f32, f32::max);
    let mode = match configured {
        NoiseShapingAmp::TwoPassRefine if refine => NoiseShapingAmp::SingleBand,
        NoiseShapingAmp::TwoPassRefine => NoiseShapingAmp::HalfMax,
        mode => mode,
    };
    match mode {
        NoiseShapingAmp::SingleBand => {}
        NoiseShapingAmp::HalfMax => {
            trigger = if trigger > 1.0 { trigger.sqrt() } else { trigger * 0.95 };
        }
        _ => {
            trigger = if trigger > 1.0 { 1.0 } else { trigger * 0.95 };
        }
    }

    let single_band = configured == NoiseShapingAmp::SingleBand;
    let mut j = 0;
    for sfb in 0..gi.sfbmax {
        let width = gi.width[sfb];
        let start = j;
        j += width;
        if distort[sfb] < trigger {
            continue;
        }

        if ctx.substep.contains(SubstepShaping::PSEUDO_HALF_STEPS) {
            ws.pseudohalf[sfb] = !ws.pseudohalf[sfb];
            if !ws.pseudohalf[sfb] && single_band {
                return;
            }
        }
        gi.scalefac[sfb] += 1;
        amplify_lines(ws, &mut gi.xrpow_max, start..j, ifqstep34);

        if single_band {
            return;
        }
    }
}

/// Switch to coarse scalefactor steps, folding preemphasis into the
/// scalefactors and rounding odd values up
pub fn inc_scalefac_scale(gi: &mut GranuleInfo, ws: &mut Workspace) {
    let mut j = 0;
    for sfb in 0..gi.sfbmax {
        let width = gi.width[sfb];
        let mut s = gi.scalefac[sfb];
        if gi.preflag {
            s += PRETAB[sfb];
        }
        if s & 1 != 0 {
            s += 1;
            amplify_lines(ws, &mut gi.xrpow_max, j..j + width, IFQSTEP34_FINE);
        }
        gi.scalefac[sfb] = s >> 1;
        j += width;
    }
    gi.preflag = false;
    gi.scalefac_scale = 1;
}

/// Raise the subblock gain of every short window whose scalefactors
/// overflow, moving the excess out of the scalefactors.
///
/// Returns false when a window's subblock gain is already at its limit or
/// a long band of a mixed block overflows.
pub fn inc_subblock_gain(ctx: &QuantContext<'_>, gi: &mut GranuleInfo, ws: &mut Workspace) -> bool {
    if gi.scalefac[..gi.sfb_lmax].iter().any(|&sf| sf >= 16) {
        return false;
    }

    for window in 0..3 {
        let mut s1 = 0;
        let mut s2 = 0;
        let mut sfb = gi.sfb_lmax + window;
        while sfb < gi.sfbdivide {
            s1 = s1.max(gi.scalefac[sfb]);
            sfb += 3;
        }
        while sfb < gi.sfbmax {
            s2 = s2.max(gi.scalefac[sfb]);
            sfb += 3;
        }
        if s1 < 16 && s2 < 8 {
            continue;
        }
        if gi.subblock_gain[window] >= 7 {
            return false;
        }

        gi.subblock_gain[window] += 1;
        let mut j = ctx.bands.l[gi.sfb_lmax];
        let mut sfb = gi.sfb_lmax + window;
        while sfb < gi.sfbmax {
            let width = gi.width[sfb];
            let s = gi.scalefac[sfb] - (4 >> gi.scalefac_scale);
            if s >= 0 {
                gi.scalefac[sfb] = s;
                j += width * 3;
            } else {
                gi.scalefac[sfb] = 0;
                let amp = QUANT_TABLES.ipow20(210 + (s << (gi.scalefac_scale + 1)));
                j += width * (window + 1);
                amplify_lines(ws, &mut gi.xrpow_max, j - width..j, amp);
                j += width * (3 - window - 1);
            }
            sfb += 3;
        }

        // the band above the last scalefactor follows the window gain too
        if sfb < SFBMAX {
            let width = gi.width[sfb];
            j += width * (window + 1);
            amplify_lines(ws, &mut gi.xrpow_max, j - width..j, QUANT_TABLES.ipow20(202));
        }
    }
    true
}

/// True when every band has been amplified at least once
pub fn loop_break(gi: &GranuleInfo) -> bool {
    (0..gi.sfbmax).all(|sfb| gi.scalefac[sfb] + gi.subblock_gain[gi.window[sfb]] != 0)
}

/// Amplify the distorted bands and escalate until the scalefactors can be
/// coded again.
///
/// Returns the stage at which the scalefactors fit, or
/// [`BalanceState::Exhausted`] when the loop cannot amplify any further.
pub fn balance_noise(
    ctx: &QuantContext<'_>,
    gi: &mut GranuleInfo,
    distort: &[f32; SFBMAX],
    ws: &mut Workspace,
    refine: bool,
) -> BalanceState {
    amp_scalefac_bands(ctx, gi, distort, ws, refine);
    if loop_break(gi) {
        return BalanceState::Exhausted;
    }
    if scale_bitcount(gi, ctx.granules) {
        return BalanceState::Amplifying;
    }

    let escalated = if ctx.shaping.noise_shaping == NoiseShaping::Extended {
        ws.pseudohalf = [false; SFBMAX];
        if gi.scalefac_scale == 0 {
            inc_scalefac_scale(gi, ws);
            BalanceState::PromotingScaleScale
        } else if gi.block_type.is_short() && ctx.shaping.subblock_gain {
            if inc_subblock_gain(ctx, gi, ws) && !loop_break(gi) {
                BalanceState::RaisingSubblockGain
            } else {
                BalanceState::Exhausted
            }
        } else {
            BalanceState::Exhausted
        }
    } else {
        BalanceState::Exhausted
    };

    if !escalated.is_exhausted() && scale_bitcount(gi, ctx.granules) {
        escalated
    } else {
        BalanceState::Exhausted
    }
}
