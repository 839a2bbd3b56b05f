//! Per granule rate/distortion loop
//!
//! The outer loop starts from the gain search result and repeatedly
//! amplifies distorted bands, requantizes into the bit budget and keeps the
//! best candidate according to the configured comparison strategy.

use crate::amplify::balance_noise;
use crate::ath::{ath_adjust, AthThresholds};
use crate::compare::quant_compare;
use crate::config::{MaskingConfig, NoiseShaping, NoiseShapingAmp};
use crate::noise::{calc_noise, NoiseCache};
use crate::quantize::{count_bits, QuantContext, Workspace};
use crate::search::StepSearch;
use crate::tables::{approx_eq, ScalefacBands, NR_OF_SFB_BLOCK};
use crate::types::{
    BlockType, GranuleInfo, SubstepShaping, GRANULE_SIZE, PSFB12, PSFB21, SBMAX_L, SBMAX_S, SBPSY_L, SBPSY_S, SFBMAX,
};

/// Over count reported when noise shaping is disabled
const UNSHAPED_OVER_COUNT: i32 = 100;

/// Reset the coding state of `gi` and lay out its scalefactor bands.
///
/// Short block spectra are reordered from the interleaved line/window order
/// into band/window/line order.
pub fn init_band_layout(gi: &mut GranuleInfo, bands: &ScalefacBands, granules: usize, sfb21_extra: bool) {
    *gi = GranuleInfo::with_spectrum(gi.xr, gi.block_type, gi.mixed_block_flag);

    gi.psy_lmax = if sfb21_extra { SBMAX_L } else { SBPSY_L };
    gi.psymax = gi.psy_lmax;
    for sfb in 0..SBMAX_L {
        gi.width[sfb] = bands.l[sfb + 1] - bands.l[sfb];
        gi.window[sfb] = 3;
    }

    if gi.block_type == BlockType::Short {
        gi.sfb_smin = 0;
        gi.sfb_lmax = 0;
        if gi.mixed_block_flag {
            gi.sfb_smin = 3;
            gi.sfb_lmax = granules * 2 + 4;
        }
        let short_bands = if sfb21_extra { SBMAX_S } else { SBPSY_S };
        gi.psymax = gi.sfb_lmax + 3 * (short_bands - gi.sfb_smin);
        gi.sfbmax = gi.sfb_lmax + 3 * (SBPSY_S - gi.sfb_smin);
        gi.sfbdivide = gi.sfbmax - 18;
        gi.psy_lmax = gi.sfb_lmax;

        let work = gi.xr;
        let mut ix = bands.l[gi.sfb_lmax];
        for sfb in gi.sfb_smin..SBMAX_S {
            let (start, end) = (bands.s[sfb], bands.s[sfb + 1]);
            for window in 0..3 {
                for l in start..end {
                    gi.xr[ix] = work[3 * l + window];
                    ix += 1;
                }
            }
        }

        let mut j = gi.sfb_lmax;
        for sfb in gi.sfb_smin..SBMAX_S {
            let width = bands.s[sfb + 1] - bands.s[sfb];
            for window in 0..3 {
                gi.width[j + window] = width;
                gi.window[j + window] = window;
            }
            j += 3;
        }
    }

    gi.sfb_partition_table = NR_OF_SFB_BLOCK[0][0];
}

/// Prepare a granule for the outer loop: fresh coding state, band layout
/// and inaudible high frequency lines removed
pub fn init_outer_loop(
    gi: &mut GranuleInfo,
    bands: &ScalefacBands,
    granules: usize,
    sfb21_extra: bool,
    ath: &AthThresholds,
    masking: &MaskingConfig,
) {
    init_band_layout(gi, bands, granules, sfb21_extra);
    psfb21_analogsilence(gi, bands, ath, masking);
}

/// Zero the trailing lines above the last scalefactor band that stay below
/// the ATH, scanning down from the top until a line is audible
pub fn psfb21_analogsilence(gi: &mut GranuleInfo, bands: &ScalefacBands, ath: &AthThresholds, masking: &MaskingConfig) {
    let silence = |xr: &mut [f32], threshold: f32| -> bool {
        for x in xr.iter_mut().rev() {
            if x.abs() < threshold {
                *x = 0.0;
            } else {
                return true;
            }
        }
        false
    };

    if gi.block_type != BlockType::Short {
        for gsfb in (0..PSFB21).rev() {
            let mut ath21 = ath_adjust(ath.adjust, ath.psfb21[gsfb], ath.floor);
            if masking.long_factor[SBPSY_L] > 1e-12 {
                ath21 *= masking.long_factor[SBPSY_L];
            }
            let (start, end) = (bands.psfb21[gsfb], bands.psfb21[gsfb + 1]);
            if silence(&mut gi.xr[start..end], ath21) {
                break;
            }
        }
    } else {
        let sfb12_width = bands.s[SBMAX_S] - bands.s[SBPSY_S];
        for block in 0..3 {
            for gsfb in (0..PSFB12).rev() {
                let start = bands.s[SBPSY_S] * 3
                    + sfb12_width * block
                    + (bands.psfb12[gsfb] - bands.psfb12[0]);
                let end = start + (bands.psfb12[gsfb + 1] - bands.psfb12[gsfb]);
                let mut ath12 = ath_adjust(ath.adjust, ath.psfb12[gsfb], ath.floor);
                if masking.short_factor[SBPSY_S] > 1e-12 {
                    ath12 *= masking.short_factor[SBPSY_S];
                }
                if silence(&mut gi.xr[start..end], ath12) {
                    break;
                }
            }
        }
    }
}

/// Compute |xr|^(3/4) up to `max_nonzero_coeff`.
///
/// Returns false and clears the quantized values when there is nothing to
/// quantize.
pub fn init_xrpow(substep: SubstepShaping, gi: &mut GranuleInfo, ws: &mut Workspace) -> bool {
    let upper = gi.max_nonzero_coeff.min(GRANULE_SIZE - 1);
    gi.xrpow_max = 0.0;
    ws.xrpow[upper..].fill(0.0);

    let mut sum = 0.0f32;
    for (pow, &x) in ws.xrpow[..=upper].iter_mut().zip(gi.xr.iter()) {
        let tmp = x.abs();
        sum += tmp;
        *pow = (tmp * tmp.sqrt()).sqrt();
        if *pow > gi.xrpow_max {
            gi.xrpow_max = *pow;
        }
    }

    if sum > 1e-20 {
        let pseudohalf = substep.contains(SubstepShaping::PSEUDO_HALF_STEPS);
        ws.pseudohalf[..gi.psymax].fill(pseudohalf);
        true
    } else {
        gi.l3_enc = [0; GRANULE_SIZE];
        false
    }
}

/// Walk the global gain up until the Huffman bits fit `limit`.
///
/// Returns false when the gain passes `max_gain` first.
fn raise_gain_to_fit(ctx: &QuantContext<'_>, gi: &mut GranuleInfo, ws: &Workspace, limit: i32, max_gain: i32) -> bool {
    loop {
        gi.part2_3_length = count_bits(ctx, gi, ws);
        if gi.part2_3_length <= limit || gi.global_gain > max_gain {
            break;
        }
        gi.global_gain += 1;
    }
    gi.global_gain <= max_gain
}

/// Search the best quantization of `gi` within `targ_bits`.
///
/// On return `gi` holds the best candidate. Returns the number of bands
/// above the allowed noise of that candidate.
pub fn outer_loop(
    ctx: &QuantContext<'_>,
    gi: &mut GranuleInfo,
    xmin: &[f32; SFBMAX],
    ws: &mut Workspace,
    search: &mut StepSearch,
    targ_bits: i32,
) -> i32 {
    search.bin_search_step_size(ctx, gi, ws, targ_bits);

    if ctx.shaping.noise_shaping == NoiseShaping::Disabled {
        return UNSHAPED_OVER_COUNT;
    }

    let mut cache = NoiseCache::default();
    let mut distort = [0.0f32; SFBMAX];
    let mut best_noise = calc_noise(gi, xmin, &mut distort, Some(&mut cache));
    best_noise.bits = gi.part2_3_length;

    let mut work = gi.clone();
    let mut age = 0;
    let mut save_xrpow = ws.xrpow;
    let mut best_part2_3_length = 9_999_999;
    let mut refine = false;
    let mut best_ggain_pass1 = 0;

    let two_pass = ctx.shaping.noise_shaping_amp == NoiseShapingAmp::TwoPassRefine;
    let strategy = if gi.block_type.is_short() {
        ctx.shaping.quant_comp_short
    } else {
        ctx.shaping.quant_comp
    };
    let search_limit = if ctx.substep.contains(SubstepShaping::PSEUDO_HALF_STEPS) {
        20
    } else {
        3
    };

    loop {
        loop {
            if ctx.sfb21_extra {
                if distort[work.sfbmax] > 1.0 {
                    break;
                }
                if work.block_type.is_short()
                    && (distort[work.sfbmax + 1] > 1.0 || distort[work.sfbmax + 2] > 1.0)
                {
                    break;
                }
            }

            if balance_noise(ctx, &mut work, &distort, ws, refine).is_exhausted() {
                break;
            }
            let max_gain = if work.scalefac_scale != 0 { 254 } else { 255 };

            let huff_bits = targ_bits - work.part2_length;
            if huff_bits <= 0 {
                log::warn!("scalefactors take {} of {} target bits", work.part2_length, targ_bits);
                break;
            }
            if !raise_gain_to_fit(ctx, &mut work, ws, huff_bits, max_gain) {
                break;
            }
            if best_noise.over_count == 0 && !raise_gain_to_fit(ctx, &mut work, ws, best_part2_3_length, max_gain) {
                break;
            }

            let mut noise = calc_noise(&work, xmin, &mut distort, Some(&mut cache));
            noise.bits = work.part2_3_length;

            let better = quant_compare(strategy, &best_noise, &mut noise, &work, &distort);
            log::trace!(
                "outer loop: gain {} part2 {} bits {} over {}{}",
                work.global_gain,
                work.part2_length,
                work.part2_3_length,
                noise.over_count,
                if better { " (best)" } else { "" }
            );
            if better {
                best_part2_3_length = gi.part2_3_length;
                best_noise = noise;
                gi.clone_from(&work);
                age = 0;
                save_xrpow = ws.xrpow;
            } else if !ctx.shaping.full_outer_loop {
                age += 1;
                if age > search_limit && best_noise.over_count == 0 {
                    break;
                }
                if two_pass && refine && (age > 30 || work.global_gain - best_ggain_pass1 > 15) {
                    break;
                }
            }

            if work.global_gain + work.scalefac_scale >= 255 {
                break;
            }
        }

        if two_pass && !refine {
            work.clone_from(gi);
            ws.xrpow = save_xrpow;
            age = 0;
            best_ggain_pass1 = work.global_gain;
            refine = true;
        } else {
            break;
        }
    }

    if ctx.vbr {
        ws.xrpow = save_xrpow;
    } else if ctx.substep.contains(SubstepShaping::TRUNCATE_SMALL_SPECTRUMS) {
        truncate_small_spectrums(ctx, gi, xmin);
    }
    best_noise.over_count
}

/// Zero the smallest quantized coefficients of undistorted bands as long as
/// their removal keeps the band below its allowed noise, then recount
pub fn truncate_small_spectrums(ctx: &QuantContext<'_>, gi: &mut GranuleInfo, xmin: &[f32; SFBMAX]) {
    if (!ctx.substep.contains(SubstepShaping::SHORT_BLOCK_TRUNCATION) && gi.block_type.is_short())
        || ctx.substep.contains(SubstepShaping::RESERVOIR_PRESSURE)
    {
        return;
    }

    let mut distort = [0.0f32; SFBMAX];
    calc_noise(gi, xmin, &mut distort, None);

    let mut work = [0.0f32; GRANULE_SIZE];
    for ((w, &x), &ix) in work.iter_mut().zip(gi.xr.iter()).zip(gi.l3_enc.iter()) {
        *w = if ix != 0 { x.abs() } else { 0.0 };
    }

    let first = if gi.block_type.is_short() { 6 } else { 8 };
    let mut j: usize = gi.width[..first].iter().sum();
    for sfb in first..gi.psymax {
        let width = gi.width[sfb];
        let band = j..j + width;
        j += width;
        if distort[sfb] >= 1.0 {
            continue;
        }

        let sorted = &mut work[band.clone()];
        sorted.sort_by(|a, b| a.total_cmp(b));
        if approx_eq(sorted[width - 1], 0.0) {
            continue;
        }

        let mut allowed = (1.0 - distort[sfb]) * xmin[sfb];
        let mut threshold = 0.0f32;
        let mut start = 0;
        while start < width {
            let mut nsame = 1;
            while start + nsame < width && approx_eq(sorted[start], sorted[start + nsame]) {
                nsame += 1;
            }
            let noise = sorted[start] * sorted[start] * nsame as f32;
            if allowed < noise {
                if start != 0 {
                    threshold = sorted[start - 1];
                }
                break;
            }
            allowed -= noise;
            start += nsame;
        }
        if approx_eq(threshold, 0.0) {
            continue;
        }

        for k in band {
            if gi.xr[k].abs() <= threshold {
                gi.l3_enc[k] = 0;
            }
        }
    }

    gi.part2_3_length = ctx.counter.count_bits(gi);
}
