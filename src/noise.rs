//! Quantization noise measurement against the allowed distortion
//!
//! [`calc_xmin`] turns psychoacoustic energies and the ATH into the allowed
//! noise per band, [`calc_noise`] measures what a quantization actually
//! produces. Both walk the interleaved band layout of [`GranuleInfo`].

use crate::ath::{ath_adjust, AthThresholds};
use crate::config::{QuantConfig, RateMode};
use crate::tables::{approx_eq, PRETAB, QUANT_TABLES};
use crate::types::{BlockType, GranuleInfo, PsyRatio, GRANULE_SIZE, IXMAX_VAL, SBPSY_L, SBPSY_S, SFBMAX};

/// Aggregated noise of a quantization, in dB relative to the allowed noise
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "diagnostics", derive(serde::Serialize, serde::Deserialize))]
pub struct NoiseResult {
    /// Bands with noise above the allowed distortion
    pub over_count: i32,
    /// Sum of the dB excess over all distorted bands
    pub over_noise: f32,
    /// Sum of the dB noise over all bands
    pub tot_noise: f32,
    /// Worst band
    pub max_noise: f32,
    /// Sum of squared, rounded excess in 0.1 dB steps
    pub over_ssd: i32,
    /// Huffman bits of the measured quantization
    pub bits: i32,
}

impl Default for NoiseResult {
    fn default() -> Self {
        Self {
            over_count: 0,
            over_noise: 0.0,
            tot_noise: 0.0,
            max_noise: -20.0,
            over_ssd: 0,
            bits: 0,
        }
    }
}

/// Per band measurements reusable while a band's step does not change
#[derive(Debug, Clone)]
pub struct NoiseCache {
    step: [Option<i32>; SFBMAX],
    noise: [f32; SFBMAX],
    noise_log: [f32; SFBMAX],
}

impl Default for NoiseCache {
    fn default() -> Self {
        Self {
            step: [None; SFBMAX],
            noise: [0.0; SFBMAX],
            noise_log: [0.0; SFBMAX],
        }
    }
}

impl NoiseCache {
    pub fn reset(&mut self) {
        self.step = [None; SFBMAX];
    }
}

/// Measure the noise of the current quantization of `gi`.
///
/// Fills `distort` with noise/allowed per band. A band whose step exponent
/// matches the cache entry reuses the cached measurement.
pub fn calc_noise(
    gi: &GranuleInfo,
    xmin: &[f32; SFBMAX],
    distort: &mut [f32; SFBMAX],
    mut cache: Option<&mut NoiseCache>,
) -> NoiseResult {
    let mut result = NoiseResult::default();
    let mut j = 0usize;

    for sfb in 0..gi.psymax {
        let pre = if gi.preflag { PRETAB[sfb] } else { 0 };
        let s = gi.global_gain
            - ((gi.scalefac[sfb] + pre) << (gi.scalefac_scale + 1))
            - gi.subblock_gain[gi.window[sfb]] * 8;

        let noise_log = match cache.as_deref_mut() {
            Some(cache) if cache.step[sfb] == Some(s) => {
                j += gi.width[sfb];
                distort[sfb] = cache.noise[sfb] / xmin[sfb];
                cache.noise_log[sfb]
            }
            cache => {
                let step = QUANT_TABLES.pow20(s);
                let width = gi.width[sfb];
                let mut pairs = width >> 1;
                if j + width > gi.max_nonzero_coeff {
                    let useful = gi.max_nonzero_coeff as isize - j as isize + 1;
                    pairs = if useful > 0 { (useful as usize) >> 1 } else { 0 };
                }
                let noise = noise_core(gi, &mut j, pairs, step);
                distort[sfb] = noise / xmin[sfb];
                let noise_log = distort[sfb].max(1e-20).log10();
                if let Some(cache) = cache {
                    cache.step[sfb] = Some(s);
                    cache.noise[sfb] = noise;
                    cache.noise_log[sfb] = noise_log;
                }
                noise_log
            }
        };

        result.tot_noise += noise_log;
        if noise_log > 0.0 {
            let tmp = ((noise_log * 10.0 + 0.5) as i32).max(1);
            result.over_ssd += tmp * tmp;
            result.over_count += 1;
            result.over_noise += noise_log;
        }
        result.max_noise = result.max_noise.max(noise_log);
    }
    result
}

/// Squared error of `pairs` coefficient pairs starting at `j`
fn noise_core(gi: &GranuleInfo, j: &mut usize, pairs: usize, step: f32) -> f32 {
    let xr = &gi.xr;
    let ix = &gi.l3_enc;
    let mut sum = 0.0f32;

    let end = (*j + 2 * pairs).min(GRANULE_SIZE);
    if *j > gi.count1 {
        for &x in &xr[*j..end] {
            sum += x * x;
        }
    } else if *j > gi.big_values {
        for k in *j..end {
            let quantized = if ix[k] != 0 { step } else { 0.0 };
            let err = xr[k].abs() - quantized;
            sum += err * err;
        }
    } else {
        let pow43 = &QUANT_TABLES.pow43;
        for k in *j..end {
            let index = ix[k].clamp(0, IXMAX_VAL) as usize;
            let err = xr[k].abs() - pow43[index] * step;
            sum += err * err;
        }
    }
    *j = end;
    sum
}

/// Klemm's noise level: a smooth sum over all bands that rewards bands far
/// below the allowed noise less than it penalises distorted ones
pub fn klemm_noise(distort: &[f32; SFBMAX], gi: &GranuleInfo) -> f32 {
    let mut klemm = 1e-37f64;
    for &d in &distort[..gi.psymax] {
        let d = d as f64;
        klemm += (0.368 + 0.632 * d * d * d).log10();
    }
    klemm.max(1e-20) as f32
}

/// Compute the allowed distortion per band into `xmin`.
///
/// Also bounds the nonzero spectrum of long, start and stop blocks in
/// `gi.max_nonzero_coeff` (one past the last nonzero line). Returns the
/// number of bands whose energy exceeds the ATH; zero means analog silence.
pub fn calc_xmin(
    config: &QuantConfig,
    ath: &AthThresholds,
    ratio: &PsyRatio,
    gi: &mut GranuleInfo,
    masking_lower: f32,
    xmin: &mut [f32; SFBMAX],
) -> usize {
    let masking = &config.masking;
    let vbr_ath = config.is_vbr();
    let mtrh = config.stream.mode == RateMode::VbrMtrh;
    let xr = &gi.xr;

    let mut ath_over = 0;
    let mut j = 0usize;
    let mut out = 0usize;

    let band_energy = |j: &mut usize, width: usize, rh1: f32| -> (f32, f32) {
        let mut en0 = 0.0f32;
        let mut rh2 = f64::EPSILON as f32;
        for &x in &xr[*j..*j + width] {
            let xa = x * x;
            en0 += xa;
            rh2 += xa.min(rh1);
        }
        *j += width;
        (en0, rh2)
    };

    let mut gsfb = 0;
    while gsfb < gi.psy_lmax {
        let mut band_xmin = if vbr_ath {
            ath_adjust(ath.adjust, ath.l[gsfb], ath.floor)
        } else {
            ath.adjust * ath.l[gsfb]
        };
        let width = gi.width[gsfb];
        let (en0, mut rh2) = band_energy(&mut j, width, band_xmin / width as f32);
        if en0 > band_xmin {
            ath_over += 1;
        }

        let long_factor = masking.long_factor[gsfb];
        if gsfb == SBPSY_L {
            rh2 = rh2.max(band_xmin * long_factor);
        }
        if mtrh {
            band_xmin = rh2;
        }
        let e = ratio.en_l[gsfb];
        if !masking.ath_only && e > 0.0 {
            let mut x = en0 * ratio.thm_l[gsfb] * masking_lower / e;
            if mtrh {
                x *= long_factor;
            }
            band_xmin = band_xmin.max(x);
        }
        xmin[out] = if mtrh { band_xmin } else { band_xmin * long_factor };
        out += 1;
        gsfb += 1;
    }

    let mut max_nonzero = GRANULE_SIZE - 1;
    if gi.block_type != BlockType::Short {
        let mut k = GRANULE_SIZE;
        while k > 0 && approx_eq(xr[k - 1], 0.0) {
            k -= 1;
            max_nonzero = k;
        }
    }

    let mut sfb = gi.sfb_smin;
    while gsfb < gi.psymax {
        let tmp_ath = if vbr_ath {
            ath_adjust(ath.adjust, ath.s[sfb], ath.floor)
        } else {
            ath.adjust * ath.s[sfb]
        };
        let short_factor = masking.short_factor[sfb];
        let width = gi.width[gsfb];

        for b in 0..3 {
            let (en0, mut rh2) = band_energy(&mut j, width, tmp_ath / width as f32);
            if en0 > tmp_ath {
                ath_over += 1;
            }
            if sfb == SBPSY_S {
                rh2 = rh2.max(tmp_ath * short_factor);
            }
            let mut band_xmin = if mtrh { rh2 } else { tmp_ath };
            let e = ratio.en_s[sfb][b];
            if !masking.ath_only && !masking.ath_short && e > 0.0 {
                let mut x = en0 * ratio.thm_s[sfb][b] * masking_lower / e;
                if mtrh {
                    x *= short_factor;
                }
                band_xmin = band_xmin.max(x);
            }
            xmin[out] = if mtrh { band_xmin } else { band_xmin * short_factor };
            out += 1;
        }

        if masking.use_temporal_masking {
            let decay = config.temporal_decay();
            let w = &mut xmin[out - 3..out];
            if w[0] > w[1] {
                w[1] += (w[0] - w[1]) * decay;
            }
            if w[1] > w[2] {
                w[2] += (w[1] - w[2]) * decay;
            }
        }
        sfb += 1;
        gsfb += 3;
    }

    gi.max_nonzero_coeff = max_nonzero;
    ath_over
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::ScalefacBands;

    /// Long block granule with 44.1 kHz band widths
    fn long_granule() -> GranuleInfo {
        let bands = ScalefacBands::for_sample_rate(44100).unwrap();
        let mut gi = GranuleInfo::default();
        for sfb in 0..SFBMAX.min(22) {
            gi.width[sfb] = bands.l[sfb + 1] - bands.l[sfb];
        }
        gi
    }

    #[test]
    fn test_silent_quantization_of_silence_is_noiseless() {
        let gi = long_granule();
        let xmin = [1.0; SFBMAX];
        let mut distort = [0.0; SFBMAX];
        let result = calc_noise(&gi, &xmin, &mut distort, None);

        assert_eq!(result.over_count, 0);
        assert_eq!(result.over_ssd, 0);
        assert_eq!(result.max_noise, -20.0);
        assert!((result.tot_noise - (-20.0 * gi.psymax as f32)).abs() < 1e-3);
    }

    #[test]
    fn test_zeroed_band_reports_distortion() {
        let mut gi = long_granule();
        for x in gi.xr[..4].iter_mut() {
            *x = 10.0;
        }
        gi.max_nonzero_coeff = 3;
        gi.count1 = 0;
        gi.big_values = 0;
        let xmin = [1.0; SFBMAX];
        let mut distort = [0.0; SFBMAX];
        let result = calc_noise(&gi, &xmin, &mut distort, None);

        // nothing was quantized, so band 0 carries 4 * 100 of noise
        assert!((distort[0] - 400.0).abs() < 1e-3);
        assert_eq!(result.over_count, 1);
        let expected_log = 400f32.log10();
        assert!((result.over_noise - expected_log).abs() < 1e-4);
        assert!((result.max_noise - expected_log).abs() < 1e-4);
        let tmp = (expected_log * 10.0 + 0.5) as i32;
        assert_eq!(result.over_ssd, tmp * tmp);
    }

    #[test]
    fn test_single_distorted_band_totals() {
        let mut gi = GranuleInfo {
            psymax: 1,
            sfbmax: 1,
            max_nonzero_coeff: 1,
            ..GranuleInfo::default()
        };
        gi.width[0] = 2;
        gi.xr[0] = 1.0;
        gi.xr[1] = -1.0;
        let xmin = [1.0; SFBMAX];
        let mut distort = [0.0; SFBMAX];
        let result = calc_noise(&gi, &xmin, &mut distort, None);

        assert!((distort[0] - 2.0).abs() < 1e-6);
        assert_eq!(result.over_count, 1);
        assert!((result.over_noise - 0.30103).abs() < 1e-4);
        assert!((result.max_noise - 0.30103).abs() < 1e-4);
        assert!((result.tot_noise - 0.30103).abs() < 1e-4);
        // 10 * log10(2) + 0.5 truncates to 3
        assert_eq!(result.over_ssd, 9);
    }

    #[test]
    fn test_cache_hits_reproduce_measurement() {
        let mut gi = long_granule();
        for (i, x) in gi.xr.iter_mut().enumerate().take(300) {
            *x = ((i % 7) as f32 - 3.0) * 0.01;
        }
        gi.max_nonzero_coeff = 299;
        gi.count1 = 300;
        gi.big_values = 0;
        let xmin = [1e-4; SFBMAX];
        let mut cache = NoiseCache::default();
        let mut first = [0.0; SFBMAX];
        let mut second = [0.0; SFBMAX];

        let cold = calc_noise(&gi, &xmin, &mut first, Some(&mut cache));
        let warm = calc_noise(&gi, &xmin, &mut second, Some(&mut cache));
        assert_eq!(cold, warm);
        assert_eq!(first, second);

        cache.reset();
        gi.global_gain += 4;
        let shifted = calc_noise(&gi, &xmin, &mut second, Some(&mut cache));
        assert!(shifted.tot_noise >= cold.tot_noise - 1e-3);
    }

    #[test]
    fn test_klemm_noise_floor() {
        let gi = long_granule();
        let distort = [0.0; SFBMAX];
        // log10(0.368) per band is negative, so the sum clamps
        assert!(klemm_noise(&distort, &gi) <= 1e-19);

        let loud = [10.0; SFBMAX];
        assert!(klemm_noise(&loud, &gi) > 1.0);
    }

    #[test]
    fn test_calc_xmin_analog_silence_and_max_nonzero() {
        let config = QuantConfig::new();
        let bands = ScalefacBands::for_sample_rate(44100).unwrap();
        let ath = AthThresholds::compute(&config, &bands);
        let mut gi = long_granule();
        let ratio = PsyRatio::default();
        let mut xmin = [0.0; SFBMAX];

        assert_eq!(calc_xmin(&config, &ath, &ratio, &mut gi, 1.0, &mut xmin), 0);
        assert_eq!(gi.max_nonzero_coeff, 0);
        for sfb in 0..gi.psy_lmax {
            assert!((xmin[sfb] - ath.l[sfb]).abs() <= ath.l[sfb] * 1e-6);
        }

        gi.xr[100] = 1.0;
        assert!(calc_xmin(&config, &ath, &ratio, &mut gi, 1.0, &mut xmin) >= 1);
        // one past the last nonzero line
        assert_eq!(gi.max_nonzero_coeff, 101);
    }

    #[test]
    fn test_calc_xmin_masking_raises_threshold() {
        let config = QuantConfig::new();
        let bands = ScalefacBands::for_sample_rate(44100).unwrap();
        let ath = AthThresholds::compute(&config, &bands);
        let mut gi = long_granule();
        for x in gi.xr[..4].iter_mut() {
            *x = 1.0;
        }
        let mut ratio = PsyRatio::default();
        ratio.en_l[0] = 4.0;
        ratio.thm_l[0] = 0.5;
        let mut xmin = [0.0; SFBMAX];
        calc_xmin(&config, &ath, &ratio, &mut gi, 1.0, &mut xmin);

        // en0 * thm / en = 4 * 0.5 / 4
        assert!((xmin[0] - 0.5).abs() < 1e-6);
    }
}
