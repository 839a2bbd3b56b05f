//! Absolute threshold of hearing per scalefactor band

use crate::config::QuantConfig;
use crate::tables::ScalefacBands;
use crate::types::{PSFB12, PSFB21, SBMAX_L, SBMAX_S};

/// Offset between the ATH formula's dB scale and MDCT energies
const ATH_MDCT_SCALE: f32 = 100.0;

/// ATH energies in MDCT units
#[derive(Debug, Clone, PartialEq)]
pub struct AthThresholds {
    pub l: [f32; SBMAX_L],
    pub s: [f32; SBMAX_S],
    pub psfb21: [f32; PSFB21],
    pub psfb12: [f32; PSFB12],
    /// ATH minimum in dB
    pub floor: f32,
    /// Linear scale applied to every threshold
    pub adjust: f32,
}

impl AthThresholds {
    /// Thresholds for the sample rate and ATH shape of `config`
    pub fn compute(config: &QuantConfig, bands: &ScalefacBands) -> Self {
        let ath = &config.ath;
        let sample_rate = config.stream.sample_rate as f32;
        let mdct = |freq: f32| ath_mdct(freq, ath.curve, ath.lower_db);

        let band_min = |start: usize, end: usize, line_hz: f32| {
            (start..end)
                .map(|i| mdct(i as f32 * line_hz))
                .fold(f32::MAX, f32::min)
        };
        let long_hz = sample_rate / (2.0 * 576.0);
        let short_hz = sample_rate / (2.0 * 192.0);

        let mut thresholds = Self {
            l: std::array::from_fn(|sfb| band_min(bands.l[sfb], bands.l[sfb + 1], long_hz)),
            s: std::array::from_fn(|sfb| {
                let (start, end) = (bands.s[sfb], bands.s[sfb + 1]);
                band_min(start, end, short_hz) * (end - start) as f32
            }),
            psfb21: std::array::from_fn(|i| band_min(bands.psfb21[i], bands.psfb21[i + 1], long_hz)),
            psfb12: std::array::from_fn(|i| {
                let (start, end) = (bands.psfb12[i], bands.psfb12[i + 1]);
                band_min(start, end, short_hz) * (end - start) as f32
            }),
            floor: 10.0 * mdct(-1.0).log10(),
            adjust: ath.adjust,
        };

        if ath.disabled {
            thresholds.l = [1e-20; SBMAX_L];
            thresholds.s = [1e-20; SBMAX_S];
            thresholds.psfb21 = [1e-20; PSFB21];
            thresholds.psfb12 = [1e-20; PSFB12];
        }
        thresholds
    }
}

/// Threshold in quiet in dB SPL at `freq_hz`; negative frequencies select
/// the region of highest sensitivity
pub fn ath_formula(freq_hz: f32, curve: f32) -> f32 {
    let freq_hz = if freq_hz < -0.3 { 3410.0 } else { freq_hz };
    let f = (freq_hz as f64 / 1000.0).max(0.1);
    let curve = curve as f64;

    let ath = 3.640 * f.powf(-0.8) - 6.800 * (-0.6 * (f - 3.4).powi(2)).exp()
        + 6.000 * (-0.15 * (f - 8.7).powi(2)).exp()
        + (0.6 + 0.04 * curve) * 0.001 * f.powi(4);
    ath as f32
}

fn ath_mdct(freq_hz: f32, curve: f32, lower_db: f32) -> f32 {
    let ath = ath_formula(freq_hz, curve) - ATH_MDCT_SCALE - lower_db;
    10f32.powf(ath / 10.0)
}

/// Scale a threshold `x` by the loudness adjustment `a` on a dB scale
/// anchored at the ATH floor
pub fn ath_adjust(a: f32, x: f32, floor: f32) -> f32 {
    const O: f32 = 90.308_74;
    const P: f32 = 94.824_45;

    let mut u = 10.0 * x.log10() - floor;
    let v = a * a;
    let mut w = 0.0;
    if v > 1e-20 {
        w = 1.0 + v.log10() * 10.0 / O;
    }
    if w < 0.0 {
        w = 0.0;
    }
    u *= w;
    u += floor + O - P;
    10f32.powf(0.1 * u)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ath_formula_shape() {
        // most sensitive around 3-4 kHz, rising toward both ends
        let low = ath_formula(100.0, 4.0);
        let mid = ath_formula(3400.0, 4.0);
        let high = ath_formula(16000.0, 4.0);
        assert!(mid < 0.0);
        assert!(low > mid && high > mid);
        assert_eq!(ath_formula(-1.0, 4.0), ath_formula(3410.0, 4.0));
    }

    #[test]
    fn test_ath_adjust_unit_gain_is_fixed_offset() {
        let floor = -105.0;
        let x = 1e-8;
        let adjusted = ath_adjust(1.0, x, floor);
        let expected = x * 10f32.powf(-0.451_571);
        assert!((adjusted / expected - 1.0).abs() < 1e-3);
        // a silenced adjustment collapses onto the floor
        let collapsed = ath_adjust(0.0, x, floor);
        assert!((10.0 * collapsed.log10() - (floor - 4.515_71)).abs() < 1e-2);
    }

    #[test]
    fn test_thresholds_follow_band_tables() {
        let config = QuantConfig::new();
        let bands = ScalefacBands::for_sample_rate(44100).unwrap();
        let ath = AthThresholds::compute(&config, &bands);

        assert!(ath.l.iter().all(|&v| v > 0.0 && v.is_finite()));
        assert!(ath.s.iter().all(|&v| v > 0.0 && v.is_finite()));
        assert!(ath.l[0] > ath.l[10], "low band ATH above mid band ATH");
        assert!(ath.floor < 0.0);

        let mut disabled = QuantConfig::new();
        disabled.ath.disabled = true;
        let silent = AthThresholds::compute(&disabled, &bands);
        assert!(silent.l.iter().all(|&v| v == 1e-20));
        assert_eq!(silent.floor, ath.floor);
    }
}
