//! Lookup tables and constants for the Layer III rate loop
//!
//! Scalefactor band boundaries per sample rate, scalefactor coding tables,
//! bitrate tables and the quantizer power tables.

use lazy_static::lazy_static;

use crate::config::MpegVersion;
use crate::types::{IXMAX_VAL, PSFB12, PSFB21, SBMAX_L, SBMAX_S, SFBMAX};

/// Sample rates in table order: MPEG-1, MPEG-2, MPEG-2.5
pub const SAMPLE_RATES: [u32; 9] = [44100, 48000, 32000, 22050, 24000, 16000, 11025, 12000, 8000];

/// Bitrates in kbps by bitrate index for MPEG-1
pub const BITRATES_MPEG1: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
/// Bitrates in kbps by bitrate index for MPEG-2
pub const BITRATES_MPEG2: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];
/// Bitrates in kbps by bitrate index for MPEG-2.5
pub const BITRATES_MPEG25: [u32; 9] = [0, 8, 16, 24, 32, 40, 48, 56, 64];

/// Long block band boundaries per sample rate (same order as `SAMPLE_RATES`)
const SFB_LONG: [[usize; SBMAX_L + 1]; 9] = [
    [0, 4, 8, 12, 16, 20, 24, 30, 36, 44, 52, 62, 74, 90, 110, 134, 162, 196, 238, 288, 342, 418, 576],
    [0, 4, 8, 12, 16, 20, 24, 30, 36, 42, 50, 60, 72, 88, 106, 128, 156, 190, 230, 276, 330, 384, 576],
    [0, 4, 8, 12, 16, 20, 24, 30, 36, 44, 54, 66, 82, 102, 126, 156, 194, 240, 296, 364, 448, 550, 576],
    [0, 6, 12, 18, 24, 30, 36, 44, 54, 66, 80, 96, 116, 140, 168, 200, 238, 284, 336, 396, 464, 522, 576],
    [0, 6, 12, 18, 24, 30, 36, 44, 54, 66, 80, 96, 114, 136, 162, 194, 232, 278, 330, 394, 464, 540, 576],
    [0, 6, 12, 18, 24, 30, 36, 44, 54, 66, 80, 96, 116, 140, 168, 200, 238, 284, 336, 396, 464, 522, 576],
    [0, 6, 12, 18, 24, 30, 36, 44, 54, 66, 80, 96, 116, 140, 168, 200, 238, 284, 336, 396, 464, 522, 576],
    [0, 6, 12, 18, 24, 30, 36, 44, 54, 66, 80, 96, 116, 140, 168, 200, 238, 284, 336, 396, 464, 522, 576],
    [0, 12, 24, 36, 48, 60, 72, 88, 108, 132, 160, 192, 232, 280, 336, 400, 476, 566, 568, 570, 572, 574, 576],
];

/// Short block band boundaries per sample rate (lines of one window)
const SFB_SHORT: [[usize; SBMAX_S + 1]; 9] = [
    [0, 4, 8, 12, 16, 22, 30, 40, 52, 66, 84, 106, 136, 192],
    [0, 4, 8, 12, 16, 22, 28, 38, 50, 64, 80, 100, 126, 192],
    [0, 4, 8, 12, 16, 22, 30, 42, 58, 78, 104, 138, 180, 192],
    [0, 4, 8, 12, 18, 24, 32, 42, 56, 74, 100, 132, 174, 192],
    [0, 4, 8, 12, 18, 26, 36, 48, 62, 80, 104, 136, 180, 192],
    [0, 4, 8, 12, 18, 26, 36, 48, 62, 80, 104, 134, 174, 192],
    [0, 4, 8, 12, 18, 26, 36, 48, 62, 80, 104, 134, 174, 192],
    [0, 4, 8, 12, 18, 26, 36, 48, 62, 80, 104, 134, 174, 192],
    [0, 8, 16, 24, 36, 52, 72, 96, 124, 160, 162, 164, 166, 192],
];

/// Scalefactor band boundaries of one sample rate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalefacBands {
    pub l: [usize; SBMAX_L + 1],
    pub s: [usize; SBMAX_S + 1],
    /// Equal partitions of the long band above the last scalefactor band
    pub psfb21: [usize; PSFB21 + 1],
    /// Equal partitions of the short band above the last scalefactor band
    pub psfb12: [usize; PSFB12 + 1],
}

impl ScalefacBands {
    /// Band boundaries for a supported sample rate
    pub fn for_sample_rate(sample_rate: u32) -> Option<Self> {
        let index = sample_rate_index(sample_rate)?;
        let l = SFB_LONG[index];
        let s = SFB_SHORT[index];

        let mut psfb21 = [0; PSFB21 + 1];
        let size21 = (l[SBMAX_L] - l[SBMAX_L - 1]) / PSFB21;
        for (i, start) in psfb21.iter_mut().enumerate() {
            *start = l[SBMAX_L - 1] + i * size21;
        }
        psfb21[PSFB21] = 576;

        let mut psfb12 = [0; PSFB12 + 1];
        let size12 = (s[SBMAX_S] - s[SBMAX_S - 1]) / PSFB12;
        for (i, start) in psfb12.iter_mut().enumerate() {
            *start = s[SBMAX_S - 1] + i * size12;
        }
        psfb12[PSFB12] = 192;

        Some(Self { l, s, psfb21, psfb12 })
    }
}

/// Index of a sample rate into the band tables
pub fn sample_rate_index(sample_rate: u32) -> Option<usize> {
    SAMPLE_RATES.iter().position(|&rate| rate == sample_rate)
}

/// Bitrate table of an MPEG version
pub fn bitrate_table(version: MpegVersion) -> &'static [u32] {
    match version {
        MpegVersion::Mpeg1 => &BITRATES_MPEG1,
        MpegVersion::Mpeg2 => &BITRATES_MPEG2,
        MpegVersion::Mpeg25 => &BITRATES_MPEG25,
    }
}

/// Bitrate index of a bitrate, if the version supports it
pub fn bitrate_index(version: MpegVersion, kbps: u32) -> Option<usize> {
    bitrate_table(version)
        .iter()
        .skip(1)
        .position(|&rate| rate == kbps)
        .map(|pos| pos + 1)
}

/// Preemphasis added to long block scalefactors when `preflag` is set
pub const PRETAB: [i32; SFBMAX] = {
    let mut tab = [0; SFBMAX];
    let long = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 3, 3, 3, 2, 0];
    let mut i = 0;
    while i < long.len() {
        tab[i] = long[i];
        i += 1;
    }
    tab
};

/// MPEG-1 scalefactor bit lengths per scalefac_compress
pub const SLEN1_TAB: [i32; 16] = [0, 0, 0, 0, 3, 1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4];
pub const SLEN2_TAB: [i32; 16] = [0, 1, 2, 3, 0, 1, 2, 3, 1, 2, 3, 1, 2, 3, 2, 3];
/// Exclusive upper bounds of the scalefactor values per scalefac_compress
pub const SLEN1_N: [i32; 16] = [1, 1, 1, 1, 8, 2, 2, 2, 4, 4, 4, 8, 8, 8, 16, 16];
pub const SLEN2_N: [i32; 16] = [1, 2, 4, 8, 1, 2, 4, 8, 2, 4, 8, 2, 4, 8, 4, 8];

/// part2 bits per scalefac_compress for short, mixed and long blocks
pub const SCALE_SHORT: [i32; 16] = [0, 18, 36, 54, 54, 36, 54, 72, 54, 72, 90, 72, 90, 108, 108, 126];
pub const SCALE_MIXED: [i32; 16] = [0, 18, 36, 54, 51, 35, 53, 71, 52, 70, 88, 69, 87, 105, 104, 122];
pub const SCALE_LONG: [i32; 16] = [0, 10, 20, 30, 33, 21, 31, 41, 32, 42, 52, 43, 53, 63, 64, 74];

/// MPEG-2 scalefactor partitions: [table][long, short, mixed][partition]
pub const NR_OF_SFB_BLOCK: [[[usize; 4]; 3]; 6] = [
    [[6, 5, 5, 5], [9, 9, 9, 9], [6, 9, 9, 9]],
    [[6, 5, 7, 3], [9, 9, 12, 6], [6, 9, 12, 6]],
    [[11, 10, 0, 0], [18, 18, 0, 0], [15, 18, 0, 0]],
    [[7, 7, 7, 0], [12, 12, 12, 0], [6, 15, 12, 0]],
    [[6, 6, 6, 3], [12, 9, 9, 6], [6, 12, 9, 6]],
    [[8, 8, 5, 0], [15, 12, 9, 0], [6, 18, 9, 0]],
];

/// Largest scalefactor per MPEG-2 partition
pub const MAX_RANGE_SFAC_TAB: [[i32; 4]; 6] = [
    [15, 15, 7, 7],
    [15, 15, 7, 0],
    [7, 3, 0, 0],
    [15, 31, 31, 0],
    [7, 7, 7, 0],
    [3, 3, 0, 0],
];

/// Bits needed for values 0..=15
pub const LOG2TAB: [i32; 16] = [0, 1, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 4, 4, 4, 4];

/// Band groups sharing one scfsi flag
pub const SCFSI_BAND: [usize; 5] = [0, 6, 11, 16, 21];

/// Quantizer power tables
pub struct QuantTables {
    /// 2^((s-210)/4) for s in -256..=256
    pow20: Vec<f32>,
    /// 2^(-(g-210)*3/16) for g in 0..=256
    ipow20: Vec<f32>,
    /// i^(4/3)
    pub pow43: Vec<f32>,
    /// Rounding offsets placing decision points at the 4/3-power midpoints
    pub adj43: Vec<f32>,
}

const POW20_OFFSET: i32 = 256;
const PRECALC_SIZE: usize = IXMAX_VAL as usize + 2;

impl QuantTables {
    fn new() -> Self {
        let pow20 = (-POW20_OFFSET..=POW20_OFFSET)
            .map(|s| 2f64.powf((s - 210) as f64 * 0.25) as f32)
            .collect();
        let ipow20 = (0..=256)
            .map(|g| 2f64.powf(-((g - 210) as f64) * 0.1875) as f32)
            .collect();
        let pow43_f64: Vec<f64> = (0..PRECALC_SIZE).map(|i| (i as f64).powf(4.0 / 3.0)).collect();
        let mut adj43: Vec<f32> = (0..PRECALC_SIZE - 1)
            .map(|i| ((i + 1) as f64 - (0.5 * (pow43_f64[i] + pow43_f64[i + 1])).powf(0.75)) as f32)
            .collect();
        adj43.push(0.5);

        Self {
            pow20,
            ipow20,
            pow43: pow43_f64.iter().map(|&v| v as f32).collect(),
            adj43,
        }
    }

    /// Quantizer step for a band step exponent
    #[inline]
    pub fn pow20(&self, s: i32) -> f32 {
        let index = (s.clamp(-POW20_OFFSET, POW20_OFFSET) + POW20_OFFSET) as usize;
        self.pow20[index]
    }

    /// Inverse 3/4-power step for a global gain
    #[inline]
    pub fn ipow20(&self, gain: i32) -> f32 {
        self.ipow20[gain.clamp(0, 256) as usize]
    }
}

lazy_static! {
    pub static ref QUANT_TABLES: QuantTables = QuantTables::new();
}

/// Relative float comparison used by the noise comparisons
#[inline]
pub fn approx_eq(a: f32, b: f32) -> bool {
    let (fa, fb) = (a.abs(), b.abs());
    if fa > fb {
        (a - b).abs() <= fa * 1e-6
    } else {
        (a - b).abs() <= fb * 1e-6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_tables_cover_granule() {
        for &rate in SAMPLE_RATES.iter() {
            let bands = ScalefacBands::for_sample_rate(rate).unwrap();
            assert_eq!(bands.l[0], 0);
            assert_eq!(bands.l[SBMAX_L], 576, "long table of {} Hz", rate);
            assert_eq!(bands.s[SBMAX_S], 192, "short table of {} Hz", rate);
            assert!(bands.l.windows(2).all(|w| w[1] > w[0] && (w[1] - w[0]) % 2 == 0));
            assert!(bands.s.windows(2).all(|w| w[1] > w[0] && (w[1] - w[0]) % 2 == 0));
            assert_eq!(bands.psfb21[0], bands.l[SBMAX_L - 1]);
            assert_eq!(bands.psfb21[PSFB21], 576);
            assert_eq!(bands.psfb12[0], bands.s[SBMAX_S - 1]);
        }
        assert!(ScalefacBands::for_sample_rate(96000).is_none());
    }

    #[test]
    fn test_bitrate_index_lookup() {
        assert_eq!(bitrate_index(MpegVersion::Mpeg1, 128), Some(9));
        assert_eq!(bitrate_index(MpegVersion::Mpeg1, 320), Some(14));
        assert_eq!(bitrate_index(MpegVersion::Mpeg2, 8), Some(1));
        assert_eq!(bitrate_index(MpegVersion::Mpeg25, 80), None);
        assert_eq!(bitrate_index(MpegVersion::Mpeg1, 0), None);
    }

    #[test]
    fn test_pretab_layout() {
        assert_eq!(PRETAB[10], 0);
        assert_eq!(PRETAB[11], 1);
        assert_eq!(PRETAB[17], 3);
        assert_eq!(PRETAB[21], 0);
        assert!(PRETAB[22..].iter().all(|&v| v == 0));
    }

    #[test]
    fn test_quant_tables() {
        let t = &*QUANT_TABLES;
        assert!((t.pow20(210) - 1.0).abs() < 1e-6);
        assert!((t.pow20(214) - 2.0).abs() < 1e-6);
        assert!((t.ipow20(210) - 1.0).abs() < 1e-6);
        assert!((t.ipow20(202) - 2f32.powf(1.5)).abs() < 1e-5);
        assert_eq!(t.pow43[0], 0.0);
        assert!((t.pow43[8] - 16.0).abs() < 1e-4);
        // decision point between 0 and 1 sits at 0.5^0.75
        assert!((t.adj43[0] - (1.0 - 0.5f32.powf(0.75))).abs() < 1e-6);
        assert!(t.adj43.iter().all(|&a| a > 0.0 && a < 1.0));
    }

    #[test]
    fn test_approx_eq() {
        assert!(approx_eq(1.0, 1.0 + 1e-7));
        assert!(!approx_eq(1.0, 1.001));
        assert!(approx_eq(0.0, 0.0));
        assert!(!approx_eq(0.0, 1e-30));
    }
}
