//! Huffman bit counting for quantized granules
//!
//! The rate loop only needs to know how many bits a quantization costs, so
//! the Huffman stage is reduced to a counting seam here. The bitstream
//! formatter owns the actual code words; [`HuffmanEstimator`] uses the exact
//! code lengths of the small tables and a length model for the large ones.

use crate::tables::ScalefacBands;
use crate::types::{BlockType, GranuleInfo, GRANULE_SIZE, LARGE_BITS, SBMAX_L};

/// Bit cost of a quantized granule.
///
/// Implementations partition `gi.l3_enc` into big values, count1 and zero
/// regions, select the tables, store the layout in `gi` and return the
/// Huffman bits including sign and linbits.
pub trait BitCounter: Send + Sync {
    fn count_bits(&self, gi: &mut GranuleInfo) -> i32;
}

/// Code lengths of table 1 (xlen 2), index x * xlen + y
const T1_LENGTHS: [u8; 4] = [1, 3, 2, 3];
const T2_LENGTHS: [u8; 9] = [1, 3, 6, 3, 3, 5, 5, 5, 6];
const T3_LENGTHS: [u8; 9] = [2, 2, 6, 3, 2, 5, 5, 5, 6];
const T5_LENGTHS: [u8; 16] = [1, 3, 6, 7, 3, 3, 6, 7, 6, 6, 7, 8, 7, 6, 7, 8];
const T6_LENGTHS: [u8; 16] = [3, 3, 5, 7, 3, 2, 4, 5, 4, 4, 5, 6, 6, 5, 6, 7];
const T7_LENGTHS: [u8; 36] = [
    1, 3, 6, 8, 8, 9, 3, 4, 6, 7, 7, 8, 6, 5, 7, 8, 8, 9, 7, 7, 8, 9, 9, 9, 7, 7, 8, 9, 9, 10, 8, 8, 9, 10, 10, 10,
];
const T8_LENGTHS: [u8; 36] = [
    2, 3, 6, 8, 8, 9, 3, 2, 4, 8, 8, 8, 6, 4, 6, 8, 8, 9, 8, 8, 8, 9, 9, 10, 8, 7, 8, 9, 10, 10, 9, 8, 9, 9, 11, 11,
];
const T9_LENGTHS: [u8; 36] = [
    3, 3, 5, 6, 8, 9, 3, 3, 4, 5, 6, 8, 4, 4, 5, 6, 7, 8, 6, 5, 6, 7, 7, 8, 7, 6, 7, 7, 8, 9, 8, 7, 8, 8, 9, 9,
];

/// Count1 table A, index 8v + 4w + 2x + y
const COUNT1_A_LENGTHS: [u8; 16] = [1, 4, 4, 5, 4, 6, 5, 6, 4, 5, 5, 6, 5, 6, 6, 6];
/// Count1 table B is a fixed 4 bit code
const COUNT1_B_LENGTH: i32 = 4;

/// Linbits of the escape tables 16..=23 and 24..=31
const LINBITS_A: [u32; 8] = [1, 2, 3, 4, 6, 8, 10, 13];
const LINBITS_B: [u32; 8] = [4, 5, 6, 7, 8, 9, 11, 13];

/// Region split for long blocks by number of covered bands
const SUBDV_TABLE: [(i32, i32); SBMAX_L + 1] = [
    (0, 0),
    (0, 0),
    (0, 0),
    (0, 0),
    (0, 0),
    (0, 1),
    (1, 1),
    (1, 1),
    (1, 2),
    (2, 2),
    (2, 3),
    (2, 3),
    (3, 4),
    (3, 4),
    (3, 4),
    (4, 5),
    (4, 5),
    (4, 6),
    (5, 6),
    (5, 6),
    (5, 7),
    (6, 7),
    (6, 7),
];

/// Default bit counter
#[derive(Debug, Clone)]
pub struct HuffmanEstimator {
    bands: ScalefacBands,
}

impl HuffmanEstimator {
    pub fn new(bands: ScalefacBands) -> Self {
        Self { bands }
    }

    /// Region0/region1 band counts for a big values region ending at `end`
    fn region_split(&self, end: usize) -> (i32, i32) {
        let l = &self.bands.l;
        let mut covered = 1;
        while covered < SBMAX_L && l[covered] < end {
            covered += 1;
        }
        let (r0_default, r1_default) = SUBDV_TABLE[covered];

        let mut r0 = r0_default;
        while r0 >= 0 && l[(r0 + 1) as usize] > end {
            r0 -= 1;
        }
        if r0 < 0 {
            r0 = r0_default;
        }

        let mut r1 = r1_default;
        while r1 >= 0 && l[((r1 + r0 + 2) as usize).min(SBMAX_L)] > end {
            r1 -= 1;
        }
        if r1 < 0 {
            r1 = r1_default;
        }
        (r0, r1)
    }
}

impl BitCounter for HuffmanEstimator {
    fn count_bits(&self, gi: &mut GranuleInfo) -> i32 {
        let ix = &gi.l3_enc;

        let mut i = GRANULE_SIZE;
        while i > 1 && ix[i - 1] == 0 && ix[i - 2] == 0 {
            i -= 2;
        }
        let count1 = i;

        let mut bits_a = 0;
        let mut bits_b = 0;
        while i > 3 {
            let quad = &ix[i - 4..i];
            if quad.iter().any(|&v| v > 1) {
                break;
            }
            let p = ((quad[0] << 3) | (quad[1] << 2) | (quad[2] << 1) | quad[3]) as usize;
            let signs = quad.iter().filter(|&&v| v != 0).count() as i32;
            bits_a += COUNT1_A_LENGTHS[p] as i32 + signs;
            bits_b += COUNT1_B_LENGTH + signs;
            i -= 4;
        }

        let (count1bits, count1_select) = if bits_a > bits_b { (bits_b, 1) } else { (bits_a, 0) };
        let big_values = i;

        let mut table_select = [0u8; 3];
        let mut bits = count1bits;
        let (region0_count, region1_count);

        if big_values > 0 {
            let (mut a1, mut a2);
            match gi.block_type {
                BlockType::Short => {
                    region0_count = 8;
                    region1_count = 36;
                    a1 = 3 * self.bands.s[3];
                    a2 = big_values;
                }
                BlockType::Normal => {
                    let (r0, r1) = self.region_split(big_values);
                    region0_count = r0;
                    region1_count = r1;
                    a1 = self.bands.l[(r0 + 1) as usize];
                    a2 = self.bands.l[((r0 + r1 + 2) as usize).min(SBMAX_L)];
                    if a2 < big_values {
                        let (table, region_bits) = choose_table(&ix[a2..big_values]);
                        table_select[2] = table;
                        bits += region_bits;
                    }
                }
                BlockType::Start | BlockType::Stop => {
                    region0_count = 7;
                    region1_count = SBMAX_L as i32 - 1 - 7 - 1;
                    a1 = self.bands.l[7 + 1];
                    a2 = big_values;
                }
            }

            a1 = a1.min(big_values);
            a2 = a2.min(big_values);
            if a1 > 0 {
                let (table, region_bits) = choose_table(&ix[..a1]);
                table_select[0] = table;
                bits += region_bits;
            }
            if a1 < a2 {
                let (table, region_bits) = choose_table(&ix[a1..a2]);
                table_select[1] = table;
                bits += region_bits;
            }
        } else {
            region0_count = 0;
            region1_count = 0;
        }

        gi.count1 = count1;
        gi.big_values = big_values;
        gi.count1bits = count1bits;
        gi.count1table_select = count1_select;
        gi.table_select = table_select;
        gi.region0_count = region0_count;
        gi.region1_count = region1_count;
        bits.min(LARGE_BITS)
    }
}

/// Pick the cheapest table for a big values region and return its bits
fn choose_table(ix: &[i32]) -> (u8, i32) {
    let max = ix.iter().copied().max().unwrap_or(0);
    match max {
        0 => (0, 0),
        1 => (1, exact_bits(ix, &T1_LENGTHS, 2)),
        2 => cheapest(ix, &[(2, &T2_LENGTHS), (3, &T3_LENGTHS)], 3),
        3 => cheapest(ix, &[(5, &T5_LENGTHS), (6, &T6_LENGTHS)], 4),
        4 | 5 => cheapest(ix, &[(7, &T7_LENGTHS), (8, &T8_LENGTHS), (9, &T9_LENGTHS)], 6),
        6 | 7 => (10, modeled_bits(ix, 0)),
        8..=15 => (13, modeled_bits(ix, 0)),
        _ => choose_escape_table(ix, max),
    }
}

fn cheapest(ix: &[i32], candidates: &[(u8, &[u8])], xlen: usize) -> (u8, i32) {
    candidates
        .iter()
        .map(|&(table, lengths)| (table, exact_bits(ix, lengths, xlen)))
        .min_by_key(|&(_, bits)| bits)
        .unwrap_or((0, LARGE_BITS))
}

fn exact_bits(ix: &[i32], lengths: &[u8], xlen: usize) -> i32 {
    ix.chunks_exact(2)
        .map(|pair| {
            let (x, y) = (pair[0] as usize, pair[1] as usize);
            lengths[x * xlen + y] as i32 + sign_bits(pair)
        })
        .sum()
}

/// Code length model of the large tables: short codes near zero growing
/// with the magnitude of each value, plus linbits for escaped values
fn modeled_bits(ix: &[i32], linbits: u32) -> i32 {
    let value_len = |v: i32| -> i32 {
        if v == 0 {
            0
        } else {
            2 + 2 * (31 - v.min(15).leading_zeros() as i32)
        }
    };
    ix.chunks_exact(2)
        .map(|pair| {
            let escapes = pair.iter().filter(|&&v| v >= 15).count() as i32;
            1 + value_len(pair[0]) + value_len(pair[1]) + sign_bits(pair) + escapes * linbits as i32
        })
        .sum()
}

fn choose_escape_table(ix: &[i32], max: i32) -> (u8, i32) {
    let escaped = max - 15;
    let fits = |linbits: &u32| (1i32 << linbits) > escaped;

    let group_a = LINBITS_A.iter().position(fits);
    let group_b = LINBITS_B.iter().position(fits);
    match (group_a, group_b) {
        (Some(a), Some(b)) => {
            let bits_a = modeled_bits(ix, LINBITS_A[a]);
            let bits_b = modeled_bits(ix, LINBITS_B[b]);
            if bits_b < bits_a {
                (24 + b as u8, bits_b)
            } else {
                (16 + a as u8, bits_a)
            }
        }
        _ => (0, LARGE_BITS),
    }
}

#[inline]
fn sign_bits(pair: &[i32]) -> i32 {
    pair.iter().filter(|&&v| v != 0).count() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> HuffmanEstimator {
        HuffmanEstimator::new(ScalefacBands::for_sample_rate(44100).unwrap())
    }

    #[test]
    fn test_silent_granule_costs_nothing() {
        let mut gi = GranuleInfo::default();
        let bits = estimator().count_bits(&mut gi);

        assert_eq!(bits, 0);
        assert_eq!(gi.big_values, 0);
        assert_eq!(gi.count1, 0);
        assert_eq!(gi.table_select, [0; 3]);
    }

    #[test]
    fn test_count1_quad_prefers_cheaper_table() {
        let mut gi = GranuleInfo::default();
        gi.l3_enc[..4].copy_from_slice(&[1, 0, 1, 1]);
        let bits = estimator().count_bits(&mut gi);

        // table A: 6 + 3 signs, table B: 4 + 3 signs
        assert_eq!(bits, 7);
        assert_eq!(gi.count1table_select, 1);
        assert_eq!(gi.count1bits, 7);
        assert_eq!(gi.count1, 4);
        assert_eq!(gi.big_values, 0);
    }

    #[test]
    fn test_single_pair_in_big_values() {
        let mut gi = GranuleInfo::default();
        gi.l3_enc[0] = 1;
        gi.l3_enc[1] = 2;
        let bits = estimator().count_bits(&mut gi);

        assert_eq!(gi.big_values, 2);
        assert_eq!(gi.count1, 2);
        // table 2 codes (1,2) in 5 bits, table 3 in 5 bits, plus two signs
        assert_eq!(bits, 7);
        assert!(gi.table_select[0] == 2 || gi.table_select[0] == 3);
    }

    #[test]
    fn test_escape_values_select_linbits_table() {
        let mut gi = GranuleInfo::default();
        gi.l3_enc[0] = 100;
        let bits = estimator().count_bits(&mut gi);

        assert!(gi.table_select[0] >= 16);
        assert!(bits > 7, "escaped value must pay linbits");
        assert!(bits < LARGE_BITS);
    }

    #[test]
    fn test_bits_grow_with_magnitude() {
        let est = estimator();
        let mut previous = 0;
        for scale in [1, 2, 4, 8, 32, 512] {
            let mut gi = GranuleInfo::default();
            for (i, v) in gi.l3_enc.iter_mut().take(200).enumerate() {
                *v = (i as i32 % 3) * scale;
            }
            let bits = est.count_bits(&mut gi);
            assert!(bits > previous, "scale {} gave {} bits", scale, bits);
            previous = bits;
        }
    }

    #[test]
    fn test_short_block_regions() {
        let mut gi = GranuleInfo {
            block_type: BlockType::Short,
            ..GranuleInfo::default()
        };
        for v in gi.l3_enc.iter_mut().take(120) {
            *v = 3;
        }
        let bits = estimator().count_bits(&mut gi);

        assert_eq!(gi.big_values, 120);
        assert_eq!(gi.region0_count, 8);
        assert!(gi.table_select[0] == 5 || gi.table_select[0] == 6);
        assert!(bits > 0);
    }

    #[test]
    fn test_region_split_stays_within_bands() {
        let est = estimator();
        for end in (2..=GRANULE_SIZE).step_by(2) {
            let (r0, r1) = est.region_split(end);
            assert!(r0 >= 0 && r1 >= 0);
            assert!((r0 + r1 + 2) as usize <= SBMAX_L);
        }
    }
}
