//! Scalefactor coding cost and final scalefactor storage
//!
//! MPEG-1 codes scalefactors with one of 16 (slen1, slen2) pairs chosen by
//! `scalefac_compress`; MPEG-2 and 2.5 split the bands into four partitions
//! with their own bit widths. [`best_scalefac_store`] compacts the final
//! scalefactors of a granule and shares them across granules where possible.

use crate::tables::{
    LOG2TAB, MAX_RANGE_SFAC_TAB, NR_OF_SFB_BLOCK, PRETAB, SCALE_LONG, SCALE_MIXED, SCALE_SHORT, SCFSI_BAND, SLEN1_N,
    SLEN1_TAB, SLEN2_N, SLEN2_TAB,
};
use crate::types::{BlockType, GranuleInfo, SideInfo, LARGE_BITS, SBPSY_L};

/// Scalefactor value marking a band without nonzero coefficients
const ANY_SCALEFAC: i32 = -2;

/// Compute `part2_length` and `scalefac_compress` of the granule.
///
/// Returns false when the scalefactors exceed every coding option.
pub fn scale_bitcount(gi: &mut GranuleInfo, granules: usize) -> bool {
    if granules == 2 {
        mpeg1_scale_bitcount(gi)
    } else {
        lsf_scale_bitcount(gi)
    }
}

fn mpeg1_scale_bitcount(gi: &mut GranuleInfo) -> bool {
    let tab = if gi.block_type.is_short() {
        if gi.mixed_block_flag {
            &SCALE_MIXED
        } else {
            &SCALE_SHORT
        }
    } else {
        if !gi.preflag && (11..SBPSY_L).all(|sfb| gi.scalefac[sfb] >= PRETAB[sfb]) {
            gi.preflag = true;
            for sfb in 11..SBPSY_L {
                gi.scalefac[sfb] -= PRETAB[sfb];
            }
        }
        &SCALE_LONG
    };

    let max_slen1 = gi.scalefac[..gi.sfbdivide].iter().copied().fold(0, i32::max);
    let max_slen2 = gi.scalefac[gi.sfbdivide..gi.sfbmax].iter().copied().fold(0, i32::max);

    gi.part2_length = LARGE_BITS;
    for k in 0..16 {
        if max_slen1 < SLEN1_N[k] && max_slen2 < SLEN2_N[k] && gi.part2_length > tab[k] {
            gi.part2_length = tab[k];
            gi.scalefac_compress = k as i32;
        }
    }
    gi.part2_length != LARGE_BITS
}

fn lsf_scale_bitcount(gi: &mut GranuleInfo) -> bool {
    let table_number = if gi.preflag { 2 } else { 0 };
    let mut max_sfac = [0i32; 4];

    let row = if gi.block_type.is_short() {
        let partition_table = &NR_OF_SFB_BLOCK[table_number][1];
        let mut sfb = 0;
        for (partition, &bands) in partition_table.iter().enumerate() {
            for _ in 0..bands / 3 {
                for window in 0..3 {
                    max_sfac[partition] = max_sfac[partition].max(gi.scalefac[sfb * 3 + window]);
                }
                sfb += 1;
            }
        }
        1
    } else {
        let partition_table = &NR_OF_SFB_BLOCK[table_number][0];
        let mut sfb = 0;
        for (partition, &bands) in partition_table.iter().enumerate() {
            for _ in 0..bands {
                max_sfac[partition] = max_sfac[partition].max(gi.scalefac[sfb]);
                sfb += 1;
            }
        }
        0
    };

    let over = max_sfac
        .iter()
        .zip(MAX_RANGE_SFAC_TAB[table_number].iter())
        .any(|(&max, &range)| max > range);
    if over {
        return false;
    }

    gi.sfb_partition_table = NR_OF_SFB_BLOCK[table_number][row];
    for (slen, &max) in gi.slen.iter_mut().zip(max_sfac.iter()) {
        *slen = LOG2TAB[max as usize];
    }
    let [slen1, slen2, slen3, slen4] = gi.slen;
    gi.scalefac_compress = match table_number {
        0 => (((slen1 * 5) + slen2) << 4) + (slen3 << 2) + slen4,
        1 => 400 + (((slen1 * 5) + slen2) << 2) + slen3,
        _ => 500 + (slen1 * 3) + slen2,
    };
    gi.part2_length = gi
        .slen
        .iter()
        .zip(gi.sfb_partition_table.iter())
        .map(|(&slen, &bands)| slen * bands as i32)
        .sum();
    true
}

/// Compact and store the final scalefactors of granule `gr`, channel `ch`.
///
/// Bands without coded coefficients take any value, even scalefactors are
/// halved into `scalefac_scale`, preemphasis is detected, and in the second
/// MPEG-1 granule bands equal to the first granule are shared via scfsi.
pub fn best_scalefac_store(side: &mut SideInfo, gr: usize, ch: usize, granules: usize) {
    let mut recalc = false;
    {
        let gi = &mut side.tt[gr][ch];

        let mut j = 0;
        for sfb in 0..gi.sfbmax {
            let width = gi.width[sfb];
            if gi.l3_enc[j..j + width].iter().all(|&v| v == 0) {
                gi.scalefac[sfb] = ANY_SCALEFAC;
                recalc = true;
            }
            j += width;
        }

        if gi.scalefac_scale == 0 && !gi.preflag {
            let s = gi.scalefac[..gi.sfbmax]
                .iter()
                .filter(|&&sf| sf > 0)
                .fold(0, |acc, &sf| acc | sf);
            if s & 1 == 0 && s != 0 {
                for sf in gi.scalefac[..gi.sfbmax].iter_mut().filter(|sf| **sf > 0) {
                    *sf >>= 1;
                }
                gi.scalefac_scale = 1;
                recalc = true;
            }
        }

        if !gi.preflag
            && !gi.block_type.is_short()
            && granules == 2
            && (11..SBPSY_L).all(|sfb| gi.scalefac[sfb] >= PRETAB[sfb] || gi.scalefac[sfb] == ANY_SCALEFAC)
        {
            for sfb in 11..SBPSY_L {
                if gi.scalefac[sfb] > 0 {
                    gi.scalefac[sfb] -= PRETAB[sfb];
                }
            }
            gi.preflag = true;
            recalc = true;
        }
    }

    side.scfsi[ch] = [false; 4];

    if granules == 2
        && gr == 1
        && side.tt[0][ch].block_type != BlockType::Short
        && side.tt[1][ch].block_type != BlockType::Short
    {
        scfsi_calc(side, ch);
        recalc = false;
    }

    let gi = &mut side.tt[gr][ch];
    for sf in gi.scalefac[..gi.sfbmax].iter_mut() {
        if *sf == ANY_SCALEFAC {
            *sf = 0;
        }
    }
    if recalc {
        scale_bitcount(gi, granules);
    }
}

/// Share scalefactor groups of the second granule with the first one
fn scfsi_calc(side: &mut SideInfo, ch: usize) {
    let [first, second] = &mut side.tt;
    let g0 = &first[ch];
    let gi = &mut second[ch];
    let scfsi = &mut side.scfsi[ch];
    let mut shared = [false; SBPSY_L];

    for (group, bounds) in SCFSI_BAND.windows(2).enumerate() {
        let range = bounds[0]..bounds[1];
        let reusable = range
            .clone()
            .all(|sfb| g0.scalefac[sfb] == gi.scalefac[sfb] || gi.scalefac[sfb] < 0);
        if reusable {
            for sfb in range {
                gi.scalefac[sfb] = g0.scalefac[sfb];
                shared[sfb] = true;
            }
            scfsi[group] = true;
        }
    }

    let coded = |range: std::ops::Range<usize>| -> (i32, i32) {
        range
            .filter(|&sfb| !shared[sfb])
            .fold((0, 0), |(count, max), sfb| (count + 1, max.max(gi.scalefac[sfb])))
    };
    let (c1, s1) = coded(0..11);
    let (c2, s2) = coded(11..SBPSY_L);

    for i in 0..16 {
        if s1 < SLEN1_N[i] && s2 < SLEN2_N[i] {
            let c = SLEN1_TAB[i] * c1 + SLEN2_TAB[i] * c2;
            if gi.part2_length > c {
                gi.part2_length = c;
                gi.scalefac_compress = i as i32;
            }
        }
    }
}
