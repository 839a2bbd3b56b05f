//! Type definitions for the Layer III rate loop
//!
//! Granule coding state, side information and the psychoacoustic inputs
//! exchanged with the surrounding encoder.

use bitflags::bitflags;

pub const GRANULE_SIZE: usize = 576;
pub const MAX_CHANNELS: usize = 2;
pub const MAX_GRANULES: usize = 2;

/// Scalefactor bands of a long block
pub const SBMAX_L: usize = 22;
/// Scalefactor bands of a short block window
pub const SBMAX_S: usize = 13;
/// Long bands carrying a transmitted scalefactor
pub const SBPSY_L: usize = 21;
/// Short bands carrying a transmitted scalefactor
pub const SBPSY_S: usize = 12;
/// Scalefactor slots in a granule (13 short bands in 3 windows)
pub const SFBMAX: usize = SBMAX_S * 3;
/// Partitions of the long sfb21 region
pub const PSFB21: usize = 6;
/// Partitions of the short sfb12 region
pub const PSFB12: usize = 6;

pub const MAX_BITS_PER_CHANNEL: i32 = 4095;
pub const MAX_BITS_PER_GRANULE: i32 = 7680;
/// Sentinel for an unencodable quantization
pub const LARGE_BITS: i32 = 100_000;
/// Largest quantized magnitude the Huffman tables can express
pub const IXMAX_VAL: i32 = 8206;

pub const SQRT2: f64 = std::f64::consts::SQRT_2;

/// Block type of a granule as signalled in the side info
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "diagnostics", derive(serde::Serialize, serde::Deserialize))]
pub enum BlockType {
    #[default]
    Normal,
    Start,
    Short,
    Stop,
}

impl BlockType {
    pub fn is_short(self) -> bool {
        self == BlockType::Short
    }
}

bitflags! {
    /// Substep noise shaping switches.
    ///
    /// The first three are user settings; `RESERVOIR_PRESSURE` is raised by
    /// the bit reservoir while it runs close to full.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SubstepShaping: u8 {
        /// Zero small coefficients that fit into the remaining noise budget
        const TRUNCATE_SMALL_SPECTRUMS = 0x01;
        /// Half-step scalefactor resolution through selective rounding
        const PSEUDO_HALF_STEPS = 0x02;
        /// Allow truncation on short blocks too
        const SHORT_BLOCK_TRUNCATION = 0x04;
        /// Reservoir above 90 % fill
        const RESERVOIR_PRESSURE = 0x80;
    }
}

/// Granule coding state.
///
/// Scalefactor band bookkeeping follows the interleaved layout used
/// throughout the loop: long bands first (`0..sfb_lmax`), then short bands
/// as `sfb_lmax + 3 * band + window`.
#[derive(Debug, Clone)]
pub struct GranuleInfo {
    /// Spectral coefficients, short blocks reordered band/window/line
    pub xr: [f32; GRANULE_SIZE],
    /// Quantized magnitudes
    pub l3_enc: [i32; GRANULE_SIZE],
    pub scalefac: [i32; SFBMAX],
    pub xrpow_max: f32,
    /// Huffman bits while looping; the serializer adds `part2_length`
    pub part2_3_length: i32,
    /// End of the big values region (coefficient index)
    pub big_values: usize,
    /// End of the count1 region (coefficient index)
    pub count1: usize,
    pub global_gain: i32,
    pub scalefac_compress: i32,
    pub block_type: BlockType,
    pub mixed_block_flag: bool,
    pub table_select: [u8; 3],
    pub subblock_gain: [i32; 4],
    pub region0_count: i32,
    pub region1_count: i32,
    pub preflag: bool,
    pub scalefac_scale: i32,
    pub count1table_select: u8,
    /// Scalefactor bits
    pub part2_length: i32,
    pub sfb_lmax: usize,
    pub sfb_smin: usize,
    pub psy_lmax: usize,
    pub sfbmax: usize,
    pub psymax: usize,
    pub sfbdivide: usize,
    pub width: [usize; SFBMAX],
    pub window: [usize; SFBMAX],
    pub count1bits: i32,
    /// MPEG-2 scalefactor partition sizes
    pub sfb_partition_table: [usize; 4],
    pub slen: [i32; 4],
    pub max_nonzero_coeff: usize,
}

impl Default for GranuleInfo {
    fn default() -> Self {
        Self {
            xr: [0.0; GRANULE_SIZE],
            l3_enc: [0; GRANULE_SIZE],
            scalefac: [0; SFBMAX],
            xrpow_max: 0.0,
            part2_3_length: 0,
            big_values: 0,
            count1: 0,
            global_gain: 210,
            scalefac_compress: 0,
            block_type: BlockType::Normal,
            mixed_block_flag: false,
            table_select: [0; 3],
            subblock_gain: [0; 4],
            region0_count: 0,
            region1_count: 0,
            preflag: false,
            scalefac_scale: 0,
            count1table_select: 0,
            part2_length: 0,
            sfb_lmax: SBPSY_L,
            sfb_smin: SBPSY_S,
            psy_lmax: SBPSY_L,
            sfbmax: SBPSY_L,
            psymax: SBPSY_L,
            sfbdivide: 11,
            width: [0; SFBMAX],
            window: [3; SFBMAX],
            count1bits: 0,
            sfb_partition_table: [6, 5, 5, 5],
            slen: [0; 4],
            max_nonzero_coeff: GRANULE_SIZE - 1,
        }
    }
}

impl GranuleInfo {
    /// Granule with the given spectrum and block layout, otherwise fresh
    pub fn with_spectrum(xr: [f32; GRANULE_SIZE], block_type: BlockType, mixed: bool) -> Self {
        Self {
            xr,
            block_type,
            mixed_block_flag: mixed,
            ..Self::default()
        }
    }

    /// Bits this granule occupies in the main data
    pub fn total_bits(&self) -> i32 {
        self.part2_3_length + self.part2_length
    }
}

/// Masking energies and thresholds produced by the psychoacoustic model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsyRatio {
    pub en_l: [f32; SBMAX_L],
    pub thm_l: [f32; SBMAX_L],
    pub en_s: [[f32; 3]; SBMAX_S],
    pub thm_s: [[f32; 3]; SBMAX_S],
}

impl Default for PsyRatio {
    fn default() -> Self {
        Self {
            en_l: [0.0; SBMAX_L],
            thm_l: [0.0; SBMAX_L],
            en_s: [[0.0; 3]; SBMAX_S],
            thm_s: [[0.0; 3]; SBMAX_S],
        }
    }
}

/// Side information of one frame as handed to the bitstream formatter
#[derive(Debug, Clone, Default)]
pub struct SideInfo {
    pub tt: [[GranuleInfo; MAX_CHANNELS]; MAX_GRANULES],
    /// Scalefactor reuse flags per channel for bands {0..6, 6..11, 11..16, 16..21}
    pub scfsi: [[bool; 4]; MAX_CHANNELS],
    /// Byte offset of this frame's main data into previous frames
    pub main_data_begin: i32,
    /// Stuffing bits placed in the previous frame's ancillary space
    pub resv_drain_pre: i32,
    /// Stuffing bits placed after this frame's main data
    pub resv_drain_post: i32,
}
