//! Bit reservoir
//!
//! Layer III main data may start in earlier frames (`main_data_begin`), so a
//! frame can spend bits that previous frames left unused. The reservoir
//! tracks how many such bits are banked, hands out per granule targets and
//! drains overflow into stuffing so its size stays byte aligned and below
//! its maximum.

use crate::config::ReservoirConfig;
use crate::error::{EncodingError, EncodingResult};
use crate::types::{GranuleInfo, SideInfo, SubstepShaping};

/// Main data buffer of the decoder model, 1440 bytes
const DEFAULT_BUFFER_BITS: i32 = 8 * 1440;
/// Largest main_data_begin offset, 8 bits per granule plus one byte
const RESV_LIMIT_PER_GRANULE: i32 = 8 * 256;

/// Per frame allocation returned by [`BitReservoir::frame_begin`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBudget {
    /// Main data bits of one granule at the nominal bitrate
    pub mean_bits: i32,
    /// Bits the frame may use including the banked reservoir
    pub full_frame_bits: i32,
}

/// Bit budget of one granule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GranuleBudget {
    /// Bits the granule should aim for
    pub targ_bits: i32,
    /// Bits it may additionally borrow from the reservoir
    pub extra_bits: i32,
}

/// Bit reservoir of one encoding session
#[derive(Debug, Clone)]
pub struct BitReservoir {
    /// Banked bits
    resv_size: i32,
    /// Largest size the next frame may leave behind
    resv_max: i32,
    /// Main data buffer size of the decoder
    max_buffer_bits: i32,
    disabled: bool,
}

impl BitReservoir {
    /// Empty reservoir sized for `sample_rate`
    pub fn new(config: &ReservoirConfig, sample_rate: u32) -> Self {
        let max_buffer_bits = if config.strict_iso {
            // size of a 320 kbps frame
            let frames_per_second = sample_rate as f32 / 1152.0;
            8 * ((320_000.0 / frames_per_second) / 8.0 + 0.5) as i32
        } else {
            DEFAULT_BUFFER_BITS
        };
        Self {
            resv_size: 0,
            resv_max: 0,
            max_buffer_bits,
            disabled: config.disabled,
        }
    }

    /// Size the reservoir for a frame of `frame_bits` total bits.
    ///
    /// May be called once per candidate bitrate; only the last call counts.
    pub fn frame_begin(
        &mut self,
        frame_bits: i32,
        side_info_bits: i32,
        granules: usize,
        side: &mut SideInfo,
    ) -> FrameBudget {
        let granules = granules as i32;
        let mean_bits = (frame_bits - side_info_bits) / granules;
        let resv_limit = RESV_LIMIT_PER_GRANULE * granules - 8;

        self.resv_max = (self.max_buffer_bits - frame_bits).min(resv_limit);
        if self.resv_max < 0 || self.disabled {
            self.resv_max = 0;
        }

        let full_frame_bits = (mean_bits * granules + self.resv_size.min(self.resv_max)).min(self.max_buffer_bits);

        side.resv_drain_pre = 0;
        side.resv_drain_post = 0;

        log::trace!(
            "reservoir frame begin: size {} max {} mean {} full {}",
            self.resv_size,
            self.resv_max,
            mean_bits,
            full_frame_bits
        );
        FrameBudget {
            mean_bits,
            full_frame_bits,
        }
    }

    /// Target and borrowable bits of the next granule.
    ///
    /// Above 90 % fill the excess is released into the target and
    /// `RESERVOIR_PRESSURE` is raised in `substep`; below it the flag is
    /// cleared and a tenth of `mean_bits` is held back to refill.
    pub fn max_bits(&self, mean_bits: i32, cbr: bool, substep: &mut SubstepShaping) -> GranuleBudget {
        let mut resv_size = self.resv_size;
        let mut resv_max = self.resv_max;
        if cbr {
            resv_size += mean_bits;
        }
        if substep.contains(SubstepShaping::TRUNCATE_SMALL_SPECTRUMS) {
            resv_max = (resv_max as f32 * 0.9) as i32;
        }

        let mut targ_bits = mean_bits;
        let released;
        if resv_size * 10 > resv_max * 9 {
            released = resv_size - (resv_max * 9) / 10;
            targ_bits += released;
            substep.insert(SubstepShaping::RESERVOIR_PRESSURE);
        } else {
            released = 0;
            substep.remove(SubstepShaping::RESERVOIR_PRESSURE);
            if !self.disabled && !substep.contains(SubstepShaping::TRUNCATE_SMALL_SPECTRUMS) {
                targ_bits = (targ_bits as f64 - 0.1 * mean_bits as f64) as i32;
            }
        }

        let extra_bits = (resv_size.min((self.resv_max * 6) / 10) - released).max(0);
        GranuleBudget { targ_bits, extra_bits }
    }

    /// Debit the bits a finished granule occupies
    pub fn adjust(&mut self, gi: &GranuleInfo) {
        self.resv_size -= gi.total_bits();
    }

    /// Credit the frame's mean bits and drain overflow into stuffing.
    ///
    /// Stuffing goes into the previous frame's ancillary space first, as far
    /// as `main_data_begin` reaches, the rest after this frame's main data.
    /// Returns the stuffing bits.
    pub fn frame_end(&mut self, mean_bits: i32, granules: usize, side: &mut SideInfo) -> EncodingResult<i32> {
        self.resv_size += mean_bits * granules as i32;
        side.resv_drain_pre = 0;
        side.resv_drain_post = 0;

        if self.resv_size < 0 {
            return Err(EncodingError::ReservoirInvariant(format!(
                "frame overspent the reservoir by {} bits",
                -self.resv_size
            )));
        }

        let mut stuffing = self.resv_size % 8;
        let over_bits = (self.resv_size - stuffing) - self.resv_max;
        if over_bits > 0 {
            stuffing += over_bits;
        }

        let pre_bytes = (side.main_data_begin * 8).min(stuffing) / 8;
        side.resv_drain_pre = 8 * pre_bytes;
        side.main_data_begin -= pre_bytes;
        side.resv_drain_post = stuffing - 8 * pre_bytes;
        self.resv_size -= stuffing;

        if self.resv_size % 8 != 0 || self.resv_size > self.resv_max {
            return Err(EncodingError::ReservoirInvariant(format!(
                "size {} not aligned below max {}",
                self.resv_size, self.resv_max
            )));
        }

        log::trace!(
            "reservoir frame end: size {} stuffing {} (pre {}, post {})",
            self.resv_size,
            stuffing,
            side.resv_drain_pre,
            side.resv_drain_post
        );
        Ok(stuffing)
    }

    /// Banked bits
    pub fn size(&self) -> i32 {
        self.resv_size
    }

    /// Current maximum size
    pub fn max(&self) -> i32 {
        self.resv_max
    }

    /// Bytes of the next frame's main data placed in earlier frames
    pub fn main_data_begin(&self) -> i32 {
        self.resv_size / 8
    }
}
