//! Shared granule fixtures for the quantizer unit tests

use crate::config::ShapingConfig;
use crate::huffman::HuffmanEstimator;
use crate::outer_loop::{init_band_layout, init_xrpow};
use crate::quantize::{QuantContext, Workspace};
use crate::tables::ScalefacBands;
use crate::iteration::{ChannelInput, FrameInput, GranuleInput};
use crate::types::{BlockType, GranuleInfo, PsyRatio, SubstepShaping, GRANULE_SIZE, SBMAX_L, SFBMAX};

/// Everything a [`QuantContext`] borrows, for 44.1 kHz MPEG-1
pub struct Harness {
    pub bands: ScalefacBands,
    pub estimator: HuffmanEstimator,
    pub shaping: ShapingConfig,
    pub substep: SubstepShaping,
    pub granules: usize,
}

impl Harness {
    pub fn new(configure: impl FnOnce(&mut ShapingConfig)) -> Self {
        let bands = ScalefacBands::for_sample_rate(44100).expect("44.1 kHz is a valid rate");
        let mut shaping = ShapingConfig::default();
        configure(&mut shaping);
        Self {
            estimator: HuffmanEstimator::new(bands.clone()),
            bands,
            shaping,
            substep: SubstepShaping::empty(),
            granules: 2,
        }
    }

    pub fn ctx(&self) -> QuantContext<'_> {
        QuantContext {
            counter: &self.estimator,
            bands: &self.bands,
            shaping: &self.shaping,
            substep: self.substep,
            granules: self.granules,
            sfb21_extra: false,
            vbr: false,
        }
    }

    /// Silent long block granule with its band layout
    pub fn long_granule(&self) -> GranuleInfo {
        let mut gi = GranuleInfo::default();
        init_band_layout(&mut gi, &self.bands, self.granules, false);
        gi
    }

    /// Silent pure short block granule with its band layout
    pub fn short_granule(&self) -> GranuleInfo {
        let mut gi = GranuleInfo {
            block_type: BlockType::Short,
            ..GranuleInfo::default()
        };
        init_band_layout(&mut gi, &self.bands, self.granules, false);
        gi
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new(|_| {})
    }
}

/// Decaying deterministic spectrum of peak `amplitude`
pub fn tone_spectrum(amplitude: f32) -> [f32; GRANULE_SIZE] {
    std::array::from_fn(|i| {
        let i = i as f32;
        amplitude * (-i / 96.0).exp() * ((i * 0.37).sin() + 0.2)
    })
}

/// Fill `gi` with [`tone_spectrum`] and prepare its `xrpow`
pub fn tone_workspace(gi: &mut GranuleInfo, amplitude: f32) -> Workspace {
    gi.xr = tone_spectrum(amplitude);
    gi.max_nonzero_coeff = GRANULE_SIZE - 1;
    let mut ws = Workspace::default();
    init_xrpow(SubstepShaping::empty(), gi, &mut ws);
    ws
}

/// Allowed noise of each band as `factor(sfb)` times its energy in `gi.xr`
pub fn band_xmin(gi: &GranuleInfo, factor: impl Fn(usize) -> f32) -> [f32; SFBMAX] {
    let mut xmin = [1e-20; SFBMAX];
    let mut j = 0;
    for sfb in 0..gi.psymax {
        let width = gi.width[sfb];
        let en: f32 = gi.xr[j..j + width].iter().map(|x| x * x).sum();
        xmin[sfb] = (en * factor(sfb)).max(1e-20);
        j += width;
    }
    xmin
}

/// Long block masking with every band's threshold `snr_db` below its energy
pub fn long_ratio(xr: &[f32; GRANULE_SIZE], bands: &ScalefacBands, snr_db: f32) -> PsyRatio {
    let mut ratio = PsyRatio::default();
    let scale = 10f32.powf(-snr_db / 10.0);
    for sfb in 0..SBMAX_L {
        let en: f32 = xr[bands.l[sfb]..bands.l[sfb + 1]].iter().map(|x| x * x).sum();
        ratio.en_l[sfb] = en;
        ratio.thm_l[sfb] = en * scale;
    }
    ratio
}

/// Long block channel of [`tone_spectrum`] masked 20 dB below its energy
pub fn tone_channel(amplitude: f32, pe: f32) -> ChannelInput {
    let xr = tone_spectrum(amplitude);
    let bands = ScalefacBands::for_sample_rate(44100).expect("44.1 kHz is a valid rate");
    ChannelInput {
        pe,
        ratio: long_ratio(&xr, &bands, 20.0),
        ..ChannelInput::new(xr, BlockType::Normal)
    }
}

/// Frame of identical granules of `channel`
pub fn uniform_frame(channel: ChannelInput, granules: usize, channels: usize) -> FrameInput {
    let granule = GranuleInput {
        channels: vec![channel; channels],
        ms_ener_ratio: 0.5,
    };
    FrameInput {
        granules: vec![granule; granules],
        mid_side: false,
    }
}
