use biquad::{Biquad, Coefficients};
use neuro_types::FilterSettings;
use tracing::debug;

use super::design::{self, Band};
use crate::error::PipelineResult;

/// Most sections a single low- or high-pass cascade can hold (order 8).
pub const MAX_SECTIONS: usize = 4;

/// Section slots per channel in flat order: the notch, then the low-pass and high-pass
/// cascades padded to [`MAX_SECTIONS`] each.
pub const CHANNEL_SECTIONS: usize = 1 + 2 * MAX_SECTIONS;

/// Coefficients per section in flat form: `b0 b1 b2 a1 a2`.
pub const SECTION_COEFFICIENTS: usize = 5;

/// History words per section in flat form: `x1 x2 y1 y2`.
pub const SECTION_HISTORY: usize = 4;

const IDENTITY: Coefficients<f32> = Coefficients {
    a1: 0.0,
    a2: 0.0,
    b0: 1.0,
    b1: 0.0,
    b2: 0.0,
};

/// Coefficients shared by every channel of a session.
#[derive(Clone)]
pub struct FilterPlan {
    notch: Option<Coefficients<f32>>,
    lowpass: Vec<Coefficients<f32>>,
    highpass: Vec<Coefficients<f32>>,
}

impl FilterPlan {
    pub fn new(settings: &FilterSettings, sample_rate_hz: f64) -> PipelineResult<Self> {
        let notch = if settings.notch_enabled {
            Some(design::notch(
                settings.notch_hz,
                settings.notch_bandwidth_hz,
                sample_rate_hz,
            )?)
        } else {
            None
        };
        let lowpass = design::cascade(
            settings.lowpass_design,
            Band::LowPass,
            settings.lowpass_order,
            settings.lowpass_hz,
            sample_rate_hz,
        )?;
        let highpass = design::cascade(
            settings.highpass_design,
            Band::HighPass,
            settings.highpass_order,
            settings.highpass_hz,
            sample_rate_hz,
        )?;
        debug!(
            "Filter plan: notch {}, {} low-pass and {} high-pass sections at {} Hz",
            notch.is_some(),
            lowpass.len(),
            highpass.len(),
            sample_rate_hz
        );
        Ok(Self {
            notch,
            lowpass,
            highpass,
        })
    }

    pub fn lowpass_sections(&self) -> usize {
        self.lowpass.len()
    }

    pub fn highpass_sections(&self) -> usize {
        self.highpass.len()
    }

    pub fn has_notch(&self) -> bool {
        self.notch.is_some()
    }
}

/// Direct-Form-1 biquad whose history can be exported and restored.
#[derive(Debug, Clone, Copy)]
pub struct Section {
    coeffs: Coefficients<f32>,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl Section {
    pub fn new(coeffs: Coefficients<f32>) -> Self {
        Self {
            coeffs,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    pub fn coefficients(&self) -> [f32; SECTION_COEFFICIENTS] {
        let c = &self.coeffs;
        [c.b0, c.b1, c.b2, c.a1, c.a2]
    }

    pub fn history(&self) -> [f32; SECTION_HISTORY] {
        [self.x1, self.x2, self.y1, self.y2]
    }

    pub fn set_history(&mut self, [x1, x2, y1, y2]: [f32; SECTION_HISTORY]) {
        self.x1 = x1;
        self.x2 = x2;
        self.y1 = y1;
        self.y2 = y2;
    }
}

impl Biquad<f32> for Section {
    #[inline]
    fn run(&mut self, input: f32) -> f32 {
        let c = &self.coeffs;
        let out = c.b0 * input + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = input;
        self.y2 = self.y1;
        self.y1 = out;
        out
    }

    fn update_coefficients(&mut self, new_coefficients: Coefficients<f32>) {
        self.coeffs = new_coefficients;
    }

    fn replace_coefficients(&mut self, new_coefficients: Coefficients<f32>) -> Coefficients<f32> {
        std::mem::replace(&mut self.coeffs, new_coefficients)
    }

    fn reset_state(&mut self) {
        self.set_history([0.0; SECTION_HISTORY]);
    }
}

/// Up to [`MAX_SECTIONS`] Direct-Form-1 biquads in series. Unused slots hold identity
/// sections and are never run.
#[derive(Clone, Copy)]
pub struct Cascade {
    sections: [Section; MAX_SECTIONS],
    len: usize,
}

impl Cascade {
    pub fn new(coefficients: &[Coefficients<f32>]) -> Self {
        let mut sections = [Section::new(IDENTITY); MAX_SECTIONS];
        let len = coefficients.len().min(MAX_SECTIONS);
        for (section, c) in sections.iter_mut().zip(&coefficients[..len]) {
            *section = Section::new(*c);
        }
        Self { sections, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn run(&mut self, input: f32) -> f32 {
        self.sections[..self.len]
            .iter_mut()
            .fold(input, |x, section| section.run(x))
    }

    pub fn reset(&mut self) {
        for section in &mut self.sections {
            section.reset_state();
        }
    }

    /// All slots, including the unused identity ones.
    pub fn sections(&self) -> &[Section; MAX_SECTIONS] {
        &self.sections
    }

    pub fn sections_mut(&mut self) -> &mut [Section; MAX_SECTIONS] {
        &mut self.sections
    }
}

/// Filter outputs for one input sample, in microvolts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilteredSample {
    pub wide: f32,
    pub low: f32,
    pub high: f32,
}

/// One channel's notch plus its two cascades, all fed from the notch output.
#[derive(Clone, Copy)]
pub struct ChannelFilters {
    /// Identity when the notch is off.
    notch: Section,
    has_notch: bool,
    lowpass: Cascade,
    highpass: Cascade,
}

impl ChannelFilters {
    pub fn new(plan: &FilterPlan) -> Self {
        Self {
            notch: Section::new(plan.notch.unwrap_or(IDENTITY)),
            has_notch: plan.notch.is_some(),
            lowpass: Cascade::new(&plan.lowpass),
            highpass: Cascade::new(&plan.highpass),
        }
    }

    #[inline]
    pub fn run(&mut self, microvolts: f32) -> FilteredSample {
        let wide = if self.has_notch {
            self.notch.run(microvolts)
        } else {
            microvolts
        };
        FilteredSample {
            wide,
            low: self.lowpass.run(wide),
            high: self.highpass.run(wide),
        }
    }

    pub fn reset(&mut self) {
        self.notch.reset_state();
        self.lowpass.reset();
        self.highpass.reset();
    }

    pub fn has_notch(&self) -> bool {
        self.has_notch
    }

    pub fn lowpass_len(&self) -> usize {
        self.lowpass.len()
    }

    pub fn highpass_len(&self) -> usize {
        self.highpass.len()
    }

    fn slots(&self) -> impl Iterator<Item = &Section> {
        std::iter::once(&self.notch)
            .chain(self.lowpass.sections())
            .chain(self.highpass.sections())
    }

    fn slots_mut(&mut self) -> impl Iterator<Item = &mut Section> {
        std::iter::once(&mut self.notch)
            .chain(self.lowpass.sections_mut())
            .chain(self.highpass.sections_mut())
    }

    /// Writes `CHANNEL_SECTIONS * SECTION_COEFFICIENTS` values in slot order.
    pub fn export_coefficients(&self, out: &mut [f32]) {
        for (section, dst) in self.slots().zip(out.chunks_exact_mut(SECTION_COEFFICIENTS)) {
            dst.copy_from_slice(&section.coefficients());
        }
    }

    /// Writes `CHANNEL_SECTIONS * SECTION_HISTORY` values in slot order.
    pub fn export_history(&self, out: &mut [f32]) {
        for (section, dst) in self.slots().zip(out.chunks_exact_mut(SECTION_HISTORY)) {
            dst.copy_from_slice(&section.history());
        }
    }

    /// Restores history written by [`ChannelFilters::export_history`].
    pub fn import_history(&mut self, from: &[f32]) {
        for (section, src) in self.slots_mut().zip(from.chunks_exact(SECTION_HISTORY)) {
            section.set_history([src[0], src[1], src[2], src[3]]);
        }
    }
}
