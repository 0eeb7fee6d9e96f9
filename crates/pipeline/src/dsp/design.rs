//! Coefficient design for biquad sections.
//!
//! Higher orders are built from tabulated analog prototypes. Each prototype section
//! carries a cutoff scale relative to the -3 dB frequency of the whole cascade and,
//! for second-order sections, a Q. Odd orders start with one first-order section.

use std::f64::consts::PI;

use biquad::{Coefficients, ToHertz, Type};
use neuro_types::{FilterDesign, MAX_FILTER_ORDER};

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    LowPass,
    HighPass,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SectionShape {
    FirstOrder,
    SecondOrder { q: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrototypeSection {
    pub shape: SectionShape,
    pub scale: f64,
}

const fn fo(scale: f64) -> PrototypeSection {
    PrototypeSection {
        shape: SectionShape::FirstOrder,
        scale,
    }
}

const fn so(scale: f64, q: f32) -> PrototypeSection {
    PrototypeSection {
        shape: SectionShape::SecondOrder { q },
        scale,
    }
}

static BUTTERWORTH: [&[PrototypeSection]; MAX_FILTER_ORDER] = [
    &[fo(1.0)],
    &[so(1.0, 0.7071)],
    &[fo(1.0), so(1.0, 1.0)],
    &[so(1.0, 0.5412), so(1.0, 1.3065)],
    &[fo(1.0), so(1.0, 0.6180), so(1.0, 1.6180)],
    &[so(1.0, 0.5176), so(1.0, 0.7071), so(1.0, 1.9319)],
    &[fo(1.0), so(1.0, 0.5550), so(1.0, 0.8019), so(1.0, 2.2470)],
    &[so(1.0, 0.5098), so(1.0, 0.6013), so(1.0, 0.9000), so(1.0, 2.5629)],
];

static BESSEL: [&[PrototypeSection]; MAX_FILTER_ORDER] = [
    &[fo(1.0)],
    &[so(1.2736, 0.5773)],
    &[fo(1.3270), so(1.4524, 0.6910)],
    &[so(1.4192, 0.5219), so(1.5912, 0.8055)],
    &[fo(1.5069), so(1.5611, 0.5635), so(1.7607, 0.9165)],
    &[so(1.6060, 0.5103), so(1.6913, 0.6112), so(1.9071, 1.0234)],
    &[fo(1.6853), so(1.7174, 0.5324), so(1.8235, 0.6608), so(2.0507, 1.1262)],
    &[so(1.7837, 0.5060), so(1.8376, 0.5596), so(1.9591, 0.7109), so(2.1953, 1.2258)],
];

pub fn prototype(design: FilterDesign, order: usize) -> PipelineResult<&'static [PrototypeSection]> {
    if order == 0 || order > MAX_FILTER_ORDER {
        return Err(PipelineError::invalid_configuration(format!(
            "filter order {} outside 1..={}",
            order, MAX_FILTER_ORDER
        )));
    }
    Ok(match design {
        FilterDesign::Butterworth => BUTTERWORTH[order - 1],
        FilterDesign::Bessel => BESSEL[order - 1],
    })
}

/// Bilinear-transform first-order section, prewarped at `fc`.
pub fn first_order(band: Band, fc: f64, fs: f64) -> Coefficients<f32> {
    let k = (PI * fc / fs).tan();
    let norm = 1.0 / (1.0 + k);
    let (b0, b1) = match band {
        Band::LowPass => (k * norm, k * norm),
        Band::HighPass => (norm, -norm),
    };
    Coefficients {
        a1: ((k - 1.0) * norm) as f32,
        a2: 0.0,
        b0: b0 as f32,
        b1: b1 as f32,
        b2: 0.0,
    }
}

pub fn second_order(band: Band, fc: f64, q: f32, fs: f64) -> PipelineResult<Coefficients<f32>> {
    let kind = match band {
        Band::LowPass => Type::LowPass,
        Band::HighPass => Type::HighPass,
    };
    Coefficients::<f32>::from_params(kind, (fs as f32).hz(), (fc as f32).hz(), q).map_err(|e| {
        PipelineError::invalid_configuration(format!(
            "{:?} section at {} Hz (Q {}): {:?}",
            band, fc, q, e
        ))
    })
}

/// Fixed-Q notch whose -3 dB width is `bandwidth` Hz.
pub fn notch(f0: f64, bandwidth: f64, fs: f64) -> PipelineResult<Coefficients<f32>> {
    if bandwidth <= 0.0 {
        return Err(PipelineError::invalid_configuration(
            "notch bandwidth must be positive",
        ));
    }
    let q = (f0 / bandwidth) as f32;
    Coefficients::<f32>::from_params(Type::Notch, (fs as f32).hz(), (f0 as f32).hz(), q).map_err(
        |e| PipelineError::invalid_configuration(format!("notch at {} Hz: {:?}", f0, e)),
    )
}

/// Sections of an `order`-pole cascade with overall cutoff `fc`.
pub fn cascade(
    design: FilterDesign,
    band: Band,
    order: usize,
    fc: f64,
    fs: f64,
) -> PipelineResult<Vec<Coefficients<f32>>> {
    let nyquist = fs / 2.0;
    prototype(design, order)?
        .iter()
        .map(|section| {
            let section_fc = match band {
                Band::LowPass => fc * section.scale,
                Band::HighPass => fc / section.scale,
            };
            if section_fc <= 0.0 || section_fc >= nyquist {
                return Err(PipelineError::invalid_configuration(format!(
                    "{:?} {:?} order {} at {} Hz needs a {} Hz section, beyond Nyquist ({} Hz)",
                    design, band, order, fc, section_fc, nyquist
                )));
            }
            match section.shape {
                SectionShape::FirstOrder => Ok(first_order(band, section_fc, fs)),
                SectionShape::SecondOrder { q } => second_order(band, section_fc, q, fs),
            }
        })
        .collect()
}
