use std::f32::consts::PI;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use super::SyntheticConfig;
use crate::frame::{FrameLayout, FrameSamples};
use crate::source::SourceError;
use crate::units;

/// Produces frames of neural-like signal: background noise, line hum and
/// sparse extracellular spikes, plus a sine on ADC 0 and a pulse train on digital line 0.
#[derive(Debug, Clone)]
pub struct SignalGenerator {
    layout: FrameLayout,
    sample_rate: f32,
    config: SyntheticConfig,
    rng: StdRng,
    noise: Normal<f32>,
    /// Per amplifier, position within the spike template while one is playing.
    spike_cursor: Vec<Option<usize>>,
    line_phase: Vec<f32>,
    template: Vec<f32>,
    frame_index: u64,
    frame: FrameSamples,
}

fn spike_template(sample_rate: f32, amplitude_uv: f32) -> Vec<f32> {
    // Biphasic extracellular shape over 1.5 ms: sharp trough, slower rebound.
    let len = ((1.5e-3 * sample_rate).round() as usize).max(4);
    (0..len)
        .map(|i| {
            let t_ms = i as f32 * 1000.0 / sample_rate;
            let trough = (-((t_ms - 0.3) / 0.1).powi(2)).exp();
            let rebound = 0.35 * (-((t_ms - 0.75) / 0.25).powi(2)).exp();
            amplitude_uv * (rebound - trough)
        })
        .collect()
}

impl SignalGenerator {
    pub fn new(
        layout: FrameLayout,
        sample_rate: f32,
        config: SyntheticConfig,
    ) -> Result<Self, SourceError> {
        let noise = Normal::new(0.0, config.noise_uv).map_err(|e| {
            SourceError::ConfigurationError(format!("noise_uv {}: {}", config.noise_uv, e))
        })?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let amplifiers = layout.channels_per_stream() * layout.num_streams();
        let line_phase = (0..amplifiers).map(|_| rng.gen::<f32>() * 2.0 * PI).collect();
        debug!(
            "Synthetic generator: {} amplifiers at {} Hz, seed {}",
            amplifiers, sample_rate, config.seed
        );
        Ok(Self {
            layout,
            sample_rate,
            template: spike_template(sample_rate, config.spike_amplitude_uv),
            config,
            rng,
            noise,
            spike_cursor: vec![None; amplifiers],
            line_phase,
            frame_index: 0,
            frame: FrameSamples::new(&layout),
        })
    }

    /// Advances one frame and returns it.
    pub fn next_frame(&mut self) -> &FrameSamples {
        let t = self.frame_index as f32 / self.sample_rate;
        let spike_p = f64::from(self.config.spike_rate_hz / self.sample_rate);
        let hum = 2.0 * PI * self.config.line_hz * t;

        for (i, code) in self.frame.amplifier.iter_mut().enumerate() {
            let mut uv = self.noise.sample(&mut self.rng)
                + self.config.line_noise_uv * (hum + self.line_phase[i]).sin();
            match self.spike_cursor[i] {
                Some(pos) => {
                    uv += self.template[pos];
                    self.spike_cursor[i] = (pos + 1 < self.template.len()).then(|| pos + 1);
                }
                None => {
                    if self.rng.gen_bool(spike_p.clamp(0.0, 1.0)) {
                        self.spike_cursor[i] = Some(0);
                    }
                }
            }
            *code = units::microvolts_to_amplifier_code(uv);
        }

        let streams = self.layout.num_streams();
        // Supply sensor sits on the last record aux slot.
        let supply = (3.3 / (units::SUPPLY_UV_PER_LSB * 1e-6)).round() as u16;
        let supply_slot = self.layout.aux_slots() - 1;
        for stream in 0..streams {
            self.frame.aux[supply_slot * streams + stream] = supply;
        }
        self.frame.dc_amplifier.iter_mut().for_each(|w| *w = 512);
        if self.layout.variant().has_stimulation() {
            self.frame.dac = [32768; 8];
        }

        let adc_v = (2.0 * PI * t).sin();
        self.frame.adc[0] = match self.layout.variant() {
            neuro_types::ControllerVariant::Usb2Record => {
                ((1.65 + adc_v) / (units::USB2_ADC_UV_PER_LSB * 1e-6)).round() as u16
            }
            _ => (32768.0 + adc_v / (units::ADC_UV_PER_LSB * 1e-6)).round() as u16,
        };

        let period = (self.config.trigger_period_s * f64::from(self.sample_rate)).max(1.0) as u64;
        let high = self.frame_index % period < period / 10;
        self.frame.digital_in.set(0, high);

        self.frame.timestamp = self.frame_index as u32;
        self.frame_index += 1;
        &self.frame
    }
}
