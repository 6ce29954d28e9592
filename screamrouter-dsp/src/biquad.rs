//! Direct-form-I biquad filter, driven by the RBJ Audio EQ Cookbook coefficient
//! formulas. Coefficients are carried in `f64` for precision; sample I/O is `f32`.

use std::f64::consts::PI;

/// Filter response shapes supported by a single biquad stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    LowPass,
    HighPass,
    BandPass,
    Notch,
    Peak,
    LowShelf,
    HighShelf,
}

/// A single Direct-Form-I biquad section with its own delay line.
#[derive(Debug, Clone)]
pub struct Biquad {
    filter_type: FilterType,
    fc: f64,
    q: f64,
    peak_gain_db: f64,
    a0: f64,
    a1: f64,
    a2: f64,
    b1: f64,
    b2: f64,
    z1: f64,
    z2: f64,
}

impl Default for Biquad {
    fn default() -> Self {
        Self {
            filter_type: FilterType::LowPass,
            fc: 0.5,
            q: 0.707,
            peak_gain_db: 0.0,
            a0: 1.0,
            a1: 0.0,
            a2: 0.0,
            b1: 0.0,
            b2: 0.0,
            z1: 0.0,
            z2: 0.0,
        }
    }
}

impl Biquad {
    /// Build a filter. `fc` is the normalized center/cutoff frequency (cycles per sample,
    /// i.e. `hz / sample_rate`), not Hz.
    pub fn new(filter_type: FilterType, fc: f64, q: f64, peak_gain_db: f64) -> Self {
        let mut bq = Self {
            filter_type,
            fc,
            q,
            peak_gain_db,
            ..Default::default()
        };
        bq.recalculate();
        bq
    }

    /// Convenience constructor taking a frequency in Hz plus the sample rate.
    pub fn from_hz(filter_type: FilterType, freq_hz: f64, sample_rate: f64, q: f64, peak_gain_db: f64) -> Self {
        Self::new(filter_type, freq_hz / sample_rate, q, peak_gain_db)
    }

    pub fn set_peak_gain(&mut self, peak_gain_db: f64) {
        self.peak_gain_db = peak_gain_db;
        self.recalculate();
    }

    pub fn set_fc(&mut self, fc: f64) {
        self.fc = fc;
        self.recalculate();
    }

    pub fn set_q(&mut self, q: f64) {
        self.q = q;
        self.recalculate();
    }

    /// Zero the delay line without touching the coefficients.
    pub fn flush(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }

    fn recalculate(&mut self) {
        let v = 10f64.powf(self.peak_gain_db.abs() / 20.0);
        let k = (PI * self.fc).tan();
        let q = self.q;

        match self.filter_type {
            FilterType::LowPass => {
                let norm = 1.0 / (1.0 + k / q + k * k);
                self.a0 = k * k * norm;
                self.a1 = 2.0 * self.a0;
                self.a2 = self.a0;
                self.b1 = 2.0 * (k * k - 1.0) * norm;
                self.b2 = (1.0 - k / q + k * k) * norm;
            }
            FilterType::HighPass => {
                let norm = 1.0 / (1.0 + k / q + k * k);
                self.a0 = norm;
                self.a1 = -2.0 * self.a0;
                self.a2 = self.a0;
                self.b1 = 2.0 * (k * k - 1.0) * norm;
                self.b2 = (1.0 - k / q + k * k) * norm;
            }
            FilterType::BandPass => {
                let norm = 1.0 / (1.0 + k / q + k * k);
                self.a0 = k / q * norm;
                self.a1 = 0.0;
                self.a2 = -self.a0;
                self.b1 = 2.0 * (k * k - 1.0) * norm;
                self.b2 = (1.0 - k / q + k * k) * norm;
            }
            FilterType::Notch => {
                let norm = 1.0 / (1.0 + k / q + k * k);
                self.a0 = (1.0 + k * k) * norm;
                self.a1 = 2.0 * (k * k - 1.0) * norm;
                self.a2 = self.a0;
                self.b1 = self.a1;
                self.b2 = (1.0 - k / q + k * k) * norm;
            }
            FilterType::Peak => {
                if self.peak_gain_db >= 0.0 {
                    let norm = 1.0 / (1.0 + 1.0 / q * k + k * k);
                    self.a0 = (1.0 + v / q * k + k * k) * norm;
                    self.a1 = 2.0 * (k * k - 1.0) * norm;
                    self.a2 = (1.0 - v / q * k + k * k) * norm;
                    self.b1 = self.a1;
                    self.b2 = (1.0 - 1.0 / q * k + k * k) * norm;
                } else {
                    let norm = 1.0 / (1.0 + v / q * k + k * k);
                    self.a0 = (1.0 + 1.0 / q * k + k * k) * norm;
                    self.a1 = 2.0 * (k * k - 1.0) * norm;
                    self.a2 = (1.0 - 1.0 / q * k + k * k) * norm;
                    self.b1 = self.a1;
                    self.b2 = (1.0 - v / q * k + k * k) * norm;
                }
            }
            FilterType::LowShelf => {
                if self.peak_gain_db >= 0.0 {
                    let norm = 1.0 / (1.0 + 2f64.sqrt() * k + k * k);
                    self.a0 = (1.0 + (2.0 * v).sqrt() * k + v * k * k) * norm;
                    self.a1 = 2.0 * (v * k * k - 1.0) * norm;
                    self.a2 = (1.0 - (2.0 * v).sqrt() * k + v * k * k) * norm;
                    self.b1 = 2.0 * (k * k - 1.0) * norm;
                    self.b2 = (1.0 - 2f64.sqrt() * k + k * k) * norm;
                } else {
                    let norm = 1.0 / (1.0 + (2.0 * v).sqrt() * k + v * k * k);
                    self.a0 = (1.0 + 2f64.sqrt() * k + k * k) * norm;
                    self.a1 = 2.0 * (k * k - 1.0) * norm;
                    self.a2 = (1.0 - 2f64.sqrt() * k + k * k) * norm;
                    self.b1 = 2.0 * (v * k * k - 1.0) * norm;
                    self.b2 = (1.0 - (2.0 * v).sqrt() * k + v * k * k) * norm;
                }
            }
            FilterType::HighShelf => {
                if self.peak_gain_db >= 0.0 {
                    let norm = 1.0 / (1.0 + 2f64.sqrt() * k + k * k);
                    self.a0 = (v + (2.0 * v).sqrt() * k + k * k) * norm;
                    self.a1 = 2.0 * (k * k - v) * norm;
                    self.a2 = (v - (2.0 * v).sqrt() * k + k * k) * norm;
                    self.b1 = 2.0 * (k * k - 1.0) * norm;
                    self.b2 = (1.0 - 2f64.sqrt() * k + k * k) * norm;
                } else {
                    let norm = 1.0 / (v + (2.0 * v).sqrt() * k + k * k);
                    self.a0 = (1.0 + 2f64.sqrt() * k + k * k) * norm;
                    self.a1 = 2.0 * (k * k - 1.0) * norm;
                    self.a2 = (1.0 - 2f64.sqrt() * k + k * k) * norm;
                    self.b1 = 2.0 * (k * k - v) * norm;
                    self.b2 = (v - (2.0 * v).sqrt() * k + k * k) * norm;
                }
            }
        }
    }

    /// Process a single sample, Direct Form I.
    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let input = input as f64;
        let out = input * self.a0 + self.z1;
        self.z1 = input * self.a1 + self.z2 - self.b1 * out;
        self.z2 = input * self.a2 - self.b2 * out;
        out as f32
    }

    pub fn process_block(&mut self, input: &[f32], output: &mut [f32]) {
        for (i, o) in input.iter().zip(output.iter_mut()) {
            *o = self.process(*i);
        }
    }
}
