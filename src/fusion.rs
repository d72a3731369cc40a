//! Sensor fusion side of the calibration.
//!
//! The calibrator only needs four things from the fusion: the current orientation, the current
//! raw field, and a way to clear or install a magnetometer correction. `MagneticFusion` is that
//! seam. `MargFusion` is the Madgwick backed implementation the binary runs.

use tracing::debug;

use crate::madgwick::{self, Gains, MargMeta};
use crate::{Q, V};

/// What the calibrator consumes from, and hands back to, the sensor fusion.
pub trait MagneticFusion {
    /// Current orientation estimate.
    fn orientation(&self) -> Q;
    /// Latest raw magnetometer reading in the device frame.
    fn magnetometer(&self) -> V;
    /// Drop any installed correction so readings are raw again.
    fn clear_mag_calibration(&mut self);
    /// Install a correction applied to every raw reading from now on.
    fn set_mag_calibration(&mut self, correction: MagCorrection);
}

/// Row-major 4x4 affine transform applied to raw magnetometer readings.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MagCorrection {
    pub matrix: [[f32; 4]; 4],
}

impl MagCorrection {
    pub fn identity() -> Self {
        let mut matrix = [[0.0; 4]; 4];
        for (i, row) in matrix.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        MagCorrection { matrix }
    }

    /// Pure translation by `offset`.
    pub fn translation(offset: V) -> Self {
        let mut c = MagCorrection::identity();
        c.matrix[0][3] = offset.x;
        c.matrix[1][3] = offset.y;
        c.matrix[2][3] = offset.z;
        c
    }

    pub fn offset(&self) -> V {
        V::new(self.matrix[0][3], self.matrix[1][3], self.matrix[2][3])
    }

    pub fn apply(&self, raw: V) -> V {
        let m = &self.matrix;
        let row = |r: &[f32; 4]| r[0] * raw.x + r[1] * raw.y + r[2] * raw.z + r[3];
        V::new(row(&m[0]), row(&m[1]), row(&m[2]))
    }
}

impl Default for MagCorrection {
    fn default() -> Self {
        MagCorrection::identity()
    }
}

/// Madgwick fusion of gyro, accel and magnetometer.
///
/// Runs the gravity only filter until a magnetometer correction is installed, then switches to
/// the full MARG filter fed with corrected field readings.
#[derive(Debug)]
pub struct MargFusion {
    q: Q,
    meta: MargMeta,
    gains: Gains,
    raw_mag: V,
    correction: Option<MagCorrection>,
}

impl MargFusion {
    pub fn new(gains: Gains) -> Self {
        MargFusion {
            q: Q::default(),
            meta: MargMeta::default(),
            gains,
            raw_mag: V::ZERO,
            correction: None,
        }
    }

    /// Feed one set of readings taken `dt` seconds after the previous one.
    pub fn update(&mut self, gyro: V, accel: V, mag: V, dt: f32) -> Q {
        self.raw_mag = mag;
        match self.correction {
            Some(c) => {
                let mag = c.apply(mag);
                let (q, meta) =
                    madgwick::marg_update(gyro, accel, mag, self.q, dt, self.meta, self.gains);
                self.q = q;
                self.meta = meta;
            }
            None => {
                self.q = madgwick::imu_update(gyro, accel, self.q, dt, self.gains);
            }
        }
        self.q
    }

    pub fn has_mag_calibration(&self) -> bool {
        self.correction.is_some()
    }

    pub fn mag_calibration(&self) -> Option<MagCorrection> {
        self.correction
    }

    /// `raw` with the installed correction applied, if there is one.
    pub fn calibrated_mag_value(&self, raw: V) -> Option<V> {
        self.correction.map(|c| c.apply(raw))
    }

    /// Latest reading with the installed correction applied, if there is one.
    pub fn calibrated_magnetometer(&self) -> Option<V> {
        self.calibrated_mag_value(self.raw_mag)
    }

    /// Back to the identity orientation with a fresh flux reference. The correction is kept.
    pub fn reset(&mut self) {
        self.q = Q::default();
        self.meta = MargMeta::default();
    }
}

impl Default for MargFusion {
    fn default() -> Self {
        MargFusion::new(Gains::default())
    }
}

impl MagneticFusion for MargFusion {
    fn orientation(&self) -> Q {
        self.q
    }

    fn magnetometer(&self) -> V {
        self.raw_mag
    }

    fn clear_mag_calibration(&mut self) {
        self.correction = None;
        self.meta = MargMeta::default();
        debug!("magnetometer correction cleared");
    }

    fn set_mag_calibration(&mut self, correction: MagCorrection) {
        let offset = correction.offset();
        self.correction = Some(correction);
        debug!(
            offset_x = offset.x,
            offset_y = offset.y,
            offset_z = offset.z,
            "magnetometer correction installed"
        );
    }
}
