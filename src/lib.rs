//! # Magnetometer hard-iron auto-calibration
//!
//! Picks four well spread (orientation, magnetic field) samples while the device is moved around
//! and fits the sphere through their field vectors. The sphere center is the hard-iron bias, which
//! is handed back to the sensor fusion as a translation to subtract from every raw reading.
//!
//! - `geometry`: closed form sphere center and point to plane distance
//! - `samples`: the four slot sample buffer and the acceptance policy guarding it
//! - `calibration`: the calibrator state machine
//! - `fusion`: the sensor fusion capability the calibrator talks to, plus a Madgwick backed one
//!
//! Vectors and quaternions are the plain `V` and `Q` structs below.

pub mod calibration;
pub mod config;
pub mod error;
pub mod fusion;
pub mod geometry;
pub mod madgwick;
pub mod samples;

use std::f32::consts::PI;
use std::ops::{Add, Mul, Neg, Sub};

pub use calibration::{CalibrationState, MagCalibration};
pub use error::CalibrationError;
pub use fusion::{MagCorrection, MagneticFusion, MargFusion};
pub use samples::{Sample, SampleBuffer, Thresholds};

/// Struct for a generic 3-axis vector like a magnetic field in the x, y and z direction.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[repr(C)]
pub struct V {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Struct for a quaternion
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(C)]
pub struct Q {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Default for Q {
    fn default() -> Self {
        Q {
            w: 1.0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Euler {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

impl V {
    pub const ZERO: V = V {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        V { x, y, z }
    }

    pub fn dot(self, other: V) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(self, other: V) -> V {
        V {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    pub fn length_sq(self) -> f32 {
        self.dot(self)
    }

    pub fn length(self) -> f32 {
        self.length_sq().sqrt()
    }

    /// Unit vector in the same direction, or `None` when the length is too small to divide by.
    pub fn normalized(self) -> Option<V> {
        let len = self.length();
        if len <= f32::EPSILON {
            return None;
        }
        Some(self * (1.0 / len))
    }
}

impl From<[f32; 3]> for V {
    fn from(a: [f32; 3]) -> Self {
        V {
            x: a[0],
            y: a[1],
            z: a[2],
        }
    }
}

impl Add for V {
    type Output = V;
    fn add(self, rhs: V) -> V {
        V::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for V {
    type Output = V;
    fn sub(self, rhs: V) -> V {
        V::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Neg for V {
    type Output = V;
    fn neg(self) -> V {
        V::new(-self.x, -self.y, -self.z)
    }
}

impl Mul<f32> for V {
    type Output = V;
    fn mul(self, s: f32) -> V {
        V::new(self.x * s, self.y * s, self.z * s)
    }
}

impl Q {
    pub fn new(w: f32, x: f32, y: f32, z: f32) -> Self {
        Q { w, x, y, z }
    }

    /// Rotation of `angle` radians about `axis`. The axis does not need to be normalized.
    pub fn from_axis_angle(axis: V, angle: f32) -> Self {
        let axis = match axis.normalized() {
            Some(a) => a,
            None => return Q::default(),
        };
        let (s, c) = (0.5 * angle).sin_cos();
        Q {
            w: c,
            x: axis.x * s,
            y: axis.y * s,
            z: axis.z * s,
        }
    }

    pub fn length_sq(self) -> f32 {
        self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z
    }

    pub fn normalized(self) -> Q {
        let norm = self.length_sq().sqrt();
        if norm <= f32::EPSILON {
            return Q::default();
        }
        Q {
            w: self.w / norm,
            x: self.x / norm,
            y: self.y / norm,
            z: self.z / norm,
        }
    }

    /// Squared 4D distance to `other`, taking the closer of `other` and `-other` since both
    /// describe the same rotation.
    pub fn distance_sq(self, other: Q) -> f32 {
        let diff = Q::new(
            self.w - other.w,
            self.x - other.x,
            self.y - other.y,
            self.z - other.z,
        );
        let sum = Q::new(
            self.w + other.w,
            self.x + other.x,
            self.y + other.y,
            self.z + other.z,
        );
        diff.length_sq().min(sum.length_sq())
    }

    /// Implemented from https://en.wikipedia.org/wiki/Rotation_matrix#Quaternion
    pub fn to_rotation_matrix(self) -> [[f32; 3]; 3] {
        let Q { w, x, y, z } = self;
        [
            [
                1.0 - 2.0 * (y * y + z * z),
                2.0 * (x * y - z * w),
                2.0 * (x * z + y * w),
            ],
            [
                2.0 * (x * y + z * w),
                1.0 - 2.0 * (x * x + z * z),
                2.0 * (y * z - x * w),
            ],
            [
                2.0 * (x * z - y * w),
                2.0 * (y * z + x * w),
                1.0 - 2.0 * (x * x + y * y),
            ],
        ]
    }

    /// Rotate `v` from the body frame into the reference frame.
    pub fn rotate(self, v: V) -> V {
        let m = self.to_rotation_matrix();
        V {
            x: m[0][0] * v.x + m[0][1] * v.y + m[0][2] * v.z,
            y: m[1][0] * v.x + m[1][1] * v.y + m[1][2] * v.z,
            z: m[2][0] * v.x + m[2][1] * v.y + m[2][2] * v.z,
        }
    }

    pub fn roll_pitch_yaw(self) -> Euler {
        let Q { w, x, y, z } = self;

        let test = x * y + z * w;
        // singularities at the poles
        if test > 0.499 {
            return Euler {
                roll: 0.0,
                pitch: 2.0 * x.atan2(w),
                yaw: PI / 2.0,
            };
        }
        if test < -0.499 {
            return Euler {
                roll: 0.0,
                pitch: -2.0 * x.atan2(w),
                yaw: -PI / 2.0,
            };
        }

        Euler {
            roll: (2.0 * x * w - 2.0 * y * z).atan2(1.0 - 2.0 * x * x - 2.0 * z * z),
            pitch: (2.0 * y * w - 2.0 * x * z).atan2(1.0 - 2.0 * y * y - 2.0 * z * z),
            yaw: (2.0 * test).asin(),
        }
    }
}

impl From<Q> for Euler {
    fn from(q: Q) -> Self {
        q.roll_pitch_yaw()
    }
}
