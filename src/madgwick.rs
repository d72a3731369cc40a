//! # Madgwick orientation filters
//! Gradient descent orientation filters from
//! https://www.x-io.co.uk/res/doc/madgwick_internal_report.pdf
//!
//! `imu_update` corrects gyro drift with gravity only. `marg_update` also uses the magnetic field
//! and so can hold yaw, which is only worth doing once the magnetometer is calibrated.
//!
//! Initial Q for a system is 1,0,0,0

use crate::{Q, V};

// gyroscope measurement error in rad/s (shown as 5 deg/s)
const GYRO_MEAS_ERROR: f32 = std::f32::consts::PI * (5.0 / 180.0);
// gyroscope measurement drift in rad/s/s (shown as 0.2 deg/s/s)
const GYRO_MEAS_DRIFT: f32 = std::f32::consts::PI * (0.2 / 180.0);

/// Filter gains. `beta` weighs the gradient step against the gyro, `zeta` the gyro bias drift.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Gains {
    pub beta: f32,
    pub zeta: f32,
}

impl Gains {
    /// Gains from gyro error in rad/s and gyro drift in rad/s/s.
    pub fn from_gyro_error(meas_error: f32, meas_drift: f32) -> Self {
        let k = (3_f32 / 4_f32).sqrt();
        Gains {
            beta: k * meas_error,
            zeta: k * meas_drift,
        }
    }
}

impl Default for Gains {
    fn default() -> Self {
        Gains::from_gyro_error(GYRO_MEAS_ERROR, GYRO_MEAS_DRIFT)
    }
}

/// Earth flux reference and gyro bias carried between MARG updates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MargMeta {
    pub b_x: f32,
    pub b_z: f32,
    pub gyro_bias: V,
}

impl Default for MargMeta {
    fn default() -> Self {
        MargMeta {
            b_x: 1.0,
            b_z: 0.0,
            gyro_bias: V::ZERO,
        }
    }
}

/// J^T f for a stacked objective.
fn jacobian_t_f(rows: &[[f32; 4]], f: &[f32]) -> [f32; 4] {
    let mut g = [0.0; 4];
    for (row, &fi) in rows.iter().zip(f) {
        for (gj, &jij) in g.iter_mut().zip(row) {
            *gj += jij * fi;
        }
    }
    g
}

/// Gradient of the gravity objective for unit accel `a`.
fn gravity_gradient(q: Q, a: V) -> [f32; 4] {
    let Q { w, x, y, z } = q;
    let f = [
        2.0 * (x * z - w * y) - a.x,
        2.0 * (w * x + y * z) - a.y,
        1.0 - 2.0 * (x * x + y * y) - a.z,
    ];
    let j = [
        [-2.0 * y, 2.0 * z, -2.0 * w, 2.0 * x],
        [2.0 * x, 2.0 * w, 2.0 * z, 2.0 * y],
        [0.0, -4.0 * x, -4.0 * y, 0.0],
    ];
    jacobian_t_f(&j, &f)
}

/// Gradient of the magnetic objective for unit field `m` against the flux reference.
fn flux_gradient(q: Q, m: V, b_x: f32, b_z: f32) -> [f32; 4] {
    let Q { w, x, y, z } = q;
    let f = [
        2.0 * b_x * (0.5 - y * y - z * z) + 2.0 * b_z * (x * z - w * y) - m.x,
        2.0 * b_x * (x * y - w * z) + 2.0 * b_z * (w * x + y * z) - m.y,
        2.0 * b_x * (w * y + x * z) + 2.0 * b_z * (0.5 - x * x - y * y) - m.z,
    ];
    let j = [
        [
            -2.0 * b_z * y,
            2.0 * b_z * z,
            -4.0 * b_x * y - 2.0 * b_z * w,
            -4.0 * b_x * z + 2.0 * b_z * x,
        ],
        [
            -2.0 * b_x * z + 2.0 * b_z * x,
            2.0 * b_x * y + 2.0 * b_z * w,
            2.0 * b_x * x + 2.0 * b_z * z,
            -2.0 * b_x * w + 2.0 * b_z * y,
        ],
        [
            2.0 * b_x * y,
            2.0 * b_x * z - 4.0 * b_z * x,
            2.0 * b_x * w - 4.0 * b_z * y,
            2.0 * b_x * x,
        ],
    ];
    jacobian_t_f(&j, &f)
}

fn normalize4(g: [f32; 4]) -> [f32; 4] {
    let norm = g.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return [0.0; 4];
    }
    [g[0] / norm, g[1] / norm, g[2] / norm, g[3] / norm]
}

/// Quaternion rate from body angular rate `w`.
fn omega_rate(q: Q, w: V) -> [f32; 4] {
    let h = Q::new(0.5 * q.w, 0.5 * q.x, 0.5 * q.y, 0.5 * q.z);
    [
        -h.x * w.x - h.y * w.y - h.z * w.z,
        h.w * w.x + h.y * w.z - h.z * w.y,
        h.w * w.y - h.x * w.z + h.z * w.x,
        h.w * w.z + h.x * w.y - h.y * w.x,
    ]
}

fn integrate(q: Q, rate: [f32; 4], step: [f32; 4], beta: f32, dt: f32) -> Q {
    Q::new(
        q.w + (rate[0] - beta * step[0]) * dt,
        q.x + (rate[1] - beta * step[1]) * dt,
        q.y + (rate[2] - beta * step[2]) * dt,
        q.z + (rate[3] - beta * step[3]) * dt,
    )
    .normalized()
}

/// One gyro + accel step.
///
/// - w: gyroscope measurements in rad/s
/// - a: accelerometer measurements, any unit
/// - q: current orientation
/// - dt: sampling period in seconds
pub fn imu_update(w: V, a: V, q: Q, dt: f32, gains: Gains) -> Q {
    let step = match a.normalized() {
        Some(a) => normalize4(gravity_gradient(q, a)),
        None => [0.0; 4],
    };
    integrate(q, omega_rate(q, w), step, gains.beta, dt)
}

/// One gyro + accel + mag step. Falls back to `imu_update` when the field reading is zero.
pub fn marg_update(
    w: V,
    a: V,
    m: V,
    q: Q,
    dt: f32,
    meta: MargMeta,
    gains: Gains,
) -> (Q, MargMeta) {
    let (a, m) = match (a.normalized(), m.normalized()) {
        (Some(a), Some(m)) => (a, m),
        _ => return (imu_update(w, a, q, dt, gains), meta),
    };

    let g = gravity_gradient(q, a);
    let b = flux_gradient(q, m, meta.b_x, meta.b_z);
    let step = normalize4([g[0] + b[0], g[1] + b[1], g[2] + b[2], g[3] + b[3]]);

    // direction of the gyro error, integrated into the bias estimate
    let Q { w: q0, x: q1, y: q2, z: q3 } = q;
    let w_err = V::new(
        2.0 * (q0 * step[1] - q1 * step[0] - q2 * step[3] + q3 * step[2]),
        2.0 * (q0 * step[2] + q1 * step[3] - q2 * step[0] - q3 * step[1]),
        2.0 * (q0 * step[3] - q1 * step[2] + q2 * step[1] - q3 * step[0]),
    );
    let gyro_bias = meta.gyro_bias + w_err * (dt * gains.zeta);

    let q = integrate(q, omega_rate(q, w - gyro_bias), step, gains.beta, dt);

    // earth frame flux, folded onto the x-z plane
    let h = q.rotate(m);
    let meta = MargMeta {
        b_x: (h.x * h.x + h.y * h.y).sqrt(),
        b_z: h.z,
        gyro_bias,
    };

    (q, meta)
}
