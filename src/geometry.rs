//! # Sphere fitting geometry
//!
//! Closed form helpers for the four point magnetometer calibration. The sphere center comes
//! straight out of Cramer's rule on the system
//!
//! ```text
//! |p|^2 = 2 c.p + k      for each of the four points p
//! ```
//!
//! which is why exactly four non-coplanar points are needed. Determinants are taken in f64.

use crate::error::CalibrationError;
use crate::V;

/// Relative tolerance on the coefficient determinant below which the points count as coplanar.
pub const DEGENERATE_EPSILON: f64 = 1e-9;

/// Determinant of a row-major 4x4 matrix by cofactor expansion over 2x2 minors.
pub fn det4(m: &[[f64; 4]; 4]) -> f64 {
    let s0 = m[0][0] * m[1][1] - m[1][0] * m[0][1];
    let s1 = m[0][0] * m[1][2] - m[1][0] * m[0][2];
    let s2 = m[0][0] * m[1][3] - m[1][0] * m[0][3];
    let s3 = m[0][1] * m[1][2] - m[1][1] * m[0][2];
    let s4 = m[0][1] * m[1][3] - m[1][1] * m[0][3];
    let s5 = m[0][2] * m[1][3] - m[1][2] * m[0][3];

    let c5 = m[2][2] * m[3][3] - m[3][2] * m[2][3];
    let c4 = m[2][1] * m[3][3] - m[3][1] * m[2][3];
    let c3 = m[2][1] * m[3][2] - m[3][1] * m[2][2];
    let c2 = m[2][0] * m[3][3] - m[3][0] * m[2][3];
    let c1 = m[2][0] * m[3][2] - m[3][0] * m[2][2];
    let c0 = m[2][0] * m[3][1] - m[3][0] * m[2][1];

    s0 * c5 - s1 * c4 + s2 * c3 + s3 * c2 - s4 * c1 + s5 * c0
}

/// Center of the unique sphere passing through `p1..p4`.
///
/// Fails with `DegenerateSamples` when the points are coplanar (or close enough that the
/// coefficient determinant vanishes relative to their spread), rather than dividing by it.
pub fn sphere_center(p1: V, p2: V, p3: V, p4: V) -> Result<V, CalibrationError> {
    let p = [p1, p2, p3, p4];
    let xyz = |v: V| [v.x as f64, v.y as f64, v.z as f64];
    let norm_sq = |v: V| {
        let [x, y, z] = xyz(v);
        x * x + y * y + z * z
    };

    // each minor replaces one column of [x y z 1] with |p|^2
    let minor = |columns: fn([f64; 3], f64) -> [f64; 4]| {
        let mut a = [[0.0; 4]; 4];
        for (row, &v) in a.iter_mut().zip(p.iter()) {
            *row = columns(xyz(v), norm_sq(v));
        }
        det4(&a)
    };

    let m11 = minor(|[x, y, z], _| [x, y, z, 1.0]);

    let spread = p[1..]
        .iter()
        .flat_map(|&v| xyz(v - p1).to_vec())
        .fold(0.0_f64, |acc, c| acc.max(c.abs()));
    if spread == 0.0 || m11.abs() <= DEGENERATE_EPSILON * spread.powi(3) {
        return Err(CalibrationError::DegenerateSamples { determinant: m11 });
    }

    let m12 = minor(|[_, y, z], n| [n, y, z, 1.0]);
    let m13 = minor(|[x, _, z], n| [n, x, z, 1.0]);
    let m14 = minor(|[x, y, _], n| [n, x, y, 1.0]);

    let c = 0.5 / m11;
    Ok(V {
        x: (c * m12) as f32,
        y: (-c * m13) as f32,
        z: (c * m14) as f32,
    })
}

/// Unsigned distance from `p4` to the plane through `p1`, `p2` and `p3`.
///
/// `None` when the three plane points are collinear and the normal cannot be normalized.
pub fn point_to_plane_distance(p1: V, p2: V, p3: V, p4: V) -> Option<f32> {
    let normal = (p1 - p2).cross(p1 - p3).normalized()?;
    Some((normal.dot(p4) - normal.dot(p1)).abs())
}
