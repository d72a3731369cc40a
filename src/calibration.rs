//! # Magnetometer auto-calibration
//!
//! Hard-iron distortion shifts every raw field reading by the same bias, so while the device is
//! turned the readings trace a sphere centered on that bias instead of the origin. Four readings
//! pin the sphere down. `MagCalibration` collects them as the device moves, fits the sphere and
//! hands `-center` back to the sensor fusion as a translation.
//!
//! Reference: https://teslabs.com/articles/magnetometer-calibration/
//!
//! Soft-iron (scale and skew) distortion is not handled.

use tracing::{debug, info, trace, warn};

use crate::error::CalibrationError;
use crate::fusion::{MagCorrection, MagneticFusion};
use crate::geometry::sphere_center;
use crate::samples::{Sample, SampleBuffer, Thresholds, SAMPLE_CAPACITY};
use crate::{Q, V};

/// Where the calibration is. The fitted center only exists once calibrated.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CalibrationState {
    Uncalibrated,
    AutoCalibrating,
    ManuallyCalibrating,
    Calibrated { center: V },
}

impl CalibrationState {
    /// Collecting samples, either automatically or under manual control.
    pub fn is_collecting(&self) -> bool {
        matches!(
            self,
            CalibrationState::AutoCalibrating | CalibrationState::ManuallyCalibrating
        )
    }
}

impl Default for CalibrationState {
    fn default() -> Self {
        CalibrationState::Uncalibrated
    }
}

#[derive(Clone, Debug, Default)]
pub struct MagCalibration {
    state: CalibrationState,
    samples: SampleBuffer,
    thresholds: Thresholds,
}

impl MagCalibration {
    pub fn new(thresholds: Thresholds) -> Self {
        MagCalibration {
            state: CalibrationState::Uncalibrated,
            samples: SampleBuffer::new(),
            thresholds,
        }
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn samples(&self) -> &SampleBuffer {
        &self.samples
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn is_calibrated(&self) -> bool {
        matches!(self.state, CalibrationState::Calibrated { .. })
    }

    pub fn is_auto_calibrating(&self) -> bool {
        self.state == CalibrationState::AutoCalibrating
    }

    pub fn is_manually_calibrating(&self) -> bool {
        self.state == CalibrationState::ManuallyCalibrating
    }

    /// Fitted hard-iron bias, once calibrated.
    pub fn mag_center(&self) -> Option<V> {
        match self.state {
            CalibrationState::Calibrated { center } => Some(center),
            _ => None,
        }
    }

    /// Start collecting from scratch. Any correction the fusion holds is cleared first so new
    /// readings are raw.
    pub fn begin_auto_calibration<F: MagneticFusion>(&mut self, fusion: &mut F) {
        self.restart(CalibrationState::AutoCalibrating, fusion);
    }

    /// As `begin_auto_calibration`, but samples are fed through `insert_if_acceptable` and the
    /// caller decides when to `finalize`.
    pub fn begin_manual_calibration<F: MagneticFusion>(&mut self, fusion: &mut F) {
        self.restart(CalibrationState::ManuallyCalibrating, fusion);
    }

    fn restart<F: MagneticFusion>(&mut self, state: CalibrationState, fusion: &mut F) {
        self.state = state;
        fusion.clear_mag_calibration();
        self.samples.clear();
        info!(?state, "magnetometer calibration started");
    }

    /// Offer the fusion's current reading to the buffer, calibrating as soon as the fourth one is
    /// accepted. Does nothing unless auto calibrating. Call once per fusion update.
    pub fn update_auto_calibration<F: MagneticFusion>(
        &mut self,
        fusion: &mut F,
    ) -> CalibrationState {
        if self.state != CalibrationState::AutoCalibrating {
            return self.state;
        }

        let q = fusion.orientation();
        let m = fusion.magnetometer();
        if !self.insert_if_acceptable(q, m) || !self.samples.is_full() {
            return self.state;
        }

        if let Err(err) = self.finalize(fusion) {
            // a near-coplanar set slipped past the plane test; keep the first three and go on
            warn!(%err, "discarding last magnetometer sample");
            self.samples.pop();
        }
        self.state
    }

    /// Add the sample if the acceptance policy allows it. Only while collecting.
    pub fn insert_if_acceptable(&mut self, orientation: Q, field: V) -> bool {
        if !self.state.is_collecting() {
            return false;
        }
        if !self.thresholds.is_acceptable(&self.samples, orientation, field) {
            trace!(count = self.samples.len(), "magnetometer sample rejected");
            return false;
        }
        if let Err(err) = self.samples.push(Sample::new(orientation, field)) {
            warn!(%err, "accepted magnetometer sample not stored");
            return false;
        }
        debug!(
            index = self.samples.len() - 1,
            x = field.x,
            y = field.y,
            z = field.z,
            "magnetometer sample accepted"
        );
        true
    }

    /// Fit the sphere through the four held fields and install `-center` as the fusion's
    /// correction. Leaves the state alone on failure.
    pub fn finalize<F: MagneticFusion>(&mut self, fusion: &mut F) -> Result<V, CalibrationError> {
        let insufficient = CalibrationError::InsufficientSamples {
            collected: self.samples.len(),
            required: SAMPLE_CAPACITY,
        };
        let [p1, p2, p3, p4] = self.samples.fields().ok_or(insufficient)?;
        if !self.state.is_collecting() {
            return Err(CalibrationError::NotCollecting);
        }

        let center = sphere_center(p1, p2, p3, p4)?;
        self.install(center, fusion);
        info!(
            center_x = center.x,
            center_y = center.y,
            center_z = center.z,
            radius = (p1 - center).length(),
            "magnetometer calibrated"
        );
        Ok(center)
    }

    /// Reuse a center from an earlier calibration without collecting samples.
    pub fn restore<F: MagneticFusion>(&mut self, center: V, fusion: &mut F) {
        self.samples.clear();
        self.install(center, fusion);
        info!(
            center_x = center.x,
            center_y = center.y,
            center_z = center.z,
            "magnetometer calibration restored"
        );
    }

    fn install<F: MagneticFusion>(&mut self, center: V, fusion: &mut F) {
        fusion.set_mag_calibration(MagCorrection::translation(-center));
        self.state = CalibrationState::Calibrated { center };
    }

    /// Forget the calibration and its samples, here and in the fusion.
    pub fn clear_calibration<F: MagneticFusion>(&mut self, fusion: &mut F) {
        self.state = CalibrationState::Uncalibrated;
        self.samples.clear();
        fusion.clear_mag_calibration();
    }

    /// Stop collecting. Whatever the fusion holds stays installed.
    pub fn abort_calibration(&mut self) {
        self.state = CalibrationState::Uncalibrated;
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Replays scripted readings, one per `advance`, and records what the calibrator installs.
    #[derive(Default)]
    struct FakeFusion {
        readings: Vec<(Q, V)>,
        cursor: usize,
        installed: Option<MagCorrection>,
        clears: usize,
    }

    impl FakeFusion {
        fn with(readings: &[(Q, V)]) -> Self {
            FakeFusion {
                readings: readings.to_vec(),
                ..Default::default()
            }
        }

        fn advance(&mut self) {
            if self.cursor + 1 < self.readings.len() {
                self.cursor += 1;
            }
        }

        fn current(&self) -> (Q, V) {
            self.readings
                .get(self.cursor)
                .copied()
                .unwrap_or((Q::default(), V::ZERO))
        }
    }

    impl MagneticFusion for FakeFusion {
        fn orientation(&self) -> Q {
            self.current().0
        }

        fn magnetometer(&self) -> V {
            self.current().1
        }

        fn clear_mag_calibration(&mut self) {
            self.installed = None;
            self.clears += 1;
        }

        fn set_mag_calibration(&mut self, correction: MagCorrection) {
            self.installed = Some(correction);
        }
    }

    fn v(x: f32, y: f32, z: f32) -> V {
        V::new(x, y, z)
    }

    fn about(axis: V, angle: f32) -> Q {
        Q::from_axis_angle(axis, angle)
    }

    /// Four pairwise distinct orientations paired with the unit tetrahedron.
    fn tetrahedron() -> Vec<(Q, V)> {
        vec![
            (Q::default(), v(1.0, 0.0, 0.0)),
            (about(v(0.0, 0.0, 1.0), 2.0), v(0.0, 1.0, 0.0)),
            (about(v(1.0, 0.0, 0.0), 2.0), v(0.0, 0.0, 1.0)),
            (about(v(0.0, 1.0, 0.0), 2.0), v(0.0, 0.0, 0.0)),
        ]
    }

    /// Drive one update per reading and return the state after each.
    fn run(
        cal: &mut MagCalibration,
        fusion: &mut FakeFusion,
        ticks: usize,
    ) -> Vec<CalibrationState> {
        (0..ticks)
            .map(|_| {
                let s = cal.update_auto_calibration(fusion);
                fusion.advance();
                s
            })
            .collect()
    }

    #[test]
    fn begin_auto_clears_buffer_and_fusion() {
        let mut fusion = FakeFusion::with(&tetrahedron());
        fusion.installed = Some(MagCorrection::translation(v(1.0, 1.0, 1.0)));
        let mut cal = MagCalibration::default();

        cal.begin_auto_calibration(&mut fusion);

        assert_eq!(cal.state(), CalibrationState::AutoCalibrating);
        assert_eq!(cal.sample_count(), 0);
        assert!(fusion.installed.is_none());
        assert_eq!(fusion.clears, 1);
    }

    #[test]
    fn calibrates_on_fourth_acceptable_sample() {
        let mut fusion = FakeFusion::with(&tetrahedron());
        let mut cal = MagCalibration::default();
        cal.begin_auto_calibration(&mut fusion);

        let states = run(&mut cal, &mut fusion, 4);
        assert!(states[..3]
            .iter()
            .all(|s| *s == CalibrationState::AutoCalibrating));
        assert!(matches!(states[3], CalibrationState::Calibrated { .. }));

        let center = cal.mag_center().unwrap();
        assert_relative_eq!(center.x, 0.5, epsilon = 1e-5);
        assert_relative_eq!(center.y, 0.5, epsilon = 1e-5);
        assert_relative_eq!(center.z, 0.5, epsilon = 1e-5);

        let offset = fusion.installed.unwrap().offset();
        assert_relative_eq!(offset.x, -0.5, epsilon = 1e-5);
        assert_relative_eq!(offset.y, -0.5, epsilon = 1e-5);
        assert_relative_eq!(offset.z, -0.5, epsilon = 1e-5);
    }

    #[test]
    fn repeated_readings_do_not_count() {
        let t = tetrahedron();
        // device held still between the useful readings
        let readings = vec![t[0], t[0], t[1], t[1], t[1], t[2], t[2], t[3]];
        let mut fusion = FakeFusion::with(&readings);
        let mut cal = MagCalibration::default();
        cal.begin_auto_calibration(&mut fusion);

        let states = run(&mut cal, &mut fusion, readings.len());
        let first_calibrated = states
            .iter()
            .position(|s| matches!(s, CalibrationState::Calibrated { .. }));
        assert_eq!(first_calibrated, Some(readings.len() - 1));
    }

    #[test]
    fn coplanar_fourth_reading_is_skipped() {
        let readings = vec![
            (Q::default(), v(0.0, 0.0, 0.0)),
            (about(v(0.0, 0.0, 1.0), 2.0), v(1.0, 0.0, 0.0)),
            (about(v(1.0, 0.0, 0.0), 2.0), v(0.0, 1.0, 0.0)),
            (about(v(0.0, 1.0, 0.0), 2.0), v(0.5, 0.5, 0.0)),
        ];
        let mut fusion = FakeFusion::with(&readings);
        let mut cal = MagCalibration::default();
        cal.begin_auto_calibration(&mut fusion);

        let states = run(&mut cal, &mut fusion, 4);
        assert_eq!(states[3], CalibrationState::AutoCalibrating);
        assert_eq!(cal.sample_count(), 3);
        assert!(fusion.installed.is_none());
    }

    #[test]
    fn near_coplanar_fit_drops_last_sample_and_keeps_collecting() {
        // the fourth field clears the plane test but the first three are almost collinear,
        // so the sphere fit refuses them
        let t = tetrahedron();
        let readings = vec![
            (t[0].0, v(0.0, 0.0, 0.0)),
            (t[1].0, v(10.0, 0.0, 0.0)),
            (t[2].0, v(20.0, 2e-8, 0.0)),
            (t[3].0, v(0.0, 0.0, 1.0)),
        ];
        let mut fusion = FakeFusion::with(&readings);
        let mut cal = MagCalibration::default();
        cal.begin_auto_calibration(&mut fusion);

        let states = run(&mut cal, &mut fusion, 4);
        assert!(states
            .iter()
            .all(|s| *s == CalibrationState::AutoCalibrating));
        assert_eq!(cal.sample_count(), 3);
        assert_eq!(cal.samples().get(2).unwrap().field, v(20.0, 2e-8, 0.0));
        assert!(fusion.installed.is_none());
    }

    #[test]
    fn clear_after_calibration_drops_samples() {
        let mut fusion = FakeFusion::with(&tetrahedron());
        let mut cal = MagCalibration::default();
        cal.begin_auto_calibration(&mut fusion);
        run(&mut cal, &mut fusion, 4);
        assert!(cal.is_calibrated());
        assert_eq!(cal.sample_count(), 4);

        cal.clear_calibration(&mut fusion);
        assert_eq!(cal.state(), CalibrationState::Uncalibrated);
        assert_eq!(cal.sample_count(), 0);
        assert!(cal.samples().is_empty());
        assert!(fusion.installed.is_none());
    }

    #[test]
    fn calibrated_ignores_further_updates() {
        let mut fusion = FakeFusion::with(&tetrahedron());
        let mut cal = MagCalibration::default();
        cal.begin_auto_calibration(&mut fusion);
        run(&mut cal, &mut fusion, 4);
        let center = cal.mag_center().unwrap();

        fusion.readings.push((about(v(1.0, 1.0, 0.0), 2.5), v(3.0, -2.0, 1.0)));
        fusion.advance();
        let state = cal.update_auto_calibration(&mut fusion);

        assert_eq!(state, CalibrationState::Calibrated { center });
        assert_eq!(cal.sample_count(), 4);
    }

    #[test]
    fn update_outside_auto_is_a_no_op() {
        let mut fusion = FakeFusion::with(&tetrahedron());
        let mut cal = MagCalibration::default();
        assert_eq!(
            cal.update_auto_calibration(&mut fusion),
            CalibrationState::Uncalibrated
        );
        assert_eq!(cal.sample_count(), 0);

        cal.begin_manual_calibration(&mut fusion);
        assert_eq!(
            cal.update_auto_calibration(&mut fusion),
            CalibrationState::ManuallyCalibrating
        );
        assert_eq!(cal.sample_count(), 0);
    }

    #[test]
    fn finalize_needs_four_samples() {
        let mut fusion = FakeFusion::default();
        let mut cal = MagCalibration::default();

        let err = cal.finalize(&mut fusion).unwrap_err();
        assert_eq!(
            err,
            CalibrationError::InsufficientSamples {
                collected: 0,
                required: 4
            }
        );
        assert_eq!(cal.state(), CalibrationState::Uncalibrated);
        assert!(fusion.installed.is_none());
    }

    #[test]
    fn manual_flow_feeds_samples_and_finalizes() {
        let mut fusion = FakeFusion::default();
        let mut cal = MagCalibration::default();
        assert!(!cal.insert_if_acceptable(Q::default(), v(1.0, 0.0, 0.0)));

        cal.begin_manual_calibration(&mut fusion);
        assert!(cal.is_manually_calibrating());
        for (q, m) in tetrahedron() {
            assert!(cal.insert_if_acceptable(q, m));
        }
        assert_eq!(cal.state(), CalibrationState::ManuallyCalibrating);
        // a full buffer takes nothing more
        assert!(!cal.insert_if_acceptable(about(v(1.0, 1.0, 0.0), 2.5), v(3.0, -2.0, 1.0)));
        assert_eq!(cal.sample_count(), 4);

        let center = cal.finalize(&mut fusion).unwrap();
        assert!(cal.is_calibrated());
        assert_relative_eq!(center.y, 0.5, epsilon = 1e-5);
        assert!(fusion.installed.is_some());

        // a second finalize on the same samples is refused
        assert_eq!(cal.finalize(&mut fusion), Err(CalibrationError::NotCollecting));
    }

    #[test]
    fn restart_after_calibration_starts_over() {
        let mut fusion = FakeFusion::with(&tetrahedron());
        let mut cal = MagCalibration::default();
        cal.begin_auto_calibration(&mut fusion);
        run(&mut cal, &mut fusion, 4);
        assert!(cal.is_calibrated());

        cal.begin_auto_calibration(&mut fusion);
        assert!(cal.is_auto_calibrating());
        assert_eq!(cal.sample_count(), 0);
        assert!(cal.mag_center().is_none());
        assert!(fusion.installed.is_none());
    }

    #[test]
    fn clear_abort_and_restore() {
        let mut fusion = FakeFusion::default();
        let mut cal = MagCalibration::default();

        cal.restore(v(0.1, 0.2, 0.3), &mut fusion);
        assert_eq!(cal.mag_center(), Some(v(0.1, 0.2, 0.3)));
        assert_eq!(fusion.installed.unwrap().offset(), v(-0.1, -0.2, -0.3));

        cal.clear_calibration(&mut fusion);
        assert_eq!(cal.state(), CalibrationState::Uncalibrated);
        assert!(fusion.installed.is_none());

        cal.begin_auto_calibration(&mut fusion);
        cal.insert_if_acceptable(Q::default(), V::ZERO);
        cal.abort_calibration();
        assert_eq!(cal.state(), CalibrationState::Uncalibrated);
        assert_eq!(cal.sample_count(), 0);
    }

    #[test]
    fn offset_sphere_is_recentered() {
        let bias = v(0.15, -0.25, 0.4);
        let r = 0.5;
        let readings = vec![
            (Q::default(), bias + v(r, 0.0, 0.0)),
            (about(v(0.0, 0.0, 1.0), 2.0), bias + v(0.0, r, 0.0)),
            (about(v(1.0, 0.0, 0.0), 2.0), bias + v(0.0, 0.0, -r)),
            (about(v(0.0, 1.0, 0.0), 2.0), bias + v(-r * 0.6, 0.0, r * 0.8)),
        ];
        let mut fusion = FakeFusion::with(&readings);
        let mut cal = MagCalibration::default();
        cal.begin_auto_calibration(&mut fusion);
        run(&mut cal, &mut fusion, 4);

        let correction = fusion.installed.unwrap();
        for (_, m) in readings {
            assert_relative_eq!(correction.apply(m).length(), r, epsilon = 1e-4);
        }
    }
}
