//! Sample buffer and acceptance policy for the four point sphere fit.
//!
//! A candidate only gets in if the device has visibly moved since every stored sample: its
//! orientation must be far enough from all of them and its field reading must be too. The
//! fourth sample must also lift the set out of a plane, otherwise the sphere fit is singular.

use crate::error::CalibrationError;
use crate::geometry::point_to_plane_distance;
use crate::{Q, V};

/// Number of samples a sphere fit needs.
pub const SAMPLE_CAPACITY: usize = 4;

/// Orientation and raw magnetometer reading taken at the same instant.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Sample {
    pub orientation: Q,
    pub field: V,
}

impl Sample {
    pub fn new(orientation: Q, field: V) -> Self {
        Sample { orientation, field }
    }
}

/// Minimum separations a candidate needs from the samples already held.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Thresholds {
    min_mag_distance: f32,
    min_mag_distance_sq: f32,
    min_quat_distance_sq: f32,
}

impl Thresholds {
    pub const DEFAULT_MIN_MAG_DISTANCE: f32 = 0.2;
    pub const DEFAULT_MIN_QUAT_DISTANCE: f32 = 0.5;

    /// `min_mag_distance` is in magnetometer units (gauss), `min_quat_distance` is the 4D
    /// distance between unit quaternions.
    pub fn new(min_mag_distance: f32, min_quat_distance: f32) -> Self {
        Thresholds {
            min_mag_distance,
            min_mag_distance_sq: min_mag_distance * min_mag_distance,
            min_quat_distance_sq: min_quat_distance * min_quat_distance,
        }
    }

    pub fn min_mag_distance(&self) -> f32 {
        self.min_mag_distance
    }

    pub fn min_mag_distance_sq(&self) -> f32 {
        self.min_mag_distance_sq
    }

    pub fn min_quat_distance_sq(&self) -> f32 {
        self.min_quat_distance_sq
    }

    /// Whether `candidate` is rotated far enough from every sample in `held`.
    pub fn orientation_distinct(&self, held: &[Sample], candidate: Q) -> bool {
        held.iter()
            .all(|s| candidate.distance_sq(s.orientation) > self.min_quat_distance_sq)
    }

    /// Whether `candidate` reads a field far enough from every sample in `held`.
    pub fn field_distinct(&self, held: &[Sample], candidate: V) -> bool {
        held.iter()
            .all(|s| (candidate - s.field).length_sq() > self.min_mag_distance_sq)
    }

    /// Whether `candidate` together with three held fields spans a volume. Each of the four
    /// points in turn is measured against the plane through the other three and one clear
    /// distance is enough. A collinear plane triple never passes.
    pub fn off_plane(&self, held: &[Sample; 3], candidate: V) -> bool {
        let [a, b, c] = [held[0].field, held[1].field, held[2].field];
        let m = candidate;
        [(a, b, c, m), (b, c, m, a), (c, m, a, b), (m, a, b, c)]
            .iter()
            .any(|&(p1, p2, p3, p4)| match point_to_plane_distance(p1, p2, p3, p4) {
                Some(d) => d > self.min_mag_distance,
                None => false,
            })
    }

    /// Acceptance policy, keyed on how many samples `buffer` already holds.
    pub fn is_acceptable(&self, buffer: &SampleBuffer, orientation: Q, field: V) -> bool {
        let held = buffer.samples();
        match held {
            [] => true,
            [_] | [_, _] => {
                self.orientation_distinct(held, orientation) && self.field_distinct(held, field)
            }
            [a, b, c] => {
                self.orientation_distinct(held, orientation) && self.off_plane(&[*a, *b, *c], field)
            }
            _ => false,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds::new(
            Thresholds::DEFAULT_MIN_MAG_DISTANCE,
            Thresholds::DEFAULT_MIN_QUAT_DISTANCE,
        )
    }
}

/// Fixed four slot store. Slot 0 is always the sample that seeded the set.
#[derive(Clone, Debug, Default)]
pub struct SampleBuffer {
    slots: [Sample; SAMPLE_CAPACITY],
    len: usize,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn push(&mut self, sample: Sample) -> Result<(), CalibrationError> {
        if self.is_full() {
            return Err(CalibrationError::BufferFull);
        }
        self.slots[self.len] = sample;
        self.len += 1;
        Ok(())
    }

    /// Drop the most recently pushed sample, if any.
    pub fn pop(&mut self) -> Option<Sample> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(self.slots[self.len])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == SAMPLE_CAPACITY
    }

    pub fn get(&self, index: usize) -> Option<&Sample> {
        self.samples().get(index)
    }

    /// The occupied slots, oldest first.
    pub fn samples(&self) -> &[Sample] {
        &self.slots[..self.len]
    }

    /// All four field readings once the buffer is full.
    pub fn fields(&self) -> Option<[V; SAMPLE_CAPACITY]> {
        if !self.is_full() {
            return None;
        }
        let s = &self.slots;
        Some([s[0].field, s[1].field, s[2].field, s[3].field])
    }
}
