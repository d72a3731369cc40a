use thiserror::Error;

/// Errors raised while gathering samples or fitting the calibration sphere
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    /// Fewer than four samples have been accepted so far
    #[error("need {required} samples to calibrate, have {collected}")]
    InsufficientSamples { collected: usize, required: usize },
    /// The sample buffer already holds four samples
    #[error("sample buffer is full")]
    BufferFull,
    /// Finalizing was asked for outside an auto or manual calibration
    #[error("not collecting calibration samples")]
    NotCollecting,
    /// The four field samples are (nearly) coplanar so no unique sphere passes through them
    #[error("magnetometer samples are coplanar (determinant {determinant:e})")]
    DegenerateSamples { determinant: f64 },
}
