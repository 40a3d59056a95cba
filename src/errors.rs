use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistBoostError {
    #[error("Length mismatch for {0}, expected {1}, found {2}.")]
    MismatchedLength(String, usize, usize),
    #[error("Invalid label {0} found at index {1}: {2}")]
    InvalidLabel(f64, usize, String),
    #[error("Invalid sample weight {0} found at index {1}.")]
    InvalidWeight(f64, usize),
    #[error("Feature index {0} is out of range for data with {1} columns.")]
    InvalidFeatureIndex(usize, usize),
    #[error("No records were provided for {0}.")]
    EmptyData(String),
    #[error("Invalid parameter value: {0}")]
    Configuration(String),
    #[error("Unsupported objective {0}.")]
    UnsupportedLoss(String),
    #[error("Unsupported metric {0}.")]
    UnsupportedMetric(String),
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Unable to write model to file: {0}")]
    UnableToWrite(String),
    #[error("Unable to read model from file: {0}")]
    UnableToRead(String),
}

/// Failures raised by a histogram compute device.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceError {
    #[error("No device {1} found on platform {0}.")]
    NotFound(usize, usize),
    #[error("Device out of memory, requested {0} bytes with {1} bytes available.")]
    OutOfMemory(usize, usize),
    #[error("Feature data has not been uploaded to the device.")]
    FeaturesNotUploaded,
    #[error("Gradient buffer has not been uploaded to the device.")]
    GradientsNotUploaded,
    #[error("Kernel launch failed: {0}")]
    LaunchFailed(String),
    #[error("Device does not support {0}.")]
    Unsupported(String),
}
