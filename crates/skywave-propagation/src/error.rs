use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PropagationError {
    #[error("invalid grid locator {0:?}: must be 4 or 6 characters")]
    InvalidLocatorLength(String),

    #[error("invalid grid locator {0:?}: field letters must be A-R")]
    InvalidField(String),

    #[error("invalid grid locator {0:?}: square characters must be digits")]
    InvalidSquare(String),

    #[error("invalid grid locator {0:?}: subsquare letters must be a-x")]
    InvalidSubsquare(String),

    #[error("latitude {0} out of range [-90, 90]")]
    LatitudeOutOfRange(f64),

    #[error("longitude {0} out of range [-180, 180]")]
    LongitudeOutOfRange(f64),
}
