use crate::fetch::FetchError;
use crate::reference::ReferenceError;

#[cfg_attr(test, mockall::automock)]
pub trait PageSource {
    /// Fetch the device page body. A single bounded attempt, no retry.
    fn fetch(&self) -> Result<String, FetchError>;
}

#[cfg_attr(test, mockall::automock)]
pub trait ReferenceTime {
    /// Current reference time in Unix seconds.
    fn now(&mut self) -> Result<f64, ReferenceError>;
}

#[cfg_attr(test, mockall::automock)]
pub trait OffsetSource {
    /// Measures the offset to apply to the local clock (Local + Offset = Reference), in seconds.
    /// Positive offset means the local clock is behind.
    fn query_offset(&self) -> Result<f64, ReferenceError>;
}
