//! Errors surfaced by the acquisition core

use crate::{
    calibration,
    dma,
    transport,
};
use thiserror::Error;

/// A configuration was rejected before any register was touched
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Decimation factor must be at least 1")]
    Decimation,
    #[error("Shot count must be at least 1")]
    ShotCount,
    #[error("Acquisition needs {required} bytes of device memory but only {capacity} exist")]
    MemoryOverflow { required: u64, capacity: u64 },
    #[error("Invalid input range code {0:#04x}")]
    Range(u32),
    #[error("Internal trigger channel {0} does not exist")]
    Channel(usize),
}

/// A hardware fault that ends the current acquisition sequence
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    #[error("DMA error (status {status:#x}), all acquisition lost")]
    Dma { status: u32 },
    #[error("Acquisition state machine is in the ILLEGAL state")]
    IllegalState,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("DMA resources unavailable")]
    Resource(#[source] dma::Error),
    #[error("Buffer back end could not provide a {0} byte block")]
    BlockAlloc(usize),
    #[error("Device fault")]
    DeviceFault(#[from] Fault),
    #[error("A DMA transfer is already in flight")]
    Busy,
    #[error("Software trigger is not enabled")]
    Permission,
    #[error("Invalid calibration access")]
    Calibration(#[source] calibration::Error),
    #[error(transparent)]
    Transport(#[from] transport::Error),
    #[error("A device fault is pending, stop the acquisition before starting a new one")]
    FaultPending,
}

impl Error {
    /// Whether this error ends the whole acquisition sequence rather than a single shot or call
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceFault(_))
    }
}

impl From<dma::Error> for Error {
    fn from(value: dma::Error) -> Self {
        match value {
            dma::Error::Transport(e) => Self::Transport(e),
            dma::Error::Busy => Self::Busy,
            other => Self::Resource(other),
        }
    }
}

impl From<calibration::Error> for Error {
    fn from(value: calibration::Error) -> Self {
        match value {
            calibration::Error::Transport(e) => Self::Transport(e),
            other => Self::Calibration(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_device_faults_are_fatal() {
        assert!(Error::from(Fault::IllegalState).is_fatal());
        assert!(Error::from(Fault::Dma { status: 4 }).is_fatal());
        assert!(!Error::Permission.is_fatal());
        assert!(!Error::from(ConfigError::Decimation).is_fatal());
        assert!(!Error::from(dma::Error::NoData).is_fatal());
        assert!(!Error::FaultPending.is_fatal());
    }

    #[test]
    fn test_transport_errors_are_not_resource_errors() {
        let e = Error::from(dma::Error::Transport(transport::Error::Bus(0x1000)));
        assert!(matches!(e, Error::Transport(transport::Error::Bus(0x1000))));
        assert!(matches!(Error::from(dma::Error::Busy), Error::Busy));
        assert!(matches!(
            Error::from(dma::Error::Map(0x10)),
            Error::Resource(dma::Error::Map(0x10))
        ));
        let e = Error::from(calibration::Error::Transport(transport::Error::IrqAck));
        assert!(matches!(e, Error::Transport(transport::Error::IrqAck)));
        let e = Error::from(calibration::Error::Offset(1));
        assert!(matches!(e, Error::Calibration(calibration::Error::Offset(1))));
    }

    #[test]
    fn test_fault_message() {
        assert_eq!(
            Fault::Dma { status: 0x3 }.to_string(),
            "DMA error (status 0x3), all acquisition lost"
        );
    }
}
