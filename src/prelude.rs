//! Prelude (helpful reexports) for this package

pub use crate::{
    calibration::{
        CalibrationTable,
        InputRange,
    },
    device::FmcAdc,
    dma::{
        DmaMapper,
        IdentityMapper,
    },
    error::{
        ConfigError,
        Error,
        Fault,
    },
    fsm::AcquisitionState,
    irq::{
        AcquisitionEvent,
        Counters,
        Interrupts,
        IrqCause,
    },
    transport::{
        mock::Mock,
        Transport,
    },
    trigger::{
        AcquisitionConfig,
        BufferBackend,
        DataBlock,
        DeviceOptions,
        Polarity,
        TimestampEvent,
        TriggerConfig,
        TriggerSource,
        VecBackend,
    },
};
pub use fixed::prelude::*;
