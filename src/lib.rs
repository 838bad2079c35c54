//! # FMC ADC
//!
//! Acquisition control for the FMC ADC 100MS/s 14-bit 4-channel digitizer: register access,
//! calibration, the trigger and acquisition state machine, DMA of finished acquisitions to the
//! host and the interrupt flow tying them together.
//!
//! Everything hangs off an [`FmcAdc`](device::FmcAdc), which owns the register
//! [`Transport`](transport::Transport) along with the DMA and buffer back ends.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod calibration;
pub mod core;
pub mod device;
pub mod dma;
pub mod error;
pub mod fsm;
pub mod irq;
pub mod prelude;
pub mod transport;
pub mod trigger;
