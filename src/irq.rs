//! Interrupt handling for the acquisition core.
//!
//! Handling is split in two. [`InterruptHandler::acknowledge`] runs when the interrupt line
//! fires: it latches the cause, acknowledges it at the carrier and queues it. The
//! [`IrqWorker`] picks causes off the queue and does the actual work (teardown, hand-off,
//! re-arming) under the device lock, reporting what happened as [`AcquisitionEvent`]s.

use crate::{
    core::{
        regs,
        FA_IRQ_MEM_OFF,
    },
    device::Core,
    error::{
        Error,
        Fault,
        Result,
    },
    fsm::{
        self,
        AcquisitionState,
    },
    transport::{
        Deserialize,
        Located,
        Serialize,
        Transport,
    },
};
use anyhow::Context;
use fmcadc_derive::{
    offset,
    RegisterWord,
};
use packed_struct::prelude::*;
use std::sync::{
    Arc,
    Mutex,
    PoisonError,
};
use tokio::sync::mpsc;
use tracing::{
    debug,
    error,
    warn,
};

pub const IRQ_DMA_DONE: u32 = 0x1;
pub const IRQ_DMA_ERR: u32 = 0x2;
pub const IRQ_TRG_FIRE: u32 = 0x4;
pub const IRQ_ACQ_END: u32 = 0x8;
/// Mask value enabling every interrupt
pub const IRQ_ALL: u32 = 0xF;
/// Mask value disabling every interrupt
pub const IRQ_NONE: u32 = 0x0;

/// The interrupt cause register
#[offset(FA_IRQ_MEM_OFF + 0x04)]
#[derive(PackedStruct, RegisterWord, Default, Debug, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct IrqCause {
    #[packed_field(bits = "0")]
    pub dma_done: bool,
    #[packed_field(bits = "1")]
    pub dma_err: bool,
    #[packed_field(bits = "2")]
    pub trg_fire: bool,
    #[packed_field(bits = "3")]
    pub acq_end: bool,
}

impl IrqCause {
    /// Decode a raw cause word, ignoring bits above the four causes
    #[must_use]
    pub fn from_bits(bits: u32) -> Self {
        Self {
            dma_done: bits & IRQ_DMA_DONE != 0,
            dma_err: bits & IRQ_DMA_ERR != 0,
            trg_fire: bits & IRQ_TRG_FIRE != 0,
            acq_end: bits & IRQ_ACQ_END != 0,
        }
    }

    #[must_use]
    pub fn bits(&self) -> u32 {
        let mut bits = IRQ_NONE;
        for (set, bit) in [
            (self.dma_done, IRQ_DMA_DONE),
            (self.dma_err, IRQ_DMA_ERR),
            (self.trg_fire, IRQ_TRG_FIRE),
            (self.acq_end, IRQ_ACQ_END),
        ] {
            if set {
                bits |= bit;
            }
        }
        bits
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits() == IRQ_NONE
    }
}

/// Running totals kept by the dispatcher
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Counters {
    /// Triggers seen whose data hasn't reached the host yet
    pub in_flight: u32,
    /// Transfers that ended in a DMA error
    pub dma_errors: u32,
    /// Acquisitions that ended while the state machine was still busy
    pub skipped: u32,
    /// Acquisitions lost because their transfer couldn't be started
    pub lost: u32,
    /// Transfers that finished normally
    pub completed: u32,
}

impl Counters {
    /// A triggered shot reached its outcome, whichever it was
    fn shot_settled(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }
}

/// What the dispatcher did with an interrupt, as seen by the buffer consumer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AcquisitionEvent {
    /// A transfer finished and its blocks went to the buffer back end
    Completed { blocks: usize },
    /// The acquisition ended while the state machine was in `state`, its data stays on the
    /// device
    Skipped { state: AcquisitionState },
    /// The transfer for a finished acquisition couldn't be started
    Lost,
    /// The acquisition sequence is over until the device is stopped
    Fault(Fault),
}

impl<T: Transport> Core<T> {
    /// Act on one decoded interrupt cause.
    ///
    /// Transfer completion is handled first, then the trigger, then the end of acquisition. A
    /// DMA error or an ILLEGAL state machine ends processing of the cause and is returned as a
    /// [`Error::DeviceFault`], after which the core refuses to start until stopped.
    pub(crate) fn dispatch(&mut self, cause: IrqCause) -> Result<Vec<AcquisitionEvent>> {
        debug!(cause = cause.bits(), "Dispatching interrupt");
        let mut events = vec![];

        if cause.dma_done {
            self.dma_done(&mut events)?;
        } else if cause.dma_err {
            return Err(self.dma_error()?.into());
        }

        if self.faulted {
            debug!("Fault pending, ignoring acquisition interrupts");
            return Ok(events);
        }

        if cause.trg_fire {
            // The data-ready signal is ACQ_END, this only counts
            self.counters.in_flight = self.counters.in_flight.saturating_add(1);
        }

        if cause.acq_end {
            self.acq_end(&mut events)?;
        }

        Ok(events)
    }

    fn dma_done(&mut self, events: &mut Vec<AcquisitionEvent>) -> Result<()> {
        if !self.dma.teardown() {
            // Aborted or never started, the device stays as the caller left it
            debug!("DMA done with no transfer in flight, ignored");
            return Ok(());
        }
        let blocks = self.trigger.complete();
        self.counters.shot_settled();
        self.counters.completed = self.counters.completed.saturating_add(1);
        debug!(blocks, "DMA done");
        events.push(AcquisitionEvent::Completed { blocks });
        if !self.faulted {
            self.trigger.restore_enables(&mut self.transport)?;
            fsm::start(&mut self.transport)?;
        }
        Ok(())
    }

    fn dma_error(&mut self) -> Result<Fault> {
        self.dma.teardown();
        self.trigger.abort();
        self.counters.shot_settled();
        self.counters.dma_errors = self.counters.dma_errors.saturating_add(1);
        self.faulted = true;
        let status = self.transport.read_field(regs::DMA_STA)?;
        error!(status, "DMA error, all acquisition lost");
        Ok(Fault::Dma { status })
    }

    fn acq_end(&mut self, events: &mut Vec<AcquisitionEvent>) -> Result<()> {
        match fsm::state(&mut self.transport)? {
            AcquisitionState::Idle => {
                debug!("Start DMA from device");
                fsm::stop(&mut self.transport)?;
                self.trigger.write_enables(&mut self.transport, false, false)?;
                if let Err(e) = self.trigger.fire(&mut self.transport, &mut self.dma) {
                    warn!(error = %e, "Acquisition lost");
                    self.counters.shot_settled();
                    self.counters.lost = self.counters.lost.saturating_add(1);
                    events.push(AcquisitionEvent::Lost);
                    // Keep the sequence going with the next trigger
                    self.trigger.restore_enables(&mut self.transport)?;
                    fsm::start(&mut self.transport)?;
                }
            }
            AcquisitionState::Illegal => {
                error!("State machine in ILLEGAL state");
                self.counters.shot_settled();
                self.faulted = true;
                return Err(Fault::IllegalState.into());
            }
            state => {
                warn!(?state, "Can't start DMA on the last acquisition");
                self.counters.shot_settled();
                self.counters.skipped = self.counters.skipped.saturating_add(1);
                events.push(AcquisitionEvent::Skipped { state });
            }
        }
        Ok(())
    }

    /// Latch and acknowledge the pending cause
    pub(crate) fn acknowledge(&mut self) -> Result<IrqCause> {
        let cause: IrqCause = self.transport.read()?;
        self.transport.irq_ack()?;
        Ok(cause)
    }
}

/// Turn a dispatch outcome into events, keeping faults as events
fn into_events(outcome: Result<Vec<AcquisitionEvent>>) -> Result<Vec<AcquisitionEvent>> {
    match outcome {
        Ok(events) => Ok(events),
        Err(Error::DeviceFault(fault)) => Ok(vec![AcquisitionEvent::Fault(fault)]),
        Err(e) => Err(e),
    }
}

/// The fast half of interrupt handling, called once per interrupt
#[derive(Debug)]
pub struct InterruptHandler<T> {
    core: Arc<Mutex<Core<T>>>,
    queue: mpsc::UnboundedSender<IrqCause>,
}

impl<T> Clone for InterruptHandler<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            queue: self.queue.clone(),
        }
    }
}

impl<T: Transport> InterruptHandler<T> {
    /// Read the cause register, acknowledge the interrupt and queue the cause for the worker.
    /// Returns the cause that was read.
    /// # Errors
    /// Returns an error on a failed bus access or acknowledge
    pub fn acknowledge(&self) -> Result<IrqCause> {
        let cause = {
            let mut core = self.core.lock().unwrap_or_else(PoisonError::into_inner);
            core.acknowledge()?
        };
        if cause.is_empty() {
            debug!("Spurious interrupt");
        } else if self.queue.send(cause).is_err() {
            warn!(cause = cause.bits(), "Interrupt worker is gone, dropping cause");
        }
        Ok(cause)
    }
}

/// The deferred half of interrupt handling
#[derive(Debug)]
pub struct IrqWorker<T> {
    core: Arc<Mutex<Core<T>>>,
    queue: mpsc::UnboundedReceiver<IrqCause>,
    events: mpsc::UnboundedSender<AcquisitionEvent>,
}

impl<T: Transport> IrqWorker<T> {
    /// Process queued causes until every [`InterruptHandler`] is dropped.
    ///
    /// Device faults are reported as [`AcquisitionEvent::Fault`] and processing continues.
    /// # Errors
    /// Returns an error, and stops, if processing fails for any other reason
    pub async fn run(mut self) -> anyhow::Result<()> {
        while let Some(cause) = self.queue.recv().await {
            let outcome = {
                let mut core = self.core.lock().unwrap_or_else(PoisonError::into_inner);
                core.dispatch(cause)
            };
            let events = into_events(outcome)
                .with_context(|| format!("failed to process interrupt cause {:#x}", cause.bits()))?;
            for event in events {
                if self.events.send(event).is_err() {
                    debug!(?event, "No consumer for acquisition event");
                }
            }
        }
        debug!("Interrupt queue closed");
        Ok(())
    }
}

/// Both halves of interrupt handling plus the consumer's event stream
#[derive(Debug)]
pub struct Interrupts<T> {
    pub handler: InterruptHandler<T>,
    pub worker: IrqWorker<T>,
    pub events: mpsc::UnboundedReceiver<AcquisitionEvent>,
}

impl<T> Interrupts<T> {
    pub(crate) fn new(core: &Arc<Mutex<Core<T>>>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            handler: InterruptHandler {
                core: Arc::clone(core),
                queue: queue_tx,
            },
            worker: IrqWorker {
                core: Arc::clone(core),
                queue: queue_rx,
                events: events_tx,
            },
            events: events_rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        calibration::CalibrationTable,
        dma::{
            DmaEngine,
            IdentityMapper,
        },
        transport::mock::Mock,
        trigger::{
            DeviceOptions,
            TriggerController,
            VecBackend,
        },
    };
    use paste::paste;

    fn core_with(counters: Counters) -> Core<Mock> {
        let options = DeviceOptions::default();
        Core {
            transport: Mock::new(),
            trigger: TriggerController::new(options, Box::new(VecBackend::new())),
            dma: DmaEngine::new(
                Box::new(IdentityMapper::new()),
                options.fragment_granularity,
            ),
            calibration: CalibrationTable::default(),
            calibration_errors: 0,
            counters,
            faulted: false,
        }
    }

    macro_rules! test_cause_bits {
        ($name:ident, $bits:expr, $done:literal, $err:literal, $fire:literal, $end:literal) => {
            paste! {
                #[test]
                fn [<test_cause_ $name>]() {
                    let cause = IrqCause::from_bits($bits);
                    assert_eq!(cause.dma_done, $done);
                    assert_eq!(cause.dma_err, $err);
                    assert_eq!(cause.trg_fire, $fire);
                    assert_eq!(cause.acq_end, $end);
                    assert_eq!(cause.bits(), $bits & IRQ_ALL);
                }
            }
        };
    }

    test_cause_bits!(none, IRQ_NONE, false, false, false, false);
    test_cause_bits!(dma_done, IRQ_DMA_DONE, true, false, false, false);
    test_cause_bits!(dma_err, IRQ_DMA_ERR, false, true, false, false);
    test_cause_bits!(trg_fire, IRQ_TRG_FIRE, false, false, true, false);
    test_cause_bits!(acq_end, IRQ_ACQ_END, false, false, false, true);
    test_cause_bits!(all, IRQ_ALL, true, true, true, true);
    test_cause_bits!(high_bits, 0xF0 | IRQ_ACQ_END, false, false, false, true);

    #[test]
    fn test_cause_unpacks_like_from_bits() {
        for bits in 0..=IRQ_ALL {
            let unpacked = IrqCause::deserialize(bits.to_be_bytes()).unwrap();
            assert_eq!(unpacked, IrqCause::from_bits(bits));
            assert_eq!(u32::from_be_bytes(unpacked.serialize().unwrap()), bits);
        }
    }

    #[test]
    fn test_cause_word_through_transport() {
        let mut transport = Mock::new();
        transport
            .write(&IrqCause::from_bits(IRQ_DMA_ERR | IRQ_ACQ_END))
            .unwrap();
        assert_eq!(
            transport.peek(regs::IRQ_SRC.byte_offset),
            IRQ_DMA_ERR | IRQ_ACQ_END
        );
        let cause: IrqCause = transport.read().unwrap();
        assert!(cause.dma_err && cause.acq_end);
        assert!(!cause.dma_done && !cause.trg_fire);
    }

    #[test]
    fn test_counters_saturate() {
        let mut core = core_with(Counters {
            in_flight: u32::MAX,
            skipped: u32::MAX,
            ..Default::default()
        });
        core.transport
            .poke_field(regs::STA_FSM, AcquisitionState::WaitTrig.code().into());
        core.dispatch(IrqCause::from_bits(IRQ_TRG_FIRE | IRQ_ACQ_END))
            .unwrap();
        assert_eq!(core.counters.skipped, u32::MAX);
        assert_eq!(core.counters.in_flight, u32::MAX - 1);
    }

    #[test]
    fn test_settling_with_nothing_in_flight() {
        let mut core = core_with(Counters::default());
        core.transport
            .poke_field(regs::STA_FSM, AcquisitionState::PostTrig.code().into());
        core.dispatch(IrqCause::from_bits(IRQ_ACQ_END)).unwrap();
        assert_eq!(core.counters.in_flight, 0);
        assert_eq!(core.counters.skipped, 1);
    }

    #[test]
    fn test_cause_offset() {
        assert_eq!(IrqCause::OFFSET, regs::IRQ_SRC.byte_offset);
    }

    #[test]
    fn test_faults_become_events() {
        let events = into_events(Err(Fault::IllegalState.into())).unwrap();
        assert_eq!(events, vec![AcquisitionEvent::Fault(Fault::IllegalState)]);
        assert!(into_events(Err(Error::Permission)).is_err());
    }
}
