//! A single FMC ADC mezzanine and its control plane
//!
//! Everything that touches the device registers goes through one lock: configuration, the fire
//! sequence and interrupt processing all share [`Core`].

use crate::{
    calibration::{
        self,
        CalibrationTable,
        InputRange,
        CALIB_BLOB_SIZE,
        UNITY_GAIN,
    },
    core::{
        regs,
        FA_NCHAN,
    },
    dma::{
        DmaEngine,
        DmaMapper,
    },
    error::{
        ConfigError,
        Error,
        Result,
    },
    fsm::{
        self,
        AcquisitionState,
        FsmStatus,
    },
    irq::{
        AcquisitionEvent,
        Counters,
        Interrupts,
        IrqCause,
        IRQ_ALL,
        IRQ_NONE,
    },
    transport::Transport,
    trigger::{
        AcquisitionConfig,
        BufferBackend,
        DeviceOptions,
        Polarity,
        Timestamp,
        TimestampEvent,
        TriggerConfig,
        TriggerController,
        TriggerSource,
    },
};
use fixed::types::U1F15;
use paste::paste;
use std::sync::{
    Arc,
    Mutex,
    MutexGuard,
    PoisonError,
};
use tracing::{
    debug,
    info,
    warn,
};

/// The state of one device, guarded as a whole
#[derive(Debug)]
pub(crate) struct Core<T> {
    pub(crate) transport: T,
    pub(crate) trigger: TriggerController,
    pub(crate) dma: DmaEngine,
    pub(crate) calibration: CalibrationTable,
    pub(crate) calibration_errors: usize,
    pub(crate) counters: Counters,
    /// Set by a device fault, cleared by an explicit stop
    pub(crate) faulted: bool,
}

impl<T: Transport> Core<T> {
    /// Bring the mezzanine to a known state: stopped, unity gain on the 1V range with its
    /// calibration, clocks on, single shot, all interrupts and the hardware trigger enabled
    fn init(&mut self) -> Result<()> {
        fsm::stop(&mut self.transport)?;
        for channel in 0..FA_NCHAN {
            self.transport
                .write_field(regs::CH_GAIN.channel(channel), UNITY_GAIN.into())?;
            self.set_range(channel, InputRange::Range1V)?;
        }
        self.transport.write_field(regs::CTL_CLK_EN, 1)?;
        self.transport.write_field(regs::CTL_DAC_CLR_N, 1)?;
        // Device to host
        self.transport.write_field(regs::DMA_BR_DIR, 0)?;
        self.transport.write_field(regs::CTL_TEST_DATA_EN, 0)?;
        self.trigger
            .configure_acquisition(&mut self.transport, &AcquisitionConfig::default())?;
        self.trigger
            .configure_trigger(&mut self.transport, &TriggerConfig::default())?;
        self.transport.write_field(regs::IRQ_MASK, IRQ_ALL)?;
        Ok(())
    }

    fn set_range(&mut self, channel: usize, range: InputRange) -> Result<()> {
        debug_assert!(channel < FA_NCHAN);
        self.transport
            .write_field(regs::CH_CTL_RANGE.channel(channel), range.code())?;
        self.calibration.apply(&mut self.transport, channel, range)?;
        Ok(())
    }

    /// Abort any transfer in flight and drop its blocks
    fn abort_transfer(&mut self) -> Result<()> {
        if self.dma.abort(&mut self.transport)? {
            let blocks = self.trigger.abort();
            debug!(blocks, "Dropped transfer in flight");
        }
        Ok(())
    }
}

fn check_channel(channel: usize) -> Result<()> {
    if channel >= FA_NCHAN {
        return Err(ConfigError::Channel(channel).into());
    }
    Ok(())
}

/// Generates forwarding setters for the trigger controller's settings
macro_rules! forward_setters {
    ($($name:ident: $ty:ty),* $(,)?) => {
        paste! {
            $(
                #[doc = "Write the `" $name "` setting, see [`TriggerController::set_" $name "`]"]
                /// # Errors
                /// Returns an error if the new value is rejected or on a failed bus access
                pub fn [<set_ $name>](&self, value: $ty) -> Result<()> {
                    let mut core = self.lock();
                    let Core { transport, trigger, .. } = &mut *core;
                    trigger.[<set_ $name>](transport, value)
                }
            )*
        }
    };
}

/// An FMC ADC 100MS/s 14-bit 4-channel digitizer
#[derive(Debug)]
pub struct FmcAdc<T> {
    core: Arc<Mutex<Core<T>>>,
}

impl<T: Transport> FmcAdc<T> {
    /// Take control of a device and run its init sequence.
    ///
    /// `eeprom_calibration` is the persisted calibration blob. Invalid stanzas in it are
    /// replaced by the identity calibration, see [`FmcAdc::calibration_errors`].
    /// # Errors
    /// Returns an error on a failed bus access during init
    pub fn open<M, B>(
        transport: T,
        eeprom_calibration: &[u8; CALIB_BLOB_SIZE],
        mapper: M,
        backend: B,
        options: DeviceOptions,
    ) -> Result<Self>
    where
        M: DmaMapper + Send + 'static,
        B: BufferBackend + Send + 'static,
    {
        let (calibration, calibration_errors) = CalibrationTable::load(eeprom_calibration);
        if calibration_errors > 0 {
            info!(
                errors = calibration_errors,
                "Invalid calibration in EEPROM, identity used for those ranges"
            );
        }
        let mut core = Core {
            transport,
            trigger: TriggerController::new(options, Box::new(backend)),
            dma: DmaEngine::new(Box::new(mapper), options.fragment_granularity),
            calibration,
            calibration_errors,
            counters: Counters::default(),
            faulted: false,
        };
        core.init()?;
        info!("FMC ADC ready");
        Ok(Self {
            core: Arc::new(Mutex::new(core)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Core<T>> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mask every interrupt, stop the state machine and drop any transfer in flight
    /// # Errors
    /// Returns an error on a failed bus access
    pub fn close(self) -> Result<()> {
        let mut core = self.lock();
        core.transport.write_field(regs::IRQ_MASK, IRQ_NONE)?;
        fsm::stop(&mut core.transport)?;
        core.abort_transfer()?;
        info!("FMC ADC closed");
        Ok(())
    }

    /// Start an acquisition sequence. Starting while one is running restarts it.
    /// # Errors
    /// Returns [`Error::FaultPending`] after a device fault until [`FmcAdc::stop`] is called,
    /// or an error on a failed bus access
    pub fn start(&self) -> Result<()> {
        let mut core = self.lock();
        if core.faulted {
            return Err(Error::FaultPending);
        }
        let Core {
            transport, trigger, ..
        } = &mut *core;
        // The enables are dropped while a transfer runs and after a fault
        trigger.restore_enables(transport)?;
        fsm::start(transport)?;
        Ok(())
    }

    /// Stop the acquisition sequence, drop any transfer in flight and clear a pending fault
    /// # Errors
    /// Returns an error on a failed bus access
    pub fn stop(&self) -> Result<()> {
        let mut core = self.lock();
        fsm::stop(&mut core.transport)?;
        core.abort_transfer()?;
        if core.faulted {
            info!("Fault cleared");
            core.faulted = false;
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error on a failed bus access
    pub fn state(&self) -> Result<AcquisitionState> {
        Ok(fsm::state(&mut self.lock().transport)?)
    }

    /// Whether a device fault is waiting for [`FmcAdc::stop`]
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.lock().faulted
    }

    #[must_use]
    pub fn counters(&self) -> Counters {
        self.lock().counters
    }

    /// # Errors
    /// Returns an error if `config` is invalid, in which case nothing is written, or on a
    /// failed bus access
    pub fn configure_trigger(&self, config: &TriggerConfig) -> Result<()> {
        let mut core = self.lock();
        let Core {
            transport, trigger, ..
        } = &mut *core;
        trigger.configure_trigger(transport, config)
    }

    /// # Errors
    /// Returns an error if `config` is invalid, in which case nothing is written, or on a
    /// failed bus access
    pub fn configure_acquisition(&self, config: &AcquisitionConfig) -> Result<()> {
        let mut core = self.lock();
        let Core {
            transport, trigger, ..
        } = &mut *core;
        trigger.configure_acquisition(transport, config)
    }

    /// Read every trigger and acquisition setting back from hardware
    /// # Errors
    /// Returns an error on a failed bus access
    pub fn retrieve_config(&self) -> Result<(TriggerConfig, AcquisitionConfig)> {
        let mut core = self.lock();
        let Core {
            transport, trigger, ..
        } = &mut *core;
        trigger.retrieve_config(transport)
    }

    forward_setters! {
        pre_samples: u32,
        post_samples: u32,
        shots: u16,
        decimation: u16,
        source: TriggerSource,
        polarity: Polarity,
        int_channel: usize,
        threshold: u16,
        delay: u32,
        hw_enable: bool,
        sw_enable: bool,
    }

    /// Abort whatever is going on and pulse the software trigger
    /// # Errors
    /// Returns [`Error::Permission`] if the software trigger isn't enabled, or an error on a
    /// failed bus access
    pub fn software_fire(&self) -> Result<()> {
        let mut core = self.lock();
        let Core {
            transport,
            trigger,
            dma,
            ..
        } = &mut *core;
        trigger.software_fire(transport, dma)
    }

    /// Select the input range of `channel` and apply its calibration
    /// # Errors
    /// Returns an error on a failed bus access
    pub fn set_range(&self, channel: usize, range: InputRange) -> Result<()> {
        self.lock().set_range(channel, range)
    }

    /// Select the input range of `channel` by its register code
    /// # Errors
    /// Returns an error if `code` isn't a documented range code, in which case nothing is
    /// written, or on a failed bus access
    pub fn set_range_code(&self, channel: usize, code: u32) -> Result<()> {
        let range = InputRange::try_from(code)?;
        self.set_range(channel, range)
    }

    /// The input range `channel` is set to
    /// # Errors
    /// Returns an error if the register holds an undocumented code or on a failed bus access
    pub fn range(&self, channel: usize) -> Result<InputRange> {
        let code = self
            .lock()
            .transport
            .read_field(regs::CH_CTL_RANGE.channel(channel))?;
        Ok(InputRange::try_from(code)?)
    }

    /// Current raw value of `channel`
    /// # Errors
    /// Returns an error on a failed bus access
    pub fn channel_value(&self, channel: usize) -> Result<u16> {
        let raw = self
            .lock()
            .transport
            .read_field(regs::CH_STA.channel(channel))?;
        Ok(raw as u16)
    }

    /// Override the gain of `channel`. The calibrated gain comes back on the next range change
    /// or calibration write.
    /// # Errors
    /// Returns an error if the channel doesn't exist, in which case nothing is written, or on a
    /// failed bus access
    pub fn set_channel_gain(&self, channel: usize, gain: U1F15) -> Result<()> {
        check_channel(channel)?;
        self.lock()
            .transport
            .write_field(regs::CH_GAIN.channel(channel), gain.to_bits().into())?;
        Ok(())
    }

    /// Gain currently applied to `channel`
    /// # Errors
    /// Returns an error if the channel doesn't exist or on a failed bus access
    pub fn channel_gain(&self, channel: usize) -> Result<U1F15> {
        check_channel(channel)?;
        let raw = self
            .lock()
            .transport
            .read_field(regs::CH_GAIN.channel(channel))?;
        Ok(U1F15::from_bits(raw as u16))
    }

    /// Override the offset of `channel`. The calibrated offset comes back on the next range
    /// change or calibration write.
    /// # Errors
    /// Returns an error if the channel doesn't exist, in which case nothing is written, or on a
    /// failed bus access
    pub fn set_channel_offset(&self, channel: usize, offset: i16) -> Result<()> {
        check_channel(channel)?;
        self.lock()
            .transport
            .write_field(regs::CH_OFFSET.channel(channel), u32::from(offset as u16))?;
        Ok(())
    }

    /// Offset currently applied to `channel`
    /// # Errors
    /// Returns an error if the channel doesn't exist or on a failed bus access
    pub fn channel_offset(&self, channel: usize) -> Result<i16> {
        check_channel(channel)?;
        let raw = self
            .lock()
            .transport
            .read_field(regs::CH_OFFSET.channel(channel))?;
        Ok(raw as u16 as i16)
    }

    /// The whole status word: state machine and serdes lock flags
    /// # Errors
    /// Returns an error on a failed bus access
    pub fn status(&self) -> Result<FsmStatus> {
        Ok(fsm::status(&mut self.lock().transport)?)
    }

    /// # Errors
    /// Returns an error on a failed bus access
    pub fn timestamp(&self, event: TimestampEvent) -> Result<Timestamp> {
        event.read(&mut self.lock().transport)
    }

    /// Samples acquired so far in the current shot
    /// # Errors
    /// Returns an error on a failed bus access
    pub fn sample_count(&self) -> Result<u32> {
        Ok(self.lock().transport.read_field(regs::TRIG_CNT)?)
    }

    /// Device memory address the last trigger was recorded at
    /// # Errors
    /// Returns an error on a failed bus access
    pub fn trigger_position(&self) -> Result<u32> {
        Ok(self.lock().transport.read_field(regs::TRIG_POS)?)
    }

    #[must_use]
    pub fn calibration(&self) -> CalibrationTable {
        self.lock().calibration
    }

    /// Number of calibration stanzas replaced by the identity on the last load or write
    #[must_use]
    pub fn calibration_errors(&self) -> usize {
        self.lock().calibration_errors
    }

    /// Copy the calibration in use into `out` in its persisted format, returning the bytes
    /// written
    /// # Errors
    /// Returns an error unless `offset` is zero and `out` is exactly one blob long
    pub fn read_calibration(&self, out: &mut [u8], offset: u64) -> Result<usize> {
        self.lock().calibration.store(out, offset)?;
        Ok(out.len())
    }

    /// Replace the calibration with a user-supplied blob and apply it to every channel.
    ///
    /// The blob is validated like the EEPROM one. Returns how many stanzas were replaced by the
    /// identity.
    /// # Errors
    /// Returns an error unless `offset` is zero and `data` is exactly one blob long, in which
    /// case nothing changes, or on a failed bus access
    pub fn write_calibration(&self, data: &[u8], offset: u64) -> Result<usize> {
        calibration::check_access(data.len(), offset)?;
        let mut raw = [0u8; CALIB_BLOB_SIZE];
        raw.copy_from_slice(data);
        let (table, errors) = CalibrationTable::load(&raw);

        let mut guard = self.lock();
        let core = &mut *guard;
        core.calibration = table;
        core.calibration_errors = errors;
        for channel in 0..FA_NCHAN {
            let code = core
                .transport
                .read_field(regs::CH_CTL_RANGE.channel(channel))?;
            match InputRange::from_code(code) {
                Some(range) => table.apply(&mut core.transport, channel, range)?,
                None => warn!(channel, code, "Unknown range, calibration not applied"),
            }
        }
        Ok(errors)
    }

    /// Split interrupt handling into its fast and deferred halves. The worker has to be run
    /// for interrupts to have any effect.
    #[must_use]
    pub fn interrupts(&self) -> Interrupts<T> {
        Interrupts::new(&self.core)
    }

    /// Act on an interrupt cause right away, without the deferred worker
    /// # Errors
    /// Returns [`Error::DeviceFault`] on a DMA error or an ILLEGAL state machine, or an error on
    /// a failed bus access
    pub fn dispatch(&self, cause: IrqCause) -> Result<Vec<AcquisitionEvent>> {
        self.lock().dispatch(cause)
    }

    /// Acknowledge the pending interrupt and act on it, all under one lock
    /// # Errors
    /// Returns [`Error::DeviceFault`] on a DMA error or an ILLEGAL state machine, or an error on
    /// a failed bus access
    pub fn handle_interrupt(&self) -> Result<Vec<AcquisitionEvent>> {
        let mut core = self.lock();
        let cause = core.acknowledge()?;
        if cause.is_empty() {
            return Ok(vec![]);
        }
        core.dispatch(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        calibration::CalibrationStanza,
        core::{
            FSM_CMD_START,
            FSM_CMD_STOP,
        },
        dma::IdentityMapper,
        transport::mock::Mock,
        trigger::VecBackend,
    };

    fn open_with(blob: &[u8; CALIB_BLOB_SIZE]) -> (FmcAdc<Mock>, Mock) {
        let mock = Mock::new();
        let adc = FmcAdc::open(
            mock.clone(),
            blob,
            IdentityMapper::new(),
            VecBackend::new(),
            DeviceOptions::default(),
        )
        .unwrap();
        (adc, mock)
    }

    fn open() -> (FmcAdc<Mock>, Mock) {
        open_with(&CalibrationTable::default().to_bytes())
    }

    #[test]
    fn test_init_sequence() {
        let (adc, mock) = open();
        assert_eq!(mock.field_writes(regs::CTL_FSM_CMD)[0], FSM_CMD_STOP);
        for channel in 0..FA_NCHAN {
            assert_eq!(mock.peek_field(regs::CH_GAIN.channel(channel)), 0x8000);
            assert_eq!(mock.peek_field(regs::CH_CTL_RANGE.channel(channel)), 0x11);
            assert_eq!(adc.range(channel).unwrap(), InputRange::Range1V);
        }
        assert_eq!(mock.peek_field(regs::CTL_CLK_EN), 1);
        assert_eq!(mock.peek_field(regs::CTL_DAC_CLR_N), 1);
        assert_eq!(mock.peek_field(regs::DMA_BR_DIR), 0);
        assert_eq!(mock.peek_field(regs::TRIG_SR_DECI), 1);
        assert_eq!(mock.peek_field(regs::CTL_TEST_DATA_EN), 0);
        assert_eq!(mock.peek_field(regs::TRIG_SHOTS_NB), 1);
        assert_eq!(mock.peek_field(regs::IRQ_MASK), IRQ_ALL);
        assert_eq!(mock.peek_field(regs::TRIG_CFG_HW_EN), 1);
        assert_eq!(mock.peek_field(regs::TRIG_CFG_SW_EN), 0);
        assert_eq!(adc.calibration_errors(), 0);
    }

    #[test]
    fn test_open_applies_eeprom_calibration() {
        let mut table = CalibrationTable::default();
        table.adc[1] = CalibrationStanza {
            offset: [1, -2, 3, -4],
            gain: [0x8001, 0x8002, 0x8003, 0x8004],
            temperature: 4000,
        };
        table.adc[0].gain[0] = 0x1000;
        let (adc, mock) = open_with(&table.to_bytes());
        assert_eq!(mock.peek_field(regs::CH_GAIN.channel(2)), 0x8003);
        assert_eq!(mock.peek_field(regs::CH_OFFSET.channel(1)), u32::from(-2i16 as u16));
        assert_eq!(adc.calibration_errors(), 1);
        assert_eq!(adc.calibration().adc[0], CalibrationStanza::IDENTITY);
    }

    #[test]
    fn test_close() {
        let (adc, mock) = open();
        mock.clear_writes();
        adc.close().unwrap();
        assert_eq!(mock.peek_field(regs::IRQ_MASK), IRQ_NONE);
        assert_eq!(mock.field_writes(regs::CTL_FSM_CMD), vec![FSM_CMD_STOP]);
    }

    #[test]
    fn test_start_stop() {
        let (adc, mock) = open();
        mock.clear_writes();
        adc.start().unwrap();
        assert_eq!(
            mock.field_writes(regs::CTL_FSM_CMD),
            vec![FSM_CMD_STOP, FSM_CMD_START]
        );
        mock.poke_field(regs::STA_FSM, 3);
        assert_eq!(adc.state().unwrap(), AcquisitionState::WaitTrig);
        adc.stop().unwrap();
        assert_eq!(mock.peek_field(regs::CTL_FSM_CMD), FSM_CMD_STOP);
    }

    #[test]
    fn test_set_range() {
        let (adc, mock) = open();
        let mut table = CalibrationTable::default();
        table.adc[2].gain = [0x8100; FA_NCHAN];
        adc.write_calibration(&table.to_bytes(), 0).unwrap();
        adc.set_range(1, InputRange::Range100mV).unwrap();
        assert_eq!(mock.peek_field(regs::CH_CTL_RANGE.channel(1)), 0x23);
        assert_eq!(mock.peek_field(regs::CH_GAIN.channel(1)), 0x8100);
        // Other channels keep the 1V calibration
        assert_eq!(mock.peek_field(regs::CH_GAIN.channel(0)), 0x8000);
    }

    #[test]
    fn test_set_range_code_rejects_unknown() {
        let (adc, mock) = open();
        mock.clear_writes();
        for code in [0x01, 0x12, 0x24, 0x46, 0x7F] {
            assert!(matches!(
                adc.set_range_code(0, code),
                Err(Error::Config(ConfigError::Range(_)))
            ));
        }
        assert!(mock.writes().is_empty());
        adc.set_range_code(0, 0x45).unwrap();
        assert_eq!(adc.range(0).unwrap(), InputRange::Range10V);
    }

    #[test]
    fn test_write_calibration_access_checks() {
        let (adc, mock) = open();
        mock.clear_writes();
        let blob = CalibrationTable::default().to_bytes();
        assert!(matches!(
            adc.write_calibration(&blob, 4),
            Err(Error::Calibration(calibration::Error::Offset(4)))
        ));
        assert!(matches!(
            adc.write_calibration(&blob[1..], 0),
            Err(Error::Calibration(calibration::Error::Length { .. }))
        ));
        assert!(mock.writes().is_empty());
    }

    #[test]
    fn test_write_calibration_applies() {
        let (adc, mock) = open();
        let mut table = CalibrationTable::default();
        table.adc[1].offset = [10, 20, 30, 40];
        table.dac[0].temperature = 0xFFFF;
        assert_eq!(adc.write_calibration(&table.to_bytes(), 0).unwrap(), 1);
        assert_eq!(adc.calibration_errors(), 1);
        for (channel, offset) in [10, 20, 30, 40].into_iter().enumerate() {
            assert_eq!(mock.peek_field(regs::CH_OFFSET.channel(channel)), offset);
        }

        let mut out = vec![0u8; CALIB_BLOB_SIZE];
        assert_eq!(adc.read_calibration(&mut out, 0).unwrap(), CALIB_BLOB_SIZE);
        let (read_back, errors) = CalibrationTable::load(&out.try_into().unwrap());
        assert_eq!(errors, 0);
        assert_eq!(read_back.adc[1], table.adc[1]);
        assert_eq!(read_back.dac[0], CalibrationStanza::IDENTITY);
        assert!(adc.read_calibration(&mut [0u8; 10], 0).is_err());
    }

    #[test]
    fn test_channel_gain_and_offset() {
        let (adc, mock) = open();
        adc.set_channel_gain(2, U1F15::from_num(0.75)).unwrap();
        adc.set_channel_offset(2, -300).unwrap();
        assert_eq!(mock.peek_field(regs::CH_GAIN.channel(2)), 0x6000);
        assert_eq!(adc.channel_gain(2).unwrap(), U1F15::from_num(0.75));
        assert_eq!(adc.channel_offset(2).unwrap(), -300);

        // A range change brings the calibration back
        adc.set_range(2, InputRange::Range10V).unwrap();
        assert_eq!(adc.channel_gain(2).unwrap(), U1F15::from_bits(UNITY_GAIN));
        assert_eq!(adc.channel_offset(2).unwrap(), 0);
    }

    #[test]
    fn test_channel_overrides_check_channel() {
        let (adc, mock) = open();
        mock.clear_writes();
        assert!(matches!(
            adc.set_channel_gain(FA_NCHAN, U1F15::from_bits(UNITY_GAIN)),
            Err(Error::Config(ConfigError::Channel(FA_NCHAN)))
        ));
        assert!(matches!(
            adc.set_channel_offset(7, 1),
            Err(Error::Config(ConfigError::Channel(7)))
        ));
        assert!(adc.channel_gain(4).is_err());
        assert!(mock.writes().is_empty());
    }

    #[test]
    fn test_status() {
        let (adc, mock) = open();
        mock.poke_field(regs::STA_FSM, 3);
        mock.poke_field(regs::STA_SERDES_SYNCED, 1);
        let status = adc.status().unwrap();
        assert_eq!(status.state(), AcquisitionState::WaitTrig);
        assert!(status.serdes_synced);
        assert!(!status.serdes_pll);
        mock.poke_field(regs::STA_SERDES_PLL, 1);
        assert!(adc.status().unwrap().serdes_pll);
    }

    #[test]
    fn test_readbacks() {
        let (adc, mock) = open();
        mock.poke_field(regs::CH_STA.channel(3), 0x1FFF);
        mock.poke_field(regs::TRIG_CNT, 1234);
        mock.poke_field(regs::TRIG_POS, 0x40);
        mock.poke_field(regs::UTC_ACQ_START_SECONDS, 99);
        assert_eq!(adc.channel_value(3).unwrap(), 0x1FFF);
        assert_eq!(adc.sample_count().unwrap(), 1234);
        assert_eq!(adc.trigger_position().unwrap(), 0x40);
        assert_eq!(adc.timestamp(TimestampEvent::AcqStart).unwrap().seconds, 99);
    }

    #[test]
    fn test_forwarded_setters() {
        let (adc, mock) = open();
        adc.set_threshold(0x100).unwrap();
        adc.set_int_channel(3).unwrap();
        adc.set_pre_samples(16).unwrap();
        adc.set_shots(4).unwrap();
        assert_eq!(mock.peek_field(regs::TRIG_CFG_THRES), 0x100);
        assert_eq!(mock.peek_field(regs::TRIG_CFG_INT_SEL), 3);
        assert_eq!(mock.peek_field(regs::TRIG_PRE), 16);
        assert_eq!(mock.peek_field(regs::TRIG_SHOTS_NB), 4);
        assert!(adc.set_decimation(0).is_err());
        let (trigger, acquisition) = adc.retrieve_config().unwrap();
        assert_eq!(trigger.threshold, 0x100);
        assert_eq!(acquisition.shots, 4);
    }
}
