//! Trigger configuration and the fire sequence that moves a finished acquisition to the host
//!
//! The fire sequence runs once the state machine has settled after an acquisition. It stamps a
//! control record, asks the buffer back end for one block per shot and starts a single DMA
//! chain covering all of them. Completion arrives later as an interrupt.

use crate::{
    core::{
        regs,
        RegisterField,
        FA_MAX_ACQ_BYTE,
        FA_NCHAN,
        FA_SAMPLE_SIZE,
    },
    dma::{
        DmaBlock,
        DmaEngine,
        DEFAULT_FRAGMENT_GRANULARITY,
    },
    error::{
        ConfigError,
        Error,
        Result,
    },
    fsm,
    transport::Transport,
};
use paste::paste;
use std::{
    collections::VecDeque,
    num::NonZeroUsize,
    sync::{
        Arc,
        Mutex,
        PoisonError,
    },
};
use tracing::{
    debug,
    warn,
};

/// Where the hardware trigger comes from
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TriggerSource {
    /// Threshold crossing on one of the input channels
    #[default]
    Internal,
    /// Front panel trigger input
    External,
}

impl TriggerSource {
    const fn bit(self) -> u32 {
        match self {
            Self::Internal => 0,
            Self::External => 1,
        }
    }

    const fn from_bit(bit: u32) -> Self {
        if bit == 0 {
            Self::Internal
        } else {
            Self::External
        }
    }
}

/// Edge or slope the hardware trigger reacts to
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Polarity {
    #[default]
    Positive,
    Negative,
}

impl Polarity {
    const fn bit(self) -> u32 {
        match self {
            Self::Positive => 0,
            Self::Negative => 1,
        }
    }

    const fn from_bit(bit: u32) -> Self {
        if bit == 0 {
            Self::Positive
        } else {
            Self::Negative
        }
    }
}

/// Trigger settings
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TriggerConfig {
    pub source: TriggerSource,
    pub polarity: Polarity,
    pub hw_enable: bool,
    pub sw_enable: bool,
    /// Channel watched by the internal trigger
    pub int_channel: usize,
    /// Threshold of the internal trigger, in raw ADC counts
    pub threshold: u16,
    /// Samples between the trigger condition and the trigger event
    pub delay: u32,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            source: TriggerSource::default(),
            polarity: Polarity::default(),
            hw_enable: true,
            sw_enable: false,
            int_channel: 0,
            threshold: 0,
            delay: 0,
        }
    }
}

impl TriggerConfig {
    /// # Errors
    /// Returns an error if the internal trigger channel doesn't exist
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.int_channel >= FA_NCHAN {
            return Err(ConfigError::Channel(self.int_channel));
        }
        Ok(())
    }
}

/// Shape of an acquisition
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AcquisitionConfig {
    pub pre_samples: u32,
    pub post_samples: u32,
    pub shots: u16,
    /// Divisor applied to the 100MS/s sample clock
    pub decimation: u16,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            pre_samples: 0,
            post_samples: 1000,
            shots: 1,
            decimation: 1,
        }
    }
}

impl AcquisitionConfig {
    /// Samples captured per shot
    #[must_use]
    pub fn samples_per_shot(&self) -> u64 {
        u64::from(self.pre_samples) + u64::from(self.post_samples)
    }

    /// Bytes of device memory the whole acquisition needs
    #[must_use]
    pub fn required_bytes(&self, sample_size: usize) -> u64 {
        self.samples_per_shot() * sample_size as u64 * u64::from(self.shots)
    }

    /// Check this configuration against the device. Nothing may be written to hardware unless
    /// this passes.
    /// # Errors
    /// Returns an error on a zero shot count, a zero decimation or an acquisition that doesn't
    /// fit in device memory
    pub fn validate(&self, options: &DeviceOptions) -> std::result::Result<(), ConfigError> {
        if self.shots == 0 {
            return Err(ConfigError::ShotCount);
        }
        if self.decimation == 0 {
            return Err(ConfigError::Decimation);
        }
        let required = self.required_bytes(options.sample_size);
        if required > options.memory_capacity {
            return Err(ConfigError::MemoryOverflow {
                required,
                capacity: options.memory_capacity,
            });
        }
        Ok(())
    }
}

const DEFAULT_GRANULARITY: NonZeroUsize = match NonZeroUsize::new(DEFAULT_FRAGMENT_GRANULARITY) {
    Some(g) => g,
    None => panic!("fragment granularity can't be zero"),
};

/// Fixed properties of a device instance
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceOptions {
    /// Bytes of on-board acquisition memory
    pub memory_capacity: u64,
    /// Bytes per sample
    pub sample_size: usize,
    /// No DMA fragment crosses a multiple of this many bytes in host memory
    pub fragment_granularity: NonZeroUsize,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            memory_capacity: FA_MAX_ACQ_BYTE,
            sample_size: FA_SAMPLE_SIZE,
            fragment_granularity: DEFAULT_GRANULARITY,
        }
    }
}

/// A UTC timestamp as kept by the timestamp core
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Timestamp {
    pub seconds: u64,
    pub coarse_ticks: u64,
    pub fine_bins: u64,
}

/// Events the timestamp core latches a time for
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TimestampEvent {
    AcqStart,
    Trigger,
    AcqStop,
    AcqEnd,
}

impl TimestampEvent {
    pub const ALL: [Self; 4] = [Self::AcqStart, Self::Trigger, Self::AcqStop, Self::AcqEnd];

    const fn fields(self) -> [RegisterField; 3] {
        match self {
            Self::AcqStart => [
                regs::UTC_ACQ_START_SECONDS,
                regs::UTC_ACQ_START_COARSE,
                regs::UTC_ACQ_START_FINE,
            ],
            Self::Trigger => [
                regs::UTC_TRIG_SECONDS,
                regs::UTC_TRIG_COARSE,
                regs::UTC_TRIG_FINE,
            ],
            Self::AcqStop => [
                regs::UTC_ACQ_STOP_SECONDS,
                regs::UTC_ACQ_STOP_COARSE,
                regs::UTC_ACQ_STOP_FINE,
            ],
            Self::AcqEnd => [
                regs::UTC_ACQ_END_SECONDS,
                regs::UTC_ACQ_END_COARSE,
                regs::UTC_ACQ_END_FINE,
            ],
        }
    }

    /// Read the timestamp latched for this event
    /// # Errors
    /// Returns an error on a failed bus access
    pub fn read<T: Transport>(self, transport: &mut T) -> Result<Timestamp> {
        let [seconds, coarse, fine] = self.fields();
        Ok(Timestamp {
            seconds: transport.read_field(seconds)?.into(),
            coarse_ticks: transport.read_field(coarse)?.into(),
            fine_bins: transport.read_field(fine)?.into(),
        })
    }
}

/// Metadata travelling with every data block
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControlRecord {
    /// Increases by one for every block handed out
    pub seq_num: u64,
    /// Shot index within the acquisition
    pub shot: u16,
    pub sample_size: usize,
    pub pre_samples: u32,
    pub post_samples: u32,
    pub decimation: u16,
    pub acq_start: Timestamp,
    pub trigger: Timestamp,
    pub acq_stop: Timestamp,
    pub acq_end: Timestamp,
}

/// A host buffer receiving one shot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    pub ctrl: ControlRecord,
    pub data: Vec<u8>,
    /// Offset in device memory the shot is read from
    pub dev_mem_off: u32,
}

impl DataBlock {
    /// The DMA view of this block
    #[must_use]
    pub fn dma_block(&self) -> DmaBlock {
        DmaBlock {
            host_addr: self.data.as_ptr() as u64,
            len: self.data.len(),
            dev_mem_off: self.dev_mem_off,
        }
    }
}

/// Where data blocks come from and where finished ones go, supplied by the surrounding driver
/// framework
pub trait BufferBackend {
    /// Provide a zeroed block of `size` bytes carrying `ctrl`, or `None` if none is available
    fn alloc(&mut self, ctrl: &ControlRecord, size: usize) -> Option<DataBlock>;

    /// Hand a filled block to its consumer. A block that can't be taken is given back.
    /// # Errors
    /// Returns the block if it wasn't stored
    fn store(&mut self, block: DataBlock) -> std::result::Result<(), DataBlock>;

    fn free(&mut self, block: DataBlock);
}

#[derive(Debug, Default)]
struct VecBackendState {
    limit: Option<usize>,
    outstanding: usize,
    stored: VecDeque<DataBlock>,
    store_limit: Option<usize>,
}

/// A heap-backed buffer back end keeping finished blocks in a queue.
///
/// Clones share the same queue. An optional limit on outstanding bytes makes allocations fail
/// like a full buffer would.
#[derive(Debug, Clone, Default)]
pub struct VecBackend {
    state: Arc<Mutex<VecBackendState>>,
}

impl VecBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A back end that refuses to have more than `bytes` allocated at once
    #[must_use]
    pub fn with_limit(bytes: usize) -> Self {
        let backend = Self::default();
        backend.with(|s| s.limit = Some(bytes));
        backend
    }

    fn with<R>(&self, f: impl FnOnce(&mut VecBackendState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Refuse to store more than `blocks` finished blocks
    pub fn limit_stored(&self, blocks: usize) {
        self.with(|s| s.store_limit = Some(blocks));
    }

    /// Bytes handed out and not yet stored or freed
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.with(|s| s.outstanding)
    }

    /// Number of finished blocks waiting for the consumer
    #[must_use]
    pub fn stored(&self) -> usize {
        self.with(|s| s.stored.len())
    }

    /// Take the oldest finished block
    #[must_use]
    pub fn pop(&self) -> Option<DataBlock> {
        self.with(|s| s.stored.pop_front())
    }
}

impl BufferBackend for VecBackend {
    fn alloc(&mut self, ctrl: &ControlRecord, size: usize) -> Option<DataBlock> {
        self.with(|s| {
            if s.limit.is_some_and(|limit| s.outstanding + size > limit) {
                return None;
            }
            s.outstanding += size;
            Some(DataBlock {
                ctrl: *ctrl,
                data: vec![0; size],
                dev_mem_off: 0,
            })
        })
    }

    fn store(&mut self, block: DataBlock) -> std::result::Result<(), DataBlock> {
        self.with(|s| {
            if s.store_limit.is_some_and(|limit| s.stored.len() >= limit) {
                return Err(block);
            }
            s.outstanding = s.outstanding.saturating_sub(block.data.len());
            s.stored.push_back(block);
            Ok(())
        })
    }

    fn free(&mut self, block: DataBlock) {
        self.with(|s| s.outstanding = s.outstanding.saturating_sub(block.data.len()));
    }
}

/// Generates a setter for a trigger setting that needs no validation
macro_rules! trigger_setter {
    ($name:ident, $ty:ty, $field:expr, $raw:expr) => {
        paste! {
            #[doc = "Write the `" $name "` trigger setting"]
            /// # Errors
            /// Returns an error on a failed bus access
            pub fn [<set_ $name>]<T: Transport>(
                &mut self,
                transport: &mut T,
                value: $ty,
            ) -> Result<()> {
                transport.write_field($field, $raw(value))?;
                self.trigger.$name = value;
                Ok(())
            }
        }
    };
}

/// Owns the trigger settings of one device and runs the fire sequence
pub struct TriggerController {
    options: DeviceOptions,
    /// Last settings written to hardware
    trigger: TriggerConfig,
    acquisition: AcquisitionConfig,
    seq_num: u64,
    /// Blocks owned by the DMA chain in flight
    pending: Vec<DataBlock>,
    backend: Box<dyn BufferBackend + Send>,
}

impl std::fmt::Debug for TriggerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerController")
            .field("options", &self.options)
            .field("trigger", &self.trigger)
            .field("acquisition", &self.acquisition)
            .field("seq_num", &self.seq_num)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl TriggerController {
    pub fn new(options: DeviceOptions, backend: Box<dyn BufferBackend + Send>) -> Self {
        Self {
            options,
            trigger: TriggerConfig::default(),
            acquisition: AcquisitionConfig::default(),
            seq_num: 0,
            pending: vec![],
            backend,
        }
    }

    #[must_use]
    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    /// The trigger settings last written
    #[must_use]
    pub fn trigger_config(&self) -> &TriggerConfig {
        &self.trigger
    }

    /// The acquisition shape last written
    #[must_use]
    pub fn acquisition_config(&self) -> &AcquisitionConfig {
        &self.acquisition
    }

    /// Whether the software trigger was last enabled. Answered without touching hardware.
    #[must_use]
    pub fn sw_enabled(&self) -> bool {
        self.trigger.sw_enable
    }

    /// Number of blocks waiting on the DMA in flight
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Write every trigger setting
    /// # Errors
    /// Returns an error if `config` is invalid, in which case nothing is written, or on a
    /// failed bus access
    pub fn configure_trigger<T: Transport>(
        &mut self,
        transport: &mut T,
        config: &TriggerConfig,
    ) -> Result<()> {
        config.validate()?;
        transport.write_field(regs::TRIG_CFG_HW_SEL, config.source.bit())?;
        transport.write_field(regs::TRIG_CFG_HW_POL, config.polarity.bit())?;
        transport.write_field(regs::TRIG_CFG_INT_SEL, config.int_channel as u32)?;
        transport.write_field(regs::TRIG_CFG_THRES, config.threshold.into())?;
        transport.write_field(regs::TRIG_DELAY, config.delay)?;
        transport.write_field(regs::TRIG_CFG_HW_EN, config.hw_enable.into())?;
        transport.write_field(regs::TRIG_CFG_SW_EN, config.sw_enable.into())?;
        self.trigger = *config;
        Ok(())
    }

    /// Write the whole acquisition shape
    /// # Errors
    /// Returns an error if `config` is invalid, in which case nothing is written, or on a
    /// failed bus access
    pub fn configure_acquisition<T: Transport>(
        &mut self,
        transport: &mut T,
        config: &AcquisitionConfig,
    ) -> Result<()> {
        config.validate(&self.options)?;
        transport.write_field(regs::TRIG_PRE, config.pre_samples)?;
        transport.write_field(regs::TRIG_POST, config.post_samples)?;
        transport.write_field(regs::TRIG_SHOTS_NB, config.shots.into())?;
        transport.write_field(regs::TRIG_SR_DECI, config.decimation.into())?;
        self.acquisition = *config;
        Ok(())
    }

    /// Validate `candidate` against the device before writing one field of it
    fn stage<T: Transport>(
        &mut self,
        transport: &mut T,
        candidate: AcquisitionConfig,
        field: RegisterField,
        raw: u32,
    ) -> Result<()> {
        candidate.validate(&self.options)?;
        transport.write_field(field, raw)?;
        self.acquisition = candidate;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the acquisition would no longer fit in device memory, or on a failed
    /// bus access
    pub fn set_pre_samples<T: Transport>(&mut self, transport: &mut T, pre: u32) -> Result<()> {
        let candidate = AcquisitionConfig {
            pre_samples: pre,
            ..self.acquisition
        };
        self.stage(transport, candidate, regs::TRIG_PRE, pre)
    }

    /// # Errors
    /// Returns an error if the acquisition would no longer fit in device memory, or on a failed
    /// bus access
    pub fn set_post_samples<T: Transport>(&mut self, transport: &mut T, post: u32) -> Result<()> {
        let candidate = AcquisitionConfig {
            post_samples: post,
            ..self.acquisition
        };
        self.stage(transport, candidate, regs::TRIG_POST, post)
    }

    /// # Errors
    /// Returns an error on zero shots, on an acquisition that would no longer fit in device
    /// memory, or on a failed bus access
    pub fn set_shots<T: Transport>(&mut self, transport: &mut T, shots: u16) -> Result<()> {
        let candidate = AcquisitionConfig {
            shots,
            ..self.acquisition
        };
        self.stage(transport, candidate, regs::TRIG_SHOTS_NB, shots.into())
    }

    /// # Errors
    /// Returns an error on a zero decimation or a failed bus access
    pub fn set_decimation<T: Transport>(
        &mut self,
        transport: &mut T,
        decimation: u16,
    ) -> Result<()> {
        let candidate = AcquisitionConfig {
            decimation,
            ..self.acquisition
        };
        self.stage(transport, candidate, regs::TRIG_SR_DECI, decimation.into())
    }

    /// # Errors
    /// Returns an error if the channel doesn't exist or on a failed bus access
    pub fn set_int_channel<T: Transport>(
        &mut self,
        transport: &mut T,
        channel: usize,
    ) -> Result<()> {
        if channel >= FA_NCHAN {
            return Err(ConfigError::Channel(channel).into());
        }
        transport.write_field(regs::TRIG_CFG_INT_SEL, channel as u32)?;
        self.trigger.int_channel = channel;
        Ok(())
    }

    trigger_setter!(source, TriggerSource, regs::TRIG_CFG_HW_SEL, TriggerSource::bit);
    trigger_setter!(polarity, Polarity, regs::TRIG_CFG_HW_POL, Polarity::bit);
    trigger_setter!(threshold, u16, regs::TRIG_CFG_THRES, u32::from);
    trigger_setter!(delay, u32, regs::TRIG_DELAY, u32::from);
    trigger_setter!(hw_enable, bool, regs::TRIG_CFG_HW_EN, u32::from);
    trigger_setter!(sw_enable, bool, regs::TRIG_CFG_SW_EN, u32::from);

    /// Read every trigger and acquisition setting back from hardware
    /// # Errors
    /// Returns an error on a failed bus access
    pub fn retrieve_config<T: Transport>(
        &self,
        transport: &mut T,
    ) -> Result<(TriggerConfig, AcquisitionConfig)> {
        let trigger = TriggerConfig {
            source: TriggerSource::from_bit(transport.read_field(regs::TRIG_CFG_HW_SEL)?),
            polarity: Polarity::from_bit(transport.read_field(regs::TRIG_CFG_HW_POL)?),
            hw_enable: transport.read_field(regs::TRIG_CFG_HW_EN)? != 0,
            sw_enable: transport.read_field(regs::TRIG_CFG_SW_EN)? != 0,
            int_channel: transport.read_field(regs::TRIG_CFG_INT_SEL)? as usize,
            threshold: transport.read_field(regs::TRIG_CFG_THRES)? as u16,
            delay: transport.read_field(regs::TRIG_DELAY)?,
        };
        let acquisition = AcquisitionConfig {
            pre_samples: transport.read_field(regs::TRIG_PRE)?,
            post_samples: transport.read_field(regs::TRIG_POST)?,
            shots: transport.read_field(regs::TRIG_SHOTS_NB)? as u16,
            decimation: transport.read_field(regs::TRIG_SR_DECI)? as u16,
        };
        Ok((trigger, acquisition))
    }

    /// Write both trigger enables without touching the stored settings
    /// # Errors
    /// Returns an error on a failed bus access
    pub fn write_enables<T: Transport>(
        &self,
        transport: &mut T,
        hw: bool,
        sw: bool,
    ) -> Result<()> {
        transport.write_field(regs::TRIG_CFG_HW_EN, hw.into())?;
        transport.write_field(regs::TRIG_CFG_SW_EN, sw.into())?;
        Ok(())
    }

    /// Put the stored trigger enables back into hardware
    /// # Errors
    /// Returns an error on a failed bus access
    pub fn restore_enables<T: Transport>(&self, transport: &mut T) -> Result<()> {
        self.write_enables(transport, self.trigger.hw_enable, self.trigger.sw_enable)
    }

    /// Move the acquisition in device memory to the host.
    ///
    /// Allocates one block per shot and starts one DMA chain over all of them. Returns as soon
    /// as the transfer is started. On failure the shot is lost: every block allocated so far is
    /// freed and nothing is retried.
    /// # Errors
    /// Returns an error if a block can't be allocated or the DMA can't be started
    pub fn fire<T: Transport>(&mut self, transport: &mut T, dma: &mut DmaEngine) -> Result<()> {
        let mut ctrl = ControlRecord {
            sample_size: self.options.sample_size,
            pre_samples: self.acquisition.pre_samples,
            post_samples: self.acquisition.post_samples,
            decimation: self.acquisition.decimation,
            ..Default::default()
        };
        ctrl.acq_start = TimestampEvent::AcqStart.read(transport)?;
        ctrl.trigger = TimestampEvent::Trigger.read(transport)?;
        ctrl.acq_stop = TimestampEvent::AcqStop.read(transport)?;
        ctrl.acq_end = TimestampEvent::AcqEnd.read(transport)?;

        let shot_bytes = self.acquisition.samples_per_shot() as usize * self.options.sample_size;
        let mut blocks = Vec::with_capacity(self.acquisition.shots.into());
        for shot in 0..self.acquisition.shots {
            self.seq_num += 1;
            ctrl.seq_num = self.seq_num;
            ctrl.shot = shot;
            let Some(mut block) = self.backend.alloc(&ctrl, shot_bytes) else {
                warn!(shot, bytes = shot_bytes, "Can't allocate block, shot lost");
                self.free_all(blocks);
                return Err(Error::BlockAlloc(shot_bytes));
            };
            block.dev_mem_off = (usize::from(shot) * shot_bytes) as u32;
            blocks.push(block);
        }

        let dma_blocks: Vec<DmaBlock> = blocks.iter().map(DataBlock::dma_block).collect();
        if let Err(e) = dma.start(transport, &dma_blocks) {
            warn!(error = %e, "Can't start DMA, shot lost");
            self.free_all(blocks);
            return Err(e.into());
        }
        debug!(
            blocks = blocks.len(),
            seq_num = self.seq_num,
            "Fired, transfer started"
        );
        self.pending = blocks;
        Ok(())
    }

    /// Hand every block of the finished transfer to the back end, returning how many there were
    pub fn complete(&mut self) -> usize {
        let blocks = std::mem::take(&mut self.pending);
        let n = blocks.len();
        for block in blocks {
            if let Err(block) = self.backend.store(block) {
                debug!(seq_num = block.ctrl.seq_num, "Back end refused block");
                self.backend.free(block);
            }
        }
        n
    }

    /// Drop the blocks of an aborted transfer, returning how many there were
    pub fn abort(&mut self) -> usize {
        let blocks = std::mem::take(&mut self.pending);
        let n = blocks.len();
        self.free_all(blocks);
        n
    }

    fn free_all(&mut self, blocks: Vec<DataBlock>) {
        for block in blocks {
            self.backend.free(block);
        }
    }

    /// Force a fresh acquisition from software.
    ///
    /// The enable check uses the stored settings only. When it passes, any acquisition or
    /// transfer in progress is dropped, the state machine is re-armed and the software trigger
    /// is pulsed.
    /// # Errors
    /// Returns [`Error::Permission`] if the software trigger isn't enabled, or an error on a
    /// failed bus access
    pub fn software_fire<T: Transport>(
        &mut self,
        transport: &mut T,
        dma: &mut DmaEngine,
    ) -> Result<()> {
        if !self.sw_enabled() {
            warn!("Software trigger must be enabled first");
            return Err(Error::Permission);
        }
        fsm::stop(transport)?;
        if dma.abort(transport)? {
            debug!("Aborted transfer in flight");
        }
        self.abort();
        self.restore_enables(transport)?;
        fsm::start(transport)?;
        transport.write_field(regs::TRIG_SW, 1)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{
            FSM_CMD_START,
            FSM_CMD_STOP,
        },
        dma::IdentityMapper,
        transport::mock::Mock,
    };

    fn controller() -> (TriggerController, VecBackend) {
        let backend = VecBackend::new();
        (
            TriggerController::new(DeviceOptions::default(), Box::new(backend.clone())),
            backend,
        )
    }

    fn engine() -> (DmaEngine, IdentityMapper) {
        let mapper = IdentityMapper::new();
        (
            DmaEngine::new(Box::new(mapper.clone()), DEFAULT_GRANULARITY),
            mapper,
        )
    }

    fn acq(pre: u32, post: u32, shots: u16) -> AcquisitionConfig {
        AcquisitionConfig {
            pre_samples: pre,
            post_samples: post,
            shots,
            decimation: 1,
        }
    }

    #[test]
    fn test_config_within_memory() {
        let options = DeviceOptions::default();
        // Exactly fills the memory
        let max_samples = (FA_MAX_ACQ_BYTE / 2) as u32;
        assert!(acq(max_samples / 2, max_samples / 2, 1).validate(&options).is_ok());
        assert!(acq(1000, 1000, 4).validate(&options).is_ok());
        assert!(acq(0, 0, 1).validate(&options).is_ok());
    }

    #[test]
    fn test_config_exceeding_memory() {
        let options = DeviceOptions::default();
        let max_samples = (FA_MAX_ACQ_BYTE / 2) as u32;
        assert!(matches!(
            acq(max_samples / 2, max_samples / 2 + 1, 1).validate(&options),
            Err(ConfigError::MemoryOverflow { .. })
        ));
        assert!(matches!(
            acq(max_samples / 4, max_samples / 4, 3).validate(&options),
            Err(ConfigError::MemoryOverflow { .. })
        ));
        assert!(matches!(
            acq(u32::MAX, u32::MAX, u16::MAX).validate(&options),
            Err(ConfigError::MemoryOverflow { .. })
        ));
    }

    #[test]
    fn test_decimation_bounds() {
        let options = DeviceOptions::default();
        let mut config = acq(10, 10, 1);
        for decimation in [1, 2, 100, u16::MAX] {
            config.decimation = decimation;
            assert!(config.validate(&options).is_ok());
        }
        config.decimation = 0;
        assert_eq!(config.validate(&options), Err(ConfigError::Decimation));
    }

    #[test]
    fn test_zero_shots() {
        assert_eq!(
            acq(10, 10, 0).validate(&DeviceOptions::default()),
            Err(ConfigError::ShotCount)
        );
    }

    #[test]
    fn test_rejected_config_writes_nothing() {
        let (mut ctl, _) = controller();
        let mut transport = Mock::new();
        let mut config = acq(10, 10, 1);
        config.decimation = 0;
        assert!(matches!(
            ctl.configure_acquisition(&mut transport, &config),
            Err(Error::Config(ConfigError::Decimation))
        ));
        assert!(matches!(
            ctl.set_decimation(&mut transport, 0),
            Err(Error::Config(ConfigError::Decimation))
        ));
        let bad = TriggerConfig {
            int_channel: 4,
            ..Default::default()
        };
        assert!(ctl.configure_trigger(&mut transport, &bad).is_err());
        assert!(transport.writes().is_empty());
    }

    #[test]
    fn test_pre_post_checked_against_each_other() {
        let (mut ctl, _) = controller();
        let mut transport = Mock::new();
        let half = (FA_MAX_ACQ_BYTE / 4) as u32;
        ctl.set_pre_samples(&mut transport, half).unwrap();
        ctl.set_post_samples(&mut transport, half).unwrap();
        transport.clear_writes();
        assert!(ctl.set_post_samples(&mut transport, half + 1).is_err());
        assert!(ctl.set_shots(&mut transport, 2).is_err());
        assert!(transport.writes().is_empty());
        assert_eq!(ctl.acquisition_config().post_samples, half);
    }

    #[test]
    fn test_shadow_state_is_per_instance() {
        let (mut a, _) = controller();
        let (mut b, _) = controller();
        let mut ta = Mock::new();
        let mut tb = Mock::new();
        let most = (FA_MAX_ACQ_BYTE / 2) as u32 - 10;
        a.set_post_samples(&mut ta, 10).unwrap();
        a.set_pre_samples(&mut ta, most).unwrap();
        // b has its own view of pre, so a large post is fine there
        b.set_post_samples(&mut tb, most).unwrap();
        assert!(a.set_post_samples(&mut ta, 11).is_err());
    }

    #[test]
    fn test_configure_and_retrieve() {
        let (mut ctl, _) = controller();
        let mut transport = Mock::new();
        let trigger = TriggerConfig {
            source: TriggerSource::External,
            polarity: Polarity::Negative,
            hw_enable: false,
            sw_enable: true,
            int_channel: 2,
            threshold: 0x1234,
            delay: 77,
        };
        let acquisition = AcquisitionConfig {
            pre_samples: 100,
            post_samples: 2000,
            shots: 3,
            decimation: 5,
        };
        ctl.configure_trigger(&mut transport, &trigger).unwrap();
        ctl.configure_acquisition(&mut transport, &acquisition).unwrap();
        assert_eq!(
            ctl.retrieve_config(&mut transport).unwrap(),
            (trigger, acquisition)
        );
        assert_eq!(transport.peek_field(regs::TRIG_CFG_THRES), 0x1234);
        assert_eq!(transport.peek_field(regs::TRIG_CFG_INT_SEL), 2);
    }

    #[test]
    fn test_generated_setters() {
        let (mut ctl, _) = controller();
        let mut transport = Mock::new();
        ctl.set_threshold(&mut transport, 0xBEEF).unwrap();
        ctl.set_polarity(&mut transport, Polarity::Negative).unwrap();
        ctl.set_source(&mut transport, TriggerSource::External).unwrap();
        ctl.set_delay(&mut transport, 12).unwrap();
        ctl.set_sw_enable(&mut transport, true).unwrap();
        assert_eq!(transport.peek_field(regs::TRIG_CFG_THRES), 0xBEEF);
        assert_eq!(transport.peek_field(regs::TRIG_CFG_HW_POL), 1);
        assert_eq!(transport.peek_field(regs::TRIG_CFG_HW_SEL), 1);
        assert_eq!(transport.peek_field(regs::TRIG_DELAY), 12);
        assert!(ctl.sw_enabled());
        assert!(ctl.set_int_channel(&mut transport, 4).is_err());
    }

    #[test]
    fn test_timestamp_read() {
        let mut transport = Mock::new();
        transport.poke_field(regs::UTC_TRIG_SECONDS, 1_700_000_000);
        transport.poke_field(regs::UTC_TRIG_COARSE, 12_345);
        transport.poke_field(regs::UTC_TRIG_FINE, 6);
        assert_eq!(
            TimestampEvent::Trigger.read(&mut transport).unwrap(),
            Timestamp {
                seconds: 1_700_000_000,
                coarse_ticks: 12_345,
                fine_bins: 6,
            }
        );
        assert_eq!(
            TimestampEvent::AcqEnd.read(&mut transport).unwrap(),
            Timestamp::default()
        );
    }

    #[test]
    fn test_fire_single_shot() {
        let (mut ctl, backend) = controller();
        let (mut dma, mapper) = engine();
        let mut transport = Mock::new();
        ctl.configure_acquisition(&mut transport, &acq(100, 400, 1)).unwrap();
        transport.poke_field(regs::UTC_TRIG_SECONDS, 42);
        ctl.fire(&mut transport, &mut dma).unwrap();
        assert_eq!(ctl.pending(), 1);
        assert_eq!(backend.outstanding(), 1000);
        assert_eq!(transport.dma_starts(), 1);
        assert!(dma.busy());
        assert_eq!(dma.in_flight().unwrap().total_len(), 1000);
        assert!(mapper.live_mappings() >= 1);

        dma.teardown();
        assert_eq!(ctl.complete(), 1);
        let block = backend.pop().unwrap();
        assert_eq!(block.data.len(), 1000);
        assert_eq!(block.ctrl.seq_num, 1);
        assert_eq!(block.ctrl.trigger.seconds, 42);
        assert_eq!(backend.outstanding(), 0);
    }

    #[test]
    fn test_fire_multi_shot() {
        let (mut ctl, backend) = controller();
        let (mut dma, _) = engine();
        let mut transport = Mock::new();
        ctl.configure_acquisition(&mut transport, &acq(10, 90, 3)).unwrap();
        ctl.fire(&mut transport, &mut dma).unwrap();
        let chain = dma.in_flight().unwrap();
        assert_eq!(chain.total_len(), 3 * 200);
        dma.teardown();
        ctl.complete();
        let blocks: Vec<_> = std::iter::from_fn(|| backend.pop()).collect();
        let offsets: Vec<u32> = blocks.iter().map(|b| b.dev_mem_off).collect();
        assert_eq!(offsets, vec![0, 200, 400]);
        let seqs: Vec<u64> = blocks.iter().map(|b| b.ctrl.seq_num).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_fire_alloc_failure_loses_shot() {
        let backend = VecBackend::with_limit(300);
        let mut ctl = TriggerController::new(DeviceOptions::default(), Box::new(backend.clone()));
        let (mut dma, mapper) = engine();
        let mut transport = Mock::new();
        ctl.configure_acquisition(&mut transport, &acq(0, 100, 2)).unwrap();
        assert!(matches!(
            ctl.fire(&mut transport, &mut dma),
            Err(Error::BlockAlloc(200))
        ));
        assert_eq!(backend.outstanding(), 0);
        assert_eq!(ctl.pending(), 0);
        assert_eq!(transport.dma_starts(), 0);
        assert_eq!(mapper.live_tables(), 0);
    }

    #[test]
    fn test_fire_without_data() {
        let (mut ctl, backend) = controller();
        let (mut dma, _) = engine();
        let mut transport = Mock::new();
        ctl.configure_acquisition(&mut transport, &acq(0, 0, 1)).unwrap();
        assert!(matches!(
            ctl.fire(&mut transport, &mut dma),
            Err(Error::Resource(crate::dma::Error::NoData))
        ));
        assert_eq!(backend.outstanding(), 0);
        assert!(!dma.busy());
    }

    #[test]
    fn test_refused_block_is_freed() {
        let (mut ctl, backend) = controller();
        let (mut dma, _) = engine();
        let mut transport = Mock::new();
        backend.limit_stored(0);
        ctl.fire(&mut transport, &mut dma).unwrap();
        dma.teardown();
        assert_eq!(ctl.complete(), 1);
        assert_eq!(backend.stored(), 0);
        assert_eq!(backend.outstanding(), 0);
    }

    #[test]
    fn test_software_fire_disabled() {
        let (mut ctl, _) = controller();
        let (mut dma, _) = engine();
        let mut transport = Mock::new();
        // Hardware says enabled, but the stored setting rules
        transport.poke_field(regs::TRIG_CFG_SW_EN, 1);
        assert!(matches!(
            ctl.software_fire(&mut transport, &mut dma),
            Err(Error::Permission)
        ));
        assert!(transport.writes().is_empty());
    }

    #[test]
    fn test_software_fire_aborts_and_rearms() {
        let (mut ctl, backend) = controller();
        let (mut dma, mapper) = engine();
        let mut transport = Mock::new();
        ctl.set_sw_enable(&mut transport, true).unwrap();
        ctl.fire(&mut transport, &mut dma).unwrap();
        // As left by the end of acquisition handling
        ctl.write_enables(&mut transport, false, false).unwrap();
        transport.clear_writes();

        ctl.software_fire(&mut transport, &mut dma).unwrap();
        assert_eq!(transport.dma_aborts(), 1);
        assert_eq!(transport.peek_field(regs::TRIG_CFG_SW_EN), 1);
        assert_eq!(transport.peek_field(regs::TRIG_CFG_HW_EN), 1);
        assert!(!dma.busy());
        assert_eq!(mapper.live_tables(), 0);
        assert_eq!(ctl.pending(), 0);
        assert_eq!(backend.outstanding(), 0);
        assert_eq!(
            transport.field_writes(regs::CTL_FSM_CMD),
            vec![FSM_CMD_STOP, FSM_CMD_STOP, FSM_CMD_START]
        );
        let (offset, value) = *transport.writes().last().unwrap();
        assert_eq!((offset, value), (regs::TRIG_SW.byte_offset, 1));
        assert_eq!(transport.dma_starts(), 0);
    }
}
