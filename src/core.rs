//! The register map of the FMC ADC gateware and the core types used to address it
//!
//! Every register is a 32-bit word at a fixed byte offset from the memory-mapped base. A
//! [`RegisterField`] picks a bitfield out of one of those words.

/// Byte offset of the chained-DMA controller registers
pub const FA_DMA_MEM_OFF: u32 = 0x0_1000;
/// Byte offset of the UTC timestamp core
pub const FA_UTC_MEM_OFF: u32 = 0x0_1400;
/// Byte offset of the interrupt controller
pub const FA_IRQ_MEM_OFF: u32 = 0x0_1500;
/// Byte offset of the ADC core (control, status, trigger and channel registers)
pub const FA_ADC_MEM_OFF: u32 = 0x0_3000;

/// Number of analog input channels
pub const FA_NCHAN: usize = 4;
/// Distance in bytes between the register blocks of two consecutive channels
pub const CHANNEL_STRIDE: u32 = 0x10;
/// Bytes per sample (14-bit samples stored as 16-bit words)
pub const FA_SAMPLE_SIZE: usize = 2;
/// Size of the on-board acquisition memory in bytes
pub const FA_MAX_ACQ_BYTE: u64 = 0x1000_0000;
/// Maximum sample rate of the ADC in samples per second
pub const FA_MAX_SAMPLE_RATE: u32 = 100_000_000;

/// FSM command that starts an acquisition
pub const FSM_CMD_START: u32 = 1;
/// FSM command that forces the state machine back to IDLE
pub const FSM_CMD_STOP: u32 = 2;

/// A bitfield inside a 32-bit register word
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RegisterField {
    /// Offset of the register word from the base of the mapping
    pub byte_offset: u32,
    /// Mask of the field, applied after shifting
    pub mask: u32,
    /// Position of the least significant bit of the field
    pub shift: u8,
}

impl RegisterField {
    #[must_use]
    pub const fn new(byte_offset: u32, mask: u32, shift: u8) -> Self {
        Self {
            byte_offset,
            mask,
            shift,
        }
    }

    /// Extract this field's value from the raw register word
    #[must_use]
    pub const fn extract(&self, raw: u32) -> u32 {
        (raw >> self.shift) & self.mask
    }

    /// Return `raw` with this field replaced by `value`, leaving every other bit untouched.
    /// Bits of `value` outside the mask are dropped.
    #[must_use]
    pub const fn insert(&self, raw: u32, value: u32) -> u32 {
        let field_mask = self.mask << self.shift;
        (raw & !field_mask) | ((value << self.shift) & field_mask)
    }

    /// The same field in the register block of channel `index`.
    /// The base field must be a channel 0 field and `index` must be less than [`FA_NCHAN`].
    #[must_use]
    pub const fn channel(&self, index: usize) -> Self {
        Self {
            byte_offset: self.byte_offset + CHANNEL_STRIDE * index as u32,
            mask: self.mask,
            shift: self.shift,
        }
    }
}

/// The register table. Channel fields are given for channel 0, use [`RegisterField::channel`]
/// for the others.
pub mod regs {
    use super::{
        RegisterField as F,
        FA_ADC_MEM_OFF as ADC,
        FA_DMA_MEM_OFF as DMA,
        FA_IRQ_MEM_OFF as IRQ,
        FA_UTC_MEM_OFF as UTC,
    };

    // Control
    pub const CTL_FSM_CMD: F = F::new(ADC, 0x0003, 0);
    pub const CTL_CLK_EN: F = F::new(ADC, 0x0001, 2);
    pub const CTL_DAC_CLR_N: F = F::new(ADC, 0x0001, 3);
    pub const CTL_TEST_DATA_EN: F = F::new(ADC, 0x0001, 5);

    // Status
    pub const STA_FSM: F = F::new(ADC + 0x04, 0x0007, 0);
    pub const STA_SERDES_PLL: F = F::new(ADC + 0x04, 0x0001, 3);
    pub const STA_SERDES_SYNCED: F = F::new(ADC + 0x04, 0x0001, 4);

    // Trigger configuration
    pub const TRIG_CFG_HW_SEL: F = F::new(ADC + 0x08, 0x0001, 0);
    pub const TRIG_CFG_HW_POL: F = F::new(ADC + 0x08, 0x0001, 1);
    pub const TRIG_CFG_HW_EN: F = F::new(ADC + 0x08, 0x0001, 2);
    pub const TRIG_CFG_SW_EN: F = F::new(ADC + 0x08, 0x0001, 3);
    pub const TRIG_CFG_INT_SEL: F = F::new(ADC + 0x08, 0x0003, 4);
    pub const TRIG_CFG_THRES: F = F::new(ADC + 0x08, 0xFFFF, 16);
    pub const TRIG_DELAY: F = F::new(ADC + 0x0C, 0xFFFF_FFFF, 0);
    pub const TRIG_SW: F = F::new(ADC + 0x10, 0xFFFF_FFFF, 0);
    pub const TRIG_SHOTS_NB: F = F::new(ADC + 0x14, 0xFFFF, 0);
    pub const TRIG_POS: F = F::new(ADC + 0x18, 0xFFFF_FFFF, 0);
    pub const TRIG_SR_DECI: F = F::new(ADC + 0x1C, 0xFFFF, 0);
    pub const TRIG_PRE: F = F::new(ADC + 0x20, 0xFFFF_FFFF, 0);
    pub const TRIG_POST: F = F::new(ADC + 0x24, 0xFFFF_FFFF, 0);
    pub const TRIG_CNT: F = F::new(ADC + 0x28, 0xFFFF_FFFF, 0);

    // Channel 0, the rest follow every CHANNEL_STRIDE bytes
    pub const CH_CTL_RANGE: F = F::new(ADC + 0x2C, 0x007F, 0);
    pub const CH_STA: F = F::new(ADC + 0x30, 0xFFFF, 0);
    pub const CH_GAIN: F = F::new(ADC + 0x34, 0xFFFF, 0);
    pub const CH_OFFSET: F = F::new(ADC + 0x38, 0xFFFF, 0);

    // Chained DMA controller
    pub const DMA_CTL_START: F = F::new(DMA, 0x0001, 0);
    pub const DMA_CTL_ABORT: F = F::new(DMA, 0x0001, 1);
    pub const DMA_STA: F = F::new(DMA + 0x04, 0x0007, 0);
    pub const DMA_ADDR: F = F::new(DMA + 0x08, 0xFFFF_FFFF, 0);
    pub const DMA_ADDR_L: F = F::new(DMA + 0x0C, 0xFFFF_FFFF, 0);
    pub const DMA_ADDR_H: F = F::new(DMA + 0x10, 0xFFFF_FFFF, 0);
    pub const DMA_LEN: F = F::new(DMA + 0x14, 0xFFFF_FFFF, 0);
    pub const DMA_NEXT_L: F = F::new(DMA + 0x18, 0xFFFF_FFFF, 0);
    pub const DMA_NEXT_H: F = F::new(DMA + 0x1C, 0xFFFF_FFFF, 0);
    pub const DMA_BR_LAST: F = F::new(DMA + 0x20, 0x0001, 0);
    pub const DMA_BR_DIR: F = F::new(DMA + 0x20, 0x0001, 1);

    // Interrupt controller
    pub const IRQ_SRC: F = F::new(IRQ + 0x04, 0x000F, 0);
    pub const IRQ_MASK: F = F::new(IRQ + 0x08, 0x000F, 0);

    // UTC timestamps, each event is a (seconds, coarse, fine) triple
    pub const UTC_TRIG_SECONDS: F = F::new(UTC + 0x0C, 0xFFFF_FFFF, 0);
    pub const UTC_TRIG_COARSE: F = F::new(UTC + 0x10, 0xFFFF_FFFF, 0);
    pub const UTC_TRIG_FINE: F = F::new(UTC + 0x14, 0xFFFF_FFFF, 0);
    pub const UTC_ACQ_START_SECONDS: F = F::new(UTC + 0x1C, 0xFFFF_FFFF, 0);
    pub const UTC_ACQ_START_COARSE: F = F::new(UTC + 0x20, 0xFFFF_FFFF, 0);
    pub const UTC_ACQ_START_FINE: F = F::new(UTC + 0x24, 0xFFFF_FFFF, 0);
    pub const UTC_ACQ_STOP_SECONDS: F = F::new(UTC + 0x2C, 0xFFFF_FFFF, 0);
    pub const UTC_ACQ_STOP_COARSE: F = F::new(UTC + 0x30, 0xFFFF_FFFF, 0);
    pub const UTC_ACQ_STOP_FINE: F = F::new(UTC + 0x34, 0xFFFF_FFFF, 0);
    pub const UTC_ACQ_END_SECONDS: F = F::new(UTC + 0x3C, 0xFFFF_FFFF, 0);
    pub const UTC_ACQ_END_COARSE: F = F::new(UTC + 0x40, 0xFFFF_FFFF, 0);
    pub const UTC_ACQ_END_FINE: F = F::new(UTC + 0x44, 0xFFFF_FFFF, 0);
}
