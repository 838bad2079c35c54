//! Mock transport implementation used in testing the acquisition core

use super::{
    Error,
    Transport,
    TransportResult,
};
use crate::core::{
    regs,
    RegisterField,
};
use std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::{
        Arc,
        Mutex,
        PoisonError,
    },
};

#[derive(Debug, Default)]
struct MockState {
    memory: HashMap<u32, u32>,
    writes: Vec<(u32, u32)>,
    irq_acks: usize,
    broken: HashSet<u32>,
}

/// A register file that mocks reads and writes, useful for testing.
///
/// Clones share the same register file, so a test can keep a handle while the device owns
/// another one. Writes made through [`Transport`] are logged, writes made through
/// [`Mock::poke`] play the part of the hardware and are not.
#[derive(Debug, Clone, Default)]
pub struct Mock {
    state: Arc<Mutex<MockState>>,
}

impl Mock {
    /// Construct a new mock register file with every word reading as zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Set a whole register word from the hardware side
    pub fn poke(&self, offset: u32, value: u32) {
        self.with(|s| {
            s.memory.insert(offset, value);
        });
    }

    /// Set a bitfield from the hardware side
    pub fn poke_field(&self, field: RegisterField, value: u32) {
        self.with(|s| {
            let raw = s.memory.get(&field.byte_offset).copied().unwrap_or_default();
            s.memory.insert(field.byte_offset, field.insert(raw, value));
        });
    }

    /// Current value of a register word
    #[must_use]
    pub fn peek(&self, offset: u32) -> u32 {
        self.with(|s| s.memory.get(&offset).copied().unwrap_or_default())
    }

    /// Current value of a bitfield
    #[must_use]
    pub fn peek_field(&self, field: RegisterField) -> u32 {
        field.extract(self.peek(field.byte_offset))
    }

    /// Every `(offset, word)` written through the transport, in order
    #[must_use]
    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.with(|s| s.writes.clone())
    }

    /// The values a bitfield was given by each write to its word that changed or set it.
    /// Writes to the same word that only touched other fields are skipped.
    #[must_use]
    pub fn field_writes(&self, field: RegisterField) -> Vec<u32> {
        self.with(|s| {
            let mut values = vec![];
            let mut prev = None;
            for &(offset, word) in &s.writes {
                if offset != field.byte_offset {
                    continue;
                }
                let value = field.extract(word);
                let touched = match prev {
                    Some(p) => field.extract(p) != value || word == p,
                    None => true,
                };
                if touched {
                    values.push(value);
                }
                prev = Some(word);
            }
            values
        })
    }

    /// Number of DMA start commands issued through the transport
    #[must_use]
    pub fn dma_starts(&self) -> usize {
        self.with(|s| {
            s.writes
                .iter()
                .filter(|(offset, word)| {
                    *offset == regs::DMA_CTL_START.byte_offset
                        && regs::DMA_CTL_START.extract(*word) == 1
                })
                .count()
        })
    }

    /// Number of DMA abort commands issued through the transport
    #[must_use]
    pub fn dma_aborts(&self) -> usize {
        self.with(|s| {
            s.writes
                .iter()
                .filter(|(offset, word)| {
                    *offset == regs::DMA_CTL_ABORT.byte_offset
                        && regs::DMA_CTL_ABORT.extract(*word) == 1
                })
                .count()
        })
    }

    /// Forget the write log
    pub fn clear_writes(&self) {
        self.with(|s| s.writes.clear());
    }

    /// Number of interrupt acknowledges received
    #[must_use]
    pub fn irq_acks(&self) -> usize {
        self.with(|s| s.irq_acks)
    }

    /// Make every access to the word at `offset` fail
    pub fn break_register(&self, offset: u32) {
        self.with(|s| {
            s.broken.insert(offset);
        });
    }
}

impl Transport for Mock {
    fn read_u32(&mut self, offset: u32) -> TransportResult<u32> {
        self.with(|s| {
            if s.broken.contains(&offset) {
                return Err(Error::Bus(offset));
            }
            Ok(s.memory.get(&offset).copied().unwrap_or_default())
        })
    }

    fn write_u32(&mut self, offset: u32, value: u32) -> TransportResult<()> {
        self.with(|s| {
            if s.broken.contains(&offset) {
                return Err(Error::Bus(offset));
            }
            s.memory.insert(offset, value);
            s.writes.push((offset, value));
            // Start and abort are strobes, the controller clears them once latched
            if offset == regs::DMA_CTL_START.byte_offset {
                let cleared = regs::DMA_CTL_ABORT.insert(regs::DMA_CTL_START.insert(value, 0), 0);
                s.memory.insert(offset, cleared);
            }
            Ok(())
        })
    }

    fn irq_ack(&mut self) -> TransportResult<()> {
        self.with(|s| {
            s.irq_acks += 1;
            // Acknowledging clears the latched cause bits
            s.memory.insert(regs::IRQ_SRC.byte_offset, 0);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paste::paste;

    macro_rules! test_rw_field {
        ($name:ident, $field:expr, $v:literal) => {
            paste! {
                #[test]
                fn [<test_rw_ $name>]() {
                    let mut transport = Mock::new();
                    transport.write_field($field, $v).unwrap();
                    let read: u32 = transport.read_field($field).unwrap();
                    assert_eq!(read, $v);
                }
            }
        };
    }

    #[test]
    fn test_read_defaults_to_zero() {
        let mut transport = Mock::new();
        assert_eq!(transport.read_u32(0x1234).unwrap(), 0);
    }

    #[test]
    fn test_write_read() {
        let mut transport = Mock::new();
        transport.write_u32(0x10, 0xDEAD_BEEF).unwrap();
        assert_eq!(transport.read_u32(0x10).unwrap(), 0xDEAD_BEEF);
        assert_eq!(transport.writes(), vec![(0x10, 0xDEAD_BEEF)]);
    }

    #[test]
    fn test_field_write_preserves_word() {
        let mut transport = Mock::new();
        transport.poke(regs::TRIG_CFG_THRES.byte_offset, 0x0000_00FF);
        transport.write_field(regs::TRIG_CFG_THRES, 0xABCD).unwrap();
        assert_eq!(transport.peek(regs::TRIG_CFG_THRES.byte_offset), 0xABCD_00FF);
    }

    #[test]
    fn test_poke_is_not_logged() {
        let transport = Mock::new();
        transport.poke_field(regs::STA_FSM, 3);
        assert_eq!(transport.peek_field(regs::STA_FSM), 3);
        assert!(transport.writes().is_empty());
    }

    #[test]
    fn test_shared_between_clones() {
        let handle = Mock::new();
        let mut transport = handle.clone();
        transport.write_field(regs::CTL_CLK_EN, 1).unwrap();
        assert_eq!(handle.peek_field(regs::CTL_CLK_EN), 1);
    }

    #[test]
    fn test_broken_register() {
        let mut transport = Mock::new();
        transport.break_register(0x40);
        assert!(matches!(transport.read_u32(0x40), Err(Error::Bus(0x40))));
        assert!(transport.write_u32(0x40, 1).is_err());
        assert!(transport.writes().is_empty());
    }

    #[test]
    fn test_irq_ack_clears_cause() {
        let mut transport = Mock::new();
        transport.poke(regs::IRQ_SRC.byte_offset, 0xF);
        transport.irq_ack().unwrap();
        assert_eq!(transport.peek_field(regs::IRQ_SRC), 0);
        assert_eq!(transport.irq_acks(), 1);
    }

    #[test]
    fn test_dma_start_strobe() {
        let mut transport = Mock::new();
        transport.write_field(regs::DMA_CTL_START, 1).unwrap();
        assert_eq!(transport.peek_field(regs::DMA_CTL_START), 0);
        assert_eq!(transport.dma_starts(), 1);
    }

    #[test]
    fn test_dma_abort_strobe() {
        let mut transport = Mock::new();
        transport.write_field(regs::DMA_CTL_ABORT, 1).unwrap();
        assert_eq!(transport.peek_field(regs::DMA_CTL_ABORT), 0);
        assert_eq!(transport.dma_aborts(), 1);
        assert_eq!(transport.dma_starts(), 0);
    }

    test_rw_field!(fsm_cmd, regs::CTL_FSM_CMD, 2);
    test_rw_field!(threshold, regs::TRIG_CFG_THRES, 0xBEEF);
    test_rw_field!(int_sel, regs::TRIG_CFG_INT_SEL, 3);
    test_rw_field!(delay, regs::TRIG_DELAY, 0xDEAD_BEEF);
    test_rw_field!(gain_ch3, regs::CH_GAIN.channel(3), 0x8000);
    test_rw_field!(range_ch1, regs::CH_CTL_RANGE.channel(1), 0x45);
}
