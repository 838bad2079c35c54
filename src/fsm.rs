//! The hardware acquisition state machine.
//!
//! The state is owned by the gateware. Software only issues commands and reads the state back
//! when it needs it, nothing here caches or predicts transitions.

use crate::{
    core::{
        regs,
        FA_ADC_MEM_OFF,
        FSM_CMD_START,
        FSM_CMD_STOP,
    },
    transport::{
        Deserialize,
        Located,
        Serialize,
        Transport,
        TransportResult,
    },
};
use fmcadc_derive::{
    offset,
    RegisterWord,
};
use packed_struct::prelude::*;
use tracing::debug;

/// States of the acquisition state machine, as reported in the status register
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AcquisitionState {
    Idle,
    PreTrig,
    WaitTrig,
    PostTrig,
    DecrShot,
    /// Only reachable through a hardware fault
    Illegal,
}

impl AcquisitionState {
    /// Decode the 3-bit state code. Codes the gateware never produces read as
    /// [`AcquisitionState::Illegal`].
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Idle,
            2 => Self::PreTrig,
            3 => Self::WaitTrig,
            4 => Self::PostTrig,
            5 => Self::DecrShot,
            _ => Self::Illegal,
        }
    }

    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Idle => 1,
            Self::PreTrig => 2,
            Self::WaitTrig => 3,
            Self::PostTrig => 4,
            Self::DecrShot => 5,
            Self::Illegal => 7,
        }
    }
}

/// The ADC core status register
#[offset(FA_ADC_MEM_OFF + 0x04)]
#[derive(PackedStruct, RegisterWord, Default, Debug, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct FsmStatus {
    #[packed_field(bits = "0..=2")]
    state: Integer<u8, packed_bits::Bits<3>>,
    #[packed_field(bits = "3")]
    pub serdes_pll: bool,
    #[packed_field(bits = "4")]
    pub serdes_synced: bool,
}

impl FsmStatus {
    #[must_use]
    pub fn state(&self) -> AcquisitionState {
        AcquisitionState::from_code(self.state.into())
    }
}

/// Read the current state
/// # Errors
/// Returns an error on a failed bus access
pub fn state<T: Transport>(transport: &mut T) -> TransportResult<AcquisitionState> {
    let status: FsmStatus = transport.read()?;
    Ok(status.state())
}

/// Read the whole status register
/// # Errors
/// Returns an error on a failed bus access
pub fn status<T: Transport>(transport: &mut T) -> TransportResult<FsmStatus> {
    transport.read()
}

/// Force the state machine back to IDLE from wherever it is
/// # Errors
/// Returns an error on a failed bus access
pub fn stop<T: Transport>(transport: &mut T) -> TransportResult<()> {
    debug!("FSM stop");
    transport.write_field(regs::CTL_FSM_CMD, FSM_CMD_STOP)
}

/// Start an acquisition. A STOP always goes out first, so starting in the middle of an
/// acquisition restarts it.
/// # Errors
/// Returns an error on a failed bus access
pub fn start<T: Transport>(transport: &mut T) -> TransportResult<()> {
    stop(transport)?;
    debug!("FSM start");
    transport.write_field(regs::CTL_FSM_CMD, FSM_CMD_START)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::Mock;
    use paste::paste;

    macro_rules! test_state {
        ($name:ident, $code:literal, $state:expr) => {
            paste! {
                #[test]
                fn [<test_state_ $name>]() {
                    let mut transport = Mock::new();
                    transport.poke_field(regs::STA_FSM, $code);
                    assert_eq!(state(&mut transport).unwrap(), $state);
                }
            }
        };
    }

    test_state!(unknown_zero, 0, AcquisitionState::Illegal);
    test_state!(idle, 1, AcquisitionState::Idle);
    test_state!(pre_trig, 2, AcquisitionState::PreTrig);
    test_state!(wait_trig, 3, AcquisitionState::WaitTrig);
    test_state!(post_trig, 4, AcquisitionState::PostTrig);
    test_state!(decr_shot, 5, AcquisitionState::DecrShot);
    test_state!(unknown_six, 6, AcquisitionState::Illegal);
    test_state!(illegal, 7, AcquisitionState::Illegal);

    #[test]
    fn test_status_flags() {
        let mut transport = Mock::new();
        transport.poke(regs::STA_FSM.byte_offset, 0xFFFF_FF19);
        let status = status(&mut transport).unwrap();
        assert_eq!(status.state(), AcquisitionState::Idle);
        assert!(status.serdes_pll);
        assert!(status.serdes_synced);
    }

    #[test]
    fn test_start_stops_first() {
        let mut transport = Mock::new();
        start(&mut transport).unwrap();
        assert_eq!(
            transport.field_writes(regs::CTL_FSM_CMD),
            vec![FSM_CMD_STOP, FSM_CMD_START]
        );
    }

    #[test]
    fn test_commands_preserve_control_bits() {
        let mut transport = Mock::new();
        transport.poke_field(regs::CTL_CLK_EN, 1);
        transport.poke_field(regs::CTL_DAC_CLR_N, 1);
        start(&mut transport).unwrap();
        assert_eq!(transport.peek_field(regs::CTL_CLK_EN), 1);
        assert_eq!(transport.peek_field(regs::CTL_DAC_CLR_N), 1);
    }

    #[test]
    fn test_state_codes_round_trip() {
        for code in 1..=5 {
            assert_eq!(AcquisitionState::from_code(code).code(), code);
        }
        assert_eq!(AcquisitionState::Illegal.code(), 7);
    }
}
