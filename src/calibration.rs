//! Per-channel gain/offset calibration, as persisted in the mezzanine EEPROM
//!
//! The persisted blob is a flat run of little-endian 16-bit words: three ADC stanzas (one per
//! input range) followed by three DAC stanzas. Every stanza is checked against the identity
//! calibration on load and replaced by it when any of its fields drifts too far.

use crate::{
    core::{
        regs,
        FA_NCHAN,
    },
    error::ConfigError,
    transport::Transport,
};
use fixed::types::U1F15;
use thiserror::Error;
use tracing::{
    debug,
    info,
};

/// Number of input ranges that carry their own calibration
pub const FA_CALIB_RANGES: usize = 3;
/// 16-bit words in one stanza: four offsets, four gains, one temperature
pub const STANZA_WORDS: usize = 2 * FA_NCHAN + 1;
/// Bytes in one persisted stanza
pub const STANZA_BYTES: usize = STANZA_WORDS * 2;
/// Exact size of the persisted calibration blob
pub const CALIB_BLOB_SIZE: usize = 2 * FA_CALIB_RANGES * STANZA_BYTES;

/// Largest accepted distance of an offset from the identity offset
pub const MAX_DELTA_OFFSET: i32 = 0x1000;
/// Largest accepted distance of a gain from unity
pub const MAX_DELTA_GAIN: i32 = 0x1000;
/// Largest accepted distance of the temperature from 50 C, in centi-degrees
pub const MAX_DELTA_TEMP: i32 = 40 * 100;

/// Raw gain word meaning a gain of exactly one
pub const UNITY_GAIN: u16 = 0x8000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Calibration data is accessed as a whole, offset {0} is not allowed")]
    Offset(u64),
    #[error("Calibration data is exactly {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error(transparent)]
    Transport(#[from] crate::transport::Error),
}

/// Analog input ranges of a channel, identified by the code written to the range register
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum InputRange {
    Range100mV,
    #[default]
    Range1V,
    Range10V,
    /// Input disconnected
    Open,
    /// Calibration reference for the 100mV range
    Cal100mV,
    /// Calibration reference for the 1V range
    Cal1V,
    /// Calibration reference for the 10V range
    Cal10V,
}

impl InputRange {
    /// The code of this range in the channel range register
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Range100mV => 0x23,
            Self::Range1V => 0x11,
            Self::Range10V => 0x45,
            Self::Open => 0x00,
            Self::Cal100mV => 0x42,
            Self::Cal1V => 0x40,
            Self::Cal10V => 0x44,
        }
    }

    /// Looks up a range register code. Only the seven documented codes are accepted.
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0x23 => Self::Range100mV,
            0x11 => Self::Range1V,
            0x45 => Self::Range10V,
            0x00 => Self::Open,
            0x42 => Self::Cal100mV,
            0x40 => Self::Cal1V,
            0x44 => Self::Cal10V,
            _ => return None,
        })
    }

    /// Index of the stanza holding this range's calibration. Calibration references use the
    /// stanza of the range they calibrate, an open input uses the 1V stanza.
    #[must_use]
    pub const fn calibration_index(self) -> usize {
        match self {
            Self::Range10V | Self::Cal10V => 0,
            Self::Range1V | Self::Cal1V | Self::Open => 1,
            Self::Range100mV | Self::Cal100mV => 2,
        }
    }
}

impl TryFrom<u32> for InputRange {
    type Error = ConfigError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or(ConfigError::Range(code))
    }
}

/// One calibration record for a group of four channels at one input range
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CalibrationStanza {
    pub offset: [i16; FA_NCHAN],
    /// Unsigned 1.15 fixed point, 0x8000 is unity
    pub gain: [u16; FA_NCHAN],
    /// Board temperature at calibration time in centi-degrees Celsius
    pub temperature: u16,
}

impl Default for CalibrationStanza {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl CalibrationStanza {
    /// Zero offset, unity gain, taken at 50 C
    pub const IDENTITY: Self = Self {
        offset: [0; FA_NCHAN],
        gain: [UNITY_GAIN; FA_NCHAN],
        temperature: 50 * 100,
    };

    fn from_words(words: &[u16]) -> Self {
        let mut stanza = Self::IDENTITY;
        for ch in 0..FA_NCHAN {
            stanza.offset[ch] = words[ch] as i16;
            stanza.gain[ch] = words[FA_NCHAN + ch];
        }
        stanza.temperature = words[2 * FA_NCHAN];
        stanza
    }

    fn to_words(self) -> [u16; STANZA_WORDS] {
        let mut words = [0; STANZA_WORDS];
        for ch in 0..FA_NCHAN {
            words[ch] = self.offset[ch] as u16;
            words[FA_NCHAN + ch] = self.gain[ch];
        }
        words[2 * FA_NCHAN] = self.temperature;
        words
    }

    /// The gain of channel `channel` as a fixed point number
    #[must_use]
    pub fn gain_factor(&self, channel: usize) -> U1F15 {
        U1F15::from_bits(self.gain[channel])
    }

    /// Count the fields of this stanza that lie outside the tolerance band around
    /// [`CalibrationStanza::IDENTITY`]
    #[must_use]
    pub fn deviations(&self) -> usize {
        let iden = Self::IDENTITY;
        let mut bad = 0;
        for ch in 0..FA_NCHAN {
            let delta = (i32::from(self.offset[ch]) - i32::from(iden.offset[ch])).abs();
            if delta > MAX_DELTA_OFFSET {
                debug!(channel = ch, offset = self.offset[ch], "Calibration offset out of band");
                bad += 1;
            }
            // Gains wrap as 16-bit quantities
            let delta = i32::from(self.gain[ch].wrapping_sub(iden.gain[ch]) as i16).abs();
            if delta > MAX_DELTA_GAIN {
                debug!(channel = ch, gain = self.gain[ch], "Calibration gain out of band");
                bad += 1;
            }
        }
        let delta = i32::from(self.temperature.wrapping_sub(iden.temperature) as i16).abs();
        if delta > MAX_DELTA_TEMP {
            debug!(temperature = self.temperature, "Calibration temperature out of band");
            bad += 1;
        }
        bad
    }

    /// Whether every field lies within the tolerance band around the identity
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.deviations() == 0
    }
}

/// Calibration for every input range of the ADC and of the offset DACs
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CalibrationTable {
    /// Indexed by [`InputRange::calibration_index`]
    pub adc: [CalibrationStanza; FA_CALIB_RANGES],
    pub dac: [CalibrationStanza; FA_CALIB_RANGES],
}

impl CalibrationTable {
    /// Deserialize a persisted blob and validate it.
    ///
    /// Never fails: every stanza outside the tolerance band is replaced by the identity stanza.
    /// Returns the table along with the number of stanzas that were replaced.
    #[must_use]
    pub fn load(raw: &[u8; CALIB_BLOB_SIZE]) -> (Self, usize) {
        let words: Vec<u16> = raw
            .chunks_exact(2)
            .map(|w| u16::from_le_bytes([w[0], w[1]]))
            .collect();
        let mut stanzas = words.chunks_exact(STANZA_WORDS).map(CalibrationStanza::from_words);
        let mut table = Self::default();
        for stanza in table.adc.iter_mut().chain(table.dac.iter_mut()) {
            if let Some(s) = stanzas.next() {
                *stanza = s;
            }
        }
        let errors = table.validate();
        (table, errors)
    }

    /// Replace every stanza outside the tolerance band with the identity stanza, returning how
    /// many were replaced
    pub fn validate(&mut self) -> usize {
        let mut errors = 0;
        for (kind, stanzas) in [("adc", &mut self.adc), ("dac", &mut self.dac)] {
            for (range, stanza) in stanzas.iter_mut().enumerate() {
                let bad = stanza.deviations();
                if bad > 0 {
                    info!(kind, range, fields = bad, "Invalid calibration, using identity");
                    *stanza = CalibrationStanza::IDENTITY;
                    errors += 1;
                }
            }
        }
        errors
    }

    /// Serialize to the persisted little-endian format
    #[must_use]
    pub fn to_bytes(&self) -> [u8; CALIB_BLOB_SIZE] {
        let mut out = [0u8; CALIB_BLOB_SIZE];
        let words = self
            .adc
            .iter()
            .chain(self.dac.iter())
            .flat_map(|s| s.to_words());
        for (dst, word) in out.chunks_exact_mut(2).zip(words) {
            dst.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Serialize into `out` as if it were the persisted blob at byte `offset`.
    /// # Errors
    /// Returns an error if `offset` is not zero or `out` isn't exactly [`CALIB_BLOB_SIZE`] long
    pub fn store(&self, out: &mut [u8], offset: u64) -> Result<(), Error> {
        check_access(out.len(), offset)?;
        out.copy_from_slice(&self.to_bytes());
        Ok(())
    }

    /// The ADC stanza used when a channel is set to `range`
    #[must_use]
    pub fn adc_stanza(&self, range: InputRange) -> &CalibrationStanza {
        &self.adc[range.calibration_index()]
    }

    /// Push the gain and offset of `channel` at `range` into the live channel registers
    /// # Errors
    /// Returns an error on a failed bus access
    pub fn apply<T: Transport>(
        &self,
        transport: &mut T,
        channel: usize,
        range: InputRange,
    ) -> Result<(), Error> {
        let stanza = self.adc_stanza(range);
        debug!(
            channel,
            ?range,
            gain = %stanza.gain_factor(channel),
            offset = stanza.offset[channel],
            "Applying calibration"
        );
        transport.write_field(regs::CH_GAIN.channel(channel), stanza.gain[channel].into())?;
        transport.write_field(
            regs::CH_OFFSET.channel(channel),
            u32::from(stanza.offset[channel] as u16),
        )?;
        Ok(())
    }
}

/// Check an access to the persisted blob, which is all-or-nothing
pub(crate) fn check_access(len: usize, offset: u64) -> Result<(), Error> {
    if offset != 0 {
        return Err(Error::Offset(offset));
    }
    if len != CALIB_BLOB_SIZE {
        return Err(Error::Length {
            expected: CALIB_BLOB_SIZE,
            actual: len,
        });
    }
    Ok(())
}
