//! Defines the register access boundary every fmcadc transport must implement

pub mod mock;

use crate::core::RegisterField;
use packed_struct::PackingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Bus access to register at offset {0:#06x} failed")]
    Bus(u32),
    #[error("Interrupt acknowledge failed")]
    IrqAck,
    #[error("Register word could not be packed or unpacked")]
    Packing(#[from] PackingError),
}

pub type TransportResult<T> = Result<T, Error>;

/// Types that implement this trait can be serialized such that they can be written to a
/// register word
pub trait Serialize {
    type Chunk;
    /// # Errors
    /// Returns an error if the value can't be packed
    fn serialize(&self) -> Result<Self::Chunk, Error>;
}

/// Types that implement this trait can be deserialized from a register word
pub trait Deserialize: Sized {
    type Chunk;
    /// # Errors
    /// Returns an error if the word doesn't unpack into a valid value
    fn deserialize(chunk: Self::Chunk) -> Result<Self, Error>;
}

/// Register words that live at a fixed byte offset
pub trait Located {
    const OFFSET: u32;
}

/// The trait that is implemented for the single-register access primitives of the
/// surrounding driver framework. Register state is never cached, every call goes to hardware.
pub trait Transport {
    /// Read the 32-bit register word at byte offset `offset`
    /// # Errors
    /// Returns an error on a failed bus access
    fn read_u32(&mut self, offset: u32) -> TransportResult<u32>;

    /// Write the 32-bit register word at byte offset `offset`
    /// # Errors
    /// Returns an error on a failed bus access
    fn write_u32(&mut self, offset: u32, value: u32) -> TransportResult<()>;

    /// Acknowledge the pending interrupt at the carrier level
    /// # Errors
    /// Returns an error if the acknowledge could not be delivered
    fn irq_ack(&mut self) -> TransportResult<()>;

    /// Read the value of a bitfield
    /// # Errors
    /// Returns an error on a failed bus access
    fn read_field(&mut self, field: RegisterField) -> TransportResult<u32> {
        Ok(field.extract(self.read_u32(field.byte_offset)?))
    }

    /// Read-modify-write a bitfield, preserving the other bits of the word
    /// # Errors
    /// Returns an error on a failed bus access
    fn write_field(&mut self, field: RegisterField, value: u32) -> TransportResult<()> {
        let raw = self.read_u32(field.byte_offset)?;
        self.write_u32(field.byte_offset, field.insert(raw, value))
    }

    /// Generically read a packed register word `R` from its fixed offset
    /// # Errors
    /// Returns an error on a failed bus access or a word that doesn't unpack
    fn read<R>(&mut self) -> TransportResult<R>
    where
        R: Deserialize<Chunk = [u8; 4]> + Located,
    {
        let raw = self.read_u32(R::OFFSET)?;
        R::deserialize(raw.to_be_bytes())
    }

    /// Generically write a packed register word `R` to its fixed offset
    /// # Errors
    /// Returns an error on a failed bus access or a value that doesn't pack
    fn write<R>(&mut self, data: &R) -> TransportResult<()>
    where
        R: Serialize<Chunk = [u8; 4]> + Located,
    {
        let raw = u32::from_be_bytes(data.serialize()?);
        self.write_u32(R::OFFSET, raw)
    }
}
