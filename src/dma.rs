//! Scatter-gather transfers from the on-board acquisition memory to host memory
//!
//! The chained DMA controller only exposes registers for a single descriptor. Every other
//! descriptor of a transfer lives in a host-side table that the controller walks on its own by
//! following the `next` addresses, so the whole chain has to exist before the start bit is set.

use crate::{
    core::regs,
    transport::Transport,
};
use packed_struct::prelude::*;
use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{
        Arc,
        Mutex,
        PoisonError,
    },
};
use thiserror::Error;
use tracing::{
    debug,
    error,
};

/// Size in bytes of one descriptor as read by the controller
pub const FA_DMA_ITEM_SIZE: usize = 28;

/// Fragment granularity matching the usual host page size
pub const DEFAULT_FRAGMENT_GRANULARITY: usize = 4096;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No data to transfer")]
    NoData,
    #[error("Cannot allocate a descriptor table of {0} items")]
    TableAlloc(usize),
    #[error("Cannot map host memory at {0:#x} for DMA")]
    Map(u64),
    #[error("Cannot write the descriptor table at {0:#x}")]
    TableWrite(u64),
    #[error("A DMA transfer is already in flight")]
    Busy,
    #[error("Descriptor could not be packed")]
    Packing(#[from] PackingError),
    #[error(transparent)]
    Transport(#[from] crate::transport::Error),
}

/// One logical acquisition buffer to be filled from device memory
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DmaBlock {
    /// Host address of the first byte of the buffer
    pub host_addr: u64,
    /// Length of the buffer in bytes
    pub len: usize,
    /// Offset in device memory the buffer is copied from
    pub dev_mem_off: u32,
}

/// A host-contiguous piece of a [`DmaBlock`] that never crosses a granularity boundary
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub host_addr: u64,
    pub len: u32,
    pub dev_mem_off: u32,
}

impl DmaBlock {
    /// Split this block at every multiple of `granularity` in host address space, appending the
    /// pieces to `out`. Zero-length blocks contribute nothing.
    pub fn split_into(&self, granularity: NonZeroUsize, out: &mut Vec<Fragment>) {
        let g = granularity.get() as u64;
        let mut host_addr = self.host_addr;
        let mut dev_mem_off = self.dev_mem_off;
        let mut left = self.len as u64;
        while left > 0 {
            let room = (g - host_addr % g).min(u64::from(u32::MAX));
            let len = left.min(room);
            out.push(Fragment {
                host_addr,
                len: len as u32,
                dev_mem_off,
            });
            host_addr += len;
            dev_mem_off = dev_mem_off.wrapping_add(len as u32);
            left -= len;
        }
    }
}

/// A descriptor in the format the chained DMA controller reads
#[derive(PackedStruct, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(endian = "lsb")]
pub struct DmaItem {
    /// Offset in device memory
    pub start_addr: u32,
    pub dma_addr_l: u32,
    pub dma_addr_h: u32,
    pub dma_len: u32,
    pub next_addr_l: u32,
    pub next_addr_h: u32,
    /// Bit 0 set means another descriptor follows
    pub attribute: u32,
}

impl DmaItem {
    pub const MORE: u32 = 0x1;

    /// Bus address this descriptor transfers into
    #[must_use]
    pub fn dma_addr(&self) -> u64 {
        (u64::from(self.dma_addr_h) << 32) | u64::from(self.dma_addr_l)
    }

    /// Bus address of the next descriptor, meaningless on the last one
    #[must_use]
    pub fn next_addr(&self) -> u64 {
        (u64::from(self.next_addr_h) << 32) | u64::from(self.next_addr_l)
    }

    #[must_use]
    pub fn has_next(&self) -> bool {
        self.attribute & Self::MORE != 0
    }
}

/// The bus-address side of a transfer, supplied by the surrounding driver framework.
///
/// [`DmaEngine`] acquires resources in the order table, fragments, table contents and releases
/// them in the reverse order.
pub trait DmaMapper {
    /// Allocate device-visible storage for `items` descriptors and return its bus address
    /// # Errors
    /// Returns an error if the storage can't be allocated
    fn alloc_table(&mut self, items: usize) -> Result<u64, Error>;

    /// Fill a table previously returned by [`DmaMapper::alloc_table`] with packed descriptors
    /// # Errors
    /// Returns an error if the table can't be written or synced for the device
    fn write_table(&mut self, table: u64, bytes: &[u8]) -> Result<(), Error>;

    fn free_table(&mut self, table: u64);

    /// Map a host fragment for the device to write into, returning its bus address
    /// # Errors
    /// Returns an error if the fragment can't be mapped
    fn map(&mut self, fragment: &Fragment) -> Result<u64, Error>;

    fn unmap(&mut self, bus_addr: u64, len: u32);
}

#[derive(Debug)]
struct MapperState {
    next_table: u64,
    tables: HashMap<u64, Vec<u8>>,
    live_mappings: usize,
    maps: usize,
    fail_alloc: bool,
    fail_write: bool,
    fail_map_at: Option<usize>,
}

impl Default for MapperState {
    fn default() -> Self {
        Self {
            next_table: IdentityMapper::TABLE_BASE,
            tables: HashMap::new(),
            live_mappings: 0,
            maps: 0,
            fail_alloc: false,
            fail_write: false,
            fail_map_at: None,
        }
    }
}

/// A mapper for hosts without an IOMMU, where bus addresses equal host addresses.
///
/// Descriptor tables are kept in host memory owned by the mapper. Clones share the same state,
/// and failures can be injected to exercise the release paths.
#[derive(Debug, Clone, Default)]
pub struct IdentityMapper {
    state: Arc<Mutex<MapperState>>,
}

impl IdentityMapper {
    const TABLE_BASE: u64 = 0x1_0000_0000;

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MapperState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Number of fragments currently mapped
    #[must_use]
    pub fn live_mappings(&self) -> usize {
        self.with(|s| s.live_mappings)
    }

    /// Number of descriptor tables currently allocated
    #[must_use]
    pub fn live_tables(&self) -> usize {
        self.with(|s| s.tables.len())
    }

    /// The descriptors stored in the table at `table`, if it is still allocated
    #[must_use]
    pub fn table(&self, table: u64) -> Option<Vec<DmaItem>> {
        self.with(|s| {
            let bytes = s.tables.get(&table)?;
            bytes
                .chunks_exact(FA_DMA_ITEM_SIZE)
                .map(|chunk| {
                    let mut raw = [0u8; FA_DMA_ITEM_SIZE];
                    raw.copy_from_slice(chunk);
                    DmaItem::unpack(&raw).ok()
                })
                .collect()
        })
    }

    pub fn fail_table_alloc(&self, fail: bool) {
        self.with(|s| s.fail_alloc = fail);
    }

    pub fn fail_table_write(&self, fail: bool) {
        self.with(|s| s.fail_write = fail);
    }

    /// Fail the `n`th (zero-based) map request from now on
    pub fn fail_map_at(&self, n: Option<usize>) {
        self.with(|s| {
            s.maps = 0;
            s.fail_map_at = n;
        });
    }
}

impl DmaMapper for IdentityMapper {
    fn alloc_table(&mut self, items: usize) -> Result<u64, Error> {
        self.with(|s| {
            if s.fail_alloc {
                return Err(Error::TableAlloc(items));
            }
            let addr = s.next_table;
            let size = (items * FA_DMA_ITEM_SIZE) as u64;
            s.next_table += size.next_multiple_of(DEFAULT_FRAGMENT_GRANULARITY as u64);
            s.tables.insert(addr, vec![0; items * FA_DMA_ITEM_SIZE]);
            Ok(addr)
        })
    }

    fn write_table(&mut self, table: u64, bytes: &[u8]) -> Result<(), Error> {
        self.with(|s| {
            if s.fail_write {
                return Err(Error::TableWrite(table));
            }
            match s.tables.get_mut(&table) {
                Some(storage) if storage.len() == bytes.len() => {
                    storage.copy_from_slice(bytes);
                    Ok(())
                }
                _ => Err(Error::TableWrite(table)),
            }
        })
    }

    fn free_table(&mut self, table: u64) {
        self.with(|s| {
            s.tables.remove(&table);
        });
    }

    fn map(&mut self, fragment: &Fragment) -> Result<u64, Error> {
        self.with(|s| {
            let n = s.maps;
            s.maps += 1;
            if s.fail_map_at == Some(n) {
                return Err(Error::Map(fragment.host_addr));
            }
            s.live_mappings += 1;
            Ok(fragment.host_addr)
        })
    }

    fn unmap(&mut self, _bus_addr: u64, _len: u32) {
        self.with(|s| s.live_mappings = s.live_mappings.saturating_sub(1));
    }
}

/// A fully built descriptor chain, owned by the transfer it describes
#[derive(Debug)]
pub struct DmaDescriptorChain {
    items: Vec<DmaItem>,
    table_addr: u64,
    /// (bus address, length) of every mapped fragment, in chain order
    mappings: Vec<(u64, u32)>,
}

impl DmaDescriptorChain {
    #[must_use]
    pub fn items(&self) -> &[DmaItem] {
        &self.items
    }

    /// The descriptor that goes into the live DMA registers
    #[must_use]
    pub fn first(&self) -> &DmaItem {
        // A chain is never built empty
        &self.items[0]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Bus address of the descriptor table
    #[must_use]
    pub fn table_addr(&self) -> u64 {
        self.table_addr
    }

    /// Total number of bytes moved by this chain
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.items.iter().map(|i| u64::from(i.dma_len)).sum()
    }
}

/// Builds, programs and tears down descriptor chains. At most one chain is in flight.
pub struct DmaEngine {
    mapper: Box<dyn DmaMapper + Send>,
    granularity: NonZeroUsize,
    in_flight: Option<DmaDescriptorChain>,
}

impl std::fmt::Debug for DmaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaEngine")
            .field("granularity", &self.granularity)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl DmaEngine {
    pub fn new(mapper: Box<dyn DmaMapper + Send>, granularity: NonZeroUsize) -> Self {
        Self {
            mapper,
            granularity,
            in_flight: None,
        }
    }

    /// Whether a chain has been programmed and not yet torn down
    #[must_use]
    pub fn busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// The chain currently owned by the device, if any
    #[must_use]
    pub fn in_flight(&self) -> Option<&DmaDescriptorChain> {
        self.in_flight.as_ref()
    }

    /// Build the descriptor chain covering `blocks`, in order.
    ///
    /// Fragments are computed in a single pass over the blocks. Every fragment becomes one
    /// descriptor whose device offset continues from the previous one, restarting at each
    /// block's own device offset.
    /// # Errors
    /// Returns an error if there is nothing to transfer or if any mapping resource can't be
    /// acquired. Everything acquired so far is released before returning.
    pub fn build_chain(&mut self, blocks: &[DmaBlock]) -> Result<DmaDescriptorChain, Error> {
        let mut fragments = vec![];
        for block in blocks {
            block.split_into(self.granularity, &mut fragments);
        }
        if fragments.is_empty() {
            debug!(blocks = blocks.len(), "No fragments to transfer");
            return Err(Error::NoData);
        }
        debug!(
            fragments = fragments.len(),
            blocks = blocks.len(),
            "Building DMA chain"
        );

        let table_addr = self.mapper.alloc_table(fragments.len()).map_err(|e| {
            error!(items = fragments.len(), "Cannot allocate descriptor table");
            e
        })?;

        let mut mappings = Vec::with_capacity(fragments.len());
        let mut items = Vec::with_capacity(fragments.len());
        let last = fragments.len() - 1;
        for (i, fragment) in fragments.iter().enumerate() {
            let bus_addr = match self.mapper.map(fragment) {
                Ok(addr) => addr,
                Err(e) => {
                    error!(host_addr = fragment.host_addr, "Cannot map DMA memory");
                    self.release(table_addr, &mappings);
                    return Err(e);
                }
            };
            mappings.push((bus_addr, fragment.len));
            let mut item = DmaItem {
                start_addr: fragment.dev_mem_off,
                dma_addr_l: bus_addr as u32,
                dma_addr_h: (bus_addr >> 32) as u32,
                dma_len: fragment.len,
                ..Default::default()
            };
            if i != last {
                let next = table_addr + (FA_DMA_ITEM_SIZE * (i + 1)) as u64;
                item.next_addr_l = next as u32;
                item.next_addr_h = (next >> 32) as u32;
                item.attribute = DmaItem::MORE;
            }
            debug!(
                item = i,
                addr = bus_addr,
                len = item.dma_len,
                dev_off = item.start_addr,
                next = item.next_addr(),
                "Configured DMA item"
            );
            items.push(item);
        }

        let written = items
            .iter()
            .map(|item| item.pack())
            .collect::<Result<Vec<_>, _>>()
            .map_err(Error::from)
            .and_then(|packed| self.mapper.write_table(table_addr, &packed.concat()));
        if let Err(e) = written {
            self.release(table_addr, &mappings);
            return Err(e);
        }

        Ok(DmaDescriptorChain {
            items,
            table_addr,
            mappings,
        })
    }

    /// Hand `chain` to the device: the first descriptor goes into the live registers and the
    /// start bit is set. The chain is owned by the engine until [`DmaEngine::teardown`].
    /// # Errors
    /// Returns an error if a transfer is already in flight or a register access fails. In both
    /// cases `chain` is released.
    pub fn program<T: Transport>(
        &mut self,
        transport: &mut T,
        chain: DmaDescriptorChain,
    ) -> Result<(), Error> {
        if self.busy() {
            self.release_chain(chain);
            return Err(Error::Busy);
        }
        if let Err(e) = Self::write_first(transport, chain.first()) {
            self.release_chain(chain);
            return Err(e.into());
        }
        debug!(items = chain.len(), bytes = chain.total_len(), "DMA started");
        self.in_flight = Some(chain);
        Ok(())
    }

    fn write_first<T: Transport>(
        transport: &mut T,
        item: &DmaItem,
    ) -> Result<(), crate::transport::Error> {
        transport.write_field(regs::DMA_ADDR, item.start_addr)?;
        transport.write_field(regs::DMA_ADDR_L, item.dma_addr_l)?;
        transport.write_field(regs::DMA_ADDR_H, item.dma_addr_h)?;
        transport.write_field(regs::DMA_LEN, item.dma_len)?;
        transport.write_field(regs::DMA_NEXT_L, item.next_addr_l)?;
        transport.write_field(regs::DMA_NEXT_H, item.next_addr_h)?;
        transport.write_field(regs::DMA_BR_LAST, item.attribute & DmaItem::MORE)?;
        transport.write_field(regs::DMA_CTL_START, 1)
    }

    /// Build a chain over `blocks` and program it
    /// # Errors
    /// Returns an error if either step fails, nothing stays allocated in that case
    pub fn start<T: Transport>(
        &mut self,
        transport: &mut T,
        blocks: &[DmaBlock],
    ) -> Result<(), Error> {
        if self.busy() {
            return Err(Error::Busy);
        }
        let chain = self.build_chain(blocks)?;
        self.program(transport, chain)
    }

    /// Release the in-flight chain's mappings and descriptor table. Safe to call after normal
    /// completion, after an error, or with nothing in flight. Returns whether a chain was torn
    /// down.
    pub fn teardown(&mut self) -> bool {
        match self.in_flight.take() {
            Some(chain) => {
                debug!(items = chain.len(), "Unmapping DMA");
                self.release_chain(chain);
                true
            }
            None => false,
        }
    }

    /// Stop the controller and tear down the chain in flight, if any. The mappings stay alive
    /// when the abort can't be delivered, since the controller may still be writing to them.
    /// Returns whether a chain was torn down.
    /// # Errors
    /// Returns an error if the abort command can't be written
    pub fn abort<T: Transport>(&mut self, transport: &mut T) -> Result<bool, Error> {
        if !self.busy() {
            return Ok(false);
        }
        debug!("Aborting DMA");
        transport.write_field(regs::DMA_CTL_ABORT, 1)?;
        Ok(self.teardown())
    }

    fn release_chain(&mut self, chain: DmaDescriptorChain) {
        self.release(chain.table_addr, &chain.mappings);
    }

    fn release(&mut self, table_addr: u64, mappings: &[(u64, u32)]) {
        for &(bus_addr, len) in mappings.iter().rev() {
            self.mapper.unmap(bus_addr, len);
        }
        self.mapper.free_table(table_addr);
    }
}
