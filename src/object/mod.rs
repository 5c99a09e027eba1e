//! Objects being transmitted or received: plain files and append-only
//! streams, both partitioned into source blocks of encoding symbols.

mod file;
mod stream;

pub use file::File;
pub use stream::FileStream;

use crate::common::oti::FecScheme;
use crate::common::symbol::EncodingSymbol;
use crate::fdt::FileEntry;
use crate::fec::nocode::Partitioning;
use crate::tools::error::Result;
use std::collections::BTreeMap;

///
/// Per-symbol state. The symbol bytes live in the owning block's buffer (or
/// the object buffer) at `offset`, there is no aliasing between symbols.
///
#[derive(Clone, Debug)]
pub struct Symbol {
    pub esi: u16,
    pub offset: usize,
    pub length: usize,
    /// Only meaningful for streams: false until the writer filled this slot
    pub has_content: bool,
    pub complete: bool,
    /// Emitted on the wire but the send is not confirmed yet
    pub queued: bool,
}

///
/// One source block: a buffer plus the metadata of its symbols. Blocks of a
/// plain file index into the object buffer (`buffer` is None), stream blocks
/// and Raptor encoder blocks own their storage.
///
#[derive(Clone, Debug)]
pub struct SourceBlock {
    pub sbn: u16,
    pub complete: bool,
    /// Sum of all symbol lengths
    pub length: usize,
    pub buffer: Option<Vec<u8>>,
    pub symbols: Vec<Symbol>,
}

impl SourceBlock {
    /// Bytes of one symbol, resolved against the block or object buffer
    pub fn symbol_data<'a>(&'a self, object_buffer: Option<&'a [u8]>, idx: usize) -> Option<&'a [u8]> {
        let symbol = self.symbols.get(idx)?;
        let buffer = self.buffer.as_deref().or(object_buffer)?;
        buffer.get(symbol.offset..symbol.offset + symbol.length)
    }
}

///
/// Partition an object into blocks of empty symbol slots. With
/// `absolute_offsets` the symbol offsets index the object buffer, otherwise
/// they are block-relative.
///
pub(crate) fn build_blocks(
    partitioning: &Partitioning,
    transfer_length: u64,
    encoding_symbol_length: u64,
    absolute_offsets: bool,
    has_content: bool,
) -> Vec<SourceBlock> {
    let mut blocks = Vec::with_capacity(partitioning.nof_source_blocks as usize);
    let mut remaining = transfer_length;
    let mut global_offset = 0usize;
    let mut sbn: u16 = 0;

    while remaining > 0 {
        let block_symbols = partitioning.block_symbol_count(sbn);
        let mut symbols = Vec::with_capacity(block_symbols as usize);
        let mut block_length = 0usize;
        let mut local_offset = 0usize;

        for esi in 0..block_symbols as u16 {
            let symbol_length = remaining.min(encoding_symbol_length) as usize;
            symbols.push(Symbol {
                esi,
                offset: if absolute_offsets {
                    global_offset
                } else {
                    local_offset
                },
                length: symbol_length,
                has_content,
                complete: false,
                queued: false,
            });

            global_offset += symbol_length;
            local_offset += symbol_length;
            block_length += symbol_length;
            remaining -= symbol_length as u64;
            if remaining == 0 {
                break;
            }
        }

        blocks.push(SourceBlock {
            sbn,
            complete: false,
            length: block_length,
            buffer: None,
            symbols,
        });
        sbn += 1;
    }

    blocks
}

///
/// Pull not-complete, not-queued symbols that fit into `max_size` bytes and
/// flag them queued. Collection stops at the first symbol without content
/// (the stream backpressure boundary) and whenever appending a symbol would
/// break the same-block contiguous-ESI requirement of one ALC packet.
///
pub(crate) fn take_next_symbols(
    blocks: &mut [SourceBlock],
    object_buffer: Option<&[u8]>,
    encoding_symbol_length: u64,
    max_size: usize,
) -> Vec<EncodingSymbol> {
    let nof_symbols = max_size / encoding_symbol_length.max(1) as usize;
    let mut out: Vec<EncodingSymbol> = Vec::new();

    'blocks: for block_index in 0..blocks.len() {
        if out.len() >= nof_symbols {
            break;
        }

        let block = &blocks[block_index];
        if block.complete || block.symbols.is_empty() {
            continue;
        }
        if !block.symbols[0].has_content && block.buffer.is_none() && object_buffer.is_none() {
            break;
        }

        for idx in 0..blocks[block_index].symbols.len() {
            if out.len() >= nof_symbols {
                break 'blocks;
            }

            let block = &blocks[block_index];
            let symbol = &block.symbols[idx];
            if symbol.complete || symbol.queued {
                continue;
            }
            if !symbol.has_content {
                // Streams are filled in order, nothing beyond this point
                break 'blocks;
            }

            if let Some(last) = out.last() {
                if last.sbn != block.sbn || last.esi.wrapping_add(1) != symbol.esi {
                    break 'blocks;
                }
            }

            let data = match block.symbol_data(object_buffer, idx) {
                Some(data) => data.to_vec(),
                None => break 'blocks,
            };
            out.push(EncodingSymbol::new(block.sbn, symbol.esi, data));
            blocks[block_index].symbols[idx].queued = true;
        }
    }

    out
}

/// Missing (SBN -> ESIs) of all incomplete symbols in incomplete blocks
pub(crate) fn missing_parts_of(blocks: &[SourceBlock]) -> BTreeMap<u16, Vec<u16>> {
    let mut missing = BTreeMap::new();
    for block in blocks {
        if block.complete {
            continue;
        }
        let esis: Vec<u16> = block
            .symbols
            .iter()
            .filter(|s| !s.complete)
            .map(|s| s.esi)
            .collect();
        if !esis.is_empty() {
            missing.insert(block.sbn, esis);
        }
    }
    missing
}

///
/// Shared behavior of transmitted/received objects. A trait object of this
/// sits behind the per-TOI entry of the Transmitter and Receiver maps.
///
pub trait ObjectBase: Send {
    fn meta(&self) -> &FileEntry;
    fn meta_mut(&mut self) -> &mut FileEntry;

    fn complete(&self) -> bool;
    fn mark_complete(&mut self);

    /// Reception timestamp, seconds since epoch
    fn received_at(&self) -> u64;

    fn fdt_instance_id(&self) -> u32;
    fn set_fdt_instance_id(&mut self, id: u32);

    /// The assembled object, None when the buffer was released or the
    /// object keeps per-block storage only
    fn buffer(&self) -> Option<&[u8]>;
    fn free_buffer(&mut self);

    /// Drop the FEC decoder state once the object is done
    fn free_fec(&mut self) {}

    fn source_blocks(&self) -> &[SourceBlock];

    fn symbol_data(&self, sbn: u16, esi: u16) -> Option<&[u8]>;

    /// Write a received encoding symbol into its slot
    fn put_symbol(&mut self, symbol: &EncodingSymbol) -> Result<()>;

    fn get_next_symbols(&mut self, max_size: usize) -> Vec<EncodingSymbol>;

    fn mark_completed(&mut self, symbols: &[EncodingSymbol], success: bool);

    /// Missing (SBN -> ESIs) of all incomplete symbols in incomplete blocks
    fn missing_parts(&self) -> BTreeMap<u16, Vec<u16>>;

    fn fec_scheme(&self) -> FecScheme {
        self.meta().fec_oti.encoding_id
    }

    /// Downcast hook for stream-specific operations
    fn as_stream(&mut self) -> Option<&mut FileStream> {
        None
    }
}
