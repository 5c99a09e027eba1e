use crate::common::oti::FecOti;
use crate::common::partition;

///
/// Source-block partitioning of an object, RFC 5052 §9.1. For the Compact
/// No-Code scheme this is the whole codec: a block is complete when every
/// source symbol is complete.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Partitioning {
    pub nof_source_symbols: u64,
    pub nof_source_blocks: u64,
    pub large_source_block_length: u64,
    pub small_source_block_length: u64,
    pub nof_large_source_blocks: u64,
}

impl Partitioning {
    pub fn compute(oti: &FecOti) -> Self {
        let (a_large, a_small, nb_a_large, nb_blocks) = partition::block_partitioning(
            oti.max_source_block_length as u64,
            oti.transfer_length,
            oti.encoding_symbol_length as u64,
        );

        Self {
            nof_source_symbols: num_integer::div_ceil(
                oti.transfer_length,
                oti.encoding_symbol_length as u64,
            ),
            nof_source_blocks: nb_blocks,
            large_source_block_length: a_large,
            small_source_block_length: a_small,
            nof_large_source_blocks: nb_a_large,
        }
    }

    /// Number of symbols of source block `sbn`
    pub fn block_symbol_count(&self, sbn: u16) -> u64 {
        if (sbn as u64) < self.nof_large_source_blocks {
            self.large_source_block_length
        } else {
            self.small_source_block_length
        }
    }
}
