//! Forward error correction codecs.
//!
//! `NoCode` is the identity scheme where a source symbol is the encoding
//! symbol. `Raptor` wraps RFC 5053 Scheme 1 and produces surplus repair
//! symbols on top of the source symbols.

pub mod nocode;
pub mod raptor;

use std::sync::OnceLock;
use tokio::sync::Semaphore;

static CREATE_BLOCKS: OnceLock<Semaphore> = OnceLock::new();
static PROCESS_SYMBOL: OnceLock<Semaphore> = OnceLock::new();

/// Gate for block encoding. Encoding the blocks of several objects in
/// parallel is slower than serializing them, so a single permit.
pub fn create_blocks_semaphore() -> &'static Semaphore {
    CREATE_BLOCKS.get_or_init(|| Semaphore::new(1))
}

/// Gate for concurrent FEC symbol processing.
pub fn process_symbol_semaphore() -> &'static Semaphore {
    PROCESS_SYMBOL.get_or_init(|| Semaphore::new(8))
}
