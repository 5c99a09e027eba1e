use super::{build_blocks, take_next_symbols, ObjectBase, SourceBlock};
use crate::common::oti::{FecOti, FecScheme};
use crate::common::symbol::EncodingSymbol;
use crate::fdt::FileEntry;
use crate::fec::nocode::Partitioning;
use crate::tools;
use crate::tools::error::{FluteError, Result};
use std::collections::BTreeMap;

/// Callback invoked when a message has been assembled from a stream
pub type EmitMessageCallback = Box<dyn Fn(u32, String) + Send + Sync>;

///
/// An append-only object of a stream. The transfer length is fixed up
/// front, the content grows in place through [`FileStream::push_to_file`].
/// One source block occupies one contiguous allocation, created lazily when
/// the block is first touched (by the writer or by a received symbol).
/// Completion means all symbols received, there is no hash check.
///
pub struct FileStream {
    meta: FileEntry,
    fdt_instance_id: u32,
    complete: bool,
    received_at: u64,
    blocks: Vec<SourceBlock>,
    released: bool,
    next_block_input: usize,
    next_symbol_input: usize,
    emit_message_cb: Option<EmitMessageCallback>,
}

fn stream_blocks(fec_oti: &FecOti) -> Vec<SourceBlock> {
    let partitioning = Partitioning::compute(fec_oti);
    build_blocks(
        &partitioning,
        fec_oti.transfer_length,
        fec_oti.encoding_symbol_length as u64,
        false,
        false,
    )
}

fn reject_fec(fec_oti: &FecOti) -> Result<()> {
    if fec_oti.encoding_id != FecScheme::NoCode {
        return Err(FluteError::new_kind(
            std::io::ErrorKind::InvalidInput,
            "FEC is not supported for streams",
        ));
    }
    Ok(())
}

impl FileStream {
    ///
    /// Create an empty stream object for transmission. `file_length` bytes
    /// of symbol slots are laid out immediately, the writer fills them with
    /// `push_to_file`.
    ///
    pub fn for_transmit(
        toi: u32,
        fec_oti: &FecOti,
        stream_id: u32,
        content_type: &str,
        expires: u64,
        should_be_complete_at: u64,
        file_length: u64,
    ) -> Result<FileStream> {
        if toi == 0 {
            return Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidInput,
                "TOI 0 is reserved for the FDT",
            ));
        }
        reject_fec(fec_oti)?;

        let meta = FileEntry {
            toi,
            stream_id,
            content_location: String::new(),
            content_length: file_length,
            content_md5: None,
            content_type: content_type.to_owned(),
            expires,
            should_be_complete_at,
            fec_oti: FecOti {
                transfer_length: file_length,
                ..*fec_oti
            },
            raptor: None,
        };
        super::file::guard_not_expired(&meta)?;

        log::debug!(
            "[TRANSMIT] Creating stream object (TOI {}, stream {}, length {})",
            toi,
            stream_id,
            file_length
        );

        let blocks = stream_blocks(&meta.fec_oti);
        Ok(FileStream {
            meta,
            fdt_instance_id: 0,
            complete: false,
            received_at: tools::now_secs(),
            blocks,
            released: false,
            next_block_input: 0,
            next_symbol_input: 0,
            emit_message_cb: None,
        })
    }

    /// Create a stream object from an FDT entry, used for reception
    pub fn for_receive(entry: FileEntry) -> Result<FileStream> {
        reject_fec(&entry.fec_oti)?;
        super::file::guard_valid_oti(&entry)?;
        super::file::guard_not_expired(&entry)?;

        log::debug!(
            "[RECEIVE] Creating stream object (TOI {}, stream {}, length {})",
            entry.toi,
            entry.stream_id,
            entry.transfer_length()
        );

        let blocks = stream_blocks(&entry.fec_oti);
        Ok(FileStream {
            meta: entry,
            fdt_instance_id: 0,
            complete: false,
            received_at: tools::now_secs(),
            blocks,
            released: false,
            next_block_input: 0,
            next_symbol_input: 0,
            emit_message_cb: None,
        })
    }

    pub fn register_emit_message_callback(&mut self, cb: EmitMessageCallback) {
        self.emit_message_cb = Some(cb);
    }

    /// Hand an assembled message of this stream to the registered callback
    pub fn emit_message(&self, message: String) {
        if let Some(cb) = self.emit_message_cb.as_ref() {
            cb(self.meta.stream_id, message);
        }
    }

    fn ensure_block_buffer(block: &mut SourceBlock) {
        if block.buffer.is_none() {
            block.buffer = Some(vec![0u8; block.length]);
        }
    }

    ///
    /// Append `content` into the stream. Returns the number of bytes
    /// actually written, less than `content.len()` once the object is full.
    /// The unused tail of the last touched symbol is zero-filled so stale
    /// memory never reaches the wire.
    ///
    pub fn push_to_file(&mut self, content: &[u8]) -> usize {
        if content.is_empty() || self.released {
            return 0;
        }

        let mut added = 0usize;
        while added < content.len() {
            if self.next_block_input >= self.blocks.len() {
                break;
            }
            let block = &mut self.blocks[self.next_block_input];
            Self::ensure_block_buffer(block);

            if self.next_symbol_input >= block.symbols.len() {
                self.next_block_input += 1;
                self.next_symbol_input = 0;
                continue;
            }

            let symbol = &mut block.symbols[self.next_symbol_input];
            let slice_len = (content.len() - added).min(symbol.length);
            let buffer = block.buffer.as_mut().unwrap();
            buffer[symbol.offset..symbol.offset + slice_len]
                .copy_from_slice(&content[added..added + slice_len]);
            if slice_len < symbol.length {
                buffer[symbol.offset + slice_len..symbol.offset + symbol.length].fill(0);
            }
            symbol.has_content = true;
            added += slice_len;

            self.next_symbol_input += 1;
            if self.next_symbol_input >= block.symbols.len() {
                self.next_symbol_input = 0;
                self.next_block_input += 1;
            }
        }

        added
    }

    /// Bytes that can still be written before `push_to_file` returns 0
    pub fn available_space(&self) -> usize {
        let mut space = 0usize;
        for (block_index, block) in self.blocks.iter().enumerate().skip(self.next_block_input) {
            for (symbol_index, symbol) in block.symbols.iter().enumerate() {
                if block_index == self.next_block_input && symbol_index < self.next_symbol_input {
                    continue;
                }
                space += symbol.length;
            }
        }
        space
    }

    fn check_source_block_completion(&mut self, sbn: u16) {
        if let Some(block) = self.blocks.get_mut(sbn as usize) {
            block.complete = block.symbols.iter().all(|s| s.complete);
        }
    }

    fn check_file_completion(&mut self) {
        // Completion carries no payload semantics for a stream
        self.complete = self.blocks.iter().all(|b| b.complete);
    }
}

impl ObjectBase for FileStream {
    fn meta(&self) -> &FileEntry {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut FileEntry {
        &mut self.meta
    }

    fn complete(&self) -> bool {
        self.complete
    }

    fn mark_complete(&mut self) {
        self.complete = true;
    }

    fn received_at(&self) -> u64 {
        self.received_at
    }

    fn fdt_instance_id(&self) -> u32 {
        self.fdt_instance_id
    }

    fn set_fdt_instance_id(&mut self, id: u32) {
        self.fdt_instance_id = id;
    }

    fn buffer(&self) -> Option<&[u8]> {
        // A stream keeps one allocation per source block
        None
    }

    fn free_buffer(&mut self) {
        for block in &mut self.blocks {
            block.buffer = None;
            if let Some(first) = block.symbols.first_mut() {
                first.has_content = false;
            }
        }
        self.released = true;
    }

    fn source_blocks(&self) -> &[SourceBlock] {
        &self.blocks
    }

    fn symbol_data(&self, sbn: u16, esi: u16) -> Option<&[u8]> {
        self.blocks.get(sbn as usize)?.symbol_data(None, esi as usize)
    }

    fn put_symbol(&mut self, symbol: &EncodingSymbol) -> Result<()> {
        if self.complete {
            log::debug!(
                "[RECEIVE] Not handling symbol {} of SBN {} since TOI {} is already complete",
                symbol.esi,
                symbol.sbn,
                self.meta.toi
            );
            return Ok(());
        }
        if self.released {
            return Ok(());
        }

        let block_index = symbol.sbn as usize;
        if block_index >= self.blocks.len() {
            return Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidData,
                format!("source block number {} too high", symbol.sbn),
            ));
        }

        let block = &mut self.blocks[block_index];
        if block.complete {
            log::trace!(
                "[RECEIVE] Ignoring symbol {} since block {} is already complete",
                symbol.esi,
                symbol.sbn
            );
            return Ok(());
        }
        let symbol_index = symbol.esi as usize;
        if symbol_index >= block.symbols.len() {
            return Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidData,
                format!("encoding symbol id {} too high", symbol.esi),
            ));
        }

        Self::ensure_block_buffer(block);

        let slot = &block.symbols[symbol_index];
        if slot.complete {
            return Ok(());
        }
        if slot.length == 0 {
            return Ok(());
        }
        if slot.length != symbol.data.len() {
            log::info!(
                "[RECEIVE] Symbol length mismatch for TOI {}, slot {}, received {}",
                self.meta.toi,
                slot.length,
                symbol.data.len()
            );
        }

        let (offset, length) = (slot.offset, slot.length);
        let copy_len = length.min(symbol.data.len());
        let buffer = block.buffer.as_mut().unwrap();
        buffer[offset..offset + copy_len].copy_from_slice(&symbol.data[..copy_len]);
        let slot = &mut block.symbols[symbol_index];
        slot.complete = true;
        slot.has_content = true;

        self.check_source_block_completion(symbol.sbn);
        if self.blocks[block_index].complete {
            self.check_file_completion();
        }
        Ok(())
    }

    fn get_next_symbols(&mut self, max_size: usize) -> Vec<EncodingSymbol> {
        take_next_symbols(
            &mut self.blocks,
            None,
            self.meta.fec_oti.encoding_symbol_length as u64,
            max_size,
        )
    }

    fn mark_completed(&mut self, symbols: &[EncodingSymbol], success: bool) {
        let mut touched = Vec::new();
        for symbol in symbols {
            let Some(block) = self.blocks.get_mut(symbol.sbn as usize) else {
                continue;
            };
            if let Some(slot) = block.symbols.get_mut(symbol.esi as usize) {
                slot.queued = false;
                slot.complete = success;
            }
            if !touched.contains(&symbol.sbn) {
                touched.push(symbol.sbn);
            }
        }
        for sbn in touched {
            self.check_source_block_completion(sbn);
        }
        self.check_file_completion();
    }

    fn missing_parts(&self) -> BTreeMap<u16, Vec<u16>> {
        super::missing_parts_of(&self.blocks)
    }

    fn as_stream(&mut self) -> Option<&mut FileStream> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_oti(esl: u32, msbl: u32, length: u64) -> FecOti {
        FecOti {
            encoding_id: FecScheme::NoCode,
            transfer_length: length,
            encoding_symbol_length: esl,
            max_source_block_length: msbl,
        }
    }

    fn writer(file_length: u64, esl: u32, msbl: u32) -> FileStream {
        FileStream::for_transmit(1, &stream_oti(esl, msbl, 0), 5, "", 0, 0, file_length).unwrap()
    }

    #[test]
    pub fn test_push_order_is_wire_order() {
        crate::tests::init();

        // 3 blocks of K=2 symbols of T=4 bytes
        let mut sender = writer(24, 4, 2);
        assert_eq!(sender.available_space(), 24);

        assert_eq!(sender.push_to_file(b"AAAAAA"), 6);
        // The partially written symbol was zero-padded and skipped
        assert_eq!(sender.available_space(), 16);
        assert_eq!(sender.push_to_file(b"BBBBBB"), 6);
        assert_eq!(sender.push_to_file(b"CCCCCCCCCCCC"), 8);
        assert_eq!(sender.available_space(), 0);
        assert_eq!(sender.push_to_file(b"D"), 0);

        let mut wire: Vec<u8> = Vec::new();
        loop {
            let symbols = sender.get_next_symbols(1000);
            if symbols.is_empty() {
                break;
            }
            for s in &symbols {
                wire.extend(&s.data);
            }
            sender.mark_completed(&symbols, true);
        }
        // Each push boundary inside a symbol is zero-padded, never stale
        assert_eq!(&wire, b"AAAAAA\0\0BBBBBB\0\0CCCCCCCC" as &[u8]);
        assert!(sender.complete());
        assert_eq!(sender.symbol_data(0, 1).unwrap(), b"AA\0\0");
    }

    #[test]
    pub fn test_receive_assembly() {
        crate::tests::init();

        let entry = FileEntry {
            toi: 3,
            stream_id: 5,
            content_location: String::new(),
            content_length: 24,
            content_md5: None,
            content_type: String::new(),
            expires: 0,
            should_be_complete_at: 0,
            fec_oti: stream_oti(4, 2, 24),
            raptor: None,
        };
        let mut receiver = FileStream::for_receive(entry).unwrap();

        let payload = b"AAAAAABB\0\0\0\0BBBBCCCCCCCC";
        for sbn in 0..3u16 {
            for esi in 0..2u16 {
                let start = sbn as usize * 8 + esi as usize * 4;
                receiver
                    .put_symbol(&EncodingSymbol::new(sbn, esi, payload[start..start + 4].to_vec()))
                    .unwrap();
            }
        }

        assert!(receiver.complete());
        assert_eq!(receiver.symbol_data(2, 1).unwrap(), b"CCCC");
    }

    #[test]
    pub fn test_zero_length_push() {
        let mut sender = writer(24, 4, 2);
        assert_eq!(sender.push_to_file(b""), 0);
        assert_eq!(sender.available_space(), 24);
    }

    #[test]
    pub fn test_backpressure_boundary() {
        let mut sender = writer(24, 4, 2);
        sender.push_to_file(b"XXXX");
        // Only the filled symbol is eligible, the empty slot stops the scan
        let symbols = sender.get_next_symbols(1000);
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].data, b"XXXX");
        assert!(sender.get_next_symbols(1000).is_empty());
    }

    #[test]
    pub fn test_stream_rejects_fec() {
        let mut oti = stream_oti(4, 2, 0);
        oti.encoding_id = FecScheme::Raptor;
        assert!(FileStream::for_transmit(1, &oti, 5, "", 0, 0, 24).is_err());
    }
}
