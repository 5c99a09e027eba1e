use super::{build_blocks, take_next_symbols, ObjectBase, SourceBlock, Symbol};
use crate::common::oti::{FecOti, FecScheme};
use crate::common::symbol::EncodingSymbol;
use crate::fdt::FileEntry;
use crate::fec::nocode::Partitioning;
use crate::fec::raptor::RaptorFec;
use crate::telemetry::Telemetry;
use crate::tools;
use crate::tools::error::{FluteError, Result};
use md5::{Digest, Md5};
use std::collections::BTreeMap;

/// base64 of the MD5 digest, the FDT Content-MD5 form
pub fn md5_base64(data: &[u8]) -> String {
    base64::encode(Md5::digest(data))
}

/// Sender-side slack before a deadline counts as missed
const DEADLINE_SLACK_MS: u64 = 20;

/// A FDT entry with a zero symbol or block size cannot be partitioned
pub(crate) fn guard_valid_oti(entry: &FileEntry) -> Result<()> {
    if entry.fec_oti.encoding_symbol_length == 0 || entry.fec_oti.max_source_block_length == 0 {
        return Err(FluteError::new_kind(
            std::io::ErrorKind::InvalidData,
            format!("invalid FEC OTI for TOI {}", entry.toi),
        ));
    }
    Ok(())
}

pub(crate) fn guard_not_expired(entry: &FileEntry) -> Result<()> {
    let now = tools::now_ms();
    if entry.should_be_complete_at > 0 && entry.should_be_complete_at + DEADLINE_SLACK_MS < now {
        return Err(FluteError::new_kind(
            std::io::ErrorKind::TimedOut,
            format!("deadline for TOI {} has passed", entry.toi),
        ));
    }
    if entry.expires > 0 && entry.expires * 1000 < now {
        return Err(FluteError::new_kind(
            std::io::ErrorKind::TimedOut,
            format!("TOI {} has expired", entry.toi),
        ));
    }
    Ok(())
}

///
/// A fixed-size object. One contiguous buffer holds the content; for Raptor
/// the reception buffer is padded to also hold the repair symbols and the
/// decoded content is extracted back into it on completion.
///
#[derive(Debug)]
pub struct File {
    meta: FileEntry,
    fdt_instance_id: u32,
    complete: bool,
    received_at: u64,
    buffer: Option<Vec<u8>>,
    blocks: Vec<SourceBlock>,
    fec: Option<RaptorFec>,
    verify_hash: bool,
    telemetry: Telemetry,
}

impl File {
    ///
    /// Create a file for transmission. The engine takes ownership of the
    /// buffer and keeps it alive until the object leaves the session.
    ///
    #[allow(clippy::too_many_arguments)]
    pub fn for_transmit(
        toi: u32,
        fec_oti: &FecOti,
        content_location: &str,
        content_type: &str,
        expires: u64,
        should_be_complete_at: u64,
        data: Vec<u8>,
        calculate_hash: bool,
        telemetry: Telemetry,
    ) -> Result<File> {
        let mut meta = FileEntry {
            toi,
            stream_id: 0,
            content_location: content_location.to_owned(),
            content_length: data.len() as u64,
            content_md5: calculate_hash.then(|| md5_base64(&data)),
            content_type: content_type.to_owned(),
            expires,
            should_be_complete_at,
            fec_oti: FecOti {
                transfer_length: data.len() as u64,
                ..*fec_oti
            },
            raptor: None,
        };
        guard_not_expired(&meta)?;

        log::debug!(
            "[TRANSMIT] Creating file (TOI {}, FEC {:?}, length {}) from data",
            toi,
            meta.fec_oti.encoding_id,
            data.len()
        );

        let (blocks, fec) = match meta.fec_oti.encoding_id {
            FecScheme::NoCode => {
                let partitioning = Partitioning::compute(&meta.fec_oti);
                let blocks = build_blocks(
                    &partitioning,
                    meta.fec_oti.transfer_length,
                    meta.fec_oti.encoding_symbol_length as u64,
                    true,
                    true,
                );
                (blocks, None)
            }
            FecScheme::Raptor => {
                // The session OTI carries the max payload as symbol length,
                // the derivation replaces it with T and MSBL with K
                let fec = RaptorFec::for_sending(
                    data.len() as u64,
                    meta.fec_oti.encoding_symbol_length,
                    meta.fec_oti.max_source_block_length,
                )?;
                meta.fec_oti.encoding_symbol_length = fec.symbol_length();
                meta.fec_oti.max_source_block_length = fec.k();
                meta.raptor = Some(fec.scheme_params());

                let symbol_length = fec.symbol_length() as usize;
                let blocks = fec
                    .create_encoding_blocks(&data)?
                    .into_iter()
                    .enumerate()
                    .map(|(sbn, encoded)| {
                        let nb = encoded.len() / symbol_length;
                        SourceBlock {
                            sbn: sbn as u16,
                            complete: false,
                            length: encoded.len(),
                            buffer: Some(encoded),
                            symbols: (0..nb as u16)
                                .map(|esi| Symbol {
                                    esi,
                                    offset: esi as usize * symbol_length,
                                    length: symbol_length,
                                    has_content: true,
                                    complete: false,
                                    queued: false,
                                })
                                .collect(),
                        }
                    })
                    .collect();
                (blocks, Some(fec))
            }
        };

        Ok(File {
            meta,
            fdt_instance_id: 0,
            complete: false,
            received_at: tools::now_secs(),
            buffer: Some(data),
            blocks,
            fec,
            verify_hash: false,
            telemetry,
        })
    }

    ///
    /// Create a file from an FDT entry, used for reception.
    ///
    pub fn for_receive(entry: FileEntry, check_hash: bool, telemetry: Telemetry) -> Result<File> {
        guard_valid_oti(&entry)?;
        guard_not_expired(&entry)?;

        log::debug!(
            "[RECEIVE] Creating file (TOI {}, FEC {:?}, length {}) from file entry",
            entry.toi,
            entry.fec_oti.encoding_id,
            entry.transfer_length()
        );

        let transfer_length = entry.transfer_length() as usize;
        let (buffer, blocks, fec) = match entry.fec_oti.encoding_id {
            FecScheme::NoCode => {
                let partitioning = Partitioning::compute(&entry.fec_oti);
                let blocks = build_blocks(
                    &partitioning,
                    entry.fec_oti.transfer_length,
                    entry.fec_oti.encoding_symbol_length as u64,
                    true,
                    true,
                );
                (vec![0u8; transfer_length], blocks, None)
            }
            FecScheme::Raptor => {
                let fec = RaptorFec::for_receiving(&entry)?;
                let buffer = fec.allocate_file_buffer(transfer_length)?;
                let symbol_length = fec.symbol_length() as usize;
                let blocks = (0..fec.nof_source_blocks() as u16)
                    .map(|sbn| {
                        let nb = fec.target_k(sbn);
                        let base = fec.block_offset(sbn);
                        SourceBlock {
                            sbn,
                            complete: false,
                            length: nb as usize * symbol_length,
                            buffer: None,
                            symbols: (0..nb as u16)
                                .map(|esi| Symbol {
                                    esi,
                                    offset: base + esi as usize * symbol_length,
                                    length: symbol_length,
                                    has_content: true,
                                    complete: false,
                                    queued: false,
                                })
                                .collect(),
                        }
                    })
                    .collect();
                (buffer, blocks, Some(fec))
            }
        };

        Ok(File {
            meta: entry,
            fdt_instance_id: 0,
            complete: false,
            received_at: tools::now_secs(),
            buffer: Some(buffer),
            blocks,
            fec,
            verify_hash: check_hash,
            telemetry,
        })
    }

    fn check_source_block_completion(&mut self, sbn: u16) {
        let idx = sbn as usize;
        if idx >= self.blocks.len() {
            return;
        }
        let complete = match self.fec.as_ref() {
            Some(fec) if !fec.is_encoder() => fec.block_complete(sbn),
            _ => self.blocks[idx].symbols.iter().all(|s| s.complete),
        };
        self.blocks[idx].complete = complete;
    }

    fn check_file_completion(&mut self) {
        self.complete = self.blocks.iter().all(|b| b.complete);
        if !self.complete {
            return;
        }

        if let Some(fec) = self.fec.as_mut() {
            if !fec.is_encoder() {
                let buffer = match self.buffer.as_mut() {
                    Some(buffer) => buffer,
                    None => return,
                };
                if let Err(e) = fec.extract_file(buffer) {
                    log::error!(
                        "[RECEIVE] Failed to extract TOI {} from source blocks: {}",
                        self.meta.toi,
                        e
                    );
                    self.complete = false;
                    return;
                }
            }
        }

        if !self.verify_hash {
            return;
        }
        let expected = match self.meta.content_md5.as_deref() {
            Some(expected) => expected,
            None => return,
        };

        let transfer_length = self.meta.transfer_length() as usize;
        let actual = self
            .buffer
            .as_deref()
            .map(|b| md5_base64(&b[..transfer_length.min(b.len())]));
        if actual.as_deref() == Some(expected) {
            return;
        }

        log::error!(
            "[RECEIVE] MD5 mismatch for TOI {}, expected {} got {:?}, discarding",
            self.meta.toi,
            expected,
            actual
        );
        self.telemetry.gauge("file_hash_mismatches").increment();

        // Reset everything and let retransmission or recovery fill it again
        for block in &mut self.blocks {
            for symbol in &mut block.symbols {
                symbol.complete = false;
                symbol.queued = false;
            }
            block.complete = false;
        }
        if let Some(fec) = self.fec.as_mut() {
            fec.discard_all_decoders();
        }
        self.complete = false;
    }
}

impl ObjectBase for File {
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
        let transfer_length = self.meta.transfer_length() as usize;
        self.buffer
            .as_deref()
            .map(|b| &b[..transfer_length.min(b.len())])
    }

    fn free_buffer(&mut self) {
        self.buffer = None;
        for block in &mut self.blocks {
            block.buffer = None;
        }
    }

    fn free_fec(&mut self) {
        self.fec = None;
    }

    fn source_blocks(&self) -> &[SourceBlock] {
        &self.blocks
    }

    fn symbol_data(&self, sbn: u16, esi: u16) -> Option<&[u8]> {
        self.blocks
            .get(sbn as usize)?
            .symbol_data(self.buffer.as_deref(), esi as usize)
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
        if self.buffer.is_none() {
            // Happens when the buffer was released after a duplicate delivery
            log::error!("[RECEIVE] Buffer of TOI {} has been released", self.meta.toi);
            return Ok(());
        }

        let block_index = symbol.sbn as usize;
        if block_index >= self.blocks.len() {
            return Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidData,
                format!("source block number {} too high", symbol.sbn),
            ));
        }
        if self.blocks[block_index].complete {
            log::trace!(
                "[RECEIVE] Ignoring symbol {} since block {} is already complete",
                symbol.esi,
                symbol.sbn
            );
            return Ok(());
        }
        let symbol_index = symbol.esi as usize;
        if symbol_index >= self.blocks[block_index].symbols.len() {
            return Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidData,
                format!("encoding symbol id {} too high", symbol.esi),
            ));
        }

        let slot = &self.blocks[block_index].symbols[symbol_index];
        if slot.complete {
            return Ok(());
        }
        if slot.length == 0 {
            log::info!(
                "[RECEIVE] Symbol length is 0 for TOI {}, SBN {}, ESI {}",
                self.meta.toi,
                symbol.sbn,
                symbol.esi
            );
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
        {
            let buffer = self.buffer.as_mut().unwrap();
            buffer[offset..offset + copy_len].copy_from_slice(&symbol.data[..copy_len]);
        }
        self.blocks[block_index].symbols[symbol_index].complete = true;

        let mut fec_failed = None;
        if let Some(fec) = self.fec.as_mut() {
            if !fec.is_encoder() {
                let slot_data = &self.buffer.as_ref().unwrap()[offset..offset + length];
                if let Err(e) = fec.process_symbol(symbol.sbn, symbol.esi as u32, slot_data) {
                    fec_failed = Some(e);
                }
            }
        }
        if let Some(e) = fec_failed {
            self.blocks[block_index].symbols[symbol_index].complete = false;
            let buffer = self.buffer.as_mut().unwrap();
            buffer[offset..offset + length].fill(0);
            return Err(e);
        }

        self.check_source_block_completion(symbol.sbn);
        if self.blocks[block_index].complete {
            self.check_file_completion();
        }
        Ok(())
    }

    fn get_next_symbols(&mut self, max_size: usize) -> Vec<EncodingSymbol> {
        take_next_symbols(
            &mut self.blocks,
            self.buffer.as_deref(),
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn nocode_oti(esl: u32, msbl: u32) -> FecOti {
        FecOti {
            encoding_id: FecScheme::NoCode,
            transfer_length: 0,
            encoding_symbol_length: esl,
            max_source_block_length: msbl,
        }
    }

    fn receive_entry(file: &File) -> FileEntry {
        file.meta().clone()
    }

    #[test]
    pub fn test_nocode_roundtrip_any_order() {
        crate::tests::init();

        let data: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        let mut sender = File::for_transmit(
            1,
            &nocode_oti(1428, 64),
            "file:///hello.bin",
            "application/octet-stream",
            0,
            0,
            data.clone(),
            true,
            Telemetry::disabled(),
        )
        .unwrap();

        let mut symbols = Vec::new();
        loop {
            let next = sender.get_next_symbols(1428);
            if next.is_empty() {
                break;
            }
            symbols.extend(next);
        }
        assert_eq!(symbols.len(), 3);

        let mut receiver =
            File::for_receive(receive_entry(&sender), true, Telemetry::disabled()).unwrap();
        let mut rng = rand::thread_rng();
        symbols.shuffle(&mut rng);
        for symbol in &symbols {
            receiver.put_symbol(symbol).unwrap();
        }

        assert!(receiver.complete());
        assert_eq!(receiver.buffer().unwrap(), &data[..]);
    }

    #[test]
    pub fn test_put_symbol_idempotent() {
        let data = vec![0xAB; 100];
        let sender = File::for_transmit(
            1,
            &nocode_oti(40, 64),
            "file:///a",
            "",
            0,
            0,
            data,
            false,
            Telemetry::disabled(),
        )
        .unwrap();
        let mut receiver =
            File::for_receive(receive_entry(&sender), true, Telemetry::disabled()).unwrap();

        let symbol = EncodingSymbol::new(0, 0, vec![0xAB; 40]);
        receiver.put_symbol(&symbol).unwrap();
        receiver.put_symbol(&symbol).unwrap();
        assert!(!receiver.complete());

        let bad_sbn = EncodingSymbol::new(9, 0, vec![0; 40]);
        assert!(receiver.put_symbol(&bad_sbn).is_err());
        let bad_esi = EncodingSymbol::new(0, 9, vec![0; 40]);
        assert!(receiver.put_symbol(&bad_esi).is_err());
    }

    #[test]
    pub fn test_md5_mismatch_resets_object() {
        crate::tests::init();

        let telemetry = Telemetry::new();
        let data = vec![0x55; 80];
        let sender = File::for_transmit(
            1,
            &nocode_oti(40, 64),
            "file:///a",
            "",
            0,
            0,
            data,
            true,
            Telemetry::disabled(),
        )
        .unwrap();
        let mut entry = receive_entry(&sender);
        // Corrupt the advertised hash so the check must fail
        entry.content_md5 = Some(md5_base64(b"something else"));

        let mut receiver = File::for_receive(entry, true, telemetry.clone()).unwrap();
        receiver
            .put_symbol(&EncodingSymbol::new(0, 0, vec![0x55; 40]))
            .unwrap();
        receiver
            .put_symbol(&EncodingSymbol::new(0, 1, vec![0x55; 40]))
            .unwrap();

        assert!(!receiver.complete());
        assert_eq!(telemetry.value("file_hash_mismatches"), 1.0);
        assert_eq!(receiver.missing_parts().get(&0).map(|v| v.len()), Some(2));
    }

    #[test]
    pub fn test_mark_completed_drives_transmission() {
        let data = vec![1u8; 120];
        let mut sender = File::for_transmit(
            1,
            &nocode_oti(40, 2),
            "file:///a",
            "",
            0,
            0,
            data,
            false,
            Telemetry::disabled(),
        )
        .unwrap();

        // 3 symbols in blocks of 2: packets never span blocks
        let first = sender.get_next_symbols(1000);
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|s| s.sbn == 0));
        let second = sender.get_next_symbols(1000);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].sbn, 1);
        assert!(sender.get_next_symbols(1000).is_empty());

        sender.mark_completed(&first, true);
        assert!(!sender.complete());
        sender.mark_completed(&second, true);
        assert!(sender.complete());
    }

    #[test]
    pub fn test_mark_completed_failure_requeues() {
        let data = vec![1u8; 80];
        let mut sender = File::for_transmit(
            1,
            &nocode_oti(40, 64),
            "file:///a",
            "",
            0,
            0,
            data,
            false,
            Telemetry::disabled(),
        )
        .unwrap();
        let symbols = sender.get_next_symbols(1000);
        assert_eq!(symbols.len(), 2);
        assert!(sender.get_next_symbols(1000).is_empty());

        sender.mark_completed(&symbols, false);
        assert!(!sender.complete());
        assert_eq!(sender.get_next_symbols(1000).len(), 2);
    }

    #[test]
    pub fn test_deadline_in_past_rejected() {
        let err = File::for_transmit(
            1,
            &nocode_oti(40, 64),
            "file:///a",
            "",
            0,
            1, // 1970, long gone
            vec![0; 10],
            false,
            Telemetry::disabled(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[test]
    pub fn test_raptor_roundtrip_with_loss() {
        crate::tests::init();

        let data: Vec<u8> = (0..6000u32).map(|i| (i % 241) as u8).collect();
        let session_oti = FecOti {
            encoding_id: FecScheme::Raptor,
            transfer_length: 0,
            encoding_symbol_length: 1428, // max payload before derivation
            max_source_block_length: 842,
        };
        let mut sender = File::for_transmit(
            1,
            &session_oti,
            "file:///raptor.bin",
            "",
            0,
            0,
            data.clone(),
            true,
            Telemetry::disabled(),
        )
        .unwrap();
        assert_eq!(sender.meta().fec_oti.encoding_symbol_length, 140);

        let mut symbols = Vec::new();
        loop {
            let next = sender.get_next_symbols(1428);
            if next.is_empty() {
                break;
            }
            symbols.extend(next);
        }
        // 43 source symbols + 15% surplus
        assert_eq!(symbols.len(), 49);

        let mut receiver =
            File::for_receive(receive_entry(&sender), true, Telemetry::disabled()).unwrap();
        for symbol in symbols.iter().filter(|s| s.esi % 16 != 3) {
            receiver.put_symbol(symbol).unwrap();
        }

        assert!(receiver.complete());
        assert_eq!(receiver.buffer().unwrap(), &data[..]);
    }
}
