use super::{ALC_FRAME_PREFIX, FRAME_SEPARATOR};
use crate::common::alc;
use crate::common::oti::{FecOti, FecScheme};
use crate::common::symbol::EncodingSymbol;
use crate::object::{File, ObjectBase};
use crate::sender;
use crate::telemetry::Telemetry;
use crate::tools::error::Result;
use std::collections::BTreeMap;

///
/// Server side of the recovery channel. Given a missing-symbol descriptor
/// it re-packetizes exactly those symbols of an object into a stream of
/// `ALC `-prefixed frames. One instance per session; invoked synchronously
/// by the HTTP handler.
///
pub struct Retriever {
    tsi: u64,
    max_payload: usize,
    fec_oti: FecOti,
    telemetry: Telemetry,
}

impl Retriever {
    ///
    /// The OTI derivation matches the Transmitter of the same session so
    /// re-encoded symbols are bit-identical to the multicast ones.
    ///
    pub fn new(tsi: u64, mtu: u16, fec_scheme: FecScheme, telemetry: Telemetry) -> Self {
        let mut max_payload = sender::max_payload_for(mtu, false);
        let max_source_block_length = match fec_scheme {
            FecScheme::NoCode => 64,
            FecScheme::Raptor => {
                max_payload -= max_payload % 4;
                842
            }
        };

        Self {
            tsi,
            max_payload,
            fec_oti: FecOti {
                encoding_id: fec_scheme,
                transfer_length: 0,
                encoding_symbol_length: max_payload as u32,
                max_source_block_length,
            },
            telemetry,
        }
    }

    pub fn fec_scheme(&self) -> FecScheme {
        self.fec_oti.encoding_id
    }

    ///
    /// Build the recovery frames for `search_map` from a caller-supplied
    /// object buffer (e.g. re-read from storage).
    ///
    pub fn get_alcs(
        &self,
        content_location: &str,
        content_type: &str,
        expires: u64,
        data: Vec<u8>,
        toi: u32,
        search_map: &BTreeMap<u16, Vec<u16>>,
    ) -> Result<Vec<u8>> {
        let file = File::for_transmit(
            toi,
            &self.fec_oti,
            content_location,
            content_type,
            expires,
            0,
            data,
            false,
            Telemetry::disabled(),
        )?;
        Ok(self.get_alcs_from_file(&file, search_map))
    }

    ///
    /// Build the recovery frames from an object that is already held in
    /// memory, e.g. by the Transmitter of the same process.
    ///
    pub fn get_alcs_from_file(
        &self,
        file: &dyn ObjectBase,
        search_map: &BTreeMap<u16, Vec<u16>>,
    ) -> Vec<u8> {
        let oti = file.meta().fec_oti;
        let mut selected: Vec<EncodingSymbol> = Vec::new();
        let mut total_symbols = 0usize;

        for block in file.source_blocks() {
            total_symbols += block.symbols.len();
            let Some(wanted) = search_map.get(&block.sbn) else {
                continue;
            };
            for symbol in &block.symbols {
                if !wanted.contains(&symbol.esi) {
                    continue;
                }
                if !symbol.has_content || symbol.length == 0 {
                    continue;
                }
                if let Some(data) = file.symbol_data(block.sbn, symbol.esi) {
                    selected.push(EncodingSymbol::new(block.sbn, symbol.esi, data.to_vec()));
                }
            }
        }

        let nb_selected = selected.len();
        let max_symbols_per_alc =
            (self.max_payload / (oti.encoding_symbol_length as usize).max(1)).max(1);

        let mut out = Vec::new();
        let mut run: Vec<EncodingSymbol> = Vec::new();
        for symbol in selected {
            // A packet carries one contiguous same-block run
            let breaks_run = run
                .last()
                .map(|last| last.sbn != symbol.sbn || last.esi.wrapping_add(1) != symbol.esi)
                .unwrap_or(false);
            if breaks_run || run.len() >= max_symbols_per_alc {
                self.flush_frame(&oti, file.meta().toi, &run, &mut out);
                run.clear();
            }
            run.push(symbol);
        }
        self.flush_frame(&oti, file.meta().toi, &run, &mut out);

        let percentage = match total_symbols {
            0 => 0.0,
            _ => nb_selected as f64 / total_symbols as f64 * 100.0,
        };
        self.telemetry
            .gauge("alc_percentage_retrieved")
            .set(percentage);
        log::debug!("[RETRIEVE] ALC percentage retrieved: {}", percentage);

        out
    }

    fn flush_frame(&self, oti: &FecOti, toi: u32, run: &[EncodingSymbol], out: &mut Vec<u8>) {
        if run.is_empty() {
            return;
        }
        match alc::create_alc_pkt(oti, self.tsi, toi, run, self.max_payload, None) {
            Ok(pkt) => {
                out.extend_from_slice(ALC_FRAME_PREFIX);
                out.extend_from_slice(&pkt);
                out.extend_from_slice(FRAME_SEPARATOR);
            }
            Err(e) => {
                log::error!("[RETRIEVE] Fail to build recovery packet for TOI {}: {}", toi, e)
            }
        }
    }
}
