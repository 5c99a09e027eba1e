use crate::common::oti::FecOti;
use crate::fdt::{FileEntry, RaptorSchemeParams};
use crate::tools::error::{FluteError, Result};
use std::collections::HashMap;

/// Minimum number of source symbols, RFC 5053 §4.2
const KMIN: u64 = 148;
/// Maximum symbols per packet, RFC 5053 §4.2
const GMAX: u64 = 10;
/// Symbol alignment in bytes
const AL: u32 = 4;
/// Target sub-block size. 16 MiB keeps the number of sub-blocks at 1 for
/// any realistic object.
const SUB_BLOCK_TARGET: u64 = 16 * 1024 * 1024;
/// MSBL must stay below 8192 for FEC Scheme 1, RFC 5681 §6.2.1.2
const MSBL_LIMIT: u32 = 8191;
/// Repair overhead: 15% surplus symbols, at least one per block
const SURPLUS_PACKET_RATIO: f64 = 1.15;

///
/// Raptor FEC Scheme 1 (RFC 5053) object codec. One instance per object.
/// The encoder turns each source block into `target_k(sbn)` fountain
/// symbols; the decoder keeps one lazily created
/// [`raptor_code::SourceBlockDecoder`] per source block.
///
pub struct RaptorFec {
    is_encoder: bool,
    /// F, object size in bytes
    f: u64,
    /// Al, symbol alignment
    al: u32,
    /// T, symbol size in bytes
    t: u32,
    /// G, symbols per packet
    g: u32,
    /// Z, number of source blocks
    z: u32,
    /// N, sub-blocks per source block
    n: u32,
    /// K, symbols per source block
    k: u32,
    /// Kt, total number of source symbols
    kt: u64,
    decoders: HashMap<u16, raptor_code::SourceBlockDecoder>,
    decoded: HashMap<u16, Vec<u8>>,
}

impl std::fmt::Debug for RaptorFec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaptorFec")
            .field("is_encoder", &self.is_encoder)
            .field("f", &self.f)
            .field("al", &self.al)
            .field("t", &self.t)
            .field("g", &self.g)
            .field("z", &self.z)
            .field("n", &self.n)
            .field("k", &self.k)
            .field("kt", &self.kt)
            .finish()
    }
}

impl RaptorFec {
    ///
    /// Derive the transmission parameters for an object of `transfer_length`
    /// bytes, RFC 5053 §4.2 with P = `max_payload`.
    ///
    pub fn for_sending(
        transfer_length: u64,
        max_payload: u32,
        max_source_block_length: u32,
    ) -> Result<Self> {
        if transfer_length == 0 {
            return Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidInput,
                "cannot derive Raptor parameters for an empty object",
            ));
        }

        let msbl = max_source_block_length.min(MSBL_LIMIT);
        let p = max_payload as u64;
        let f = transfer_length;

        let g = num_integer::div_ceil(p * KMIN, f)
            .min(p / AL as u64)
            .min(GMAX)
            .max(1);
        let t = ((p / (AL as u64 * g)) * AL as u64) as u32;
        if t == 0 || t % AL != 0 {
            return Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidInput,
                format!("symbol size {} does not align to {}", t, AL),
            ));
        }

        let kt = num_integer::div_ceil(f, t as u64);
        if kt < 4 {
            return Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidInput,
                "object is too small for Raptor, a minimum of 4 symbols is required",
            ));
        }

        let z = num_integer::div_ceil(kt, msbl as u64) as u32;
        let k = kt.min(msbl as u64) as u32;
        let n = num_integer::div_ceil(num_integer::div_ceil(kt, z as u64) * t as u64, SUB_BLOCK_TARGET)
            .min((t / AL) as u64) as u32;

        Ok(Self {
            is_encoder: true,
            f,
            al: AL,
            t,
            g: g as u32,
            z,
            n,
            k,
            kt,
            decoders: HashMap::new(),
            decoded: HashMap::new(),
        })
    }

    ///
    /// Reconstruct the parameters of a received object from its FDT entry.
    ///
    pub fn for_receiving(entry: &FileEntry) -> Result<Self> {
        let params = entry.raptor.ok_or_else(|| {
            FluteError::new_kind(
                std::io::ErrorKind::InvalidData,
                "FDT entry carries no Raptor parameters",
            )
        })?;

        let f = entry.fec_oti.transfer_length;
        let t = entry.fec_oti.encoding_symbol_length;
        let al = params.symbol_alignment;
        if t == 0 || al == 0 || t % al != 0 {
            return Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidData,
                format!("symbol size {} is not a multiple of alignment {}", t, al),
            ));
        }

        let msbl = entry.fec_oti.max_source_block_length.min(MSBL_LIMIT);
        let kt = num_integer::div_ceil(f, t as u64);
        let k = kt.min(msbl as u64) as u32;

        Ok(Self {
            is_encoder: false,
            f,
            al,
            t,
            g: 1,
            z: params.nof_source_blocks,
            n: params.nof_sub_blocks,
            k,
            kt,
            decoders: HashMap::new(),
            decoded: HashMap::new(),
        })
    }

    /// The FDT attributes the receiver needs to reconstruct the parameters
    pub fn scheme_params(&self) -> RaptorSchemeParams {
        RaptorSchemeParams {
            nof_source_blocks: self.z,
            nof_sub_blocks: self.n,
            symbol_alignment: self.al,
        }
    }

    pub fn symbol_length(&self) -> u32 {
        self.t
    }

    pub fn nof_source_blocks(&self) -> u32 {
        self.z
    }

    /// K, symbols per source block
    pub fn k(&self) -> u32 {
        self.k
    }

    /// K of this block: the last block takes the remainder
    pub fn source_block_length(&self, sbn: u16) -> u32 {
        if (sbn as u32) < self.z - 1 {
            return self.k;
        }
        (self.kt - self.k as u64 * (self.z as u64 - 1)) as u32
    }

    /// Number of source bytes of this block, unpadded
    pub fn block_size(&self, sbn: u16) -> usize {
        if (sbn as u32) < self.z - 1 {
            return self.k as usize * self.t as usize;
        }
        (self.f - self.k as u64 * self.t as u64 * (self.z as u64 - 1)) as usize
    }

    /// Encoding symbols to emit per block: K plus 15% repair surplus, at
    /// least one repair symbol.
    pub fn target_k(&self, sbn: u16) -> u32 {
        let k = self.source_block_length(sbn);
        let target = (k as f64 * SURPLUS_PACKET_RATIO) as u32;
        target.max(k + 1)
    }

    /// Byte offset of a block inside the padded reception buffer
    pub fn block_offset(&self, sbn: u16) -> usize {
        sbn as usize * self.target_k(0) as usize * self.t as usize
    }

    ///
    /// Allocate the reception buffer. It is larger than the object because
    /// it also holds the repair symbols of every block.
    ///
    pub fn allocate_file_buffer(&self, min_length: usize) -> Result<Vec<u8>> {
        let length = self.z as usize * self.target_k(0) as usize * self.t as usize;
        if min_length > length {
            return Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidInput,
                "min_length is larger than the maximum possible object size",
            ));
        }
        Ok(vec![0; length])
    }

    ///
    /// Encode an object into one buffer of fountain symbols per source
    /// block; each buffer holds `target_k(sbn)` symbols of `T` bytes.
    ///
    pub fn create_encoding_blocks(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        if self.n != 1 {
            return Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidInput,
                "encoding supports only 1 sub-block per source block",
            ));
        }
        if data.len() < self.f as usize {
            return Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidInput,
                "buffer is shorter than the transfer length",
            ));
        }

        let mut blocks = Vec::with_capacity(self.z as usize);
        let mut offset = 0usize;
        for sbn in 0..self.z as u16 {
            let nsymbs = self.source_block_length(sbn) as usize;
            let block_size = self.block_size(sbn);
            let padded_size = nsymbs * self.t as usize;

            // The last block is zero-padded to a whole number of symbols
            let mut padded;
            let source: &[u8] = if block_size == padded_size {
                &data[offset..offset + block_size]
            } else {
                padded = vec![0u8; padded_size];
                padded[..block_size].copy_from_slice(&data[offset..offset + block_size]);
                &padded[..]
            };

            let mut encoder = raptor_code::SourceBlockEncoder::new(source, nsymbs);
            let nb_encoded = self.target_k(sbn);
            let mut block = Vec::with_capacity(nb_encoded as usize * self.t as usize);
            for esi in 0..nb_encoded {
                block.extend(encoder.fountain(esi));
            }
            blocks.push(block);
            offset += block_size;
        }

        Ok(blocks)
    }

    ///
    /// Feed one received encoding symbol to the block decoder. The decoder
    /// context is created lazily on the first symbol of a block.
    ///
    pub fn process_symbol(&mut self, sbn: u16, esi: u32, data: &[u8]) -> Result<()> {
        if data.len() != self.t as usize {
            return Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidData,
                format!("symbol length {} is not T={}", data.len(), self.t),
            ));
        }

        if self.decoded.contains_key(&sbn) {
            return Ok(());
        }

        let nsymbs = self.source_block_length(sbn) as usize;
        let decoder = self
            .decoders
            .entry(sbn)
            .or_insert_with(|| raptor_code::SourceBlockDecoder::new(nsymbs));

        if decoder.fully_specified() {
            return Ok(());
        }

        decoder.push_encoding_symbol(data, esi);
        Ok(())
    }

    /// Whether the decoder has enough symbols to solve this block
    pub fn block_complete(&self, sbn: u16) -> bool {
        if self.decoded.contains_key(&sbn) {
            return true;
        }
        self.decoders
            .get(&sbn)
            .map(|d| d.fully_specified())
            .unwrap_or(false)
    }

    fn decode_block(&mut self, sbn: u16) -> Result<()> {
        if self.decoded.contains_key(&sbn) {
            return Ok(());
        }

        let padded_size = self.source_block_length(sbn) as usize * self.t as usize;
        let decoder = self.decoders.get_mut(&sbn).ok_or_else(|| {
            FluteError::new(format!("no decoder context for source block {}", sbn))
        })?;
        let data = decoder
            .decode(padded_size)
            .ok_or_else(|| FluteError::new(format!("fail to decode source block {}", sbn)))?;
        self.decoded.insert(sbn, data);
        Ok(())
    }

    ///
    /// After every block is complete, decode them all and write the object
    /// back into `out` (first `F` bytes).
    ///
    pub fn extract_file(&mut self, out: &mut [u8]) -> Result<()> {
        if out.len() < self.f as usize {
            return Err(FluteError::new("output buffer too small"));
        }

        for sbn in 0..self.z as u16 {
            self.decode_block(sbn)?;
        }

        let mut offset = 0usize;
        for sbn in 0..self.z as u16 {
            let real_size = self.block_size(sbn);
            let data = &self.decoded[&sbn];
            out[offset..offset + real_size].copy_from_slice(&data[..real_size]);
            offset += real_size;
        }
        Ok(())
    }

    /// Free and forget the decoder of one block, used before a retry
    pub fn discard_decoder(&mut self, sbn: u16) {
        self.decoders.remove(&sbn);
        self.decoded.remove(&sbn);
    }

    pub fn discard_all_decoders(&mut self) {
        self.decoders.clear();
        self.decoded.clear();
    }

    pub fn is_encoder(&self) -> bool {
        self.is_encoder
    }
}
