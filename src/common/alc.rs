use super::lct;
use super::oti::{FecOti, FecScheme};
use super::symbol::EncodingSymbol;
use crate::tools::error::{FluteError, Result};

///
/// A parsed ALC/LCT packet. Owns its datagram so it can sit in the receive
/// buffers after the socket buffer has been reused.
///
#[derive(Clone, Debug)]
pub struct AlcPkt {
    pub lct: lct::LctHeader,
    /// In-band OTI from EXT_FTI
    pub oti: Option<FecOti>,
    /// FDT instance id from EXT_FDT, TOI=0 only
    pub fdt_instance_id: Option<u32>,
    pub data: Vec<u8>,
    /// Offset of the FEC payload id
    pub data_payload_offset: usize,
    /// Whether this packet may be parked in the unknown-TOI buffer
    pub may_buffer_if_unknown: bool,
}

impl AlcPkt {
    pub fn tsi(&self) -> u64 {
        self.lct.tsi
    }

    pub fn toi(&self) -> u32 {
        self.lct.toi
    }

    /// FEC payload id + encoding symbols
    pub fn payload(&self) -> &[u8] {
        &self.data[self.data_payload_offset..]
    }

    /// Extract the encoding symbols carried by this packet
    pub fn symbols(&self, oti: &FecOti) -> Result<Vec<EncodingSymbol>> {
        EncodingSymbol::from_payload(self.payload(), oti)
    }
}

///
/// Build an ALC packet carrying `symbols`. All symbols must belong to the
/// same source block and have contiguous ESIs, and their payload must fit
/// into `max_size` bytes.
///
pub fn create_alc_pkt(
    oti: &FecOti,
    tsi: u64,
    toi: u32,
    symbols: &[EncodingSymbol],
    max_size: usize,
    fdt_instance_id: Option<u32>,
) -> Result<Vec<u8>> {
    let first = symbols.first().ok_or_else(|| {
        FluteError::new_kind(std::io::ErrorKind::InvalidInput, "no symbols to send")
    })?;

    let mut expected_esi = first.esi;
    let mut payload_size = 0;
    for symbol in symbols {
        if symbol.sbn != first.sbn {
            return Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidInput,
                format!("symbols span source blocks {} and {}", first.sbn, symbol.sbn),
            ));
        }
        if symbol.esi != expected_esi {
            return Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidInput,
                "symbol ESIs are not contiguous",
            ));
        }
        expected_esi = expected_esi.wrapping_add(1);
        payload_size += symbol.data.len();
    }

    if payload_size > max_size {
        return Err(FluteError::new_kind(
            std::io::ErrorKind::InvalidInput,
            format!("payload of {} bytes exceeds max size {}", payload_size, max_size),
        ));
    }

    let mut data = Vec::with_capacity(payload_size + 36);
    lct::push_lct_header(&mut data, tsi, toi, oti.encoding_id as u8, false);

    if toi == lct::TOI_FDT {
        debug_assert!(fdt_instance_id.is_some());
        push_fdt(&mut data, 1, fdt_instance_id.unwrap_or(0));
    }

    push_fti(&mut data, oti);
    EncodingSymbol::push_payload_id(&mut data, first.sbn, first.esi);
    for symbol in symbols {
        data.extend(&symbol.data);
    }

    Ok(data)
}

/// Parse a received datagram into an [`AlcPkt`]
pub fn parse_alc_pkt(data: &[u8]) -> Result<AlcPkt> {
    let lct_header = lct::parse_lct_header(data)?;

    let fec: FecScheme = lct_header.cp.try_into().map_err(|_| {
        FluteError::new_kind(
            std::io::ErrorKind::InvalidData,
            format!("codepoint {} not supported", lct_header.cp),
        )
    })?;

    let fec_payload_id_length: usize = 4;
    if lct_header.len + fec_payload_id_length > data.len() {
        return Err(FluteError::new_kind(
            std::io::ErrorKind::InvalidData,
            "wrong size of ALC packet",
        ));
    }

    let fti = lct::get_ext(data, &lct_header, lct::Ext::Fti)?;
    let oti = match fti {
        Some(ext) => Some(parse_fti(ext, fec)?),
        None => None,
    };

    let mut fdt_instance_id: Option<u32> = None;
    if lct_header.toi == lct::TOI_FDT {
        let fdt = lct::get_ext(data, &lct_header, lct::Ext::Fdt)?;
        fdt_instance_id = match fdt {
            Some(ext) => Some(parse_ext_fdt(ext)?),
            None => None,
        };
    }

    let data_payload_offset = lct_header.len;
    Ok(AlcPkt {
        lct: lct_header,
        oti,
        fdt_instance_id,
        data: data.to_vec(),
        data_payload_offset,
        may_buffer_if_unknown: false,
    })
}

fn push_fdt(data: &mut Vec<u8>, version: u8, fdt_instance_id: u32) {
    /*
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |   HET = 192   |   V   |          FDT Instance ID              |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
     */
    let ext =
        (lct::Ext::Fdt as u32) << 24 | (version as u32) << 20 | (fdt_instance_id & 0xFFFFF);
    data.extend(ext.to_be_bytes());
    lct::inc_hdr_len(data, 1);
}

fn parse_ext_fdt(ext: &[u8]) -> Result<u32> {
    if ext.len() != 4 {
        return Err(FluteError::new_kind(
            std::io::ErrorKind::InvalidData,
            "wrong size of FDT extension",
        ));
    }

    let mut fdt_bytes: [u8; 4] = [0; 4];
    fdt_bytes.copy_from_slice(ext);
    let fdt_bytes = u32::from_be_bytes(fdt_bytes);
    Ok(fdt_bytes & 0xFFFFF)
}

fn push_fti(data: &mut Vec<u8>, oti: &FecOti) {
    /*
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |   HET = 64    |   HEL = 4     |                               |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+                               +
    |                      Transfer Length                          |
    +                               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |                               |           Reserved            |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |    Encoding Symbol Length     | Max. Source Block Length (MSB)|
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    | Max. Source Block Length (LSB)|
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    */
    let ext_header: u16 = (lct::Ext::Fti as u16) << 8 | 4u16;
    let transfer_header: u64 = oti.transfer_length << 16;
    let esl: u16 = oti.encoding_symbol_length as u16;
    let sbl_msb: u16 = ((oti.max_source_block_length >> 16) & 0xFFFF) as u16;
    let sbl_lsb: u16 = (oti.max_source_block_length & 0xFFFF) as u16;

    data.extend(ext_header.to_be_bytes());
    data.extend(transfer_header.to_be_bytes());
    data.extend(esl.to_be_bytes());
    data.extend(sbl_msb.to_be_bytes());
    data.extend(sbl_lsb.to_be_bytes());
    lct::inc_hdr_len(data, 4);
}

fn parse_fti(fti: &[u8], fec: FecScheme) -> Result<FecOti> {
    if fti.len() != 16 {
        return Err(FluteError::new_kind(
            std::io::ErrorKind::InvalidData,
            "wrong size of FTI extension",
        ));
    }

    let mut transfer_length: [u8; 8] = [0; 8];
    transfer_length.copy_from_slice(&fti[2..10]);
    let transfer_length = u64::from_be_bytes(transfer_length) >> 16;

    let encoding_symbol_length = u16::from_be_bytes([fti[10], fti[11]]) as u32;

    let mut max_source_block_length: [u8; 4] = [0; 4];
    max_source_block_length.copy_from_slice(&fti[12..16]);
    let max_source_block_length = u32::from_be_bytes(max_source_block_length);

    Ok(FecOti {
        encoding_id: fec,
        transfer_length,
        encoding_symbol_length,
        max_source_block_length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols_of(sbn: u16, esi: u16, payloads: &[&[u8]]) -> Vec<EncodingSymbol> {
        payloads
            .iter()
            .enumerate()
            .map(|(i, p)| EncodingSymbol::new(sbn, esi + i as u16, p.to_vec()))
            .collect()
    }

    #[test]
    pub fn test_alc_roundtrip() {
        crate::tests::init();

        let oti = FecOti {
            encoding_id: FecScheme::NoCode,
            transfer_length: 12,
            encoding_symbol_length: 4,
            max_source_block_length: 64,
        };
        let symbols = symbols_of(2, 1, &[b"abcd", b"efgh", b"ijkl"]);

        let data = create_alc_pkt(&oti, 0x055789451234, 3, &symbols, 1428, None).unwrap();
        let pkt = parse_alc_pkt(&data).unwrap();
        assert_eq!(pkt.tsi(), 0x055789451234);
        assert_eq!(pkt.toi(), 3);
        assert_eq!(pkt.oti, Some(oti));
        assert_eq!(pkt.fdt_instance_id, None);

        let decoded = pkt.symbols(&oti).unwrap();
        assert_eq!(decoded, symbols);
    }

    #[test]
    pub fn test_alc_fdt_pkt() {
        crate::tests::init();

        let oti = FecOti {
            transfer_length: 5,
            ..Default::default()
        };
        let symbols = symbols_of(0, 0, &[b"hello"]);
        let data = create_alc_pkt(&oti, 1, 0, &symbols, 1428, Some(0x12345)).unwrap();
        let pkt = parse_alc_pkt(&data).unwrap();
        assert_eq!(pkt.toi(), 0);
        assert_eq!(pkt.fdt_instance_id, Some(0x12345));
    }

    #[test]
    pub fn test_alc_rejects_mixed_blocks() {
        let oti = FecOti::default();
        let mut symbols = symbols_of(0, 0, &[b"aaaa"]);
        symbols.push(EncodingSymbol::new(1, 1, b"bbbb".to_vec()));
        assert!(create_alc_pkt(&oti, 1, 1, &symbols, 1428, None).is_err());
    }

    #[test]
    pub fn test_alc_rejects_oversize() {
        let oti = FecOti::default();
        let symbols = symbols_of(0, 0, &[b"aaaa", b"bbbb"]);
        assert!(create_alc_pkt(&oti, 1, 1, &symbols, 7, None).is_err());
    }

    #[test]
    pub fn test_alc_rejects_bad_codepoint() {
        let oti = FecOti::default();
        let symbols = symbols_of(0, 0, &[b"aaaa"]);
        let mut data = create_alc_pkt(&oti, 1, 1, &symbols, 1428, None).unwrap();
        data[3] = 42; // unknown FEC scheme
        assert!(parse_alc_pkt(&data).is_err());
    }
}
