use super::oti::FecOti;
use crate::tools::error::{FluteError, Result};

///
/// One encoding symbol, the unit of FEC transport. A packet payload carries
/// the 4-byte FEC payload id (SBN:16 | ESI:16) followed by one or more
/// symbols of the same source block with contiguous ESIs.
///
#[derive(Clone, Debug, PartialEq)]
pub struct EncodingSymbol {
    pub sbn: u16,
    pub esi: u16,
    pub data: Vec<u8>,
}

impl EncodingSymbol {
    pub fn new(sbn: u16, esi: u16, data: Vec<u8>) -> Self {
        Self { sbn, esi, data }
    }

    /// Append the FEC payload id for the first symbol of a packet
    pub fn push_payload_id(data: &mut Vec<u8>, sbn: u16, esi: u16) {
        data.extend(sbn.to_be_bytes());
        data.extend(esi.to_be_bytes());
    }

    ///
    /// Extract the encoding symbols of an ALC payload. `data` starts at the
    /// FEC payload id. The number of contained symbols is recovered from the
    /// OTI symbol length, the last symbol of an object may be shorter.
    ///
    pub fn from_payload(data: &[u8], oti: &FecOti) -> Result<Vec<EncodingSymbol>> {
        if data.len() < 4 {
            return Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidData,
                "payload too short for FEC payload id",
            ));
        }

        let sbn = u16::from_be_bytes([data[0], data[1]]);
        let esi = u16::from_be_bytes([data[2], data[3]]);
        let symbol_length = oti.encoding_symbol_length as usize;
        if symbol_length == 0 {
            return Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidData,
                "encoding symbol length is zero",
            ));
        }

        let mut symbols = Vec::new();
        let mut payload = &data[4..];
        let mut next_esi = esi;
        while !payload.is_empty() {
            let len = payload.len().min(symbol_length);
            symbols.push(EncodingSymbol {
                sbn,
                esi: next_esi,
                data: payload[..len].to_vec(),
            });
            payload = &payload[len..];
            next_esi = next_esi.wrapping_add(1);
        }

        Ok(symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_from_payload() {
        let oti = FecOti {
            encoding_symbol_length: 4,
            ..Default::default()
        };
        let mut payload = Vec::new();
        EncodingSymbol::push_payload_id(&mut payload, 3, 7);
        payload.extend(b"AAAABBBBCC");
        let symbols = EncodingSymbol::from_payload(&payload, &oti).unwrap();
        assert_eq!(symbols.len(), 3);
        assert_eq!(symbols[0].esi, 7);
        assert_eq!(symbols[2].esi, 9);
        assert_eq!(symbols[0].sbn, 3);
        assert_eq!(symbols[2].data, b"CC");
    }

    #[test]
    pub fn test_from_payload_truncated() {
        let oti = FecOti::default();
        assert!(EncodingSymbol::from_payload(&[0, 0, 0], &oti).is_err());
    }
}
