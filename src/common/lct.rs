use crate::tools::error::{FluteError, Result};

/// TOI reserved for the File Delivery Table
pub const TOI_FDT: u32 = 0;

/// LCT header extensions used by this engine
#[repr(u8)]
#[derive(Clone, Copy)]
pub enum Ext {
    Fdt = 192,
    Fti = 64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LctHeader {
    /// Total LCT header length in bytes
    pub len: usize,
    pub cci: u32,
    pub tsi: u64,
    pub toi: u32,
    /// Codepoint, carries the FEC encoding id in this engine
    pub cp: u8,
    pub close_object: bool,
    pub close_session: bool,
    /// Offset of the first header extension within the packet
    pub header_ext_offset: usize,
}

fn nb_bytes_64(n: u64) -> u32 {
    if (n & 0xFFFF000000000000) != 0x0 {
        return 8;
    }

    if (n & 0xFFFF00000000) != 0x0 {
        return 6;
    }

    if (n & 0xFFFF0000) != 0x0 {
        return 4;
    }

    if (n & 0xFFFF) != 0x0 {
        return 2;
    }

    0
}

/**
 *  https://www.rfc-editor.org/rfc/rfc5651
 *  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
 *  |   V   | C |PSI|S| O |H|Res|A|B|   HDR_LEN     | Codepoint (CP)|
 *  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
 *  | Congestion Control Information (CCI, length = 32*(C+1) bits)  |
 *  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
 *  |  Transport Session Identifier (TSI, length = 32*S+16*H bits)  |
 *  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
 *  |   Transport Object Identifier (TOI, length = 32*O+16*H bits)  |
 *  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
 *  |                Header Extensions (if applicable)              |
 *  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
 */
pub fn push_lct_header(data: &mut Vec<u8>, tsi: u64, toi: u32, codepoint: u8, close_object: bool) {
    let tsi_size = nb_bytes_64(tsi);
    let toi_size = nb_bytes_64(toi as u64);

    let h_tsi = (tsi_size & 2) >> 1;
    let h_toi = (toi_size & 2) >> 1;

    let h = h_tsi | h_toi;
    let b: u32 = close_object as u32;
    let a: u32 = 0;
    let o = (toi_size >> 2) & 0x3;
    let s = (tsi_size >> 2) & 1;
    let c: u32 = 0; // CCI is a single 32-bit word, always zero in this engine
    let psi: u32 = 0;
    let hdr_len = (2 + o + s + h + c) as u8;
    let v: u32 = 1;

    let lct_header: u32 = (codepoint as u32)
        | ((hdr_len as u32) << 8)
        | b << 16
        | a << 17
        | (h as u32) << 20
        | (o as u32) << 21
        | (s as u32) << 23
        | psi << 24
        | c << 26
        | v << 28;

    data.extend(lct_header.to_be_bytes());
    data.extend(0u32.to_be_bytes()); // CCI

    let tsi_net = tsi.to_be_bytes();
    let tsi_net_start = tsi_net.len() - ((s << 2) + (h << 1)) as usize;
    data.extend(&tsi_net[tsi_net_start..]);

    let toi_net = (toi as u64).to_be_bytes();
    let toi_net_start = toi_net.len() - ((o << 2) + (h << 1)) as usize;
    data.extend(&toi_net[toi_net_start..]);
}

/// Bump HDR_LEN after appending a header extension, `val` in 32-bit words
pub fn inc_hdr_len(data: &mut Vec<u8>, val: u8) {
    data[2] += val;
}

pub fn parse_lct_header(data: &[u8]) -> Result<LctHeader> {
    let len = data.get(2).map_or_else(
        || {
            Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidData,
                "fail to read LCT header size",
            ))
        },
        |&v| Ok((v as usize) << 2),
    )?;

    if len > data.len() || len < 4 {
        return Err(FluteError::new_kind(
            std::io::ErrorKind::InvalidData,
            format!("LCT header size is {} whereas pkt size is {}", len, data.len()),
        ));
    }

    let cp = data[3];
    let flags1 = data[0];
    let flags2 = data[1];

    let s = (flags2 >> 7) & 0x1;
    let o = (flags2 >> 5) & 0x3;
    let h = (flags2 >> 4) & 0x1;
    let c = (flags1 >> 2) & 0x3;
    let b = flags2 & 0x1;
    let a = (flags2 >> 1) & 0x1;
    let version = flags1 >> 4;
    if version != 1 {
        return Err(FluteError::new_kind(
            std::io::ErrorKind::InvalidData,
            format!("LCT version {} is not supported", version),
        ));
    }

    let cci_len = ((c + 1) as usize) << 2;
    let tsi_len = ((s as usize) << 2) + ((h as usize) << 1);
    let toi_len = ((o as usize) << 2) + ((h as usize) << 1);

    let cci_to = 4 + cci_len;
    let tsi_to = cci_to + tsi_len;
    let toi_to = tsi_to + toi_len;

    if toi_to > data.len() || cci_len > 4 || tsi_len > 8 || toi_len > 8 {
        return Err(FluteError::new_kind(
            std::io::ErrorKind::InvalidData,
            format!("TOI ends at offset {} whereas pkt size is {}", toi_to, data.len()),
        ));
    }

    if toi_to > len {
        return Err(FluteError::new_kind(
            std::io::ErrorKind::InvalidData,
            "EXT offset outside LCT header",
        ));
    }

    let mut cci: [u8; 4] = [0; 4];
    let mut tsi: [u8; 8] = [0; 8];
    let mut toi: [u8; 8] = [0; 8];

    cci[4 - cci_len.min(4)..].copy_from_slice(&data[4..cci_to]);
    tsi[8 - tsi_len..].copy_from_slice(&data[cci_to..tsi_to]);
    toi[8 - toi_len..].copy_from_slice(&data[tsi_to..toi_to]);

    let cci = u32::from_be_bytes(cci);
    let tsi = u64::from_be_bytes(tsi);
    let toi = u64::from_be_bytes(toi) as u32;

    Ok(LctHeader {
        len,
        cci,
        tsi,
        toi,
        cp,
        close_object: b != 0,
        close_session: a != 0,
        header_ext_offset: toi_to,
    })
}

/// Find a header extension inside the LCT header
pub fn get_ext<'a>(data: &'a [u8], lct: &LctHeader, ext: Ext) -> Result<Option<&'a [u8]>> {
    let mut lct_ext = &data[lct.header_ext_offset..lct.len];
    while lct_ext.len() >= 4 {
        let het = lct_ext[0];
        let hel = match het {
            het if het >= 128 => 4_usize,
            _ => (lct_ext[1] as usize) << 2,
        };

        if hel == 0 || hel > lct_ext.len() {
            return Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidData,
                format!("LCT EXT size is {}/{} het={}", hel, lct_ext.len(), het),
            ));
        }

        if het == ext as u8 {
            return Ok(Some(&lct_ext[..hel]));
        }
        lct_ext = &lct_ext[hel..];
    }

    Ok(None)
}

#[cfg(test)]
mod tests {

    #[test]
    pub fn test_lct_roundtrip() {
        crate::tests::init();
        let mut lct = Vec::new();
        super::push_lct_header(&mut lct, 0x1234, 7, 0, false);
        let header = super::parse_lct_header(&lct).unwrap();
        assert_eq!(header.tsi, 0x1234);
        assert_eq!(header.toi, 7);
        assert_eq!(header.len, lct.len());
        assert!(!header.close_object);
    }

    #[test]
    pub fn test_lct_wide_tsi() {
        crate::tests::init();
        let mut lct = Vec::new();
        super::push_lct_header(&mut lct, 0x055789451234, 0xFFFF, 1, true);
        let header = super::parse_lct_header(&lct).unwrap();
        assert_eq!(header.tsi, 0x055789451234);
        assert_eq!(header.toi, 0xFFFF);
        assert_eq!(header.cp, 1);
        assert!(header.close_object);
    }

    #[test]
    pub fn test_lct_truncated() {
        crate::tests::init();
        let mut lct = Vec::new();
        super::push_lct_header(&mut lct, 1, 1, 0, false);
        assert!(super::parse_lct_header(&lct[..3]).is_err());
        lct[0] = 0x30; // version 3
        assert!(super::parse_lct_header(&lct).is_err());
    }
}
