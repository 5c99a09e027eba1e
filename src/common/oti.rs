///
/// FEC scheme carried in the LCT codepoint and the FDT
/// FEC-OTI-FEC-Encoding-ID attribute.
///
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FecScheme {
    /// Compact No-Code, RFC 5445
    NoCode = 0,
    /// Raptor FEC Scheme 1, RFC 5053
    Raptor = 1,
}

impl TryFrom<u8> for FecScheme {
    type Error = ();

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            x if x == FecScheme::NoCode as u8 => Ok(FecScheme::NoCode),
            x if x == FecScheme::Raptor as u8 => Ok(FecScheme::Raptor),
            _ => Err(()),
        }
    }
}

///
/// FEC Object Transmission Information, the four parameters a receiver needs
/// to reconstruct the source-block partitioning of an object.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FecOti {
    pub encoding_id: FecScheme,
    pub transfer_length: u64,
    pub encoding_symbol_length: u32,
    pub max_source_block_length: u32,
}

impl Default for FecOti {
    fn default() -> Self {
        FecOti {
            encoding_id: FecScheme::NoCode,
            transfer_length: 0,
            encoding_symbol_length: 1428,
            max_source_block_length: 64,
        }
    }
}
