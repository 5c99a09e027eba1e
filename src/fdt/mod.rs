//! File Delivery Table: the in-band XML manifest of the objects currently
//! being delivered, itself transmitted as object TOI=0.

use crate::common::oti::{FecOti, FecScheme};
use crate::tools::error::{FluteError, Result};
use serde::{Deserialize, Serialize};

/// Per-file Raptor parameters carried as FDT attributes
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RaptorSchemeParams {
    /// Z, number of source blocks
    pub nof_source_blocks: u32,
    /// N, number of sub-blocks per source block
    pub nof_sub_blocks: u32,
    /// Al, symbol alignment in bytes
    pub symbol_alignment: u32,
}

///
/// An entry for one object in the FDT
///
#[derive(Clone, Debug, PartialEq)]
pub struct FileEntry {
    pub toi: u32,
    /// Stream id, 0 for plain files
    pub stream_id: u32,
    pub content_location: String,
    pub content_length: u64,
    /// base64 of the MD5 digest
    pub content_md5: Option<String>,
    pub content_type: String,
    /// Expiry, seconds since epoch
    pub expires: u64,
    /// Recovery deadline, milliseconds since epoch, 0 when absent
    pub should_be_complete_at: u64,
    pub fec_oti: FecOti,
    pub raptor: Option<RaptorSchemeParams>,
}

impl FileEntry {
    pub fn transfer_length(&self) -> u64 {
        self.fec_oti.transfer_length
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
struct XmlCacheControl {
    #[serde(rename = "mbms2007:Expires")]
    expires: u64,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
struct XmlRecover {
    #[serde(rename = "mbms2007:Deadline")]
    deadline: u64,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
struct XmlStream {
    #[serde(rename = "mbms2007:Id")]
    id: u32,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
struct XmlFile {
    #[serde(rename = "@TOI")]
    toi: Option<String>,
    #[serde(rename = "@Content-Location")]
    content_location: Option<String>,
    #[serde(rename = "@Content-Length", skip_serializing_if = "Option::is_none")]
    content_length: Option<u64>,
    #[serde(rename = "@Transfer-Length", skip_serializing_if = "Option::is_none")]
    transfer_length: Option<u64>,
    #[serde(rename = "@Content-MD5", skip_serializing_if = "Option::is_none")]
    content_md5: Option<String>,
    #[serde(rename = "@Content-Type", skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    #[serde(rename = "@FEC-OTI-FEC-Encoding-ID", skip_serializing_if = "Option::is_none")]
    fec_oti_fec_encoding_id: Option<u8>,
    #[serde(
        rename = "@FEC-OTI-Maximum-Source-Block-Length",
        skip_serializing_if = "Option::is_none"
    )]
    fec_oti_maximum_source_block_length: Option<u64>,
    #[serde(
        rename = "@FEC-OTI-Encoding-Symbol-Length",
        skip_serializing_if = "Option::is_none"
    )]
    fec_oti_encoding_symbol_length: Option<u64>,
    #[serde(
        rename = "@FEC-OTI-Number-Of-Source-Blocks",
        skip_serializing_if = "Option::is_none"
    )]
    fec_oti_number_of_source_blocks: Option<u32>,
    #[serde(
        rename = "@FEC-OTI-Number-Of-Sub-Blocks",
        skip_serializing_if = "Option::is_none"
    )]
    fec_oti_number_of_sub_blocks: Option<u32>,
    #[serde(
        rename = "@FEC-OTI-Symbol-Alignment-Parameter",
        skip_serializing_if = "Option::is_none"
    )]
    fec_oti_symbol_alignment_parameter: Option<u32>,
    #[serde(rename = "mbms2007:Cache-Control", skip_serializing_if = "Option::is_none")]
    cache_control: Option<XmlCacheControl>,
    #[serde(rename = "mbms2007:Recover", skip_serializing_if = "Option::is_none")]
    recover: Option<XmlRecover>,
    #[serde(rename = "mbms2007:Stream", skip_serializing_if = "Option::is_none")]
    stream: Option<XmlStream>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
struct XmlFdtInstance {
    #[serde(rename = "@Expires")]
    expires: Option<String>,
    #[serde(rename = "@FEC-OTI-FEC-Encoding-ID", skip_serializing_if = "Option::is_none")]
    fec_oti_fec_encoding_id: Option<u8>,
    #[serde(
        rename = "@FEC-OTI-Maximum-Source-Block-Length",
        skip_serializing_if = "Option::is_none"
    )]
    fec_oti_maximum_source_block_length: Option<u64>,
    #[serde(
        rename = "@FEC-OTI-Encoding-Symbol-Length",
        skip_serializing_if = "Option::is_none"
    )]
    fec_oti_encoding_symbol_length: Option<u64>,
    #[serde(rename = "@xmlns:mbms2007", skip_serializing_if = "Option::is_none")]
    xmlns_mbms2007: Option<String>,
    #[serde(rename = "File", default)]
    file: Vec<XmlFile>,
}

const MBMS2007_XMLNS: &str = "urn:3GPP:metadata:2007:MBMS:FLUTE:FDT";

///
/// In-memory model of the File Delivery Table with XML (de)serialization.
/// The instance id is a 20-bit counter bumped on every `add`/`remove` so
/// receivers can dedupe re-transmissions.
///
#[derive(Debug)]
pub struct FileDeliveryTable {
    instance_id: u32,
    global_fec_oti: FecOti,
    expires: u64,
    file_entries: Vec<FileEntry>,
}

impl FileDeliveryTable {
    pub fn new(instance_id: u32, global_fec_oti: FecOti) -> Self {
        Self {
            instance_id: instance_id & 0xFFFFF,
            global_fec_oti,
            expires: 0,
            file_entries: Vec::new(),
        }
    }

    /// Parse a received FDT. `instance_id` comes from the EXT_FDT header.
    pub fn parse(instance_id: u32, buffer: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(buffer)
            .map_err(|e| FluteError::new_kind(std::io::ErrorKind::InvalidData, e.to_string()))?;
        let instance: XmlFdtInstance = quick_xml::de::from_str(text)
            .map_err(|e| FluteError::new_kind(std::io::ErrorKind::InvalidData, e.to_string()))?;

        let expires = instance
            .expires
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                FluteError::new_kind(
                    std::io::ErrorKind::InvalidData,
                    "missing Expires attribute on FDT-Instance",
                )
            })?;

        let global_fec_oti = FecOti {
            encoding_id: instance
                .fec_oti_fec_encoding_id
                .and_then(|v| FecScheme::try_from(v).ok())
                .unwrap_or(FecScheme::NoCode),
            transfer_length: 0,
            encoding_symbol_length: instance.fec_oti_encoding_symbol_length.unwrap_or(0) as u32,
            max_source_block_length: instance.fec_oti_maximum_source_block_length.unwrap_or(0)
                as u32,
        };

        let mut file_entries = Vec::new();
        for file in &instance.file {
            file_entries.push(Self::parse_file_entry(file, &global_fec_oti)?);
        }

        Ok(Self {
            instance_id: instance_id & 0xFFFFF,
            global_fec_oti,
            expires,
            file_entries,
        })
    }

    fn parse_file_entry(file: &XmlFile, global: &FecOti) -> Result<FileEntry> {
        let toi = file
            .toi
            .as_deref()
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| {
                FluteError::new_kind(
                    std::io::ErrorKind::InvalidData,
                    "missing TOI attribute on File element",
                )
            })?;

        let content_location = file.content_location.clone().ok_or_else(|| {
            FluteError::new_kind(
                std::io::ErrorKind::InvalidData,
                "missing Content-Location attribute on File element",
            )
        })?;

        let content_length = file.content_length.unwrap_or(0);
        let transfer_length = file.transfer_length.unwrap_or(content_length);

        // An unknown per-file encoding id defers to the global one
        let encoding_id = file
            .fec_oti_fec_encoding_id
            .and_then(|v| FecScheme::try_from(v).ok())
            .unwrap_or(global.encoding_id);
        let max_source_block_length = file
            .fec_oti_maximum_source_block_length
            .map(|v| v as u32)
            .unwrap_or(global.max_source_block_length);
        let encoding_symbol_length = file
            .fec_oti_encoding_symbol_length
            .map(|v| v as u32)
            .unwrap_or(global.encoding_symbol_length);

        let raptor = match encoding_id {
            FecScheme::Raptor => {
                let nof_source_blocks = file.fec_oti_number_of_source_blocks.ok_or_else(|| {
                    FluteError::new_kind(
                        std::io::ErrorKind::InvalidData,
                        "missing FEC-OTI-Number-Of-Source-Blocks for Raptor file",
                    )
                })?;
                let nof_sub_blocks = file.fec_oti_number_of_sub_blocks.ok_or_else(|| {
                    FluteError::new_kind(
                        std::io::ErrorKind::InvalidData,
                        "missing FEC-OTI-Number-Of-Sub-Blocks for Raptor file",
                    )
                })?;
                let symbol_alignment =
                    file.fec_oti_symbol_alignment_parameter.ok_or_else(|| {
                        FluteError::new_kind(
                            std::io::ErrorKind::InvalidData,
                            "missing FEC-OTI-Symbol-Alignment-Parameter for Raptor file",
                        )
                    })?;
                if symbol_alignment == 0 || encoding_symbol_length % symbol_alignment != 0 {
                    return Err(FluteError::new_kind(
                        std::io::ErrorKind::InvalidData,
                        format!(
                            "symbol length {} is not a multiple of alignment {}",
                            encoding_symbol_length, symbol_alignment
                        ),
                    ));
                }
                Some(RaptorSchemeParams {
                    nof_source_blocks,
                    nof_sub_blocks,
                    symbol_alignment,
                })
            }
            FecScheme::NoCode => None,
        };

        Ok(FileEntry {
            toi,
            stream_id: file.stream.as_ref().map(|s| s.id).unwrap_or(0),
            content_location,
            content_length,
            content_md5: file.content_md5.clone().filter(|v| !v.is_empty()),
            content_type: file.content_type.clone().unwrap_or_default(),
            expires: file.cache_control.as_ref().map(|cc| cc.expires).unwrap_or(0),
            should_be_complete_at: file.recover.as_ref().map(|r| r.deadline).unwrap_or(0),
            fec_oti: FecOti {
                encoding_id,
                transfer_length,
                encoding_symbol_length,
                max_source_block_length,
            },
            raptor,
        })
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    pub fn set_expires(&mut self, expires: u64) {
        self.expires = expires;
    }

    pub fn expires(&self) -> u64 {
        self.expires
    }

    /// Push an entry and bump the instance id
    pub fn add(&mut self, entry: FileEntry) {
        self.instance_id = (self.instance_id + 1) & 0xFFFFF;
        self.file_entries.push(entry);
    }

    /// Remove all entries with this TOI and bump the instance id
    pub fn remove(&mut self, toi: u32) {
        self.file_entries.retain(|e| e.toi != toi);
        self.instance_id = (self.instance_id + 1) & 0xFFFFF;
    }

    pub fn file_entries(&self) -> &[FileEntry] {
        &self.file_entries
    }

    pub fn file_count(&self) -> usize {
        self.file_entries.len()
    }

    pub fn get(&self, toi: u32) -> Option<&FileEntry> {
        self.file_entries.iter().find(|e| e.toi == toi)
    }

    /// Serialize to XML. Per-file attributes equal to the global FEC OTI are
    /// suppressed; with exactly one entry its OTI becomes the global one.
    pub fn to_xml(&self) -> Result<Vec<u8>> {
        let global = match self.file_entries.len() {
            1 => self.file_entries[0].fec_oti,
            _ => self.global_fec_oti,
        };

        let instance = XmlFdtInstance {
            expires: Some(self.expires.to_string()),
            fec_oti_fec_encoding_id: Some(global.encoding_id as u8),
            fec_oti_maximum_source_block_length: Some(global.max_source_block_length as u64),
            fec_oti_encoding_symbol_length: Some(global.encoding_symbol_length as u64),
            xmlns_mbms2007: Some(MBMS2007_XMLNS.to_owned()),
            file: self
                .file_entries
                .iter()
                .map(|entry| Self::file_to_xml(entry, &global))
                .collect(),
        };

        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let ser = quick_xml::se::Serializer::with_root(&mut xml, Some("FDT-Instance"))
            .map_err(|e| FluteError::new(e.to_string()))?;
        instance
            .serialize(ser)
            .map_err(|e| FluteError::new(e.to_string()))?;

        Ok(xml.into_bytes())
    }

    fn file_to_xml(entry: &FileEntry, global: &FecOti) -> XmlFile {
        let oti = &entry.fec_oti;
        XmlFile {
            toi: Some(entry.toi.to_string()),
            content_location: Some(entry.content_location.clone()),
            content_length: Some(entry.content_length),
            transfer_length: (oti.transfer_length != entry.content_length)
                .then_some(oti.transfer_length),
            content_md5: entry.content_md5.clone(),
            content_type: (!entry.content_type.is_empty())
                .then(|| entry.content_type.clone()),
            fec_oti_fec_encoding_id: (oti.encoding_id != global.encoding_id)
                .then_some(oti.encoding_id as u8),
            fec_oti_maximum_source_block_length: (oti.max_source_block_length
                != global.max_source_block_length)
                .then_some(oti.max_source_block_length as u64),
            fec_oti_encoding_symbol_length: (oti.encoding_symbol_length
                != global.encoding_symbol_length)
                .then_some(oti.encoding_symbol_length as u64),
            fec_oti_number_of_source_blocks: entry.raptor.map(|r| r.nof_source_blocks),
            fec_oti_number_of_sub_blocks: entry.raptor.map(|r| r.nof_sub_blocks),
            fec_oti_symbol_alignment_parameter: entry.raptor.map(|r| r.symbol_alignment),
            cache_control: Some(XmlCacheControl {
                expires: entry.expires,
            }),
            recover: (entry.should_be_complete_at > 0).then_some(XmlRecover {
                deadline: entry.should_be_complete_at,
            }),
            stream: (entry.stream_id > 0).then_some(XmlStream {
                id: entry.stream_id,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(toi: u32, location: &str, length: u64) -> FileEntry {
        FileEntry {
            toi,
            stream_id: 0,
            content_location: location.to_owned(),
            content_length: length,
            content_md5: None,
            content_type: "application/octet-stream".to_owned(),
            expires: 1700000000,
            should_be_complete_at: 0,
            fec_oti: FecOti {
                encoding_id: FecScheme::NoCode,
                transfer_length: length,
                encoding_symbol_length: 1428,
                max_source_block_length: 64,
            },
            raptor: None,
        }
    }

    #[test]
    pub fn test_fdt_roundtrip() {
        crate::tests::init();

        let mut fdt = FileDeliveryTable::new(1, FecOti::default());
        fdt.set_expires(1700000100);
        fdt.add(entry(1, "file:///hello.bin", 4096));
        let mut stream_entry = entry(2, "file:///stream", 24);
        stream_entry.stream_id = 5;
        stream_entry.should_be_complete_at = 1700000000123;
        fdt.add(stream_entry);

        let xml = fdt.to_xml().unwrap();
        let parsed = FileDeliveryTable::parse(fdt.instance_id(), &xml).unwrap();
        assert_eq!(parsed.file_entries(), fdt.file_entries());
        assert_eq!(parsed.expires(), 1700000100);
    }

    #[test]
    pub fn test_fdt_instance_id_bump() {
        let mut fdt = FileDeliveryTable::new(0xFFFFE, FecOti::default());
        fdt.add(entry(1, "a", 1));
        assert_eq!(fdt.instance_id(), 0xFFFFF);
        fdt.remove(1);
        assert_eq!(fdt.instance_id(), 0); // 20-bit wrap
        assert_eq!(fdt.file_count(), 0);
    }

    #[test]
    pub fn test_fdt_transfer_length_defaults_to_content_length() {
        let xml = br#"<?xml version="1.0"?>
            <FDT-Instance Expires="123" FEC-OTI-FEC-Encoding-ID="0"
                FEC-OTI-Maximum-Source-Block-Length="64"
                FEC-OTI-Encoding-Symbol-Length="1428"
                xmlns:mbms2007="urn:3GPP:metadata:2007:MBMS:FLUTE:FDT">
                <File TOI="4" Content-Location="file:///a" Content-Length="1000"/>
            </FDT-Instance>"#;
        let fdt = FileDeliveryTable::parse(7, xml).unwrap();
        let entry = fdt.get(4).unwrap();
        assert_eq!(entry.transfer_length(), 1000);
        assert_eq!(entry.fec_oti.encoding_symbol_length, 1428);
        assert_eq!(fdt.instance_id(), 7);
    }

    #[test]
    pub fn test_fdt_missing_required_attributes() {
        assert!(FileDeliveryTable::parse(0, b"<FDT-Instance/>").is_err());

        let missing_toi = br#"<FDT-Instance Expires="1">
            <File Content-Location="file:///a" Content-Length="10"/>
            </FDT-Instance>"#;
        assert!(FileDeliveryTable::parse(0, missing_toi).is_err());

        let missing_location = br#"<FDT-Instance Expires="1">
            <File TOI="1" Content-Length="10"/>
            </FDT-Instance>"#;
        assert!(FileDeliveryTable::parse(0, missing_location).is_err());
    }

    #[test]
    pub fn test_fdt_raptor_entry_requires_scheme_attributes() {
        let incomplete = br#"<FDT-Instance Expires="1" FEC-OTI-FEC-Encoding-ID="1"
            FEC-OTI-Maximum-Source-Block-Length="842" FEC-OTI-Encoding-Symbol-Length="1424">
            <File TOI="1" Content-Location="file:///a" Content-Length="100000"/>
            </FDT-Instance>"#;
        assert!(FileDeliveryTable::parse(0, incomplete).is_err());

        let complete = br#"<FDT-Instance Expires="1" FEC-OTI-FEC-Encoding-ID="1"
            FEC-OTI-Maximum-Source-Block-Length="842" FEC-OTI-Encoding-Symbol-Length="1424">
            <File TOI="1" Content-Location="file:///a" Content-Length="100000"
                FEC-OTI-Number-Of-Source-Blocks="1" FEC-OTI-Number-Of-Sub-Blocks="1"
                FEC-OTI-Symbol-Alignment-Parameter="4"/>
            </FDT-Instance>"#;
        let fdt = FileDeliveryTable::parse(0, complete).unwrap();
        let entry = fdt.get(1).unwrap();
        assert_eq!(entry.fec_oti.encoding_id, FecScheme::Raptor);
        assert_eq!(entry.raptor.unwrap().symbol_alignment, 4);
    }

    #[test]
    pub fn test_fdt_empty_serialize() {
        let mut fdt = FileDeliveryTable::new(1, FecOti::default());
        fdt.set_expires(42);
        let xml = fdt.to_xml().unwrap();
        let parsed = FileDeliveryTable::parse(1, &xml).unwrap();
        assert_eq!(parsed.file_count(), 0);
    }
}
