//! Unicast recovery: a request/response side-channel that lets a receiver
//! re-fetch missing symbols of an object (and the FDT itself) over HTTP.
//!
//! The [`Retriever`] is the server half, producing `ALC `-prefixed,
//! `\r\n\r\n`-separated packet frames for a missing-symbol descriptor. The
//! [`Fetcher`] is the client half, POSTing the descriptor and feeding the
//! returned frames back into the receive pipeline.

mod fetcher;
mod http;
mod retriever;

pub use fetcher::{DataCallback, Fetcher};
pub use http::{fdt_from_side_file, router, AlcRequest, RecoveryService};
pub use retriever::Retriever;

/// Frame prefix of one recovered ALC packet
pub(crate) const ALC_FRAME_PREFIX: &[u8] = b"ALC ";
/// Frame separator of the recovery body
pub(crate) const FRAME_SEPARATOR: &[u8] = b"\r\n\r\n";

/// Split a recovery response body into its `\r\n\r\n`-separated frames
pub(crate) fn split_frames(body: &[u8]) -> Vec<&[u8]> {
    let mut frames = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        match rest
            .windows(FRAME_SEPARATOR.len())
            .position(|w| w == FRAME_SEPARATOR)
        {
            Some(pos) => {
                frames.push(&rest[..pos]);
                rest = &rest[pos + FRAME_SEPARATOR.len()..];
            }
            None => {
                frames.push(rest);
                break;
            }
        }
    }
    frames
}
