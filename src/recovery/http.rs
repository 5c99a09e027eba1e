use super::{Retriever, FRAME_SEPARATOR};
use crate::sender::Transmitter;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

///
/// One `/alc` recovery request: which symbols of which object.
///
#[derive(Clone, Debug, Deserialize)]
pub struct AlcRequest {
    pub toi: u32,
    pub file: String,
    pub fec: u8,
    /// SBN (as decimal string key) -> missing ESIs
    #[serde(default)]
    pub missing: BTreeMap<String, Vec<u16>>,
}

impl AlcRequest {
    /// The missing map with numeric block keys
    pub fn missing_map(&self) -> BTreeMap<u16, Vec<u16>> {
        self.missing
            .iter()
            .filter_map(|(sbn, esis)| sbn.parse::<u16>().ok().map(|sbn| (sbn, esis.clone())))
            .collect()
    }
}

/// Produces the current FDT XML, None when nothing is being delivered
pub type FdtSource = Arc<dyn Fn() -> Option<Vec<u8>> + Send + Sync>;
/// Produces the framed recovery body for a request, None when unknown
pub type AlcSource = Arc<dyn Fn(&AlcRequest) -> Option<Vec<u8>> + Send + Sync>;

///
/// State behind the recovery HTTP surface: `GET /fdt` and `POST /alc`.
///
#[derive(Clone)]
pub struct RecoveryService {
    fdt_source: FdtSource,
    alc_source: AlcSource,
}

impl RecoveryService {
    pub fn new(fdt_source: FdtSource, alc_source: AlcSource) -> Self {
        Self {
            fdt_source,
            alc_source,
        }
    }

    ///
    /// Serve recovery straight from a Transmitter of this process, without
    /// reloading objects from storage.
    ///
    pub fn for_transmitter(transmitter: Arc<Transmitter>, retriever: Arc<Retriever>) -> Self {
        let fdt_transmitter = transmitter.clone();
        Self {
            fdt_source: Arc::new(move || {
                let fdt = fdt_transmitter.fdt_string();
                (!fdt.is_empty()).then(|| fdt.into_bytes())
            }),
            alc_source: Arc::new(move |request| {
                let missing = request.missing_map();
                transmitter.with_file(request.toi, |file| {
                    retriever.get_alcs_from_file(file, &missing)
                })
            }),
        }
    }
}

/// An [`FdtSource`] reading the Transmitter's `last.fdt` side file
pub fn fdt_from_side_file(path: PathBuf) -> FdtSource {
    Arc::new(move || std::fs::read(&path).ok().filter(|data| !data.is_empty()))
}

///
/// The axum router of the recovery surface.
///
pub fn router(service: RecoveryService) -> Router {
    Router::new()
        .route("/fdt", get(serve_fdt))
        .route("/alc", post(serve_alc))
        .with_state(service)
}

async fn serve_fdt(State(service): State<RecoveryService>) -> impl IntoResponse {
    match (service.fdt_source)() {
        Some(mut xml) => {
            xml.extend_from_slice(FRAME_SEPARATOR);
            (StatusCode::OK, xml).into_response()
        }
        None => (StatusCode::NOT_FOUND, "no FDT available").into_response(),
    }
}

async fn serve_alc(
    State(service): State<RecoveryService>,
    Json(request): Json<AlcRequest>,
) -> impl IntoResponse {
    log::debug!(
        "[RETRIEVE] Recovery request for TOI {} ({}), {} blocks",
        request.toi,
        request.file,
        request.missing.len()
    );
    match (service.alc_source)(&request) {
        Some(body) => (StatusCode::OK, body).into_response(),
        None => (StatusCode::NOT_FOUND, "unknown object").into_response(),
    }
}
