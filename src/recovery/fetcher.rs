use super::{split_frames, ALC_FRAME_PREFIX};
use crate::common::oti::FecScheme;
use crate::telemetry::Telemetry;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Callback receiving recovered bytes (one ALC packet, or the FDT XML)
pub type DataCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

struct FetcherInner {
    /// Base URL of the recovery server, empty = fetcher disabled
    url: String,
    client: reqwest::Client,
    alc_cb: Mutex<Option<DataCallback>>,
    fdt_cb: Mutex<Option<DataCallback>>,
    telemetry: Telemetry,
}

///
/// Client side of the recovery channel. `fetch_alcs` POSTs the
/// missing-symbol descriptor to `/alc` and hands every returned `ALC `
/// frame to the registered callback; `fetch_fdt` GETs `/fdt`. Requests run
/// on detached tasks, responses are best-effort (non-200 is logged and
/// dropped, never retried).
///
#[derive(Clone)]
pub struct Fetcher {
    inner: Arc<FetcherInner>,
}

impl Fetcher {
    pub fn new(url: &str, telemetry: Telemetry) -> Self {
        let url = url.trim_end_matches('/').to_owned();
        if url.is_empty() {
            log::debug!("[FETCHER] Fetcher is disabled");
        } else if url::Url::parse(&url).is_err() {
            log::warn!("[FETCHER] Invalid URL: {}", url);
        } else {
            log::info!("[FETCHER] Fetcher created for URL: {}", url);
        }

        Self {
            inner: Arc::new(FetcherInner {
                url,
                client: reqwest::Client::new(),
                alc_cb: Mutex::new(None),
                fdt_cb: Mutex::new(None),
                telemetry,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.inner.url.is_empty()
    }

    pub fn register_alc_callback(&self, cb: DataCallback) {
        *self.inner.alc_cb.lock().unwrap() = Some(cb);
    }

    pub fn register_fdt_callback(&self, cb: DataCallback) {
        *self.inner.fdt_cb.lock().unwrap() = Some(cb);
    }

    /// Re-pull the latest FDT from the recovery server
    pub fn fetch_fdt(&self) {
        let inner = self.inner.clone();
        if inner.url.is_empty() || inner.fdt_cb.lock().unwrap().is_none() {
            log::debug!("[FETCHER] Not fetching the missing FDT");
            return;
        }

        tokio::spawn(async move {
            let url = format!("{}/fdt", inner.url);
            let started = Instant::now();
            let response = inner.client.get(&url).send().await;
            let body = match read_body(response, &url).await {
                Some(body) => body,
                None => {
                    inner.telemetry.gauge("fetcher_bandwidth").set(0.0);
                    return;
                }
            };
            record_transfer(&inner.telemetry, body.len(), started);

            // The FDT body is terminated by an empty frame separator
            let xml = match split_frames(&body).into_iter().next() {
                Some(xml) if !xml.is_empty() => xml.to_vec(),
                _ => return,
            };
            log::trace!("[FETCHER] Received {} FDT bytes", xml.len());
            let cb = inner.fdt_cb.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb(&xml);
            }
        });
    }

    ///
    /// Request the listed missing symbols of one object. The response
    /// frames re-enter the receive pipeline through the ALC callback.
    ///
    pub fn fetch_alcs(
        &self,
        toi: u32,
        fec: FecScheme,
        content_location: &str,
        missing_symbols: &BTreeMap<u16, Vec<u16>>,
    ) {
        let inner = self.inner.clone();
        if inner.url.is_empty()
            || missing_symbols.is_empty()
            || inner.alc_cb.lock().unwrap().is_none()
        {
            log::info!("[FETCHER] Not fetching the missing symbols");
            return;
        }

        let missing: serde_json::Map<String, serde_json::Value> = missing_symbols
            .iter()
            .filter(|(_, esis)| !esis.is_empty())
            .map(|(sbn, esis)| (sbn.to_string(), serde_json::json!(esis)))
            .collect();
        if missing.is_empty() {
            log::debug!("[FETCHER] No symbols to fetch for TOI {}", toi);
            return;
        }

        let body = serde_json::json!({
            "toi": toi,
            "file": content_location,
            "fec": fec as u8,
            "missing": missing,
        });

        log::trace!("[FETCHER] Fetching missing symbols for TOI {}", toi);
        tokio::spawn(async move {
            let url = format!("{}/alc", inner.url);
            let started = Instant::now();
            let response = inner.client.post(&url).json(&body).send().await;
            let body = match read_body(response, &url).await {
                Some(body) => body,
                None => {
                    inner.telemetry.gauge("fetcher_bandwidth").set(0.0);
                    return;
                }
            };
            record_transfer(&inner.telemetry, body.len(), started);

            let cb = inner.alc_cb.lock().unwrap().clone();
            let Some(cb) = cb else { return };
            for frame in split_frames(&body) {
                if frame.is_empty() {
                    continue;
                }
                if !frame.starts_with(ALC_FRAME_PREFIX) {
                    log::warn!("[FETCHER] Received frame that does not start with 'ALC '");
                    continue;
                }
                let alc_data = &frame[ALC_FRAME_PREFIX.len()..];
                log::trace!("[FETCHER] Received {} ALC bytes", alc_data.len());
                cb(alc_data);
            }
        });
    }
}

async fn read_body(
    response: std::result::Result<reqwest::Response, reqwest::Error>,
    url: &str,
) -> Option<Vec<u8>> {
    match response {
        Ok(response) if response.status().is_success() => {
            response.bytes().await.ok().map(|b| b.to_vec())
        }
        Ok(response) => {
            log::warn!("[FETCHER] {} answered with status {}", url, response.status());
            None
        }
        Err(e) => {
            log::warn!("[FETCHER] Request to {} failed: {}", url, e);
            None
        }
    }
}

fn record_transfer(telemetry: &Telemetry, nb_bytes: usize, started: Instant) {
    let latency_us = started.elapsed().as_micros() as u64;
    telemetry.gauge("fetcher_latency").set(latency_us as f64);

    // A request that took a minute is not worth a bandwidth sample
    if nb_bytes > 0 && latency_us > 0 && latency_us < 60_000_000 {
        let seconds = latency_us as f64 / 1_000_000.0;
        let kbps = nb_bytes as f64 / seconds * 8.0 / 1000.0;
        let rounded = (kbps * 1000.0).round() / 1000.0;
        telemetry.gauge("fetcher_bandwidth").set(rounded);
        log::debug!(
            "[FETCHER] Received {} bytes in {} us, bandwidth {} kbps",
            nb_bytes,
            latency_us,
            rounded
        );
    } else {
        telemetry.gauge("fetcher_bandwidth").set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_disabled_fetcher_is_a_noop() {
        crate::tests::init();
        let fetcher = Fetcher::new("", Telemetry::disabled());
        assert!(!fetcher.is_enabled());
        // No callbacks, no URL, nothing to spawn
        fetcher.fetch_fdt();
        let mut missing = BTreeMap::new();
        missing.insert(0u16, vec![1u16]);
        fetcher.fetch_alcs(1, FecScheme::NoCode, "file:///a", &missing);
    }
}
