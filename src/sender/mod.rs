//! FLUTE transmitter: rate-limited, FDT-managed packetization of objects
//! into ALC packets over a UDP multicast session.

use crate::common::alc;
use crate::common::lct::TOI_FDT;
use crate::common::oti::{FecOti, FecScheme};
use crate::fdt::FileDeliveryTable;
use crate::fec;
use crate::object::{File, FileStream, ObjectBase};
use crate::telemetry::Telemetry;
use crate::tools;
use crate::tools::error::{FluteError, Result};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Callback invoked once per TOI when its transmission finishes
pub type CompletionCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// MSBL of a Compact No-Code session
const NOCODE_MSBL: u32 = 64;
/// MSBL of a Raptor session, RFC 6681 §7.4
const RAPTOR_MSBL: u32 = 842;
/// Symbol alignment used to round the Raptor payload
const RAPTOR_AL: u32 = 4;

#[derive(Clone, Debug)]
pub struct Config {
    pub tsi: u64,
    /// Path MTU the ALC packets are sized for
    pub mtu: u16,
    /// Transmit rate limit in kbps, 0 = unlimited
    pub rate_limit_kbps: u32,
    pub fec_scheme: FecScheme,
    /// How often the FDT is re-transmitted
    pub fdt_repeat_interval: Duration,
    /// First TOI to allocate, clamped to >= 1
    pub initial_toi: u16,
    pub fdt_start_instance_id: u32,
    /// Size packets for an IPv6 header instead of IPv4
    pub ipv6: bool,
    /// Side file the serialized FDT is mirrored to on every send
    pub fdt_side_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tsi: 1,
            mtu: 1500,
            rate_limit_kbps: 0,
            fec_scheme: FecScheme::NoCode,
            fdt_repeat_interval: Duration::from_secs(1),
            initial_toi: 1,
            fdt_start_instance_id: 1,
            ipv6: false,
            fdt_side_file: Some(PathBuf::from("last.fdt")),
        }
    }
}

/// `max_payload = MTU - IP - UDP - ALC headers - FEC payload id`
pub fn max_payload_for(mtu: u16, ipv6: bool) -> usize {
    mtu as usize - if ipv6 { 40 } else { 20 } - 8 - 32 - 4
}

enum TransmitSocket {
    Udp {
        socket: tokio::net::UdpSocket,
        target: SocketAddr,
    },
    /// In-memory replacement used by tests and loss simulation
    Channel(mpsc::UnboundedSender<Vec<u8>>),
}

impl TransmitSocket {
    async fn send(&self, data: &[u8]) -> Result<()> {
        match self {
            TransmitSocket::Udp { socket, target } => {
                let nb = socket.send_to(data, target).await?;
                if nb != data.len() {
                    return Err(FluteError::new(format!(
                        "only {} of {} bytes sent",
                        nb,
                        data.len()
                    )));
                }
                Ok(())
            }
            TransmitSocket::Channel(tx) => tx
                .send(data.to_vec())
                .map_err(|_| FluteError::new("in-memory receiver is gone")),
        }
    }
}

struct Session {
    fdt: FileDeliveryTable,
    files: BTreeMap<u32, Box<dyn ObjectBase>>,
    next_toi: u16,
    last_fdt_sent_ms: u64,
}

struct TransmitterState {
    tsi: u64,
    /// Payload budget of data packets
    max_payload: usize,
    /// Payload budget of FDT packets, never Raptor-rounded
    fdt_payload: usize,
    fec_oti: FecOti,
    fdt_repeat_interval: Duration,
    fdt_side_file: Option<PathBuf>,
    socket: TransmitSocket,
    session: Mutex<Session>,
    rate_limit_kbps: AtomicU32,
    stop_when_done: AtomicBool,
    remove_after_transmission: AtomicBool,
    running: AtomicBool,
    completion_cb: Mutex<Option<CompletionCallback>>,
    telemetry: Telemetry,
}

///
/// FLUTE transmitter. Owns the socket, the FDT and the object map;
/// schedules packets under a rate limit and re-sends the FDT periodically
/// and after each object completes.
///
pub struct Transmitter {
    state: Arc<TransmitterState>,
}

impl Transmitter {
    ///
    /// Create a transmitter sending to `target` (usually a multicast
    /// group). The socket is bound to an ephemeral port, TTL 2.
    ///
    pub async fn new(target: SocketAddr, config: &Config, telemetry: Telemetry) -> Result<Self> {
        let bind_addr: SocketAddr = if target.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let socket = tokio::net::UdpSocket::bind(bind_addr).await?;
        if target.is_ipv4() {
            socket.set_multicast_ttl_v4(2).ok();
        }
        Ok(Self::with_socket(
            TransmitSocket::Udp { socket, target },
            config,
            telemetry,
        ))
    }

    ///
    /// Create a transmitter whose packets are pushed into an in-memory
    /// channel instead of a socket.
    ///
    pub fn new_with_channel(
        tx: mpsc::UnboundedSender<Vec<u8>>,
        config: &Config,
        telemetry: Telemetry,
    ) -> Self {
        Self::with_socket(TransmitSocket::Channel(tx), config, telemetry)
    }

    fn with_socket(socket: TransmitSocket, config: &Config, telemetry: Telemetry) -> Self {
        let fdt_payload = max_payload_for(config.mtu, config.ipv6);
        let mut max_payload = fdt_payload;
        let max_source_block_length = match config.fec_scheme {
            FecScheme::NoCode => NOCODE_MSBL,
            FecScheme::Raptor => {
                // Raptor payloads must be a whole number of aligned units
                max_payload -= max_payload % RAPTOR_AL as usize;
                RAPTOR_MSBL
            }
        };

        let fec_oti = FecOti {
            encoding_id: config.fec_scheme,
            transfer_length: 0,
            encoding_symbol_length: max_payload as u32,
            max_source_block_length,
        };

        let state = Arc::new(TransmitterState {
            tsi: config.tsi,
            max_payload,
            fdt_payload,
            fec_oti,
            fdt_repeat_interval: config.fdt_repeat_interval,
            fdt_side_file: config.fdt_side_file.clone(),
            socket,
            session: Mutex::new(Session {
                fdt: FileDeliveryTable::new(config.fdt_start_instance_id, fec_oti),
                files: BTreeMap::new(),
                next_toi: config.initial_toi.max(1),
                last_fdt_sent_ms: 0,
            }),
            rate_limit_kbps: AtomicU32::new(config.rate_limit_kbps),
            stop_when_done: AtomicBool::new(false),
            remove_after_transmission: AtomicBool::new(true),
            running: AtomicBool::new(true),
            completion_cb: Mutex::new(None),
            telemetry,
        });

        Self { state }
    }

    ///
    /// Start the packet pump and the FDT re-send ticker. The returned
    /// handle completes when the pump stops (see `set_stop_when_done`).
    ///
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let state = self.state.clone();
        tokio::spawn(fdt_ticker(state));
        let state = self.state.clone();
        tokio::spawn(packet_pump(state))
    }

    pub fn stop(&self) {
        self.state.running.store(false, Ordering::Relaxed);
    }

    ///
    /// Enable IPSec ESP protection of outgoing payloads. Installing the
    /// actual kernel state is the job of the embedding platform; the
    /// engine only records the request.
    ///
    pub fn enable_ipsec(&self, spi: u32, _aes_key: &str) {
        log::info!("[TRANSMIT] IPSec ESP requested for SPI {}, delegating to platform", spi);
    }

    ///
    /// Queue a file for transmission. The engine owns the buffer until the
    /// object leaves the session; the completion callback reports the
    /// returned TOI. `expires` is in seconds since epoch, `deadline` in
    /// milliseconds since epoch (0 = none).
    ///
    pub async fn send(
        &self,
        content_location: &str,
        content_type: &str,
        expires: u64,
        deadline: u64,
        data: Vec<u8>,
    ) -> Result<u32> {
        let toi = self.allocate_toi();

        let file = {
            // One block encoding at a time across the whole process
            let _permit = match self.state.fec_oti.encoding_id {
                FecScheme::Raptor => Some(
                    fec::create_blocks_semaphore()
                        .acquire()
                        .await
                        .map_err(|_| FluteError::new("semaphore closed"))?,
                ),
                FecScheme::NoCode => None,
            };
            File::for_transmit(
                toi,
                &self.state.fec_oti,
                content_location,
                content_type,
                expires,
                deadline,
                data,
                true,
                self.state.telemetry.clone(),
            )?
        };

        let mut session = self.state.session.lock().unwrap();
        session.fdt.add(file.meta().clone());
        let should_send_fdt = self.no_transmission_in_flight(&session);
        session.files.insert(toi, Box::new(file));
        if should_send_fdt {
            self.send_fdt(&mut session);
        } else {
            log::debug!(
                "[TRANSMIT] Not sending FDT, {} objects already in transmission",
                session.files.len()
            );
        }

        Ok(toi)
    }

    ///
    /// Create an empty stream object. The writer fills it incrementally
    /// with [`Transmitter::push_to_stream`].
    ///
    pub fn create_empty_file_for_stream(
        &self,
        stream_id: u32,
        content_type: &str,
        expires: u64,
        deadline: u64,
        max_source_block_length: u32,
        file_length: u64,
    ) -> Result<u32> {
        if stream_id == 0 {
            return Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidInput,
                "stream id zero is reserved",
            ));
        }
        if file_length == 0 {
            return Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidInput,
                "file length must be at least one byte",
            ));
        }
        if max_source_block_length == 0 {
            return Err(FluteError::new_kind(
                std::io::ErrorKind::InvalidInput,
                "max source block length must be at least one symbol",
            ));
        }

        let toi = self.allocate_toi();
        let oti = FecOti {
            max_source_block_length,
            ..self.state.fec_oti
        };
        let file =
            FileStream::for_transmit(toi, &oti, stream_id, content_type, expires, deadline, file_length)?;

        let mut session = self.state.session.lock().unwrap();
        session.fdt.add(file.meta().clone());
        session.files.insert(toi, Box::new(file));
        // A new stream always re-announces the FDT right away
        self.send_fdt(&mut session);
        Ok(toi)
    }

    /// Append bytes to a stream object, returns how many were written
    pub fn push_to_stream(&self, toi: u32, data: &[u8]) -> Result<usize> {
        let mut session = self.state.session.lock().unwrap();
        let file = session
            .files
            .get_mut(&toi)
            .and_then(|f| f.as_stream())
            .ok_or_else(|| FluteError::new(format!("TOI {} is not a stream object", toi)))?;
        Ok(file.push_to_file(data))
    }

    /// Bytes writable to a stream before `push_to_stream` returns 0
    pub fn stream_available_space(&self, toi: u32) -> Result<usize> {
        let mut session = self.state.session.lock().unwrap();
        let file = session
            .files
            .get_mut(&toi)
            .and_then(|f| f.as_stream())
            .ok_or_else(|| FluteError::new(format!("TOI {} is not a stream object", toi)))?;
        Ok(file.available_space())
    }

    /// Remove every non-FDT object and its FDT entry
    pub fn clear_files(&self) {
        let mut session = self.state.session.lock().unwrap();
        let tois: Vec<u32> = session.files.keys().filter(|t| **t != TOI_FDT).cloned().collect();
        for toi in tois {
            session.fdt.remove(toi);
            session.files.remove(&toi);
        }
    }

    ///
    /// Drop objects that are complete and past their expiry; returns the
    /// removed TOIs. Driven by an external ticker.
    ///
    pub fn remove_expired_files(&self) -> Vec<u32> {
        let now = tools::now_secs();
        let mut expired = Vec::new();
        let mut session = self.state.session.lock().unwrap();
        let tois: Vec<u32> = session.files.keys().cloned().collect();
        for toi in tois {
            let remove = session
                .files
                .get(&toi)
                .map(|f| f.complete() && f.meta().expires > 0 && now > f.meta().expires)
                .unwrap_or(false);
            if remove {
                session.fdt.remove(toi);
                session.files.remove(&toi);
                expired.push(toi);
            }
        }
        expired
    }

    pub fn register_completion_callback(&self, cb: CompletionCallback) {
        *self.state.completion_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_rate_limit(&self, kbps: u32) {
        self.state.rate_limit_kbps.store(kbps, Ordering::Relaxed);
    }

    pub fn set_stop_when_done(&self, stop: bool) {
        self.state.stop_when_done.store(stop, Ordering::Relaxed);
    }

    pub fn set_remove_after_transmission(&self, remove: bool) {
        self.state
            .remove_after_transmission
            .store(remove, Ordering::Relaxed);
    }

    /// Current FDT XML, empty when no files are present
    pub fn fdt_string(&self) -> String {
        let session = self.state.session.lock().unwrap();
        if session.fdt.file_count() == 0 {
            return String::new();
        }
        session
            .fdt
            .to_xml()
            .map(|xml| String::from_utf8_lossy(&xml).into_owned())
            .unwrap_or_default()
    }

    pub fn current_instance_id(&self) -> u32 {
        self.state.session.lock().unwrap().fdt.instance_id()
    }

    /// Run a closure against an object of the session, e.g. to serve
    /// recovery requests without reloading data from disk.
    pub fn with_file<R>(&self, toi: u32, f: impl FnOnce(&dyn ObjectBase) -> R) -> Option<R> {
        let session = self.state.session.lock().unwrap();
        session.files.get(&toi).map(|file| f(file.as_ref()))
    }

    /// The OTI of this session
    pub fn fec_oti(&self) -> FecOti {
        self.state.fec_oti
    }

    fn allocate_toi(&self) -> u32 {
        let mut session = self.state.session.lock().unwrap();
        let toi = session.next_toi;
        session.next_toi = session.next_toi.wrapping_add(1);
        if session.next_toi == 0 {
            session.next_toi = 1; // TOI 0 is the FDT
        }
        toi as u32
    }

    fn no_transmission_in_flight(&self, session: &Session) -> bool {
        session
            .files
            .iter()
            .all(|(toi, file)| *toi == TOI_FDT || file.complete())
    }

    fn send_fdt(&self, session: &mut Session) {
        send_fdt_locked(&self.state, session)
    }
}

impl Drop for Transmitter {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::Relaxed);
    }
}

///
/// Serialize the FDT, queue it as the TOI=0 object and mirror it to the
/// side file. Callers hold the session lock.
///
fn send_fdt_locked(state: &Arc<TransmitterState>, session: &mut Session) {
    if session.fdt.file_count() == 0 {
        // Pretend it was sent so the ticker does not retry immediately
        session.last_fdt_sent_ms = tools::now_ms();
        return;
    }

    let expires = tools::now_secs() + 2 * state.fdt_repeat_interval.as_secs().max(1);
    session.fdt.set_expires(expires);

    let xml = match session.fdt.to_xml() {
        Ok(xml) => xml,
        Err(e) => {
            log::error!("[TRANSMIT] Fail to serialize FDT: {}", e);
            return;
        }
    };

    // The FDT itself always travels in plaintext no-code symbols
    let fdt_oti = FecOti {
        encoding_id: FecScheme::NoCode,
        transfer_length: 0,
        encoding_symbol_length: state.fdt_payload as u32,
        max_source_block_length: NOCODE_MSBL,
    };
    let mut file = match File::for_transmit(
        TOI_FDT,
        &fdt_oti,
        "",
        "",
        expires,
        0,
        xml.clone(),
        false,
        state.telemetry.clone(),
    ) {
        Ok(file) => file,
        Err(e) => {
            log::error!("[TRANSMIT] Fail to create FDT object: {}", e);
            return;
        }
    };
    file.set_fdt_instance_id(session.fdt.instance_id());

    state.telemetry.gauge("multicast_fdt_sent").increment();
    session.files.insert(TOI_FDT, Box::new(file));
    session.last_fdt_sent_ms = tools::now_ms();

    if let Some(path) = state.fdt_side_file.as_deref() {
        write_fdt_side_file(path, &xml);
    }
}

/// Single-writer side channel for the recovery server: write to a temp
/// file, then rename into place so readers never observe a torn FDT.
fn write_fdt_side_file(path: &Path, xml: &[u8]) {
    let tmp = path.with_extension("fdt.tmp");
    if let Err(e) = std::fs::write(&tmp, xml).and_then(|_| std::fs::rename(&tmp, path)) {
        log::error!("[TRANSMIT] Fail to write FDT side file {:?}: {}", path, e);
    }
}

fn file_transmitted(state: &Arc<TransmitterState>, session: &mut Session, toi: u32) {
    if toi == TOI_FDT {
        log::debug!("[TRANSMIT] FDT (TOI 0) has been transmitted");
        return;
    }

    // Re-announce the FDT with the completed TOI still listed so slow
    // receivers can resolve buffered packets, then drop the object.
    send_fdt_locked(state, session);

    if state.remove_after_transmission.load(Ordering::Relaxed) {
        session.files.remove(&toi);
    }
    session.fdt.remove(toi);

    let cb = state.completion_cb.lock().unwrap().clone();
    match cb {
        Some(cb) => {
            log::debug!("[TRANSMIT] Calling completion callback for TOI {}", toi);
            // Detached so a callback taking locks cannot deadlock the pump
            tokio::spawn(async move { cb(toi) });
        }
        None => log::info!("[TRANSMIT] TOI {} has been transmitted", toi),
    }
}

async fn packet_pump(state: Arc<TransmitterState>) {
    while state.running.load(Ordering::Relaxed) {
        let mut queued: Option<(u32, Vec<crate::common::symbol::EncodingSymbol>, Vec<u8>)> = None;
        let mut only_fdt_left = false;

        {
            let mut session = state.session.lock().unwrap();
            let tois: Vec<u32> = session.files.keys().cloned().collect();
            for toi in tois {
                let Some(file) = session.files.get(&toi) else {
                    continue;
                };
                if file.complete() {
                    continue;
                }

                let deadline = file.meta().should_be_complete_at;
                if deadline > 0 && tools::now_ms() > deadline {
                    log::info!(
                        "[TRANSMIT] Deadline of TOI {} has passed, forcefully marking as complete",
                        toi
                    );
                    if let Some(file) = session.files.get_mut(&toi) {
                        file.mark_complete();
                    }
                    file_transmitted(&state, &mut session, toi);
                    continue;
                }

                // The FDT object is sized for the full no-code payload
                let budget = if toi == TOI_FDT {
                    state.fdt_payload
                } else {
                    state.max_payload
                };

                let (symbols, fec_oti, fdt_instance_id) = {
                    let Some(file) = session.files.get_mut(&toi) else {
                        continue;
                    };
                    let symbols = file.get_next_symbols(budget);
                    let fdt_instance_id = (toi == TOI_FDT).then(|| file.fdt_instance_id());
                    (symbols, file.meta().fec_oti, fdt_instance_id)
                };
                if symbols.is_empty() {
                    continue;
                }

                match alc::create_alc_pkt(&fec_oti, state.tsi, toi, &symbols, budget, fdt_instance_id)
                {
                    Ok(pkt) => {
                        queued = Some((toi, symbols, pkt));
                    }
                    Err(e) => {
                        log::error!("[TRANSMIT] Fail to build ALC packet for TOI {}: {}", toi, e);
                        if let Some(file) = session.files.get_mut(&toi) {
                            file.mark_completed(&symbols, false);
                        }
                    }
                }
                break;
            }

            if queued.is_none() {
                // Completed objects may stay in the map when
                // remove_after_transmission is off
                only_fdt_left = session.files.contains_key(&TOI_FDT)
                    && session.files.values().all(|f| f.complete());
            }
        }

        match queued {
            None => {
                if only_fdt_left && state.stop_when_done.load(Ordering::Relaxed) {
                    log::debug!("[TRANSMIT] All files transmitted, stopping pump");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            Some((toi, symbols, pkt)) => {
                let bytes_queued = pkt.len();
                let sent = state.socket.send(&pkt).await;

                {
                    let mut session = state.session.lock().unwrap();
                    match sent {
                        Ok(()) => {
                            state
                                .telemetry
                                .gauge("multicast_symbols_sent")
                                .add(symbols.len() as f64);
                            state.telemetry.gauge("multicast_packets_sent").increment();
                            let mut completed = false;
                            if let Some(file) = session.files.get_mut(&toi) {
                                file.mark_completed(&symbols, true);
                                completed = file.complete();
                            }
                            if completed {
                                file_transmitted(&state, &mut session, toi);
                            }
                        }
                        Err(e) => {
                            log::error!("[TRANSMIT] send error: {}", e);
                            if let Some(file) = session.files.get_mut(&toi) {
                                file.mark_completed(&symbols, false);
                            }
                        }
                    }
                }

                let rate = state.rate_limit_kbps.load(Ordering::Relaxed);
                if rate > 0 {
                    // ceil(bytes * 8000 / rate) microseconds
                    let wait_us = num_integer::div_ceil(bytes_queued as u64 * 8000, rate as u64);
                    tokio::time::sleep(Duration::from_micros(wait_us)).await;
                } else {
                    tokio::task::yield_now().await;
                }
            }
        }
    }
}

async fn fdt_ticker(state: Arc<TransmitterState>) {
    let interval_ms = state.fdt_repeat_interval.as_millis() as u64;
    while state.running.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(interval_ms.min(100).max(10))).await;

        let now = tools::now_ms();
        let mut session = state.session.lock().unwrap();
        let elapsed = now.saturating_sub(session.last_fdt_sent_ms);
        if elapsed <= interval_ms {
            continue;
        }

        let non_fdt_present = session.files.keys().any(|toi| *toi != TOI_FDT);
        if non_fdt_present {
            send_fdt_locked(&state, &mut session);
        } else {
            session.last_fdt_sent_ms = now;
        }
    }
}
