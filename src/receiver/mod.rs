//! FLUTE receiver: ALC parsing, out-of-order buffering for packets whose
//! describing FDT has not arrived yet, per-object assembly workers, and
//! deadline-driven unicast recovery.

use crate::common::alc::{self, AlcPkt};
use crate::common::lct::TOI_FDT;
use crate::common::oti::FecScheme;
use crate::fdt::{FileDeliveryTable, FileEntry};
use crate::fec;
use crate::object::{File, FileStream, ObjectBase};
use crate::recovery::Fetcher;
use crate::telemetry::Telemetry;
use crate::tools;
use crate::tools::pktbuffer::{OverflowPolicy, PktBuffer};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;

/// Both session buffers hold at most this many parsed packets
const PKT_BUFFER_CAPACITY: usize = 32768;
/// Socket read buffer, larger than any expected datagram
const MAX_DATAGRAM_SIZE: usize = 2048;

pub type CompletionCallback = Arc<dyn Fn(Arc<ObjectHandle>) + Send + Sync>;
pub type RemovalCallback = Arc<dyn Fn(Arc<ObjectHandle>) + Send + Sync>;
pub type EmitMessageCallback = Arc<dyn Fn(u32, String) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct Config {
    pub tsi: u64,
    /// Verify Content-MD5 of completed objects
    pub enable_md5_check: bool,
    /// Capacity of each per-object packet queue
    pub object_queue_size: usize,
    /// Object name exempt from age-based expiry
    pub bootstrap_exemption: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tsi: 1,
            enable_md5_check: true,
            object_queue_size: 2048,
            bootstrap_exemption: "bootstrap.multipart".to_owned(),
        }
    }
}

///
/// One object of the session: the assembly state plus its packet queue and
/// worker bookkeeping. Handed to the completion/removal callbacks.
///
pub struct ObjectHandle {
    toi: u32,
    object: Mutex<Box<dyn ObjectBase>>,
    queue: Mutex<VecDeque<AlcPkt>>,
    queue_capacity: usize,
    notify: Notify,
    ignore_reception: AtomicBool,
    worker_running: AtomicBool,
    completion_fired: AtomicBool,
}

impl ObjectHandle {
    fn new(toi: u32, object: Box<dyn ObjectBase>, queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            toi,
            object: Mutex::new(object),
            queue: Mutex::new(VecDeque::new()),
            queue_capacity,
            notify: Notify::new(),
            ignore_reception: AtomicBool::new(false),
            worker_running: AtomicBool::new(false),
            completion_fired: AtomicBool::new(false),
        })
    }

    pub fn toi(&self) -> u32 {
        self.toi
    }

    pub fn meta(&self) -> FileEntry {
        self.object.lock().unwrap().meta().clone()
    }

    pub fn complete(&self) -> bool {
        self.object.lock().unwrap().complete()
    }

    /// Copy of the assembled content, None once released
    pub fn buffer(&self) -> Option<Vec<u8>> {
        self.object.lock().unwrap().buffer().map(|b| b.to_vec())
    }

    pub fn is_ignored(&self) -> bool {
        self.ignore_reception.load(Ordering::Relaxed)
    }

    /// Run a closure against the object state
    pub fn with_object<R>(&self, f: impl FnOnce(&dyn ObjectBase) -> R) -> R {
        f(self.object.lock().unwrap().as_ref())
    }

    /// Encoding symbols still sitting in the pending-receive queue,
    /// extracted without consuming it. Recovery subtracts these from a
    /// missing-symbol set before going over the wire.
    pub fn buffered_symbols(&self) -> Vec<crate::common::symbol::EncodingSymbol> {
        let oti = self.object.lock().unwrap().meta().fec_oti;
        self.queue
            .lock()
            .unwrap()
            .iter()
            .filter_map(|pkt| pkt.symbols(&oti).ok())
            .flatten()
            .collect()
    }

    /// Step 2, per object: try-enqueue with drop-on-full semantics so the
    /// session pump never blocks on a slow object.
    fn enqueue(&self, pkt: AlcPkt, telemetry: &Telemetry) {
        if self.ignore_reception.load(Ordering::Relaxed) {
            return;
        }
        if !self.worker_running.load(Ordering::Relaxed) {
            return;
        }
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.queue_capacity {
                log::warn!("[RECEIVE] Object queue of TOI {} full, dropping packet", self.toi);
                telemetry.gauge("alcs_ignored").increment();
                return;
            }
            queue.push_back(pkt);
        }
        self.notify.notify_one();
    }

    fn stop_worker(&self) {
        self.worker_running.store(false, Ordering::Relaxed);
        self.notify.notify_one();
    }
}

struct Objects {
    fdt: Option<FileDeliveryTable>,
    map: BTreeMap<u32, Arc<ObjectHandle>>,
    /// Active TOIs per stream id, ordered by arrival
    stream_tois: BTreeMap<u32, Vec<u32>>,
}

struct ReceiverState {
    config: Config,
    files: Mutex<Objects>,
    alc_buffer: Mutex<PktBuffer<AlcPkt>>,
    unknown_alc_buffer: Mutex<PktBuffer<AlcPkt>>,
    fetcher: Fetcher,
    completion_cb: Mutex<Option<CompletionCallback>>,
    removal_cb: Mutex<Option<RemovalCallback>>,
    emit_message_cb: Mutex<Option<EmitMessageCallback>>,
    video_ids: Mutex<Vec<String>>,
    running: AtomicBool,
    telemetry: Telemetry,
}

///
/// FLUTE receiver for one transport session. Push datagrams in through
/// [`Receiver::handle_datagram`] (or [`Receiver::start_socket`]) and drive
/// assembly with [`Receiver::start`] or manual [`Receiver::handle_alc_buffer`]
/// calls.
///
pub struct Receiver {
    state: Arc<ReceiverState>,
}

impl Receiver {
    ///
    /// `recovery_url` points at the unicast repair server, empty disables
    /// recovery.
    ///
    pub fn new(config: Config, recovery_url: &str, telemetry: Telemetry) -> Self {
        let fetcher = Fetcher::new(recovery_url, telemetry.clone());
        let state = Arc::new(ReceiverState {
            config,
            files: Mutex::new(Objects {
                fdt: None,
                map: BTreeMap::new(),
                stream_tois: BTreeMap::new(),
            }),
            alc_buffer: Mutex::new(PktBuffer::new(
                PKT_BUFFER_CAPACITY,
                OverflowPolicy::DropArrival,
            )),
            unknown_alc_buffer: Mutex::new(PktBuffer::new(
                PKT_BUFFER_CAPACITY,
                OverflowPolicy::EvictOldest,
            )),
            fetcher: fetcher.clone(),
            completion_cb: Mutex::new(None),
            removal_cb: Mutex::new(None),
            emit_message_cb: Mutex::new(None),
            video_ids: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            telemetry,
        });

        let weak = Arc::downgrade(&state);
        fetcher.register_alc_callback(Arc::new(move |data: &[u8]| {
            if let Some(state) = weak.upgrade() {
                handle_datagram(&state, data, false);
            }
        }));
        let weak = Arc::downgrade(&state);
        fetcher.register_fdt_callback(Arc::new(move |data: &[u8]| {
            if let Some(state) = weak.upgrade() {
                handle_fetched_fdt(&state, data);
            }
        }));

        Self { state }
    }

    /// Spawn the buffer drain loop and the deadline/recovery monitor
    pub fn start(&self) {
        let state = self.state.clone();
        tokio::spawn(drain_loop(state));
        let state = self.state.clone();
        tokio::spawn(recovery_monitor(state));
    }

    /// Spawn a read loop feeding this receiver from a bound UDP socket
    pub fn start_socket(&self, socket: tokio::net::UdpSocket) -> tokio::task::JoinHandle<()> {
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            while state.running.load(Ordering::Relaxed) {
                match socket.recv_from(&mut buf).await {
                    Ok((nb, _src)) if nb > 0 => {
                        state
                            .telemetry
                            .gauge("multicast_bytes_received")
                            .add(nb as f64);
                        handle_datagram(&state, &buf[..nb], true);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("[RECEIVE] recv_from error: {}", e);
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.state.running.store(false, Ordering::Relaxed);
        let files = self.state.files.lock().unwrap();
        for handle in files.map.values() {
            handle.stop_worker();
        }
    }

    ///
    /// Enable IPSec ESP decryption of incoming payloads. Installing the
    /// actual kernel state is the job of the embedding platform; the
    /// engine only records the request.
    ///
    pub fn enable_ipsec(&self, spi: u32, _aes_key: &str) {
        log::info!("[RECEIVE] IPSec ESP requested for SPI {}, delegating to platform", spi);
    }

    ///
    /// Step 1 entry: parse one datagram and queue it for dispatch. This is
    /// also the seam for in-memory (lossy) network replacements.
    ///
    pub fn handle_datagram(&self, data: &[u8], buffer_if_unknown: bool) {
        handle_datagram(&self.state, data, buffer_if_unknown);
    }

    /// Step 3: dispatch one buffered packet; true when work was done
    pub async fn handle_alc_buffer(&self) -> bool {
        handle_alc_buffer(&self.state).await
    }

    /// Ask the recovery server for the latest FDT when unknown-TOI packets
    /// are parked without a matching FDT entry.
    pub fn resolve_fdt_for_buffered_alcs(&self) {
        let nb_unknown = self.state.unknown_alc_buffer.lock().unwrap().len();
        if nb_unknown == 0 {
            return;
        }
        self.state.fetcher.fetch_fdt();
    }

    pub fn register_completion_callback(&self, cb: CompletionCallback) {
        *self.state.completion_cb.lock().unwrap() = Some(cb);
    }

    pub fn register_removal_callback(&self, cb: RemovalCallback) {
        *self.state.removal_cb.lock().unwrap() = Some(cb);
    }

    pub fn register_emit_message_callback(&self, cb: EmitMessageCallback) {
        *self.state.emit_message_cb.lock().unwrap() = Some(cb);
    }

    /// Content-location substring allow-list: objects matching no
    /// `/<id>/` are spawned but their reception is ignored.
    pub fn set_video_ids(&self, ids: Vec<String>) {
        *self.state.video_ids.lock().unwrap() = ids;
    }

    /// Snapshot of the current objects
    pub fn file_list(&self) -> Vec<Arc<ObjectHandle>> {
        self.state.files.lock().unwrap().map.values().cloned().collect()
    }

    /// Active TOIs of a stream, in arrival order. Sibling lookups of
    /// stream objects go through this registry.
    pub fn stream_tois(&self, stream_id: u32) -> Vec<u32> {
        self.state
            .files
            .lock()
            .unwrap()
            .stream_tois
            .get(&stream_id)
            .cloned()
            .unwrap_or_default()
    }

    ///
    /// Drop objects older than `max_age` seconds, except the bootstrap
    /// object.
    ///
    pub fn remove_expired_files(&self, max_age: u64) {
        let now = tools::now_secs();
        self.remove_files_where(|handle, meta| {
            meta.content_location != self.state.config.bootstrap_exemption
                && now.saturating_sub(handle.with_object(|o| o.received_at())) > max_age
        });
    }

    /// Drop every object whose content location matches
    pub fn remove_file_with_content_location(&self, content_location: &str) {
        self.remove_files_where(|_, meta| meta.content_location == content_location);
    }

    fn remove_files_where(&self, pred: impl Fn(&Arc<ObjectHandle>, &FileEntry) -> bool) {
        let removal_cb = self.state.removal_cb.lock().unwrap().clone();
        let mut files = self.state.files.lock().unwrap();
        let tois: Vec<u32> = files.map.keys().cloned().collect();
        for toi in tois {
            let Some(handle) = files.map.get(&toi) else {
                continue;
            };
            let meta = handle.meta();
            if !pred(handle, &meta) {
                continue;
            }
            let handle = files.map.remove(&toi).unwrap();
            handle.with_object_mut(|o| o.free_fec());
            handle.stop_worker();
            if let Some(streams) = files.stream_tois.get_mut(&meta.stream_id) {
                streams.retain(|t| *t != toi);
            }
            if let Some(cb) = removal_cb.as_ref() {
                cb(handle);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn alc_buffer_len(&self) -> usize {
        self.state.alc_buffer.lock().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn unknown_buffer_len(&self) -> usize {
        self.state.unknown_alc_buffer.lock().unwrap().len()
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ObjectHandle {
    fn with_object_mut<R>(&self, f: impl FnOnce(&mut dyn ObjectBase) -> R) -> R {
        f(self.object.lock().unwrap().as_mut())
    }
}

/// Step 1: parse and TSI gate; step 2: enqueue on the session buffer.
fn handle_datagram(state: &Arc<ReceiverState>, data: &[u8], buffer_if_unknown: bool) {
    state.telemetry.gauge("alcs_received").increment();

    let mut pkt = match alc::parse_alc_pkt(data) {
        Ok(pkt) => pkt,
        Err(e) => {
            log::warn!("[RECEIVE] Failed to decode ALC/FLUTE packet: {}", e);
            state.telemetry.gauge("alcs_malformed").increment();
            return;
        }
    };

    if pkt.tsi() != 0 && pkt.tsi() != state.config.tsi {
        log::warn!("[RECEIVE] Discarding packet for unknown TSI {}", pkt.tsi());
        return;
    }

    pkt.may_buffer_if_unknown = buffer_if_unknown && pkt.toi() != TOI_FDT;

    let pushed = state.alc_buffer.lock().unwrap().push(pkt);
    if !pushed {
        // Evicting the oldest would just punch a hole into another object,
        // recovery refills this one later
        log::warn!("[RECEIVE] ALC buffer full, dropping packet");
        state.telemetry.gauge("alcs_dropped").increment();
    }
}

/// Step 3: pop one packet and route it to its object
async fn handle_alc_buffer(state: &Arc<ReceiverState>) -> bool {
    let pkt = state.alc_buffer.lock().unwrap().pop_front();
    let Some(pkt) = pkt else {
        return false;
    };

    let handle = {
        let mut files = state.files.lock().unwrap();

        if pkt.toi() == TOI_FDT {
            let instance_id = pkt.fdt_instance_id.unwrap_or(0);
            let current_id = files.fdt.as_ref().map(|fdt| fdt.instance_id());
            match files.map.get(&TOI_FDT) {
                Some(handle) => {
                    // Keep feeding an FDT that spans several packets
                    if handle.with_object(|o| o.fdt_instance_id()) != instance_id {
                        log::debug!(
                            "[RECEIVE] Discarding packet: FDT instance {} while assembling another",
                            instance_id
                        );
                        return true;
                    }
                }
                None => {
                    if current_id == Some(instance_id) {
                        log::debug!(
                            "[RECEIVE] Discarding packet: already handled FDT instance {}",
                            instance_id
                        );
                        return true;
                    }
                    let Some(oti) = pkt.oti else {
                        log::warn!("[RECEIVE] FDT packet without in-band OTI");
                        return true;
                    };
                    let entry = FileEntry {
                        toi: TOI_FDT,
                        stream_id: 0,
                        content_location: String::new(),
                        content_length: oti.transfer_length,
                        content_md5: None,
                        content_type: String::new(),
                        expires: 0,
                        should_be_complete_at: 0,
                        fec_oti: oti,
                        raptor: None,
                    };
                    match File::for_receive(entry, false, state.telemetry.clone()) {
                        Ok(mut file) => {
                            file.set_fdt_instance_id(instance_id);
                            let handle = ObjectHandle::new(
                                TOI_FDT,
                                Box::new(file),
                                state.config.object_queue_size,
                            );
                            files.map.insert(TOI_FDT, handle);
                        }
                        Err(e) => {
                            log::warn!("[RECEIVE] Failed to create FDT object: {}", e);
                            return true;
                        }
                    }
                }
            }
        }

        match files.map.get(&pkt.toi()) {
            Some(handle) => handle.clone(),
            None => {
                if pkt.may_buffer_if_unknown && pkt.toi() != TOI_FDT {
                    // Parked until an FDT announces this TOI
                    let toi = pkt.toi();
                    let mut unknown = state.unknown_alc_buffer.lock().unwrap();
                    unknown.push(pkt);
                    state
                        .telemetry
                        .gauge("alcs_buffer_size")
                        .set(unknown.len() as f64);
                    state.telemetry.gauge("alcs_buffered").increment();
                    log::trace!("[RECEIVE] Parked packet for unknown TOI {}", toi);
                } else {
                    state.telemetry.gauge("alcs_ignored").increment();
                    log::trace!("[RECEIVE] Discarding packet: unknown TOI {}", pkt.toi());
                }
                return true;
            }
        }
    };

    if pkt.toi() == TOI_FDT {
        // The FDT is assembled inline, everything else waits for it anyway
        process_object_packet(state, &handle, pkt).await;
        return true;
    }

    handle.enqueue(pkt, &state.telemetry);
    true
}

/// Step 4: object-local assembly, runs on the object's worker
async fn process_object_packet(state: &Arc<ReceiverState>, handle: &Arc<ObjectHandle>, pkt: AlcPkt) {
    if handle.complete() {
        state.telemetry.gauge("alcs_ignored").increment();
        log::trace!(
            "[RECEIVE] Discarding packet: already completed TOI {}",
            pkt.toi()
        );
        pop_toi_from_buffer_fronts(state, pkt.toi());
        return;
    }

    let oti = handle.with_object(|o| o.meta().fec_oti);
    let symbols = match pkt.symbols(&oti) {
        Ok(symbols) if !symbols.is_empty() => symbols,
        Ok(_) => {
            log::warn!("[RECEIVE] Packet without encoding symbols for TOI {}", pkt.toi());
            return;
        }
        Err(e) => {
            log::warn!("[RECEIVE] Failed to decode ALC payload: {}", e);
            return;
        }
    };
    state
        .telemetry
        .gauge("symbols_received")
        .add(symbols.len() as f64);

    let is_raptor = oti.encoding_id == FecScheme::Raptor;
    for symbol in &symbols {
        let _permit = match is_raptor {
            true => fec::process_symbol_semaphore().acquire().await.ok(),
            false => None,
        };
        if let Err(e) = handle.with_object_mut(|o| o.put_symbol(symbol)) {
            log::warn!("[RECEIVE] Failed to process symbol: {}", e);
        }
    }

    if !handle.complete() {
        return;
    }

    if pkt.toi() == TOI_FDT {
        fdt_object_completed(state, handle, &pkt);
        return;
    }

    log::debug!("[RECEIVE] TOI {} completed", pkt.toi());
    let stream_id = handle.with_object(|o| o.meta().stream_id);
    if stream_id == 0 && !handle.completion_fired.swap(true, Ordering::SeqCst) {
        let cb = state.completion_cb.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(handle.clone());
        }
    }

    // Tear the object down: no recovery, no decoder, no buffer, no worker
    handle.with_object_mut(|o| {
        o.free_fec();
        o.meta_mut().should_be_complete_at = 0;
        o.free_buffer();
    });
    handle.stop_worker();
    pop_toi_from_buffer_fronts(state, pkt.toi());
}

/// The transient TOI=0 object finished: parse it and resolve objects
fn fdt_object_completed(state: &Arc<ReceiverState>, handle: &Arc<ObjectHandle>, pkt: &AlcPkt) {
    let instance_id = pkt
        .fdt_instance_id
        .unwrap_or_else(|| handle.with_object(|o| o.fdt_instance_id()));
    let buffer = handle.buffer().unwrap_or_default();

    let mut files = state.files.lock().unwrap();
    files.map.remove(&TOI_FDT);

    match FileDeliveryTable::parse(instance_id, &buffer) {
        Ok(fdt) => {
            log::info!("[RECEIVE] FDT instance {} received", instance_id);
            state.telemetry.gauge("fdt_received").increment();
            files.fdt = Some(fdt);
        }
        Err(e) => {
            // The previous FDT stays in charge
            log::warn!("[RECEIVE] Failed to parse FDT: {}", e);
            return;
        }
    }

    spawn_objects(state, &mut files);
    drop(files);
    resolve_unknown_buffer(state);
}

/// An FDT pulled over the recovery channel replaces the current one
fn handle_fetched_fdt(state: &Arc<ReceiverState>, data: &[u8]) {
    let mut files = state.files.lock().unwrap();
    let instance_id = files.fdt.as_ref().map(|fdt| fdt.instance_id()).unwrap_or(0);
    match FileDeliveryTable::parse(instance_id, data) {
        Ok(fdt) => {
            files.fdt = Some(fdt);
        }
        Err(e) => {
            log::warn!("[RECEIVE] Failed to parse fetched FDT: {}", e);
            return;
        }
    }
    spawn_objects(state, &mut files);
    drop(files);
    resolve_unknown_buffer(state);
}

/// Step 5: spawn an object for every FDT entry we do not know yet
fn spawn_objects(state: &Arc<ReceiverState>, files: &mut Objects) {
    let Some(fdt) = files.fdt.as_ref() else {
        return;
    };

    let entries: Vec<FileEntry> = fdt
        .file_entries()
        .iter()
        .filter(|entry| !files.map.contains_key(&entry.toi))
        .cloned()
        .collect();

    for entry in entries {
        if let Err(e) = spawn_object(state, files, entry) {
            log::warn!("[RECEIVE] Failed to spawn object: {}", e);
        }
    }
}

fn spawn_object(
    state: &Arc<ReceiverState>,
    files: &mut Objects,
    entry: FileEntry,
) -> crate::tools::error::Result<()> {
    log::debug!(
        "[RECEIVE] Starting reception of TOI {}: {} ({}), size {}, FEC {:?}",
        entry.toi,
        entry.content_location,
        entry.content_type,
        entry.content_length,
        entry.fec_oti.encoding_id
    );

    let toi = entry.toi;
    let stream_id = entry.stream_id;
    let content_location = entry.content_location.clone();

    let object: Box<dyn ObjectBase> = if stream_id > 0 {
        let mut stream = FileStream::for_receive(entry)?;
        let weak: Weak<ReceiverState> = Arc::downgrade(state);
        stream.register_emit_message_callback(Box::new(move |stream_id, message| {
            if let Some(state) = weak.upgrade() {
                let cb = state.emit_message_cb.lock().unwrap().clone();
                if let Some(cb) = cb {
                    cb(stream_id, message);
                }
            }
        }));
        Box::new(stream)
    } else {
        Box::new(File::for_receive(
            entry,
            state.config.enable_md5_check,
            state.telemetry.clone(),
        )?)
    };

    let handle = ObjectHandle::new(toi, object, state.config.object_queue_size);

    if stream_id > 0 {
        files.stream_tois.entry(stream_id).or_default().push(toi);
    }

    // Content-location allow-list, non-matching objects are spawned but
    // their packets are ignored
    let may_receive = {
        let video_ids = state.video_ids.lock().unwrap();
        video_ids.is_empty()
            || video_ids
                .iter()
                .any(|id| content_location.contains(&format!("/{}/", id)))
    };

    if may_receive {
        handle.worker_running.store(true, Ordering::Relaxed);
        tokio::spawn(object_worker(state.clone(), handle.clone()));
    } else {
        handle.ignore_reception.store(true, Ordering::Relaxed);
    }

    files.map.insert(toi, handle);
    Ok(())
}

async fn object_worker(state: Arc<ReceiverState>, handle: Arc<ObjectHandle>) {
    while handle.worker_running.load(Ordering::Relaxed) && state.running.load(Ordering::Relaxed) {
        let pkt = handle.queue.lock().unwrap().pop_front();
        match pkt {
            Some(pkt) => process_object_packet(&state, &handle, pkt).await,
            None => {
                // Re-check the stop flags at least every poll interval
                tokio::time::timeout(Duration::from_millis(100), handle.notify.notified())
                    .await
                    .ok();
            }
        }
    }
    log::debug!("[RECEIVE] Stopped worker of TOI {}", handle.toi);
}

/// Drop leading buffered packets of a TOI that just completed
fn pop_toi_from_buffer_fronts(state: &Arc<ReceiverState>, toi: u32) {
    let mut nb = 0;
    nb += state
        .alc_buffer
        .lock()
        .unwrap()
        .pop_front_while(|pkt| pkt.toi() == toi);
    nb += state
        .unknown_alc_buffer
        .lock()
        .unwrap()
        .pop_front_while(|pkt| pkt.toi() == toi);
    if nb > 0 {
        log::debug!("[RECEIVE] Removed {} buffered packets of TOI {}", nb, toi);
    }
}

/// Re-submit parked unknown-TOI packets now that a new FDT arrived
fn resolve_unknown_buffer(state: &Arc<ReceiverState>) {
    let parked = state.unknown_alc_buffer.lock().unwrap().drain_all();
    if !parked.is_empty() {
        log::trace!("[RECEIVE] Re-handling {} previously unknown packets", parked.len());
    }
    for mut pkt in parked {
        if pkt.toi() == TOI_FDT {
            continue;
        }
        // Unresolvable packets are discarded this time
        pkt.may_buffer_if_unknown = false;
        if !state.alc_buffer.lock().unwrap().push(pkt) {
            state.telemetry.gauge("alcs_dropped").increment();
        }
    }
    state.telemetry.gauge("alcs_buffer_size").set(0.0);
}

/// The buffer drain loop, step 3 driver
async fn drain_loop(state: Arc<ReceiverState>) {
    while state.running.load(Ordering::Relaxed) {
        if !handle_alc_buffer(&state).await {
            tokio::time::sleep(Duration::from_micros(10)).await;
        }
    }
}

///
/// Deadline monitor: when an incomplete object passes its deadline, emit
/// the missing-symbol set (minus anything still queued locally) to the
/// Fetcher, exactly once.
///
async fn recovery_monitor(state: Arc<ReceiverState>) {
    while state.running.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let now = tools::now_ms();

        let candidates: Vec<Arc<ObjectHandle>> = {
            let files = state.files.lock().unwrap();
            files.map.values().cloned().collect()
        };

        for handle in candidates {
            let fire = handle.with_object_mut(|o| {
                let deadline = o.meta().should_be_complete_at;
                if deadline == 0 || deadline == u64::MAX || now <= deadline || o.complete() {
                    return false;
                }
                // Fire at most once per object
                o.meta_mut().should_be_complete_at = 0;
                true
            });
            if !fire || handle.is_ignored() {
                continue;
            }
            retrieve_missing_parts(&state, &handle);
        }
    }
}

fn retrieve_missing_parts(state: &Arc<ReceiverState>, handle: &Arc<ObjectHandle>) {
    state.telemetry.gauge("emit_missing_symbols").increment();

    let (mut missing, oti, content_location, toi, total_symbols) = handle.with_object(|o| {
        (
            o.missing_parts(),
            o.meta().fec_oti,
            o.meta().content_location.clone(),
            o.meta().toi,
            o.source_blocks().iter().map(|b| b.symbols.len()).sum::<usize>(),
        )
    });
    if missing.is_empty() {
        return;
    }

    let nb_missing: usize = missing.values().map(|v| v.len()).sum();
    state
        .telemetry
        .gauge("missing_symbols_gauge")
        .add(nb_missing as f64);
    if total_symbols > 0 {
        state
            .telemetry
            .gauge("alc_percentage_to_retrieve")
            .set(nb_missing as f64 / total_symbols as f64 * 100.0);
    }

    // Symbols already sitting in a local queue need no unicast round trip
    let mut found_in_buffers = 0usize;
    for symbol in handle.buffered_symbols() {
        if let Some(esis) = missing.get_mut(&symbol.sbn) {
            if let Some(pos) = esis.iter().position(|esi| *esi == symbol.esi) {
                esis.swap_remove(pos);
                found_in_buffers += 1;
            }
        }
    }
    {
        let session_buffer = state.alc_buffer.lock().unwrap();
        for pkt in session_buffer.iter().filter(|p| p.toi() == toi) {
            found_in_buffers += subtract_pkt_symbols(&mut missing, pkt, &oti);
        }
    }
    if found_in_buffers > 0 {
        log::debug!(
            "[RECEIVE] Found {} missing symbols in local buffers",
            found_in_buffers
        );
    }
    missing.retain(|_, esis| !esis.is_empty());
    if missing.is_empty() {
        return;
    }

    state
        .fetcher
        .fetch_alcs(toi, oti.encoding_id, &content_location, &missing);
}

fn subtract_pkt_symbols(
    missing: &mut BTreeMap<u16, Vec<u16>>,
    pkt: &AlcPkt,
    oti: &crate::common::oti::FecOti,
) -> usize {
    let Ok(symbols) = pkt.symbols(oti) else {
        return 0;
    };
    let mut nb = 0;
    for symbol in symbols {
        if let Some(esis) = missing.get_mut(&symbol.sbn) {
            if let Some(pos) = esis.iter().position(|esi| *esi == symbol.esi) {
                esis.swap_remove(pos);
                nb += 1;
            }
        }
    }
    nb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::{Config as SenderConfig, Transmitter};
    use tokio::sync::mpsc;

    fn receiver() -> Receiver {
        Receiver::new(Config::default(), "", Telemetry::disabled())
    }

    async fn drain(receiver: &Receiver) {
        while receiver.handle_alc_buffer().await {}
    }

    /// Object workers run detached, give them a moment to finish
    async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        done()
    }

    async fn transmit_all(config: &SenderConfig, payloads: &[(&str, Vec<u8>)]) -> Vec<Vec<u8>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transmitter = Transmitter::new_with_channel(tx, config, Telemetry::disabled());
        for (location, data) in payloads {
            transmitter
                .send(location, "application/octet-stream", 0, 0, data.clone())
                .await
                .unwrap();
        }
        transmitter.set_stop_when_done(true);
        transmitter.start().await.unwrap();
        let mut pkts = Vec::new();
        while let Ok(pkt) = rx.try_recv() {
            pkts.push(pkt);
        }
        pkts
    }

    fn sender_config() -> SenderConfig {
        SenderConfig {
            fdt_side_file: None,
            ..Default::default()
        }
    }

    #[tokio::test]
    pub async fn test_lossless_delivery() {
        crate::tests::init();

        let data = vec![0xAB; 4096];
        let pkts = transmit_all(&sender_config(), &[("file:///hello.bin", data.clone())]).await;

        let receiver = receiver();
        let completed = Arc::new(Mutex::new(Vec::<(u32, Vec<u8>)>::new()));
        let completed_cb = completed.clone();
        receiver.register_completion_callback(Arc::new(move |handle| {
            completed_cb
                .lock()
                .unwrap()
                .push((handle.toi(), handle.buffer().unwrap_or_default()));
        }));

        for pkt in &pkts {
            receiver.handle_datagram(pkt, true);
        }
        drain(&receiver).await;
        assert!(wait_until(|| !completed.lock().unwrap().is_empty()).await);

        let completed = completed.lock().unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].0, 1);
        assert_eq!(completed[0].1, data);
    }

    #[tokio::test]
    pub async fn test_completion_callback_fires_once() {
        crate::tests::init();

        let data = vec![0x11; 2000];
        let pkts = transmit_all(&sender_config(), &[("file:///a", data)]).await;

        let receiver = receiver();
        let nb_calls = Arc::new(Mutex::new(0u32));
        let nb = nb_calls.clone();
        receiver.register_completion_callback(Arc::new(move |_| {
            *nb.lock().unwrap() += 1;
        }));

        // Feed the whole capture twice: duplicates must not re-complete
        for pkt in pkts.iter().chain(pkts.iter()) {
            receiver.handle_datagram(pkt, true);
        }
        drain(&receiver).await;
        assert!(wait_until(|| *nb_calls.lock().unwrap() > 0).await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*nb_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    pub async fn test_unknown_toi_buffering() {
        crate::tests::init();

        let data = vec![0x7E; 20000];
        let pkts = transmit_all(&sender_config(), &[("file:///late-fdt.bin", data.clone())]).await;

        let receiver = receiver();
        let completed = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let completed_cb = completed.clone();
        receiver.register_completion_callback(Arc::new(move |handle| {
            completed_cb
                .lock()
                .unwrap()
                .push(handle.buffer().unwrap_or_default());
        }));

        // Data packets first, the announcing FDT arrives last
        let (fdt_pkts, data_pkts): (Vec<&Vec<u8>>, Vec<&Vec<u8>>) = pkts
            .iter()
            .partition(|p| alc::parse_alc_pkt(p).unwrap().toi() == TOI_FDT);
        for pkt in &data_pkts {
            receiver.handle_datagram(pkt, true);
        }
        drain(&receiver).await;
        assert_eq!(receiver.unknown_buffer_len(), data_pkts.len());

        for pkt in &fdt_pkts {
            receiver.handle_datagram(pkt, true);
        }
        drain(&receiver).await;
        assert!(wait_until(|| !completed.lock().unwrap().is_empty()).await);

        assert_eq!(receiver.unknown_buffer_len(), 0);
        let completed = completed.lock().unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0], data);
    }

    #[tokio::test]
    pub async fn test_wrong_tsi_dropped() {
        crate::tests::init();

        let data = vec![1u8; 100];
        let config = SenderConfig {
            tsi: 99,
            ..sender_config()
        };
        let pkts = transmit_all(&config, &[("file:///a", data)]).await;

        let receiver = receiver(); // session TSI 1
        for pkt in &pkts {
            receiver.handle_datagram(pkt, true);
        }
        assert_eq!(receiver.alc_buffer_len(), 0);
    }

    #[tokio::test]
    pub async fn test_expired_file_removal() {
        crate::tests::init();

        let data = vec![9u8; 100];
        let pkts = transmit_all(&sender_config(), &[("file:///old.bin", data)]).await;

        let receiver = receiver();
        let removed = Arc::new(Mutex::new(Vec::<u32>::new()));
        let removed_cb = removed.clone();
        receiver.register_removal_callback(Arc::new(move |handle| {
            removed_cb.lock().unwrap().push(handle.toi());
        }));

        for pkt in &pkts {
            receiver.handle_datagram(pkt, true);
        }
        drain(&receiver).await;
        assert!(wait_until(|| receiver.file_list().iter().any(|h| h.complete())).await);

        assert_eq!(receiver.file_list().len(), 1);
        receiver.remove_expired_files(3600);
        assert_eq!(receiver.file_list().len(), 1);
        receiver.remove_file_with_content_location("file:///old.bin");
        assert_eq!(receiver.file_list().len(), 0);
        assert_eq!(removed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    pub async fn test_video_id_allow_list() {
        crate::tests::init();

        let pkts = transmit_all(
            &sender_config(),
            &[
                ("http://cdn/vid1/seg1.m4s", vec![1u8; 100]),
                ("http://cdn/vid2/seg1.m4s", vec![2u8; 100]),
            ],
        )
        .await;

        let receiver = receiver();
        receiver.set_video_ids(vec!["vid1".to_owned()]);
        for pkt in &pkts {
            receiver.handle_datagram(pkt, true);
        }
        drain(&receiver).await;

        let files = receiver.file_list();
        assert_eq!(files.len(), 2);
        for handle in files {
            let location = handle.meta().content_location;
            if location.contains("/vid1/") {
                assert!(!handle.is_ignored());
            } else {
                assert!(handle.is_ignored());
            }
        }
    }
}
