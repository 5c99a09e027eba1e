//! End-to-end delivery scenarios: transmitter and receiver wired through
//! the in-memory packet seam (and once through real UDP sockets), with the
//! unicast recovery channel served by the axum surface.

use flutecast::common::alc;
use flutecast::receiver::{Config as ReceiverConfig, Receiver};
use flutecast::recovery::{router, RecoveryService, Retriever};
use flutecast::sender::{Config as SenderConfig, Transmitter};
use flutecast::telemetry::Telemetry;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;

fn init() {
    std::env::set_var("RUST_LOG", "debug");
    env_logger::builder().is_test(true).try_init().ok();
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

fn sender_config() -> SenderConfig {
    SenderConfig {
        fdt_side_file: None,
        ..Default::default()
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..1000 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    done()
}

/// Capture everything a transmitter emits for the given payloads
async fn capture_session(config: &SenderConfig, payloads: &[(&str, Vec<u8>)]) -> Vec<Vec<u8>> {
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

fn collect_completions(receiver: &Receiver) -> Arc<Mutex<Vec<(u32, Vec<u8>)>>> {
    let completed = Arc::new(Mutex::new(Vec::new()));
    let sink = completed.clone();
    receiver.register_completion_callback(Arc::new(move |object| {
        sink.lock()
            .unwrap()
            .push((object.toi(), object.buffer().unwrap_or_default()));
    }));
    completed
}

///
/// Single file, no loss: exactly ceil(4096/1428) data packets on the wire,
/// one completion with the right bytes, hash verified.
///
#[tokio::test]
async fn test_single_file_lossless() {
    init();

    let data = vec![0xAB; 4096];
    let pkts = capture_session(&sender_config(), &[("file:///hello.bin", data.clone())]).await;

    let max_payload = flutecast::sender::max_payload_for(1500, false);
    let expected_data_pkts = (4096 + max_payload - 1) / max_payload;
    let data_pkts = pkts
        .iter()
        .filter(|p| alc::parse_alc_pkt(p).unwrap().toi() != 0)
        .count();
    assert_eq!(data_pkts, expected_data_pkts);
    assert!(pkts.len() > data_pkts, "at least one FDT packet expected");

    let receiver = Receiver::new(ReceiverConfig::default(), "", Telemetry::disabled());
    let completed = collect_completions(&receiver);
    receiver.start();
    for pkt in &pkts {
        receiver.handle_datagram(pkt, true);
    }

    assert!(wait_until(|| !completed.lock().unwrap().is_empty()).await);
    let completed = completed.lock().unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].0, 1);
    assert_eq!(completed[0].1, data);
}

///
/// 10% loss plus a recovery deadline: the receiver asks the recovery
/// server for exactly the missing symbols and completes.
///
#[tokio::test]
async fn test_loss_recovered_through_unicast_repair() {
    init();

    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let transmitter = Arc::new(Transmitter::new_with_channel(
        tx,
        &sender_config(),
        Telemetry::disabled(),
    ));
    // Keep the object around so the retriever can serve it
    transmitter.set_remove_after_transmission(false);

    let deadline = now_ms() + 800;
    transmitter
        .send("file:///video.bin", "video/mp4", 0, deadline, data.clone())
        .await
        .unwrap();
    transmitter.set_stop_when_done(true);
    transmitter.start().await.unwrap();

    let mut pkts = Vec::new();
    while let Ok(pkt) = rx.try_recv() {
        pkts.push(pkt);
    }

    // Recovery surface on an ephemeral port
    let retriever = Arc::new(Retriever::new(
        1,
        1500,
        flutecast::common::oti::FecScheme::NoCode,
        Telemetry::disabled(),
    ));
    let service = RecoveryService::for_transmitter(transmitter.clone(), retriever);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router(service)).await.unwrap();
    });

    let receiver = Receiver::new(
        ReceiverConfig::default(),
        &format!("http://127.0.0.1:{}", port),
        Telemetry::disabled(),
    );
    let completed = collect_completions(&receiver);
    receiver.start();

    // Drop roughly every 10th data packet
    let mut nb_data = 0;
    let mut nb_dropped = 0;
    for pkt in &pkts {
        let parsed = alc::parse_alc_pkt(pkt).unwrap();
        if parsed.toi() != 0 {
            nb_data += 1;
            if nb_data % 10 == 3 {
                nb_dropped += 1;
                continue;
            }
        }
        receiver.handle_datagram(pkt, true);
    }
    assert!(nb_dropped > 0);

    assert!(
        wait_until(|| !completed.lock().unwrap().is_empty()).await,
        "recovery did not complete the object"
    );
    let completed = completed.lock().unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].1, data);
}

///
/// FDT refresh across two objects: the instance ids a receiver parses are
/// strictly increasing and no id is parsed twice.
///
#[tokio::test]
async fn test_fdt_instance_ids_monotonic() {
    init();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let transmitter = Transmitter::new_with_channel(tx, &sender_config(), Telemetry::disabled());
    let completions = Arc::new(Mutex::new(Vec::<u32>::new()));
    let sink = completions.clone();
    transmitter.register_completion_callback(Arc::new(move |toi| {
        sink.lock().unwrap().push(toi);
    }));

    let pump = transmitter.start();
    transmitter
        .send("file:///a.bin", "", 0, 0, vec![1u8; 3000])
        .await
        .unwrap();
    assert!(wait_until(|| !completions.lock().unwrap().is_empty()).await);
    transmitter
        .send("file:///b.bin", "", 0, 0, vec![2u8; 3000])
        .await
        .unwrap();
    assert!(wait_until(|| completions.lock().unwrap().len() == 2).await);
    transmitter.set_stop_when_done(true);
    pump.await.unwrap();

    let mut pkts = Vec::new();
    while let Ok(pkt) = rx.try_recv() {
        pkts.push(pkt);
    }

    let fdt_ids: Vec<u32> = pkts
        .iter()
        .filter_map(|p| alc::parse_alc_pkt(p).unwrap().fdt_instance_id)
        .collect();
    assert!(fdt_ids.len() >= 2);

    let telemetry = Telemetry::new();
    let receiver = Receiver::new(ReceiverConfig::default(), "", telemetry.clone());
    receiver.start();
    for pkt in &pkts {
        receiver.handle_datagram(pkt, true);
    }
    assert!(wait_until(|| telemetry.value("fdt_received") > 0.0).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Every parsed instance is fresh, duplicates are deduped on arrival
    let mut distinct = fdt_ids.clone();
    distinct.dedup();
    let mut sorted = distinct.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(distinct, sorted, "instance ids are not monotonic");
    assert_eq!(telemetry.value("fdt_received"), sorted.len() as f64);
}

///
/// An append-only stream crosses the wire in push order and re-assembles.
///
#[tokio::test]
async fn test_stream_delivery() {
    init();

    // Tiny MTU so T=4: 3 blocks of K=2 symbols for 24 bytes
    let config = SenderConfig {
        mtu: 68,
        ..sender_config()
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let transmitter = Transmitter::new_with_channel(tx, &config, Telemetry::disabled());
    transmitter.set_remove_after_transmission(false);

    let toi = transmitter
        .create_empty_file_for_stream(5, "application/octet-stream", 0, 0, 2, 24)
        .unwrap();
    assert_eq!(transmitter.push_to_stream(toi, b"AAAAAAAA").unwrap(), 8);
    assert_eq!(transmitter.push_to_stream(toi, b"BBBBBBBB").unwrap(), 8);
    assert_eq!(transmitter.push_to_stream(toi, b"CCCCCCCC").unwrap(), 8);
    assert_eq!(transmitter.stream_available_space(toi).unwrap(), 0);

    transmitter.set_stop_when_done(true);
    transmitter.start().await.unwrap();
    let mut pkts = Vec::new();
    while let Ok(pkt) = rx.try_recv() {
        pkts.push(pkt);
    }

    let receiver = Receiver::new(ReceiverConfig::default(), "", Telemetry::disabled());
    receiver.start();
    for pkt in &pkts {
        receiver.handle_datagram(pkt, true);
    }

    assert!(
        wait_until(|| {
            receiver
                .file_list()
                .iter()
                .any(|h| h.toi() == toi && h.complete())
        })
        .await
    );

    assert_eq!(receiver.stream_tois(5), vec![toi]);

    // The wire order is the writer's push order: every packet payload of
    // the stream concatenates back to the pushed bytes
    let mut assembled = Vec::new();
    for pkt in &pkts {
        let parsed = alc::parse_alc_pkt(pkt).unwrap();
        if parsed.toi() != toi {
            continue;
        }
        let oti = parsed.oti.unwrap();
        for symbol in parsed.symbols(&oti).unwrap() {
            assembled.extend(symbol.data);
        }
    }
    assert_eq!(assembled, b"AAAAAAAABBBBBBBBCCCCCCCC");
}

///
/// The rate limiter keeps a 100 kB send at 1000 kbps near the expected
/// 0.8 s wall time.
///
#[tokio::test]
async fn test_rate_limit() {
    init();

    let config = SenderConfig {
        rate_limit_kbps: 1000,
        ..sender_config()
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let transmitter = Transmitter::new_with_channel(tx, &config, Telemetry::disabled());
    transmitter
        .send("file:///big.bin", "", 0, 0, vec![0x5A; 100_000])
        .await
        .unwrap();
    transmitter.set_stop_when_done(true);

    let started = Instant::now();
    transmitter.start().await.unwrap();
    let elapsed = started.elapsed();

    let mut total_bytes = 0usize;
    while let Ok(pkt) = rx.try_recv() {
        total_bytes += pkt.len();
    }

    // >= payload / rate, minus one packet of slack
    assert!(
        elapsed >= Duration::from_millis(700),
        "sent too fast: {:?}",
        elapsed
    );
    let kbps = total_bytes as f64 * 8.0 / 1000.0 / elapsed.as_secs_f64();
    assert!(kbps <= 1100.0, "rate {} kbps above the limit", kbps);
}

///
/// Same delivery through real UDP sockets on the loopback interface.
///
#[tokio::test]
async fn test_udp_loopback_delivery() {
    init();

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = socket.local_addr().unwrap();

    let receiver = Receiver::new(ReceiverConfig::default(), "", Telemetry::disabled());
    let completed = collect_completions(&receiver);
    receiver.start();
    receiver.start_socket(socket);

    let data = vec![0xC3; 10_000];
    let transmitter = Transmitter::new(target, &sender_config(), Telemetry::disabled())
        .await
        .unwrap();
    transmitter.set_stop_when_done(true);
    let pump = transmitter.start();
    transmitter
        .send("file:///loopback.bin", "", 0, 0, data.clone())
        .await
        .unwrap();
    pump.await.unwrap();

    assert!(wait_until(|| !completed.lock().unwrap().is_empty()).await);
    assert_eq!(completed.lock().unwrap()[0].1, data);
    receiver.stop();
}
