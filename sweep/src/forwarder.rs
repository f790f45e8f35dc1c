use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use pandar_types::{EncoderConfig, ForegroundEncoder, PolarPoint};

use crate::{ForegroundSink, Result, SweepError};

/// Open a connected datagram socket toward `dest` with a tiny write
/// timeout, letting the OS pick source address and port.
fn connect_datagram_socket(dest: &str) -> Result<UdpSocket> {
    let timeout = Duration::new(0, 1);
    for dest_addr in dest.to_socket_addrs()? {
        // Let OS choose what port to use.
        let mut src_addr = dest_addr;
        src_addr.set_port(0);
        if !dest_addr.ip().is_loopback() {
            // Let OS choose what IP to use, but preserve V4 or V6.
            match src_addr {
                SocketAddr::V4(_) => {
                    src_addr.set_ip(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
                }
                SocketAddr::V6(_) => {
                    src_addr.set_ip(IpAddr::V6(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0)));
                }
            }
        }
        let sock = UdpSocket::bind(src_addr)?;
        sock.set_write_timeout(Some(timeout))?;
        debug!("UDP connecting to {dest_addr}");
        sock.connect(dest_addr)?;
        return Ok(sock);
    }
    Err(SweepError::SocketAddressConversionFailed)
}

/// Send one datagram, treating a slow or absent peer as data loss rather
/// than an error. Returns false when the datagram was not delivered.
fn send_datagram(sock: &UdpSocket, data: &[u8]) -> bool {
    match sock.send(data) {
        Ok(sz) => {
            if sz != data.len() {
                warn!("incomplete send: {sz} of {} bytes", data.len());
                return false;
            }
            true
        }
        Err(err) => match err.kind() {
            std::io::ErrorKind::WouldBlock => false,
            std::io::ErrorKind::ConnectionRefused => false,
            _ => {
                error!("error sending socket data: {err:?}");
                false
            }
        },
    }
}

/// Mirrors raw datagrams to a secondary endpoint through a bounded queue.
///
/// `forward` copies the payload and never blocks; when the queue is full
/// the payload is dropped and counted. The consumer thread owns the
/// outbound socket and logs one drop summary per interval at most.
pub struct PacketForwarder {
    tx: SyncSender<Vec<u8>>,
    dropped: Arc<AtomicU64>,
}

impl PacketForwarder {
    pub fn new(dest: &str, capacity: usize, log_interval: Duration) -> Result<Self> {
        let sock = connect_datagram_socket(dest)?;
        let (tx, rx) = sync_channel::<Vec<u8>>(capacity);
        let dropped = Arc::new(AtomicU64::new(0));

        let dropped2 = dropped.clone();
        std::thread::Builder::new()
            .name("packet-forward".to_string())
            .spawn(move || {
                let mut last_summary = Instant::now();
                let mut reported: u64 = 0;
                let mut send_failures: u64 = 0;
                loop {
                    let payload = match rx.recv() {
                        Ok(p) => p,
                        Err(_) => break, // producer gone, shut down
                    };
                    if !send_datagram(&sock, &payload) {
                        send_failures += 1;
                    }
                    if last_summary.elapsed() >= log_interval {
                        let total = dropped2.load(Ordering::Relaxed);
                        let new_drops = total - reported;
                        reported = total;
                        if new_drops > 0 || send_failures > 0 {
                            warn!(
                                "packet forwarder: {new_drops} queue drops, \
                                 {send_failures} send failures in last {log_interval:?}"
                            );
                        }
                        send_failures = 0;
                        last_summary = Instant::now();
                    }
                }
                debug!("packet forwarder consumer exiting");
            })?;

        Ok(Self { tx, dropped })
    }

    /// Copy and enqueue one payload; drops without blocking on overload.
    pub fn forward(&self, payload: &[u8]) {
        match self.tx.try_send(payload.to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Serialises foreground point batches back into wire-format datagrams and
/// emits them on a secondary endpoint. Same queue contract as
/// [`PacketForwarder`], with batches instead of payloads.
pub struct ForegroundForwarder {
    tx: SyncSender<Vec<PolarPoint>>,
    dropped: Arc<AtomicU64>,
}

impl ForegroundForwarder {
    pub fn new(
        dest: &str,
        capacity: usize,
        encoder_cfg: EncoderConfig,
        log_interval: Duration,
    ) -> Result<Self> {
        let sock = connect_datagram_socket(dest)?;
        let (tx, rx) = sync_channel::<Vec<PolarPoint>>(capacity);
        let dropped = Arc::new(AtomicU64::new(0));

        let dropped2 = dropped.clone();
        std::thread::Builder::new()
            .name("foreground-forward".to_string())
            .spawn(move || {
                let encoder = ForegroundEncoder::new(encoder_cfg);
                let mut last_summary = Instant::now();
                let mut reported: u64 = 0;
                let mut send_failures: u64 = 0;
                loop {
                    let batch = match rx.recv() {
                        Ok(b) => b,
                        Err(_) => break,
                    };
                    match encoder.encode_batch(&batch) {
                        Ok((packets, _stats)) => {
                            for packet in packets {
                                if !send_datagram(&sock, &packet) {
                                    send_failures += 1;
                                }
                            }
                        }
                        Err(e) => debug!("foreground encode failed: {e}"),
                    }
                    if last_summary.elapsed() >= log_interval {
                        let total = dropped2.load(Ordering::Relaxed);
                        let new_drops = total - reported;
                        reported = total;
                        if new_drops > 0 || send_failures > 0 {
                            warn!(
                                "foreground forwarder: {new_drops} batch drops, \
                                 {send_failures} send failures in last {log_interval:?}"
                            );
                        }
                        send_failures = 0;
                        last_summary = Instant::now();
                    }
                }
                debug!("foreground forwarder consumer exiting");
            })?;

        Ok(Self { tx, dropped })
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ForegroundSink for ForegroundForwarder {
    fn forward_batch(&self, batch: Vec<PolarPoint>) {
        match self.tx.try_send(batch) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_never_blocks_and_counts_drops() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = receiver.local_addr().unwrap().to_string();

        let forwarder =
            PacketForwarder::new(&dest, 1, Duration::from_secs(3600)).unwrap();

        let payload = vec![0xABu8; 1262];
        let start = Instant::now();
        for _ in 0..50_000 {
            forwarder.forward(&payload);
        }
        // The producer outruns the consumer's syscalls by orders of
        // magnitude, so the 1-deep queue must have overflowed, and the
        // producer must never have blocked on the socket.
        assert!(forwarder.dropped_count() > 0);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn foreground_batches_arrive_as_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let dest = receiver.local_addr().unwrap().to_string();

        let forwarder = ForegroundForwarder::new(
            &dest,
            10,
            EncoderConfig::default(),
            Duration::from_secs(3600),
        )
        .unwrap();

        let batch: Vec<PolarPoint> = (0..5)
            .map(|i| PolarPoint {
                ring: i as u8,
                azimuth_deg: 45.0,
                distance_m: 10.0,
                intensity: 99,
                block_id: 0,
                timestamp_ns: 1_700_000_000_000_000_000,
                udp_seq: 0,
                raw_block_azimuth: 4500,
            })
            .collect();
        forwarder.forward_batch(batch);

        let mut buf = [0u8; 2048];
        let (len, _src) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(len, pandar_types::PACKET_SIZE);
        let parsed = pandar_types::parse_packet(&buf[..len]).unwrap();
        let hits = parsed
            .points
            .iter()
            .filter(|p| p.distance_m > 0.0)
            .count();
        assert_eq!(hits, 5);
    }
}
