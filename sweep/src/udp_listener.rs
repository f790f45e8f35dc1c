use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pandar_types::parse_packet;

use crate::{FrameSink, PacketForwarder, Result, StatsCollector, SweepError};

/// How long one receive may block before the loop re-checks cancellation.
const READ_DEADLINE: Duration = Duration::from_millis(100);

/// Large enough for the 1266 byte sequence-bearing datagram variant.
const RECV_BUF_LEN: usize = 2048;

/// Receives sensor datagrams and fans them out.
///
/// Per datagram: account packet and byte counts, mirror the raw payload to
/// the packet forwarder if one is attached, and if parsing is enabled hand
/// the decoded points to the attached frame sink together with the latest
/// motor-speed hint. A malformed datagram is counted and logged at debug,
/// never fatal.
pub struct UdpListener {
    socket: Option<UdpSocket>,
    stats: Arc<StatsCollector>,
    forwarder: Option<PacketForwarder>,
    sink: Option<Box<dyn FrameSink>>,
    parse_packets: bool,
    latest_motor_rpm: u16,
}

impl UdpListener {
    pub async fn bind(
        listen_addr: &str,
        recv_buffer_bytes: usize,
        stats: Arc<StatsCollector>,
        forwarder: Option<PacketForwarder>,
        sink: Option<Box<dyn FrameSink>>,
        parse_packets: bool,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(listen_addr).await?;
        info!("lidar listener at {}", socket.local_addr()?);

        let sockref = socket2::SockRef::from(&socket);
        if let Err(e) = sockref.set_recv_buffer_size(recv_buffer_bytes) {
            warn!("could not set receive buffer to {recv_buffer_bytes} bytes: {e}");
        }

        Ok(Self {
            socket: Some(socket),
            stats,
            forwarder,
            sink,
            parse_packets,
            latest_motor_rpm: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let socket = self.socket.as_ref().ok_or(SweepError::ListenerClosed)?;
        Ok(socket.local_addr()?)
    }

    /// Run the receive loop until `token` is cancelled (returns `Ok`) or a
    /// non-recoverable socket error occurs. Read timeouts are not errors;
    /// other socket errors are logged and the loop continues.
    pub async fn start(&mut self, token: CancellationToken) -> Result<()> {
        let socket = self.socket.take().ok_or(SweepError::ListenerClosed)?;
        let mut buf = vec![0u8; RECV_BUF_LEN];

        loop {
            let recv = tokio::select! {
                _ = token.cancelled() => None,
                r = tokio::time::timeout(READ_DEADLINE, socket.recv_from(&mut buf)) => Some(r),
            };
            match recv {
                None => {
                    debug!("listener cancelled");
                    self.socket = Some(socket);
                    return Ok(());
                }
                Some(Err(_elapsed)) => {
                    // no traffic within the deadline; loop so cancellation
                    // is observed promptly
                }
                Some(Ok(Ok((len, _src)))) => {
                    self.handle_datagram(&buf[..len]);
                }
                Some(Ok(Err(e))) => {
                    if token.is_cancelled() {
                        self.socket = Some(socket);
                        return Ok(());
                    }
                    error!("socket error: {e}");
                }
            }
            self.stats.maybe_flush();
        }
    }

    fn handle_datagram(&mut self, payload: &[u8]) {
        self.stats.record_packet(payload.len());

        if let Some(forwarder) = &self.forwarder {
            forwarder.forward(payload);
        }

        if !self.parse_packets {
            return;
        }
        match parse_packet(payload) {
            Ok(parsed) => {
                self.latest_motor_rpm = parsed.tail.motor_rpm;
                self.stats.record_points(parsed.points.len());
                if let Some(sink) = self.sink.as_mut() {
                    sink.on_frame(&parsed.points, self.latest_motor_rpm);
                }
            }
            Err(e) => {
                self.stats.record_parse_error();
                debug!("rejected datagram: {e}");
            }
        }
    }

    /// Idempotent; drops the socket.
    pub fn close(&mut self) {
        self.socket = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    struct CountingSink {
        frames: Arc<Mutex<Vec<(usize, u16)>>>,
    }

    impl FrameSink for CountingSink {
        fn on_frame(&mut self, points: &[pandar_types::PolarPoint], motor_rpm: u16) {
            self.frames.lock().unwrap().push((points.len(), motor_rpm));
        }
    }

    fn test_stats() -> Arc<StatsCollector> {
        Arc::new(StatsCollector::new("test", Duration::from_secs(3600)))
    }

    fn test_packet() -> Vec<u8> {
        let blocks = std::array::from_fn(|i| pandar_types::BlockSpec::empty(i as u16 * 3600));
        let tail = pandar_types::TailSpec {
            motor_rpm: 601,
            timestamp_ns: 1_700_000_000_000_000_000,
            return_mode: 0x37,
        };
        pandar_types::serialize_packet(&blocks, &tail, None).unwrap()
    }

    #[tokio::test]
    async fn cancellation_unblocks_the_read_loop() {
        let mut listener = UdpListener::bind("127.0.0.1:0", 65536, test_stats(), None, None, true)
            .await
            .unwrap();
        let token = CancellationToken::new();
        let token2 = token.clone();

        let handle = tokio::spawn(async move { listener.start(token2).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let joined = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("listener did not stop within one read deadline");
        assert!(joined.unwrap().is_ok());
    }

    #[tokio::test]
    async fn datagrams_are_counted_and_parsed() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Box::new(CountingSink {
            frames: frames.clone(),
        });
        let stats = test_stats();
        let mut listener = UdpListener::bind(
            "127.0.0.1:0",
            65536,
            stats.clone(),
            None,
            Some(sink),
            true,
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();

        let token = CancellationToken::new();
        let token2 = token.clone();
        let handle = tokio::spawn(async move { listener.start(token2).await });

        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let good = test_packet();
        sender.send_to(&good, addr).await.unwrap();
        sender.send_to(b"runt", addr).await.unwrap(); // malformed, must not kill the loop
        sender.send_to(&good, addr).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(stats.packets_total(), 3);
        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|&(n, rpm)| n == 400 && rpm == 601));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut listener = UdpListener::bind("127.0.0.1:0", 65536, test_stats(), None, None, false)
            .await
            .unwrap();
        listener.close();
        listener.close();
        assert!(matches!(
            listener.start(CancellationToken::new()).await,
            Err(SweepError::ListenerClosed)
        ));
    }
}
