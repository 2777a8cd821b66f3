//! Peer stream transport: varint-length-prefixed frames over TCP with a
//! protocol-identifier handshake, plus the registry of dialable peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::SystemTime;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

/// Hard cap on a single frame. Streams carrying anything larger are
/// broken off.
pub const MAX_FRAME_SIZE: usize = 1 << 23;

const WRITE_TIMEOUT_SECS: u64 = 10;
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// A single peer stream speaking length-prefixed frames. One protocol per
/// stream; the first frame a client sends is the protocol identifier.
pub struct FramedStream {
    stream: TcpStream,
}

impl FramedStream {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Dial a peer and announce the protocol this stream will speak.
    pub async fn connect(addr: SocketAddr, protocol: &str) -> Result<Self, String> {
        let stream = timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| format!("connect to {addr} timed out"))?
        .map_err(|err| err.to_string())?;
        let mut framed = Self::new(stream);
        framed.write_frame(protocol.as_bytes()).await?;
        Ok(framed)
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), String> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err("frame too large".to_string());
        }
        let mut buf = Vec::with_capacity(payload.len() + 9);
        write_varint(&mut buf, payload.len() as u64);
        buf.extend_from_slice(payload);
        timeout(
            Duration::from_secs(WRITE_TIMEOUT_SECS),
            self.stream.write_all(&buf),
        )
        .await
        .map_err(|_| "peer write timed out".to_string())?
        .map_err(|err| err.to_string())?;
        Ok(())
    }

    pub async fn read_frame(&mut self) -> Result<Vec<u8>, String> {
        let len = self.read_varint().await?;
        if len as usize > MAX_FRAME_SIZE {
            return Err("frame too large".to_string());
        }
        let mut payload = vec![0u8; len as usize];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|err| err.to_string())?;
        Ok(payload)
    }

    /// Read the protocol identifier frame that opens every stream.
    pub async fn read_protocol(&mut self) -> Result<String, String> {
        let frame = self.read_frame().await?;
        if frame.len() > 128 {
            return Err("protocol identifier too long".to_string());
        }
        String::from_utf8(frame).map_err(|_| "protocol identifier not utf8".to_string())
    }

    async fn read_varint(&mut self) -> Result<u64, String> {
        let prefix = self.read_byte().await? as u64;
        if prefix < 0xfd {
            return Ok(prefix);
        }
        let width = match prefix {
            0xfd => 2,
            0xfe => 4,
            _ => 8,
        };
        let mut bytes = [0u8; 8];
        self.stream
            .read_exact(&mut bytes[..width])
            .await
            .map_err(|err| err.to_string())?;
        Ok(u64::from_le_bytes(bytes))
    }

    async fn read_byte(&mut self) -> Result<u8, String> {
        let mut byte = [0u8; 1];
        self.stream
            .read_exact(&mut byte)
            .await
            .map_err(|err| err.to_string())?;
        Ok(byte[0])
    }
}

fn write_varint(buf: &mut Vec<u8>, value: u64) {
    if value < 0xfd {
        buf.push(value as u8);
    } else if value <= 0xffff {
        buf.push(0xfd);
        buf.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xffff_ffff {
        buf.push(0xfe);
        buf.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        buf.push(0xff);
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

#[derive(Clone, Copy, Debug)]
struct PeerEntry {
    connected_since: SystemTime,
    last_seen: SystemTime,
}

/// Dialable peers, keyed by the address their chain service listens on.
/// Entries come from configuration and from relay-stream handshakes.
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<SocketAddr, PeerEntry>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, addr: SocketAddr) {
        let now = SystemTime::now();
        let mut peers = self.peers.lock().expect("peer registry lock");
        peers
            .entry(addr)
            .and_modify(|entry| entry.last_seen = now)
            .or_insert(PeerEntry {
                connected_since: now,
                last_seen: now,
            });
    }

    pub fn touch(&self, addr: SocketAddr) {
        let mut peers = self.peers.lock().expect("peer registry lock");
        if let Some(entry) = peers.get_mut(&addr) {
            entry.last_seen = SystemTime::now();
        }
    }

    pub fn remove(&self, addr: SocketAddr) {
        let mut peers = self.peers.lock().expect("peer registry lock");
        peers.remove(&addr);
    }

    pub fn count(&self) -> usize {
        self.peers.lock().expect("peer registry lock").len()
    }

    /// Peers ordered by how recently we heard from them, freshest first.
    pub fn snapshot(&self) -> Vec<SocketAddr> {
        let peers = self.peers.lock().expect("peer registry lock");
        let mut entries: Vec<(SocketAddr, PeerEntry)> =
            peers.iter().map(|(addr, entry)| (*addr, *entry)).collect();
        entries.sort_by(|a, b| b.1.last_seen.cmp(&a.1.last_seen));
        entries.into_iter().map(|(addr, _)| addr).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frame_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut framed = FramedStream::new(stream);
            let protocol = framed.read_protocol().await.expect("protocol");
            assert_eq!(protocol, "/umbra/regtest/chainservice");
            let frame = framed.read_frame().await.expect("frame");
            framed.write_frame(&frame).await.expect("echo");
        });

        let mut client = FramedStream::connect(addr, "/umbra/regtest/chainservice")
            .await
            .expect("connect");
        let payload = vec![0xabu8; 300];
        client.write_frame(&payload).await.expect("write");
        let echoed = client.read_frame().await.expect("read");
        assert_eq!(echoed, payload);
        server.await.expect("server task");
    }

    #[test]
    fn registry_orders_by_recency() {
        let registry = PeerRegistry::new();
        let a: SocketAddr = "10.0.0.1:9901".parse().expect("addr");
        let b: SocketAddr = "10.0.0.2:9901".parse().expect("addr");
        registry.register(a);
        registry.register(b);
        std::thread::sleep(std::time::Duration::from_millis(5));
        registry.touch(a);
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.snapshot()[0], a);
        registry.remove(a);
        assert_eq!(registry.snapshot(), vec![b]);
    }
}
