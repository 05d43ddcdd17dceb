//! Raw TCP transport on tokio.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use perfkit_core::{Error, Result};

use crate::frame::{encode_frame, FrameDecoder};
use crate::{Envelope, InboundHandler, Transport, TransportStatus};

const READ_CHUNK: usize = 64 * 1024;

type SharedHandler = Arc<Mutex<Option<InboundHandler>>>;

/// Transport over one TCP connection.
///
/// Connection, reading and writing run as a task on the supplied tokio
/// runtime. Outbound frames are queued while connecting. The transport never
/// reconnects: once the connection fails or closes, status stays
/// [`TransportStatus::Invalid`].
pub struct TcpTransport {
    address: String,
    status: Arc<Mutex<TransportStatus>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    handler: SharedHandler,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("address", &self.address)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl TcpTransport {
    /// Start connecting to `address` on `runtime`.
    pub fn connect(runtime: &Handle, address: impl Into<String>) -> Self {
        let address = address.into();
        info!("Connecting TCP transport: address={}", address);

        let status = Arc::new(Mutex::new(TransportStatus::Connecting));
        let handler: SharedHandler = Arc::new(Mutex::new(None));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let task = runtime.spawn(run_connection(
            address.clone(),
            outbound_rx,
            Arc::clone(&status),
            Arc::clone(&handler),
        ));

        Self {
            address,
            status,
            outbound,
            handler,
            task,
        }
    }

    /// Remote address.
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Transport for TcpTransport {
    fn status(&self) -> TransportStatus {
        *self.status.lock().unwrap()
    }

    fn send(&self, route: &str, payload: Value) -> Result<()> {
        if !self.status().accepts_sends() {
            return Err(Error::TransportClosed);
        }
        let frame = encode_frame(&Envelope::new(route, payload))?;
        debug!("Queueing frame: route={}, {} bytes", route, frame.len());
        self.outbound
            .send(frame)
            .map_err(|_| Error::TransportClosed)
    }

    fn set_inbound_handler(&mut self, handler: InboundHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn close(&mut self) {
        self.task.abort();
        *self.status.lock().unwrap() = TransportStatus::Invalid;
        info!("TCP transport closed: address={}", self.address);
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_connection(
    address: String,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    status: Arc<Mutex<TransportStatus>>,
    handler: SharedHandler,
) {
    let stream = match TcpStream::connect(&address).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("TCP connect failed: address={}, error={}", address, e);
            *status.lock().unwrap() = TransportStatus::Invalid;
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed: {}", e);
    }

    *status.lock().unwrap() = TransportStatus::Connected;
    info!("TCP transport connected: address={}", address);

    let (mut reader, mut writer) = stream.into_split();
    let result = tokio::select! {
        r = read_loop(&mut reader, &handler) => r,
        r = write_loop(&mut writer, &mut outbound_rx) => r,
    };

    match result {
        Ok(()) => info!("TCP connection closed: address={}", address),
        Err(e) => warn!("TCP connection failed: address={}, error={}", address, e),
    }
    *status.lock().unwrap() = TransportStatus::Invalid;
}

async fn read_loop(reader: &mut OwnedReadHalf, handler: &SharedHandler) -> Result<()> {
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        decoder.extend(&chunk[..n]);

        loop {
            let envelope = match decoder.next_frame() {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(Error::MalformedPayload(e)) => {
                    warn!("Dropping malformed frame: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let guard = handler.lock().unwrap();
            match guard.as_ref() {
                Some(deliver) => deliver(envelope),
                None => debug!("No inbound handler, dropping route={}", envelope.route),
            }
        }
    }
}

async fn write_loop(
    writer: &mut OwnedWriteHalf,
    outbound_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<()> {
    while let Some(frame) = outbound_rx.recv().await {
        writer.write_all(&frame).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{decode_payload, parse_header, HEADER_LEN, MAGIC, MAX_FRAME_LEN};
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn wait_for(transport: &TcpTransport, want: TransportStatus) {
        for _ in 0..200 {
            if transport.status() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("transport never reached {want:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tcp_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mut transport = TcpTransport::connect(&Handle::current(), addr);
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.set_inbound_handler(Box::new(move |env| {
            let _ = tx.send(env);
        }));

        // Queued before the connection is accepted
        transport
            .send("cmd:push_command", json!({"command": "ls"}))
            .unwrap();

        let (mut server, _) = listener.accept().await.unwrap();
        wait_for(&transport, TransportStatus::Connected).await;

        let mut header = [0u8; HEADER_LEN];
        server.read_exact(&mut header).await.unwrap();
        let len = parse_header(&header, MAX_FRAME_LEN).unwrap();
        let mut payload = vec![0u8; len];
        server.read_exact(&mut payload).await.unwrap();
        let received = decode_payload(&payload).unwrap();
        assert_eq!(received.route, "cmd:push_command");
        assert_eq!(received.parameter["command"], "ls");

        let reply = encode_frame(&Envelope::new("shell_output", json!({"content": "ok"}))).unwrap();
        server.write_all(&reply).await.unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.route, "shell_output");

        drop(server);
        wait_for(&transport, TransportStatus::Invalid).await;
        assert!(matches!(
            transport.send("cmd:push_command", json!({})),
            Err(Error::TransportClosed)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bad_magic_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let transport = TcpTransport::connect(&Handle::current(), addr);

        let (mut server, _) = listener.accept().await.unwrap();
        server.write_all(b"NOPE\x00\x00\x00\x00").await.unwrap();

        wait_for(&transport, TransportStatus::Invalid).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_malformed_payload_keeps_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut transport = TcpTransport::connect(&Handle::current(), addr);
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.set_inbound_handler(Box::new(move |env| {
            let _ = tx.send(env);
        }));

        let (mut server, _) = listener.accept().await.unwrap();
        wait_for(&transport, TransportStatus::Connected).await;

        // Valid CBOR with a correct header, but no `route` field.
        let mut payload = Vec::new();
        ciborium::into_writer(&json!({"parameter": 1}), &mut payload).unwrap();
        let mut bad = Vec::new();
        bad.extend_from_slice(&MAGIC);
        bad.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bad.extend_from_slice(&payload);
        server.write_all(&bad).await.unwrap();

        let good = encode_frame(&Envelope::new("shell_output", json!({"content": "ok"}))).unwrap();
        server.write_all(&good).await.unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.route, "shell_output");
        assert_eq!(transport.status(), TransportStatus::Connected);
        assert!(transport.send("cmd:push_command", json!({"command": "ls"})).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = TcpTransport::connect(&Handle::current(), addr);
        wait_for(&transport, TransportStatus::Invalid).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut transport = TcpTransport::connect(&Handle::current(), addr.clone());
        assert_eq!(transport.address(), addr);

        let _accepted = listener.accept().await.unwrap();
        wait_for(&transport, TransportStatus::Connected).await;

        transport.close();
        assert_eq!(transport.status(), TransportStatus::Invalid);
    }
}
