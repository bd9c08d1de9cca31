/*!
In-process AMQP 0-9-1 broker

`FakeBroker` accepts real client connections on a loopback port and walks
them through the handshake, channel setup, publisher confirms and close.
It records what the client sent so tests can check the wire behaviour of
`BrokerProbe` and `AmqpPublisher` without a RabbitMQ server.
*/

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Protocol header a 0-9-1 client opens with
pub const AMQP_091_HEADER: [u8; 8] = *b"AMQP\x00\x00\x09\x01";

const FRAME_METHOD: u8 = 1;
const FRAME_HEADER: u8 = 2;
const FRAME_BODY: u8 = 3;
const FRAME_HEARTBEAT: u8 = 8;
const FRAME_END: u8 = 0xCE;

const CONNECTION: u16 = 10;
const CHANNEL: u16 = 20;
const BASIC: u16 = 60;
const CONFIRM: u16 = 85;

/// A message as the broker received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct BrokerLog {
    protocol_headers: Vec<[u8; 8]>,
    virtual_hosts: Vec<String>,
    confirm_selects: usize,
    published: Vec<PublishedMessage>,
    closed: usize,
}

/// Loopback broker; stops accepting when dropped
pub struct FakeBroker {
    addr: SocketAddr,
    log: Arc<Mutex<BrokerLog>>,
    hold_acks: Arc<AtomicBool>,
    accept: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let log = Arc::new(Mutex::new(BrokerLog::default()));
        let hold_acks = Arc::new(AtomicBool::new(false));

        let session_log = log.clone();
        let session_hold = hold_acks.clone();
        let accept = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("[FAKE BROKER] accept failed: {}", e);
                        continue;
                    }
                };
                let session = Session::new(stream, session_log.clone(), session_hold.clone());
                tokio::spawn(async move {
                    if let Err(e) = session.run().await {
                        debug!("[FAKE BROKER] session with {} ended: {}", peer, e);
                    }
                });
            }
        });

        Ok(Self {
            addr,
            log,
            hold_acks,
            accept,
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop confirming publishes; they are still recorded
    pub fn hold_acks(&self) {
        self.hold_acks.store(true, Ordering::SeqCst);
    }

    /// Protocol header of each accepted connection
    pub fn protocol_headers(&self) -> Vec<[u8; 8]> {
        self.log.lock().protocol_headers.clone()
    }

    /// Virtual host named in each connection.open
    pub fn virtual_hosts(&self) -> Vec<String> {
        self.log.lock().virtual_hosts.clone()
    }

    pub fn confirm_selects(&self) -> usize {
        self.log.lock().confirm_selects
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.log.lock().published.clone()
    }

    /// Connections the client closed with connection.close
    pub fn closed_connections(&self) -> usize {
        self.log.lock().closed
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

/// Publish waiting for its content frames
struct PendingPublish {
    exchange: String,
    routing_key: String,
    body_size: u64,
    body: Vec<u8>,
}

struct Session {
    stream: TcpStream,
    log: Arc<Mutex<BrokerLog>>,
    hold_acks: Arc<AtomicBool>,
    pending: HashMap<u16, PendingPublish>,
    /// Last delivery tag per channel in confirm mode
    confirming: HashMap<u16, u64>,
}

impl Session {
    fn new(stream: TcpStream, log: Arc<Mutex<BrokerLog>>, hold_acks: Arc<AtomicBool>) -> Self {
        Self {
            stream,
            log,
            hold_acks,
            pending: HashMap::new(),
            confirming: HashMap::new(),
        }
    }

    async fn run(mut self) -> io::Result<()> {
        let mut header = [0u8; 8];
        self.stream.read_exact(&mut header).await?;
        self.log.lock().protocol_headers.push(header);
        if header != AMQP_091_HEADER {
            // a broker answers an unknown protocol with the one it speaks
            self.stream.write_all(&AMQP_091_HEADER).await?;
            return Ok(());
        }

        let mut start = vec![0, 9];
        start.extend(server_properties());
        put_longstr(&mut start, "PLAIN AMQPLAIN");
        put_longstr(&mut start, "en_US");
        self.send_method(0, CONNECTION, 10, &start).await?;

        loop {
            let (kind, channel, payload) = self.read_frame().await?;
            match kind {
                FRAME_METHOD => {
                    if !self.on_method(channel, &payload).await? {
                        return Ok(());
                    }
                }
                FRAME_HEADER => self.on_content_header(channel, &payload).await?,
                FRAME_BODY => self.on_body(channel, &payload).await?,
                FRAME_HEARTBEAT => {}
                other => return Err(invalid(format!("unexpected frame type {}", other))),
            }
        }
    }

    /// Handle one method frame; false once the connection is closed
    async fn on_method(&mut self, channel: u16, payload: &[u8]) -> io::Result<bool> {
        let mut args = Cursor::new(payload);
        let class = args.u16()?;
        let method = args.u16()?;

        match (class, method) {
            // start-ok
            (CONNECTION, 11) => {
                let mut tune = Vec::new();
                tune.extend(2047u16.to_be_bytes());
                tune.extend(131_072u32.to_be_bytes());
                tune.extend(0u16.to_be_bytes());
                self.send_method(0, CONNECTION, 30, &tune).await?;
            }
            // tune-ok
            (CONNECTION, 31) => {}
            // open
            (CONNECTION, 40) => {
                let vhost = args.shortstr()?;
                self.log.lock().virtual_hosts.push(vhost);
                let mut open_ok = Vec::new();
                put_shortstr(&mut open_ok, "");
                self.send_method(0, CONNECTION, 41, &open_ok).await?;
            }
            // close
            (CONNECTION, 50) => {
                self.log.lock().closed += 1;
                self.send_method(0, CONNECTION, 51, &[]).await?;
                return Ok(false);
            }
            // close-ok
            (CONNECTION, 51) => return Ok(false),
            // channel open
            (CHANNEL, 10) => {
                self.send_method(channel, CHANNEL, 11, &0u32.to_be_bytes()).await?;
            }
            // channel close
            (CHANNEL, 40) => {
                self.pending.remove(&channel);
                self.confirming.remove(&channel);
                self.send_method(channel, CHANNEL, 41, &[]).await?;
            }
            (CHANNEL, 41) => {}
            // confirm.select
            (CONFIRM, 10) => {
                self.log.lock().confirm_selects += 1;
                self.confirming.insert(channel, 0);
                let nowait = args.u8()? & 1 == 1;
                if !nowait {
                    self.send_method(channel, CONFIRM, 11, &[]).await?;
                }
            }
            // basic.publish
            (BASIC, 40) => {
                args.u16()?;
                let exchange = args.shortstr()?;
                let routing_key = args.shortstr()?;
                self.pending.insert(
                    channel,
                    PendingPublish {
                        exchange,
                        routing_key,
                        body_size: 0,
                        body: Vec::new(),
                    },
                );
            }
            other => debug!("[FAKE BROKER] ignoring method {:?} on channel {}", other, channel),
        }
        Ok(true)
    }

    async fn on_content_header(&mut self, channel: u16, payload: &[u8]) -> io::Result<()> {
        let mut header = Cursor::new(payload);
        header.u16()?;
        header.u16()?;
        let body_size = header.u64()?;

        match self.pending.get_mut(&channel) {
            Some(pending) => pending.body_size = body_size,
            None => return Err(invalid("content header without a publish".to_string())),
        }
        if body_size == 0 {
            self.complete(channel).await?;
        }
        Ok(())
    }

    async fn on_body(&mut self, channel: u16, payload: &[u8]) -> io::Result<()> {
        let done = match self.pending.get_mut(&channel) {
            Some(pending) => {
                pending.body.extend_from_slice(payload);
                pending.body.len() as u64 >= pending.body_size
            }
            None => return Err(invalid("body frame without a publish".to_string())),
        };
        if done {
            self.complete(channel).await?;
        }
        Ok(())
    }

    /// Record a fully received publish and confirm it when asked to
    async fn complete(&mut self, channel: u16) -> io::Result<()> {
        let Some(pending) = self.pending.remove(&channel) else {
            return Ok(());
        };
        self.log.lock().published.push(PublishedMessage {
            exchange: pending.exchange,
            routing_key: pending.routing_key,
            body: pending.body,
        });

        let tag = match self.confirming.get_mut(&channel) {
            Some(tag) => {
                *tag += 1;
                *tag
            }
            None => return Ok(()),
        };
        if self.hold_acks.load(Ordering::SeqCst) {
            debug!("[FAKE BROKER] holding ack for delivery {}", tag);
            return Ok(());
        }

        let mut ack = tag.to_be_bytes().to_vec();
        ack.push(0);
        self.send_method(channel, BASIC, 80, &ack).await
    }

    async fn read_frame(&mut self) -> io::Result<(u8, u16, Vec<u8>)> {
        let kind = self.stream.read_u8().await?;
        let channel = self.stream.read_u16().await?;
        let size = self.stream.read_u32().await?;
        let mut payload = vec![0u8; size as usize];
        self.stream.read_exact(&mut payload).await?;
        if self.stream.read_u8().await? != FRAME_END {
            return Err(invalid("missing frame end".to_string()));
        }
        Ok((kind, channel, payload))
    }

    async fn send_method(&mut self, channel: u16, class: u16, method: u16, args: &[u8]) -> io::Result<()> {
        let mut frame = vec![FRAME_METHOD];
        frame.extend(channel.to_be_bytes());
        frame.extend((args.len() as u32 + 4).to_be_bytes());
        frame.extend(class.to_be_bytes());
        frame.extend(method.to_be_bytes());
        frame.extend_from_slice(args);
        frame.push(FRAME_END);
        self.stream.write_all(&frame).await
    }
}

/// Server properties advertising publisher confirms
fn server_properties() -> Vec<u8> {
    let mut capabilities = Vec::new();
    for name in ["publisher_confirms", "basic.nack"] {
        put_shortstr(&mut capabilities, name);
        capabilities.extend([b't', 1]);
    }

    let mut properties = Vec::new();
    put_shortstr(&mut properties, "capabilities");
    properties.push(b'F');
    properties.extend((capabilities.len() as u32).to_be_bytes());
    properties.extend(capabilities);
    put_shortstr(&mut properties, "product");
    properties.push(b'S');
    put_longstr(&mut properties, "fd-devkit");

    let mut table = (properties.len() as u32).to_be_bytes().to_vec();
    table.extend(properties);
    table
}

fn put_shortstr(buf: &mut Vec<u8>, value: &str) {
    buf.push(value.len() as u8);
    buf.extend_from_slice(value.as_bytes());
}

fn put_longstr(buf: &mut Vec<u8>, value: &str) {
    buf.extend((value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Big-endian reader over a frame payload
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> io::Result<&'a [u8]> {
        let end = self.pos + len;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| invalid("truncated frame".to_string()))?;
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> io::Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u64(&mut self) -> io::Result<u64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(bytes))
    }

    fn shortstr(&mut self) -> io::Result<String> {
        let len = self.u8()? as usize;
        Ok(String::from_utf8_lossy(self.take(len)?).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_foreign_protocol_gets_amqp_header_back() {
        let broker = FakeBroker::start().await.unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", broker.port())).await.unwrap();
        client.write_all(b"\x10\x3f\x00\x04MQTT").await.unwrap();

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, AMQP_091_HEADER);
        assert_eq!(broker.protocol_headers(), vec![*b"\x10\x3f\x00\x04MQTT"]);
        assert!(broker.virtual_hosts().is_empty());
    }

    #[test]
    fn test_server_properties_table_length() {
        let table = server_properties();
        let declared = u32::from_be_bytes([table[0], table[1], table[2], table[3]]) as usize;
        assert_eq!(declared, table.len() - 4);
    }

    #[test]
    fn test_cursor_rejects_truncated_payload() {
        let mut cursor = Cursor::new(&[0, 10, 3, b'a']);
        assert_eq!(cursor.u16().unwrap(), 10);
        assert!(cursor.shortstr().is_err());
    }
}
