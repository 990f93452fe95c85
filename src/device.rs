//! Connection to one Tuya device.
//! Owns the TCP link, cipher, sequence counter and receive buffer, and turns
//! socket bytes into decoded replies.

use crate::config::PlugConfig;
use crate::crypto::TuyaCipher;
use crate::error::{Result, TuyaError};
use crate::payload::{Dps, DpsIndex, build_set_payload, build_status_request, parse_status};
use crate::protocol::{CommandType, Decoded, FrameBuffer, TuyaMessage, Version, pack_message};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const READ_CHUNK: usize = 1024;

type ConnectFuture = Pin<Box<dyn Future<Output = Result<TcpStream>> + Send>>;

enum Link {
    Disconnected,
    Connecting(ConnectFuture),
    Connected(TcpStream),
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// One decoded unit of inbound traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// A frame (or clear-text status object). `result` is `Ok(None)` for an
    /// empty acknowledgement.
    Frame {
        seqno: Option<u32>,
        cmd: u32,
        result: Result<Option<Dps>>,
    },
    /// Bytes that could not be framed at all.
    Garbage(TuyaError),
}

/// Outcome of waiting on the link.
#[derive(Debug)]
pub enum SessionEvent {
    Connected,
    ConnectFailed(TuyaError),
    Received(Vec<Received>),
    /// Peer closed the connection (`None`) or a read failed.
    Disconnected(Option<TuyaError>),
}

pub struct DeviceSession {
    id: String,
    address: String,
    port: u16,
    version: Version,
    connection_timeout: Duration,
    /// `None` for a keyless 3.1 session, which can only poll status.
    cipher: Option<TuyaCipher>,
    seqno: u32,
    link: Link,
    rx_buf: FrameBuffer,
    connect_attempts: u64,
}

impl DeviceSession {
    pub fn new(config: &PlugConfig) -> Result<Self> {
        Ok(Self {
            id: config.device_id.clone(),
            address: config.address.clone(),
            port: config.port,
            version: config.version,
            connection_timeout: config.connect_timeout(),
            cipher: if config.has_key() {
                Some(TuyaCipher::new(config.local_key.as_bytes())?)
            } else {
                None
            },
            seqno: 1,
            link: Link::Disconnected,
            rx_buf: FrameBuffer::device_replies(),
            connect_attempts: 0,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn state(&self) -> LinkState {
        match self.link {
            Link::Disconnected => LinkState::Disconnected,
            Link::Connecting(_) => LinkState::Connecting,
            Link::Connected(_) => LinkState::Connected,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.link, Link::Connected(_))
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self.link, Link::Connecting(_))
    }

    /// Number of connect attempts started so far.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts
    }

    /// Starts connecting. No-op unless disconnected; the attempt completes
    /// through [`next_event`](Self::next_event).
    pub fn connect(&mut self) {
        if !matches!(self.link, Link::Disconnected) {
            return;
        }
        let addr = format!("{}:{}", self.address, self.port);
        info!("Connecting to device {} at {}", self.id, addr);
        let connect_timeout = self.connection_timeout;
        self.connect_attempts += 1;
        self.rx_buf.clear();
        self.link = Link::Connecting(Box::pin(async move {
            timeout(connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| TuyaError::Timeout)?
                .map_err(TuyaError::from)
        }));
    }

    pub fn disconnect(&mut self) {
        if !matches!(self.link, Link::Disconnected) {
            info!("Disconnecting from device {}", self.id);
        }
        self.link = Link::Disconnected;
        self.rx_buf.clear();
    }

    /// Sends a `Control` request for the given switch states.
    pub async fn send_set(&mut self, dps: &BTreeMap<DpsIndex, bool>) -> Result<u32> {
        let body = build_set_payload(&self.id, dps, timestamp())?;
        self.send(CommandType::Control, &body).await
    }

    /// Sends a `DpQuery` status request.
    pub async fn send_status(&mut self) -> Result<u32> {
        let body = build_status_request(&self.id, timestamp())?;
        self.send(CommandType::DpQuery, &body).await
    }

    /// Packs and writes one request, returning its sequence number.
    async fn send(&mut self, cmd: CommandType, body: &[u8]) -> Result<u32> {
        match self.link {
            Link::Connected(_) => {}
            Link::Connecting(_) => return Err(TuyaError::Offline),
            Link::Disconnected => {
                self.connect();
                return Err(TuyaError::Offline);
            }
        }

        let seqno = self.seqno;
        self.seqno = self.seqno.wrapping_add(1);
        debug!(
            "Sending cmd=0x{:02X} seqno={} to {}: {}",
            cmd as u32,
            seqno,
            self.id,
            String::from_utf8_lossy(body)
        );
        let packed = pack_message(&TuyaMessage {
            seqno,
            cmd: cmd.into(),
            retcode: None,
            payload: self.seal(cmd, body)?,
        })?;

        debug!("TX {}", hex::encode(&packed));

        let Link::Connected(stream) = &mut self.link else {
            return Err(TuyaError::Offline);
        };
        if let Err(e) = stream.write_all(&packed).await {
            warn!("Write to {} failed: {}", self.id, e);
            self.disconnect();
            return Err(e.into());
        }
        Ok(seqno)
    }

    fn cipher(&self) -> Result<&TuyaCipher> {
        self.cipher.as_ref().ok_or_else(|| {
            TuyaError::InvalidConfig(format!("device {} needs a local key", self.id))
        })
    }

    /// Encrypts an outbound body the way the protocol revision expects.
    fn seal(&self, cmd: CommandType, body: &[u8]) -> Result<Vec<u8>> {
        match self.version {
            Version::V3_3 => {
                let encrypted = self.cipher()?.encrypt(body, self.version)?;
                if cmd == CommandType::DpQuery {
                    return Ok(encrypted);
                }
                let mut out = self.version.as_bytes().to_vec();
                out.extend_from_slice(&[0u8; 12]);
                out.extend_from_slice(&encrypted);
                Ok(out)
            }
            Version::V3_1 if cmd == CommandType::Control => {
                self.cipher()?.encrypt(body, self.version)
            }
            Version::V3_1 => Ok(body.to_vec()),
        }
    }

    /// Waits for the next link event. Cancel safe: dropping the future keeps
    /// a pending connect attempt and loses no received bytes.
    pub async fn next_event(&mut self) -> SessionEvent {
        match &mut self.link {
            Link::Disconnected => std::future::pending::<SessionEvent>().await,
            Link::Connecting(attempt) => {
                let result = attempt.as_mut().await;
                match result {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(true);
                        info!("Connected to device {}", self.id);
                        self.link = Link::Connected(stream);
                        SessionEvent::Connected
                    }
                    Err(e) => {
                        self.link = Link::Disconnected;
                        SessionEvent::ConnectFailed(e)
                    }
                }
            }
            Link::Connected(stream) => {
                let mut chunk = [0u8; READ_CHUNK];
                match stream.read(&mut chunk).await {
                    Ok(0) => {
                        self.disconnect();
                        SessionEvent::Disconnected(None)
                    }
                    Ok(n) => SessionEvent::Received(self.on_bytes_received(&chunk[..n])),
                    Err(e) => {
                        self.disconnect();
                        SessionEvent::Disconnected(Some(e.into()))
                    }
                }
            }
        }
    }

    /// Feeds raw socket bytes and returns every unit they complete.
    /// A partial frame stays buffered until more bytes arrive.
    pub fn on_bytes_received(&mut self, data: &[u8]) -> Vec<Received> {
        debug!("RX {}", hex::encode(data));
        self.rx_buf.extend(data);
        let mut out = Vec::new();
        while let Some(decoded) = self.rx_buf.next_frame() {
            match decoded {
                Decoded::Complete { message, .. } => out.push(self.open(message)),
                Decoded::Unframed { json, .. } => {
                    debug!("Clear-text status from {}", self.id);
                    out.push(Received::Frame {
                        seqno: None,
                        cmd: CommandType::Status.into(),
                        result: parse_status(&json).map(Some),
                    });
                }
                Decoded::Invalid { consumed, error } => {
                    warn!("Dropped {} bytes from {}: {}", consumed, self.id, error);
                    out.push(Received::Garbage(error));
                }
                Decoded::Incomplete => break,
            }
        }
        out
    }

    fn open(&self, message: TuyaMessage) -> Received {
        if let Some(code) = message.retcode.filter(|&c| c != 0) {
            debug!("Device {} returned code {} for seqno {}", self.id, code, message.seqno);
        }
        let result = if message.payload.is_empty() {
            Ok(None)
        } else {
            self.unseal(&message.payload)
                .and_then(|json| {
                    debug!("Received from {}: {}", self.id, String::from_utf8_lossy(&json));
                    parse_status(&json).map(Some)
                })
        };
        Received::Frame {
            seqno: Some(message.seqno),
            cmd: message.cmd,
            result,
        }
    }

    fn unseal(&self, payload: &[u8]) -> Result<Vec<u8>> {
        match &self.cipher {
            Some(cipher) => cipher.decrypt(payload, self.version),
            None if payload.first() == Some(&b'{') => Ok(payload.to_vec()),
            None => Err(TuyaError::DecryptionFailed),
        }
    }

    /// Connects and waits for the outcome.
    pub async fn open_link(&mut self) -> Result<()> {
        self.connect();
        loop {
            match self.next_event().await {
                SessionEvent::Connected => return Ok(()),
                SessionEvent::ConnectFailed(e) => return Err(e),
                SessionEvent::Disconnected(e) => return Err(e.unwrap_or(TuyaError::Offline)),
                SessionEvent::Received(_) => {}
            }
        }
    }

    /// Waits for the frame answering `seqno`; other traffic is skipped.
    pub async fn reply_to(&mut self, seqno: u32) -> Result<Option<Dps>> {
        loop {
            match self.next_event().await {
                SessionEvent::Received(units) => {
                    for unit in units {
                        match unit {
                            Received::Frame {
                                seqno: Some(s),
                                result,
                                ..
                            } if s == seqno => return result,
                            other => debug!("Skipping unrelated reply: {:?}", other),
                        }
                    }
                }
                SessionEvent::Disconnected(e) => return Err(e.unwrap_or(TuyaError::Offline)),
                SessionEvent::ConnectFailed(e) => return Err(e),
                SessionEvent::Connected => {}
            }
        }
    }
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KEY: &str = "0123456789abcdef";

    fn session(version: Version) -> DeviceSession {
        DeviceSession::new(&PlugConfig::new("127.0.0.1", "dev", KEY).with_version(version)).unwrap()
    }

    fn reply_frame(cipher: &TuyaCipher, seqno: u32, json: &[u8]) -> Vec<u8> {
        pack_message(&TuyaMessage {
            seqno,
            cmd: CommandType::DpQuery.into(),
            retcode: Some(0),
            payload: cipher.encrypt(json, Version::V3_3).unwrap(),
        })
        .unwrap()
    }

    #[test]
    fn seals_per_version() {
        let s33 = session(Version::V3_3);
        let query = s33.seal(CommandType::DpQuery, b"{}").unwrap();
        assert_eq!(query.len(), 16);
        let control = s33.seal(CommandType::Control, b"{}").unwrap();
        assert!(control.starts_with(b"3.3\0\0\0\0\0\0\0\0\0\0\0\0"));
        assert_eq!(control.len(), 15 + 16);

        let s31 = session(Version::V3_1);
        assert_eq!(s31.seal(CommandType::DpQuery, b"{}").unwrap(), b"{}");
        assert!(s31.seal(CommandType::Control, b"{}").unwrap().starts_with(b"3.1"));
    }

    #[test]
    fn keyless_v31_session_only_polls() {
        let config = PlugConfig::new("127.0.0.1", "dev", "").with_version(Version::V3_1);
        let mut s = DeviceSession::new(&config).unwrap();
        assert_eq!(s.seal(CommandType::DpQuery, b"{}").unwrap(), b"{}");
        assert!(matches!(
            s.seal(CommandType::Control, b"{}"),
            Err(TuyaError::InvalidConfig(_))
        ));

        let sealed = pack_message(&TuyaMessage {
            seqno: 4,
            cmd: CommandType::DpQuery.into(),
            retcode: Some(0),
            payload: vec![0xAB; 16],
        })
        .unwrap();
        assert!(matches!(
            &s.on_bytes_received(&sealed)[..],
            [Received::Frame { seqno: Some(4), result: Err(TuyaError::DecryptionFailed), .. }]
        ));
    }

    #[test]
    fn split_reply_is_reassembled() {
        let mut s = session(Version::V3_3);
        let cipher = TuyaCipher::new(KEY.as_bytes()).unwrap();
        let frame = reply_frame(&cipher, 7, br#"{"devId":"dev","dps":{"1":true}}"#);

        assert!(s.on_bytes_received(&frame[..10]).is_empty());
        let out = s.on_bytes_received(&frame[10..]);
        let mut expected = Dps::new();
        expected.insert(DpsIndex(1), json!(true));
        assert_eq!(
            out,
            vec![Received::Frame {
                seqno: Some(7),
                cmd: CommandType::DpQuery.into(),
                result: Ok(Some(expected)),
            }]
        );
    }

    #[test]
    fn empty_payload_is_an_ack() {
        let mut s = session(Version::V3_3);
        let frame = pack_message(&TuyaMessage {
            seqno: 3,
            cmd: CommandType::Control.into(),
            retcode: Some(0),
            payload: Vec::new(),
        })
        .unwrap();
        assert_eq!(
            s.on_bytes_received(&frame),
            vec![Received::Frame {
                seqno: Some(3),
                cmd: CommandType::Control.into(),
                result: Ok(None),
            }]
        );
    }

    #[test]
    fn bad_payloads_become_failed_frames() {
        let mut s = session(Version::V3_3);
        let cipher = TuyaCipher::new(KEY.as_bytes()).unwrap();
        let mut bytes = reply_frame(&cipher, 1, b"not json at all");
        let mut garbled = pack_message(&TuyaMessage {
            seqno: 2,
            cmd: CommandType::DpQuery.into(),
            retcode: Some(0),
            payload: vec![0xAB; 17],
        })
        .unwrap();
        bytes.append(&mut garbled);

        let out = s.on_bytes_received(&bytes);
        assert_eq!(out.len(), 2);
        assert!(matches!(
            &out[0],
            Received::Frame { seqno: Some(1), result: Err(TuyaError::Json(_)), .. }
        ));
        assert!(matches!(
            &out[1],
            Received::Frame { seqno: Some(2), result: Err(TuyaError::DecryptionFailed), .. }
        ));
    }

    #[test]
    fn clear_text_status_is_unframed_frame() {
        let mut s = session(Version::V3_3);
        let out = s.on_bytes_received(br#"{"devId":"dev","dps":{"2":false}}"#);
        assert!(matches!(
            &out[..],
            [Received::Frame { seqno: None, result: Ok(Some(_)), .. }]
        ));
    }

    #[tokio::test]
    async fn send_while_disconnected_starts_connecting() {
        let mut s = session(Version::V3_3);
        assert_eq!(s.state(), LinkState::Disconnected);
        assert_eq!(s.send_status().await, Err(TuyaError::Offline));
        assert_eq!(s.state(), LinkState::Connecting);
        assert_eq!(s.connect_attempts(), 1);
        assert_eq!(s.send_status().await, Err(TuyaError::Offline));
        assert_eq!(s.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn request_reaches_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut s = DeviceSession::new(&PlugConfig::new("127.0.0.1", "dev", KEY).with_port(port))
            .unwrap();
        s.open_link().await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        let mut dps = BTreeMap::new();
        dps.insert(DpsIndex(1), true);
        let seqno = s.send_set(&dps).await.unwrap();

        let mut buf = FrameBuffer::device_requests();
        let mut chunk = [0u8; 256];
        let message = loop {
            let n = peer.read(&mut chunk).await.unwrap();
            buf.extend(&chunk[..n]);
            if let Some(Decoded::Complete { message, .. }) = buf.next_frame() {
                break message;
            }
        };
        assert_eq!(message.seqno, seqno);
        assert_eq!(message.cmd, u32::from(CommandType::Control));
        let cipher = TuyaCipher::new(KEY.as_bytes()).unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&cipher.decrypt(&message.payload, Version::V3_3).unwrap())
                .unwrap();
        assert_eq!(json["dps"], json!({"1": true}));
    }

    #[tokio::test]
    async fn keyless_v31_reads_clear_status() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = PlugConfig::new("127.0.0.1", "dev", "")
            .with_version(Version::V3_1)
            .with_port(port);
        config.validate().unwrap();
        let mut s = DeviceSession::new(&config).unwrap();
        s.open_link().await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        let seqno = s.send_status().await.unwrap();

        let mut buf = FrameBuffer::device_requests();
        let mut chunk = [0u8; 256];
        let request = loop {
            let n = peer.read(&mut chunk).await.unwrap();
            buf.extend(&chunk[..n]);
            if let Some(Decoded::Complete { message, .. }) = buf.next_frame() {
                break message;
            }
        };
        assert_eq!(request.cmd, u32::from(CommandType::DpQuery));
        let query: serde_json::Value = serde_json::from_slice(&request.payload).unwrap();
        assert_eq!(query["devId"], "dev");

        let reply = pack_message(&TuyaMessage {
            seqno: request.seqno,
            cmd: CommandType::DpQuery.into(),
            retcode: Some(0),
            payload: br#"{"devId":"dev","dps":{"1":true,"2":false}}"#.to_vec(),
        })
        .unwrap();
        peer.write_all(&reply).await.unwrap();

        let dps = s.reply_to(seqno).await.unwrap().unwrap();
        assert_eq!(dps.get(&DpsIndex(1)), Some(&json!(true)));
        assert_eq!(dps.get(&DpsIndex(2)), Some(&json!(false)));
    }
}
