use serde_json::{Value, json};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tuya_plug::crypto::TuyaCipher;
use tuya_plug::protocol::{Decoded, FrameBuffer, TuyaMessage, pack_message};
use tuya_plug::{
    CommandType, ControllerHandle, DeviceModel, DpsIndex, PlugConfig, PlugController, TuyaError,
    Version,
};

const KEY: &str = "0123456789abcdef";
const WAIT: Duration = Duration::from_secs(5);

/// Plays the device end of one connection.
struct FakeDevice {
    listener: TcpListener,
    stream: Option<TcpStream>,
    buf: FrameBuffer,
    cipher: TuyaCipher,
}

/// A request as the device sees it.
struct Request {
    seqno: u32,
    cmd: u32,
    body: Value,
}

impl FakeDevice {
    async fn bind() -> (Self, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let device = Self {
            listener,
            stream: None,
            buf: FrameBuffer::device_requests(),
            cipher: TuyaCipher::new(KEY.as_bytes()).unwrap(),
        };
        (device, port)
    }

    async fn accept(&mut self) {
        let (stream, _) = timeout(WAIT, self.listener.accept()).await.unwrap().unwrap();
        self.stream = Some(stream);
    }

    async fn recv(&mut self) -> Request {
        let stream = self.stream.as_mut().unwrap();
        let mut chunk = [0u8; 512];
        loop {
            if let Some(Decoded::Complete { message, .. }) = self.buf.next_frame() {
                let plain = self.cipher.decrypt(&message.payload, Version::V3_3).unwrap();
                return Request {
                    seqno: message.seqno,
                    cmd: message.cmd,
                    body: serde_json::from_slice(&plain).unwrap(),
                };
            }
            let n = timeout(WAIT, stream.read(&mut chunk)).await.unwrap().unwrap();
            assert!(n > 0, "controller closed the connection");
            self.buf.extend(&chunk[..n]);
        }
    }

    /// Asserts that nothing arrives for a short while.
    async fn expect_silence(&mut self) {
        let stream = self.stream.as_mut().unwrap();
        let mut chunk = [0u8; 512];
        let read = timeout(Duration::from_millis(200), stream.read(&mut chunk)).await;
        assert!(read.is_err(), "unexpected traffic from controller");
    }

    async fn reply_raw(&mut self, seqno: u32, cmd: CommandType, payload: Vec<u8>) {
        let frame = pack_message(&TuyaMessage {
            seqno,
            cmd: cmd.into(),
            retcode: Some(0),
            payload,
        })
        .unwrap();
        self.stream.as_mut().unwrap().write_all(&frame).await.unwrap();
    }

    async fn ack(&mut self, seqno: u32) {
        self.reply_raw(seqno, CommandType::Control, Vec::new()).await;
    }

    async fn status(&mut self, seqno: u32, dps: Value) {
        let body = json!({"devId": "dev", "dps": dps}).to_string();
        let payload = self.cipher.encrypt(body.as_bytes(), Version::V3_3).unwrap();
        self.reply_raw(seqno, CommandType::DpQuery, payload).await;
    }
}

struct ChannelModel(mpsc::UnboundedSender<(DpsIndex, bool)>);

impl DeviceModel for ChannelModel {
    fn update_switch(&mut self, index: DpsIndex, is_on: bool) {
        let _ = self.0.send((index, is_on));
    }
}

struct Harness {
    device: FakeDevice,
    handle: ControllerHandle<ChannelModel>,
    updates: mpsc::UnboundedReceiver<(DpsIndex, bool)>,
}

impl Harness {
    async fn start(dps: &str, groups: &str) -> Self {
        let (mut device, port) = FakeDevice::bind().await;
        let config = PlugConfig::from_parameters("127.0.0.1", "dev", KEY, dps, groups, "None")
            .unwrap()
            .with_port(port)
            .with_heartbeat(Duration::from_secs(3600));
        let (tx, updates) = mpsc::unbounded_channel();
        let handle = PlugController::new(config, ChannelModel(tx)).unwrap().spawn();
        device.accept().await;
        Self {
            device,
            handle,
            updates,
        }
    }

    async fn update(&mut self) -> (DpsIndex, bool) {
        timeout(WAIT, self.updates.recv()).await.unwrap().unwrap()
    }

    /// Answers the status poll the controller sends after connecting.
    async fn initial_status(&mut self, dps: Value) -> Request {
        let request = self.device.recv().await;
        assert_eq!(request.cmd, u32::from(CommandType::DpQuery));
        self.device.status(request.seqno, dps).await;
        request
    }
}

#[tokio::test]
async fn on_command_is_confirmed_by_status() {
    let mut h = Harness::start("1", "None").await;
    h.initial_status(json!({"1": false})).await;
    assert_eq!(h.update().await, (DpsIndex(1), false));

    h.handle.command(1, "On", 0).await.unwrap();
    let set = h.device.recv().await;
    assert_eq!(set.cmd, u32::from(CommandType::Control));
    assert_eq!(set.body["dps"], json!({"1": true}));
    h.device.ack(set.seqno).await;

    let query = h.device.recv().await;
    assert_eq!(query.cmd, u32::from(CommandType::DpQuery));
    assert_ne!(query.seqno, set.seqno);
    h.device.status(query.seqno, json!({"1": true})).await;
    assert_eq!(h.update().await, (DpsIndex(1), true));

    // Nothing pending any more: no traffic until the next heartbeat, which
    // only polls.
    h.device.expect_silence().await;
    h.handle.heartbeat().await.unwrap();
    let poll = h.device.recv().await;
    assert_eq!(poll.cmd, u32::from(CommandType::DpQuery));
    assert!(poll.body.get("dps").is_none());

    h.handle.stop().await.unwrap();
}

#[tokio::test]
async fn mismatching_status_reissues_on_heartbeat() {
    let mut h = Harness::start("1", "None").await;
    h.initial_status(json!({"1": false})).await;
    assert_eq!(h.update().await, (DpsIndex(1), false));

    h.handle.command(1, "On", 0).await.unwrap();
    let set = h.device.recv().await;
    h.device.ack(set.seqno).await;
    let query = h.device.recv().await;
    h.device.status(query.seqno, json!({"1": false})).await;
    assert_eq!(h.update().await, (DpsIndex(1), false));

    h.device.expect_silence().await;
    h.handle.heartbeat().await.unwrap();
    let again = h.device.recv().await;
    assert_eq!(again.cmd, u32::from(CommandType::Control));
    assert_eq!(again.body["dps"], json!({"1": true}));

    h.handle.stop().await.unwrap();
}

#[tokio::test]
async fn group_off_sends_one_merged_set() {
    let mut h = Harness::start("3;4", "3;4").await;
    h.initial_status(json!({"3": true, "4": true})).await;
    h.update().await;
    h.update().await;

    // Group units start five above the highest switch index.
    h.handle.command(9, "Off", 0).await.unwrap();
    let set = h.device.recv().await;
    assert_eq!(set.cmd, u32::from(CommandType::Control));
    assert_eq!(set.body["dps"], json!({"3": false, "4": false}));

    h.handle.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_status_is_requested_again() {
    let mut h = Harness::start("1", "None").await;
    let first = h.device.recv().await;
    assert_eq!(first.cmd, u32::from(CommandType::DpQuery));

    let cipher = TuyaCipher::new(KEY.as_bytes()).unwrap();
    let garbage = cipher.encrypt(b"this is not json", Version::V3_3).unwrap();
    h.device.reply_raw(first.seqno, CommandType::DpQuery, garbage).await;

    let second = h.device.recv().await;
    assert_eq!(second.cmd, u32::from(CommandType::DpQuery));
    assert_ne!(second.seqno, first.seqno);
    assert!(h.updates.try_recv().is_err());

    h.device.status(second.seqno, json!({"1": true})).await;
    assert_eq!(h.update().await, (DpsIndex(1), true));

    h.handle.stop().await.unwrap();
}

#[tokio::test]
async fn invalid_commands_never_reach_the_wire() {
    let mut h = Harness::start("1", "None").await;
    h.initial_status(json!({"1": true})).await;
    h.update().await;

    assert!(matches!(
        h.handle.command(1, "Toggle", 0).await,
        Err(TuyaError::InvalidCommand(_))
    ));
    assert!(matches!(
        h.handle.command(1, "Set Level", 5).await,
        Err(TuyaError::InvalidCommand(_))
    ));
    assert_eq!(h.handle.command(3, "On", 0).await, Err(TuyaError::UnknownUnit(3)));
    h.device.expect_silence().await;

    h.handle.command(1, "Set Level", 0).await.unwrap();
    let set = h.device.recv().await;
    assert_eq!(set.body["dps"], json!({"1": false}));

    h.handle.stop().await.unwrap();
}

#[tokio::test]
async fn unsolicited_push_updates_model() {
    let mut h = Harness::start("1;2", "None").await;
    h.initial_status(json!({"1": false, "2": false})).await;
    h.update().await;
    h.update().await;

    // Device-initiated report with a sequence number nobody asked for.
    h.device.status(0, json!({"2": true})).await;
    assert_eq!(h.update().await, (DpsIndex(2), true));
    h.device.expect_silence().await;

    h.handle.stop().await.unwrap();
}
