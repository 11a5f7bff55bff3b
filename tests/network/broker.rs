//! A scripted broker that speaks the crate's own codec over a pipe.

use super::{PipeInput, PipeOutput};
use crossbeam_channel::Receiver;
use libmqtt::network::application::mqtt::codec::{
    Connack, Connect, PacketReader, PacketWriter, Publish, Suback,
};
use libmqtt::{network::application::mqtt::{ConnackCode, Packet}, QoS};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// How long the broker waits for the client before failing the test.
pub const EXPECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Accepts the connections a `PipeTransport` opens.
#[derive(Debug)]
pub struct Listener {
    accepted: Receiver<BrokerConn>,
}

impl Listener {
    pub(super) fn new(accepted: Receiver<BrokerConn>) -> Self {
        Self { accepted }
    }

    pub fn accept(&self) -> BrokerConn {
        self.accepted
            .recv_timeout(EXPECT_TIMEOUT)
            .expect("client never opened a connection")
    }

    /// Accept a connection and answer its CONNECT.
    pub fn accept_session(&self, session_present: bool) -> (BrokerConn, Connect) {
        let mut conn = self.accept();
        let connect = conn.expect_connect();
        conn.send(Packet::Connack(Connack {
            session_present,
            code: ConnackCode::Accepted,
        }));
        (conn, connect)
    }
}

/// The broker's end of one connection.
pub struct BrokerConn {
    reader: PacketReader<PipeInput>,
    writer: PacketWriter<PipeOutput>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for BrokerConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConn")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl BrokerConn {
    pub(super) fn new(input: PipeInput, output: PipeOutput) -> Self {
        let closed = input.closed.clone();
        Self {
            reader: PacketReader::new(input),
            writer: PacketWriter::new(output),
            closed,
        }
    }

    /// Next packet from the client, or `None` if it closed the connection
    /// or stayed silent for `timeout`.
    pub fn recv_within(&mut self, timeout: Duration) -> Option<Packet> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match self.reader.read_packet() {
                Ok(Some(packet)) => return Some(packet),
                Ok(None) => continue,
                Err(_) => return None,
            }
        }
        None
    }

    pub fn recv(&mut self) -> Packet {
        self.recv_within(EXPECT_TIMEOUT)
            .expect("client sent nothing")
    }

    pub fn send(&mut self, packet: Packet) {
        self.writer
            .write_packet(&packet)
            .expect("client end is closed");
    }

    /// Drop the connection as a crashed broker would.
    pub fn drop_connection(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Wait until the client has torn the connection down.
    pub fn expect_closed(&mut self) {
        let deadline = Instant::now() + EXPECT_TIMEOUT;
        while !self.closed.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "client kept the connection open");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn expect_connect(&mut self) -> Connect {
        match self.recv() {
            Packet::Connect(connect) => connect,
            other => panic!("expected CONNECT, got {other}"),
        }
    }

    pub fn expect_publish(&mut self) -> Publish {
        match self.recv() {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {other}"),
        }
    }

    pub fn expect(&mut self, expected: Packet) {
        assert_eq!(self.recv(), expected);
    }

    /// Answer the next SUBSCRIBE with `return_codes`.
    pub fn answer_subscribe(&mut self, return_codes: Vec<u8>) -> Vec<(String, QoS)> {
        match self.recv() {
            Packet::Subscribe(subscribe) => {
                self.send(Packet::Suback(Suback {
                    message_id: subscribe.message_id,
                    return_codes,
                }));
                subscribe.filters
            }
            other => panic!("expected SUBSCRIBE, got {other}"),
        }
    }

    /// Deliver an inbound publish to the client.
    pub fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, message_id: u16) {
        let mut publish = Publish::new(topic, payload.to_vec(), qos);
        publish.message_id = message_id;
        self.send(Packet::Publish(publish));
    }
}
