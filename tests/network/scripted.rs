//! Transport whose far end is driven by the test itself.
//!
//! Each `connect` hands a [`BrokerEnd`] to the test over a channel. The test
//! then reads what the client sent and writes the broker's answers by hand,
//! which makes it possible to send sequences a real broker never would.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use libiot_mqtt::network::application::mqtt::codec::{self, FixedHeader, PacketType};
use libiot_mqtt::network::{Connect, Connection, Error};

use super::Pipe;

const WAIT: Duration = Duration::from_secs(10);

/// [`Connect`] implementation handing every new connection to the test.
#[derive(Debug, Clone)]
pub struct Scripted {
    ends: Sender<BrokerEnd>,
}

impl Scripted {
    /// Connector plus the receiver the broker ends arrive on.
    pub fn new() -> (Self, Receiver<BrokerEnd>) {
        let (ends, rx) = mpsc::channel();
        (Self { ends }, rx)
    }
}

impl Connect for Scripted {
    type Connection = ScriptedConnection;

    fn connect(&mut self, _host: &str, _port: u16, _timeout: Duration) -> Result<ScriptedConnection, Error> {
        let up = Arc::new(Pipe::default());
        let down = Arc::new(Pipe::default());
        self.ends
            .send(BrokerEnd {
                up: Arc::clone(&up),
                down: Arc::clone(&down),
            })
            .map_err(|_| Error::ConnectionRefused)?;
        Ok(ScriptedConnection { up, down })
    }
}

/// Client side of a scripted connection.
#[derive(Debug)]
pub struct ScriptedConnection {
    up: Arc<Pipe>,
    down: Arc<Pipe>,
}

impl Connection for ScriptedConnection {
    fn send_timeout(&self, buf: &[u8], _timeout: Duration) -> Result<usize, Error> {
        self.up.write(buf)?;
        Ok(buf.len())
    }

    fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        self.down.read(buf, timeout)
    }

    fn close(&self) -> Result<(), Error> {
        self.up.close();
        self.down.close();
        Ok(())
    }
}

/// Broker side of a scripted connection.
#[derive(Debug)]
pub struct BrokerEnd {
    up: Arc<Pipe>,
    down: Arc<Pipe>,
}

impl BrokerEnd {
    /// Next packet from the client, which must be of type `expected`.
    /// PINGREQs in between are skipped.
    pub fn expect(&self, expected: PacketType) -> (FixedHeader, Vec<u8>) {
        loop {
            let (header, body) = self
                .up
                .read_packet(WAIT)
                .unwrap_or_else(|| panic!("client sent no {expected:?}"));
            if header.packet_type == PacketType::PingReq {
                continue;
            }
            assert_eq!(header.packet_type, expected, "unexpected packet from client");
            return (header, body);
        }
    }

    /// Whether the client stays silent for `wait`.
    pub fn is_quiet(&self, wait: Duration) -> bool {
        self.up.read_packet(wait).is_none()
    }

    /// Write raw bytes towards the client.
    pub fn send(&self, bytes: &[u8]) {
        self.down.write(bytes).expect("client end closed");
    }

    /// Read the CONNECT and accept it without a stored session.
    pub fn accept(&self) {
        self.expect(PacketType::Connect);
        self.send(&[0x20, 0x02, 0x00, 0x00]);
    }

    /// Answer a SUBSCRIBE with exactly the given return codes.
    pub fn suback(&self, packet_id: u16, codes: &[u8]) {
        let mut packet = vec![0x90, (2 + codes.len()) as u8];
        packet.extend_from_slice(&packet_id.to_be_bytes());
        packet.extend_from_slice(codes);
        self.send(&packet);
    }

    /// Read the next SUBSCRIBE and return its packet id and filter count.
    pub fn expect_subscribe(&self) -> (u16, usize) {
        let (_, body) = self.expect(PacketType::Subscribe);
        let (packet_id, filters) = codec::decode_subscribe(&body).expect("well formed SUBSCRIBE");
        (packet_id, filters.len())
    }
}
