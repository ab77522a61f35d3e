//! In-memory loopback transport with a small MQTT broker on the far end.
//!
//! Every `connect` spawns a broker thread serving that one connection. The
//! broker understands enough of MQTT 3.1.1 to exercise the client: CONNECT,
//! SUBSCRIBE, UNSUBSCRIBE, PUBLISH at all QoS levels with forwarding to
//! matching subscriptions, PUBREL and PINGREQ.
//!
//! Faults are injected on the client's send path: a dropped write is
//! reported as sent but never reaches the broker.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use libiot_mqtt::network::application::mqtt::codec::{self, PacketType, Publish, QoS};
use libiot_mqtt::network::application::mqtt::topic;
use libiot_mqtt::network::{Connect, Connection, Error};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub mod scripted;

/// Topic prefix the broker never acknowledges.
pub const BLACKHOLE: &str = "blackhole/";
/// Topic prefix the broker refuses subscriptions to.
pub const DENIED: &str = "denied/";

/// One direction of the loopback.
#[derive(Debug, Default)]
struct Pipe {
    bytes: Mutex<VecDeque<u8>>,
    ready: Condvar,
    closed: AtomicBool,
}

impl Pipe {
    fn write(&self, data: &[u8]) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        self.bytes.lock().unwrap().extend(data.iter().copied());
        self.ready.notify_all();
        Ok(())
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        let deadline = Instant::now() + timeout;
        let mut bytes = self.bytes.lock().unwrap();
        loop {
            if !bytes.is_empty() {
                let n = buf.len().min(bytes.len());
                for (slot, byte) in buf.iter_mut().zip(bytes.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if self.closed.load(Ordering::SeqCst) {
                return Ok(0);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(Error::Timeout);
            }
            bytes = self.ready.wait_timeout(bytes, left).unwrap().0;
        }
    }

    /// Take one whole packet off the front, waiting up to `timeout`.
    fn read_packet(&self, timeout: Duration) -> Option<(codec::FixedHeader, Vec<u8>)> {
        let deadline = Instant::now() + timeout;
        let mut bytes = self.bytes.lock().unwrap();
        loop {
            let front: Vec<u8> = bytes.iter().take(5).copied().collect();
            if let Ok(Some((header, used))) = codec::decode_fixed_header(&front) {
                if bytes.len() >= used + header.remaining_length {
                    bytes.drain(..used);
                    let body = bytes.drain(..header.remaining_length).collect();
                    return Some((header, body));
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return None;
            }
            bytes = self.ready.wait_timeout(bytes, left).unwrap().0;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.ready.notify_all();
    }
}

/// Counters and knobs shared by the connector, its connections and brokers.
#[derive(Debug)]
pub struct Shared {
    /// CONNECTs answered.
    pub connects: AtomicUsize,
    /// PUBLISH packets received from the client, duplicates included.
    pub publishes: AtomicUsize,
    /// Client writes thrown away.
    pub dropped: AtomicUsize,
    /// CONNACK return code to answer with.
    pub connack_code: AtomicU8,
    /// Refuse new transport connections.
    pub offline: AtomicBool,
    drop_rate: f64,
    rng: Mutex<StdRng>,
    current: Mutex<Option<(Arc<Pipe>, Arc<Pipe>)>>,
}

/// [`Connect`] implementation handing out loopback connections.
#[derive(Debug, Clone)]
pub struct Loopback {
    shared: Arc<Shared>,
}

impl Loopback {
    /// Reliable link.
    pub fn new() -> Self {
        Self::lossy(0.0, 0)
    }

    /// Link that drops each client write with probability `drop_rate`.
    pub fn lossy(drop_rate: f64, seed: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                connects: AtomicUsize::new(0),
                publishes: AtomicUsize::new(0),
                dropped: AtomicUsize::new(0),
                connack_code: AtomicU8::new(0),
                offline: AtomicBool::new(false),
                drop_rate,
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
                current: Mutex::new(None),
            }),
        }
    }

    /// Counters and knobs.
    pub fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }
}

impl Shared {
    /// Cut the current connection as if the network went away.
    pub fn sever(&self) {
        if let Some((up, down)) = self.current.lock().unwrap().take() {
            up.close();
            down.close();
        }
    }

    fn should_drop(&self) -> bool {
        self.drop_rate > 0.0 && self.rng.lock().unwrap().gen_bool(self.drop_rate)
    }
}

impl Connect for Loopback {
    type Connection = LoopbackConnection;

    fn connect(&mut self, _host: &str, _port: u16, _timeout: Duration) -> Result<LoopbackConnection, Error> {
        if self.shared.offline.load(Ordering::SeqCst) {
            return Err(Error::ConnectionRefused);
        }
        let up = Arc::new(Pipe::default());
        let down = Arc::new(Pipe::default());
        *self.shared.current.lock().unwrap() = Some((Arc::clone(&up), Arc::clone(&down)));

        let broker = Broker {
            up: Arc::clone(&up),
            down: Arc::clone(&down),
            shared: Arc::clone(&self.shared),
            subscriptions: Vec::new(),
            inbound_qos2: HashSet::new(),
            next_id: 0,
        };
        thread::spawn(move || broker.run());

        Ok(LoopbackConnection {
            up,
            down,
            shared: Arc::clone(&self.shared),
        })
    }
}

/// Client side of a loopback connection.
#[derive(Debug)]
pub struct LoopbackConnection {
    up: Arc<Pipe>,
    down: Arc<Pipe>,
    shared: Arc<Shared>,
}

impl Connection for LoopbackConnection {
    fn send_timeout(&self, buf: &[u8], _timeout: Duration) -> Result<usize, Error> {
        if self.up.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        if self.shared.should_drop() {
            self.shared.dropped.fetch_add(1, Ordering::SeqCst);
            return Ok(buf.len());
        }
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

struct Broker {
    up: Arc<Pipe>,
    down: Arc<Pipe>,
    shared: Arc<Shared>,
    subscriptions: Vec<(String, QoS)>,
    inbound_qos2: HashSet<u16>,
    next_id: u16,
}

impl Broker {
    fn run(mut self) {
        while !self.up.closed.load(Ordering::SeqCst) {
            let Some((header, body)) = self.up.read_packet(Duration::from_millis(50)) else {
                continue;
            };
            if self.handle(header, &body).is_err() {
                break;
            }
        }
        self.down.close();
    }

    fn send(&self, bytes: &[u8]) -> Result<(), Error> {
        self.down.write(bytes)
    }

    fn handle(&mut self, header: codec::FixedHeader, body: &[u8]) -> Result<(), Error> {
        match header.packet_type {
            PacketType::Connect => {
                self.shared.connects.fetch_add(1, Ordering::SeqCst);
                let code = self.shared.connack_code.load(Ordering::SeqCst);
                self.send(&[0x20, 0x02, 0x00, code])?;
                if code != 0 {
                    return Err(Error::ConnectionRefused);
                }
            }
            PacketType::Subscribe => {
                let (id, filters) = codec::decode_subscribe(body).map_err(|_| Error::ProtocolError)?;
                let mut suback = vec![0x90, (2 + filters.len()) as u8];
                suback.extend_from_slice(&id.to_be_bytes());
                for (filter, qos) in filters {
                    if filter.starts_with(DENIED) {
                        suback.push(codec::SUBACK_FAILURE);
                        continue;
                    }
                    self.subscriptions.retain(|(f, _)| f != filter);
                    self.subscriptions.push((filter.to_owned(), qos));
                    suback.push(qos as u8);
                }
                self.send(&suback)?;
            }
            PacketType::Unsubscribe => {
                let (id, filters) = codec::decode_unsubscribe(body).map_err(|_| Error::ProtocolError)?;
                self.subscriptions.retain(|(f, _)| !filters.contains(&f.as_str()));
                self.send(&codec::encode_ack(PacketType::UnsubAck, id))?;
            }
            PacketType::Publish => {
                self.shared.publishes.fetch_add(1, Ordering::SeqCst);
                let publish = codec::decode_publish(header.flags, body).map_err(|_| Error::ProtocolError)?;
                if publish.topic.starts_with(BLACKHOLE) {
                    return Ok(());
                }
                let fresh = match (publish.qos, publish.packet_id) {
                    (QoS::AtLeastOnce, Some(id)) => {
                        self.send(&codec::encode_ack(PacketType::PubAck, id))?;
                        true
                    }
                    (QoS::ExactlyOnce, Some(id)) => {
                        self.send(&codec::encode_ack(PacketType::PubRec, id))?;
                        self.inbound_qos2.insert(id)
                    }
                    _ => true,
                };
                if fresh {
                    self.forward(&publish)?;
                }
            }
            PacketType::PubRel => {
                let id = codec::decode_ack(body).map_err(|_| Error::ProtocolError)?;
                self.inbound_qos2.remove(&id);
                self.send(&codec::encode_ack(PacketType::PubComp, id))?;
            }
            PacketType::PubRec => {
                let id = codec::decode_ack(body).map_err(|_| Error::ProtocolError)?;
                self.send(&codec::encode_ack(PacketType::PubRel, id))?;
            }
            PacketType::PingReq => self.send(&codec::PINGRESP)?,
            PacketType::Disconnect => return Err(Error::ConnectionClosed),
            // PUBACK and PUBCOMP for forwarded messages need no answer.
            _ => {}
        }
        Ok(())
    }

    fn forward(&mut self, publish: &Publish<'_>) -> Result<(), Error> {
        let granted = self
            .subscriptions
            .iter()
            .filter(|(filter, _)| topic::matches(publish.topic, filter))
            .map(|(_, qos)| *qos)
            .max();
        let Some(granted) = granted else {
            return Ok(());
        };
        let qos = publish.qos.min(granted);
        let packet_id = (qos != QoS::AtMostOnce).then(|| {
            self.next_id = self.next_id % 65_000 + 1;
            self.next_id
        });
        let mut packet = Vec::new();
        codec::encode_publish(
            &mut packet,
            &Publish {
                dup: false,
                qos,
                retain: false,
                topic: publish.topic,
                packet_id,
                payload: publish.payload,
            },
        )
        .map_err(|_| Error::ProtocolError)?;
        self.send(&packet)
    }
}
