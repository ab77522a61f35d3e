//! Tests against a real broker. Run with `--ignored`; the broker is taken
//! from `TEST_MQTT_ADDRESS` (`host:port`, also read from `.env`).

use dotenvy::dotenv;
use std::env;
use std::sync::mpsc;
use std::time::Duration;

use libiot_mqtt::network::application::mqtt::{Client, Config, Event, QoS};
use libiot_mqtt::network::tcp::TcpConnector;

fn broker_config(client_id: &str) -> Config {
    dotenv().ok();
    let address = env::var("TEST_MQTT_ADDRESS").unwrap_or("test.mosquitto.org:1883".to_string());
    let (host, port) = address.rsplit_once(':').unwrap_or((address.as_str(), "1883"));
    Config::new(host, client_id)
        .with_port(port.parse().unwrap())
        .with_keep_alive(10)
}

#[derive(Debug)]
enum Note {
    Connected,
    Subscribed,
    Published(u16),
    Data(Vec<u8>),
}

fn connected_client(client_id: &str) -> (Client<TcpConnector>, mpsc::Receiver<Note>) {
    let (tx, rx) = mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    let client = Client::new(TcpConnector::default(), broker_config(client_id), move |_, event| {
        let note = match event {
            Event::Connected { .. } => Note::Connected,
            Event::Subscribed { .. } => Note::Subscribed,
            Event::Published { packet_id, .. } => Note::Published(*packet_id),
            Event::Data(message) => Note::Data(message.payload.to_vec()),
            _ => return,
        };
        let _ = tx.lock().unwrap().send(note);
    })
    .unwrap();
    client.start().unwrap();
    match rx.recv_timeout(Duration::from_secs(10)) {
        Ok(Note::Connected) => {}
        other => panic!("no CONNACK: {other:?}"),
    }
    (client, rx)
}

#[test]
#[ignore = "needs a reachable MQTT broker"]
fn test_connect_to_public_broker() {
    let (client, _events) = connected_client("libiot-mqtt-test-12345");
    client.disconnect(true).unwrap();
    client.destroy().unwrap();
    client.join().unwrap();
}

#[test]
#[ignore = "needs a reachable MQTT broker"]
fn test_publish_and_subscribe() {
    let (client, events) = connected_client("libiot-mqtt-test-67890");
    let topic = "libiot-mqtt/test-topic";
    let payload = b"hello world";

    client.subscribe(topic, QoS::AtLeastOnce).unwrap();
    assert!(matches!(events.recv_timeout(Duration::from_secs(10)), Ok(Note::Subscribed)));

    let id = client.publish(topic, payload, QoS::AtLeastOnce, false).unwrap().unwrap();

    let mut published = false;
    let mut received = false;
    while !(published && received) {
        match events.recv_timeout(Duration::from_secs(10)).expect("broker went quiet") {
            Note::Published(done) => published |= done == id,
            Note::Data(data) => received |= data == payload,
            _ => {}
        }
    }

    client.destroy().unwrap();
    client.join().unwrap();
}
