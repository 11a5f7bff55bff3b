use dotenvy::dotenv;
use libmqtt::network::tcp::TcpTransport;
use libmqtt::storage::MemoryPersistence;
use libmqtt::{Callback, ConnectOptions, Message, MqttClient, QoS};
use std::env;
use std::sync::mpsc;
use std::time::Duration;

fn broker_address() -> String {
    dotenv().ok();
    env::var("TEST_MQTT_ADDRESS").unwrap_or("test.mosquitto.org:1883".to_string())
}

struct Forward(mpsc::Sender<(String, Vec<u8>)>);

impl Callback for Forward {
    fn message_arrived(&mut self, topic: &str, message: &Message) {
        let _ = self.0.send((topic.to_string(), message.payload.clone()));
    }
}

#[test]
#[ignore = "needs a reachable broker"]
fn test_connect_to_public_broker() {
    let transport = TcpTransport::new(broker_address());
    let client = MqttClient::new(
        "libmqtt-test-client-12345",
        transport,
        Box::new(MemoryPersistence::new()),
    )
    .unwrap();

    let token = client.connect(&ConnectOptions::default()).unwrap();
    assert!(token.is_complete());
    assert!(client.is_connected());
    client.disconnect().unwrap();
}

#[test]
#[ignore = "needs a reachable broker"]
fn test_publish_and_subscribe() {
    let transport = TcpTransport::new(broker_address());
    let client = MqttClient::new(
        "libmqtt-test-client-67890",
        transport,
        Box::new(MemoryPersistence::new()),
    )
    .unwrap();
    let (tx, rx) = mpsc::channel();
    client.set_callback(Forward(tx));
    client.connect(&ConnectOptions::default()).unwrap();

    let topic = "libmqtt/test/67890";
    client.subscribe(&[(topic, QoS::ExactlyOnce)]).unwrap();
    for qos in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce] {
        client
            .publish(topic, format!("{qos:?}").into_bytes(), qos, false)
            .unwrap()
            .wait_for(Duration::from_secs(10))
            .unwrap();
        let (from, payload) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(from, topic);
        assert_eq!(payload, format!("{qos:?}").into_bytes());
    }

    client.unsubscribe(&[topic]).unwrap();
    client.disconnect().unwrap();
}
