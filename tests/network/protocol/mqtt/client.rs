use crate::network::{BrokerConn, Listener, PipeTransport, pipe};
use libmqtt::network::application::mqtt::codec::{Connack, Connect, ProtocolVersion};
use libmqtt::network::application::mqtt::{ConnackCode, Packet};
use libmqtt::storage::MemoryPersistence;
use libmqtt::{Callback, ConnectOptions, Error, Message, MqttClient, MqttVersion, QoS, Token};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug)]
enum Seen {
    Arrived(String, Message),
    Delivered(u16),
    Lost(Error),
}

struct Recorder(mpsc::Sender<Seen>);

impl Callback for Recorder {
    fn message_arrived(&mut self, topic: &str, message: &Message) {
        let _ = self.0.send(Seen::Arrived(topic.to_string(), message.clone()));
    }

    fn delivery_complete(&mut self, token: &Token) {
        let _ = self.0.send(Seen::Delivered(token.message_id()));
    }

    fn connection_lost(&mut self, cause: &Error) {
        let _ = self.0.send(Seen::Lost(cause.clone()));
    }
}

fn new_client(
    client_id: &str,
    store: &MemoryPersistence,
) -> (MqttClient<PipeTransport>, Listener, mpsc::Receiver<Seen>) {
    let (transport, listener) = pipe();
    let client = MqttClient::new(client_id, transport, Box::new(store.clone())).unwrap();
    let (tx, rx) = mpsc::channel();
    client.set_callback(Recorder(tx));
    (client, listener, rx)
}

fn options(clean_session: bool) -> ConnectOptions {
    ConnectOptions {
        clean_session,
        keep_alive_interval: 0,
        connection_timeout: 5,
        ..Default::default()
    }
}

fn connect(
    client: &MqttClient<PipeTransport>,
    listener: &Listener,
    options: &ConnectOptions,
) -> (BrokerConn, Connect, Token) {
    thread::scope(|s| {
        let broker = s.spawn(|| listener.accept_session(!options.clean_session));
        let token = client.connect(options).unwrap();
        let (conn, connect) = broker.join().unwrap();
        (conn, connect, token)
    })
}

fn next(seen: &mpsc::Receiver<Seen>) -> Seen {
    seen.recv_timeout(Duration::from_secs(5)).expect("no callback")
}

/// Everything the callback reports over `window`.
fn collect(seen: &mpsc::Receiver<Seen>, window: Duration) -> Vec<Seen> {
    let deadline = Instant::now() + window;
    let mut all = Vec::new();
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match seen.recv_timeout(left) {
            Ok(event) => all.push(event),
            Err(_) => break,
        }
    }
    all
}

#[test]
fn test_clean_connect_and_disconnect() {
    let store = MemoryPersistence::new();
    let (client, listener, seen) = new_client("t1", &store);
    let (mut broker, connect, token) = connect(&client, &listener, &options(true));

    assert_eq!(connect.client_id, "t1");
    assert!(connect.clean_session);
    assert_eq!(connect.version, ProtocolVersion::V311);
    assert!(token.is_complete());
    assert!(!token.session_present());
    assert!(client.is_connected());

    client.disconnect().unwrap();
    broker.expect(Packet::Disconnect);
    broker.expect_closed();

    assert!(!client.is_connected());
    assert!(store.is_empty());
    assert!(client.pending_delivery_tokens().is_empty());
    assert!(collect(&seen, Duration::from_millis(100)).is_empty());
    client.close().unwrap();
    assert_eq!(
        client.connect(&options(true)).err(),
        Some(Error::ClientClosed)
    );
}

#[test]
fn test_qos1_publish_completes_on_puback() {
    let store = MemoryPersistence::new();
    let (client, listener, seen) = new_client("t2", &store);
    let (mut broker, _, _) = connect(&client, &listener, &options(true));

    let token = client
        .publish("a/b", b"hello".to_vec(), QoS::AtLeastOnce, false)
        .unwrap();
    let publish = broker.expect_publish();
    assert_eq!(publish.message_id, 1);
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert!(!publish.dup);
    assert_eq!(publish.payload, b"hello".to_vec());
    assert_eq!(store.len(), 1);
    assert!(!token.is_complete());

    broker.send(Packet::Puback { message_id: 1 });
    token.wait_for(Duration::from_secs(5)).unwrap();
    assert!(store.is_empty());

    assert!(matches!(next(&seen), Seen::Delivered(1)));
    assert!(collect(&seen, Duration::from_millis(200)).is_empty());

    client.disconnect().unwrap();
}

#[test]
fn test_qos0_publish_completes_once_sent() {
    let store = MemoryPersistence::new();
    let (client, listener, seen) = new_client("t3", &store);
    let (mut broker, _, _) = connect(&client, &listener, &options(true));

    let token = client
        .publish("a/b", Vec::new(), QoS::AtMostOnce, true)
        .unwrap();
    let publish = broker.expect_publish();
    assert_eq!(publish.message_id, 0);
    assert!(publish.retain);
    token.wait_for(Duration::from_secs(5)).unwrap();
    assert!(matches!(next(&seen), Seen::Delivered(0)));
    assert!(store.is_empty());

    client.disconnect().unwrap();
}

#[test]
fn test_qos2_publish_handshake() {
    let store = MemoryPersistence::new();
    let (client, listener, _seen) = new_client("t4", &store);
    let (mut broker, _, _) = connect(&client, &listener, &options(false));

    let token = client
        .publish("a/b", b"x".to_vec(), QoS::ExactlyOnce, false)
        .unwrap();
    let id = broker.expect_publish().message_id;
    broker.send(Packet::Pubrec { message_id: id });
    broker.expect(Packet::Pubrel { message_id: id });
    assert_eq!(store.len(), 2);
    broker.send(Packet::Pubcomp { message_id: id });
    token.wait_for(Duration::from_secs(5)).unwrap();
    assert!(store.is_empty());

    client.disconnect().unwrap();
}

#[test]
fn test_duplicate_pubrel_delivers_once() {
    let store = MemoryPersistence::new();
    let (client, listener, seen) = new_client("t5", &store);
    let (mut broker, _, _) = connect(&client, &listener, &options(false));

    broker.publish("x/y", b"once", QoS::ExactlyOnce, 7);
    broker.expect(Packet::Pubrec { message_id: 7 });
    broker.send(Packet::Pubrel { message_id: 7 });
    broker.expect(Packet::Pubcomp { message_id: 7 });
    broker.send(Packet::Pubrel { message_id: 7 });
    broker.expect(Packet::Pubcomp { message_id: 7 });

    match next(&seen) {
        Seen::Arrived(topic, message) => {
            assert_eq!(topic, "x/y");
            assert_eq!(message.id, 7);
            assert_eq!(message.qos, QoS::ExactlyOnce);
            assert_eq!(message.payload, b"once".to_vec());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(collect(&seen, Duration::from_millis(200)).is_empty());
    assert!(store.is_empty());

    client.disconnect().unwrap();
}

#[test]
fn test_qos1_inbound_is_acknowledged_after_callback() {
    let store = MemoryPersistence::new();
    let (client, listener, seen) = new_client("t6", &store);
    let (mut broker, _, _) = connect(&client, &listener, &options(true));

    broker.publish("x/y", b"1", QoS::AtLeastOnce, 3);
    assert!(matches!(next(&seen), Seen::Arrived(_, Message { id: 3, .. })));
    broker.expect(Packet::Puback { message_id: 3 });

    client.disconnect().unwrap();
}

#[test]
fn test_quiesce_timeout_fails_unacknowledged_publish() {
    let store = MemoryPersistence::new();
    let (client, listener, _seen) = new_client("t7", &store);
    let (mut broker, _, _) = connect(&client, &listener, &options(false));

    let token = client
        .publish("a/b", b"stuck".to_vec(), QoS::AtLeastOnce, false)
        .unwrap();
    broker.expect_publish();

    let started = Instant::now();
    client
        .disconnect_with_timeout(Duration::from_millis(300))
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(token.error(), Some(Error::Disconnecting));
    broker.expect(Packet::Disconnect);

    // Kept for the next session.
    assert_eq!(store.len(), 1);
}

#[test]
fn test_unacknowledged_publish_is_resent_after_restart() {
    let store = MemoryPersistence::new();
    {
        let (client, listener, _seen) = new_client("t8", &store);
        let (mut broker, _, _) = connect(&client, &listener, &options(false));
        client
            .publish("a/b", b"again".to_vec(), QoS::AtLeastOnce, false)
            .unwrap();
        broker.expect_publish();
        client.disconnect_forcibly(Duration::ZERO).unwrap();
        client.close().unwrap();
    }
    assert_eq!(store.len(), 1);

    let (client, listener, seen) = new_client("t8", &store);
    let pending = client.pending_delivery_tokens();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message_id(), 1);

    let (mut broker, _, token) = connect(&client, &listener, &options(false));
    assert!(token.session_present());
    let publish = broker.expect_publish();
    assert_eq!(publish.message_id, 1);
    assert!(publish.dup);
    assert_eq!(publish.payload, b"again".to_vec());

    broker.send(Packet::Puback { message_id: 1 });
    pending[0].wait_for(Duration::from_secs(5)).unwrap();
    assert!(matches!(next(&seen), Seen::Delivered(1)));
    assert!(store.is_empty());

    client.disconnect().unwrap();
}

#[test]
fn test_keep_alive_ping() {
    let store = MemoryPersistence::new();
    let (client, listener, _seen) = new_client("t9", &store);
    let options = ConnectOptions {
        keep_alive_interval: 1,
        ..options(true)
    };
    let (mut broker, connect, _) = connect(&client, &listener, &options);
    assert_eq!(connect.keep_alive, 1);

    for _ in 0..2 {
        let ping = broker.recv_within(Duration::from_secs(3));
        assert_eq!(ping, Some(Packet::Pingreq));
        broker.send(Packet::Pingresp);
    }
    assert!(client.is_connected());

    client.disconnect().unwrap();
}

#[test]
fn test_unanswered_ping_loses_connection() {
    let store = MemoryPersistence::new();
    let (client, listener, seen) = new_client("t10", &store);
    let options = ConnectOptions {
        keep_alive_interval: 1,
        ..options(true)
    };
    let (mut broker, _, _) = connect(&client, &listener, &options);

    assert_eq!(broker.recv_within(Duration::from_secs(3)), Some(Packet::Pingreq));
    match next(&seen) {
        Seen::Lost(cause) => assert_eq!(cause, Error::KeepAliveTimeout),
        other => panic!("unexpected {other:?}"),
    }
    assert!(!client.is_connected());
    assert!(collect(&seen, Duration::from_millis(200)).is_empty());
}

#[test]
fn test_refused_connection() {
    let store = MemoryPersistence::new();
    let (client, listener, seen) = new_client("t11", &store);
    let result = thread::scope(|s| {
        s.spawn(|| {
            let mut conn = listener.accept();
            conn.expect_connect();
            conn.send(Packet::Connack(Connack {
                session_present: false,
                code: ConnackCode::NotAuthorized,
            }));
        });
        client.connect(&options(true))
    });
    assert_eq!(
        result.err(),
        Some(Error::ConnectionRefused(ConnackCode::NotAuthorized))
    );
    assert!(!client.is_connected());
    assert!(collect(&seen, Duration::from_millis(100)).is_empty());
}

#[test]
fn test_falls_back_to_mqtt_31() {
    let store = MemoryPersistence::new();
    let (client, listener, _seen) = new_client("t12", &store);
    let mut broker = thread::scope(|s| {
        let broker = s.spawn(|| {
            let mut first = listener.accept();
            assert_eq!(first.expect_connect().version, ProtocolVersion::V311);
            first.send(Packet::Connack(Connack {
                session_present: false,
                code: ConnackCode::UnacceptableProtocolVersion,
            }));
            let (second, connect) = listener.accept_session(false);
            assert_eq!(connect.version, ProtocolVersion::V31);
            second
        });
        client.connect(&options(true)).unwrap();
        broker.join().unwrap()
    });
    assert!(client.is_connected());
    client.disconnect().unwrap();
    broker.expect(Packet::Disconnect);
}

#[test]
fn test_pinned_version_does_not_fall_back() {
    let store = MemoryPersistence::new();
    let (client, listener, _seen) = new_client("t13", &store);
    let options = ConnectOptions {
        mqtt_version: MqttVersion::V311,
        ..options(true)
    };
    let result = thread::scope(|s| {
        s.spawn(|| {
            let mut conn = listener.accept();
            conn.expect_connect();
            conn.send(Packet::Connack(Connack {
                session_present: false,
                code: ConnackCode::UnacceptableProtocolVersion,
            }));
        });
        client.connect(&options)
    });
    assert_eq!(
        result.err(),
        Some(Error::ConnectionRefused(ConnackCode::UnacceptableProtocolVersion))
    );
}

#[test]
fn test_transport_failure_fails_connect() {
    let store = MemoryPersistence::new();
    let (transport, _listener) = pipe();
    let client = MqttClient::new("t14", transport.refusing(), Box::new(store)).unwrap();
    assert!(matches!(
        client.connect(&options(true)),
        Err(Error::Network(_))
    ));
    assert!(!client.is_connected());
}

#[test]
fn test_subscribe_granted_and_rejected() {
    let store = MemoryPersistence::new();
    let (client, listener, _seen) = new_client("t15", &store);
    let (mut broker, _, _) = connect(&client, &listener, &options(true));

    let (filters, token) = thread::scope(|s| {
        let answer = s.spawn(|| broker.answer_subscribe(vec![1, 0]));
        let token = client.subscribe(&[("a/+", QoS::AtLeastOnce), ("b/#", QoS::AtMostOnce)]);
        (answer.join().unwrap(), token)
    });
    assert_eq!(
        filters,
        vec![("a/+".to_string(), QoS::AtLeastOnce), ("b/#".to_string(), QoS::AtMostOnce)]
    );
    assert_eq!(token.unwrap().granted_qos(), Some(vec![1, 0]));

    let result = thread::scope(|s| {
        s.spawn(|| broker.answer_subscribe(vec![0x80]));
        client.subscribe(&[("c", QoS::ExactlyOnce)])
    });
    assert_eq!(result.err(), Some(Error::SubscribeFailed));

    let result = thread::scope(|s| {
        s.spawn(|| match broker.recv() {
            Packet::Unsubscribe(unsubscribe) => {
                assert_eq!(unsubscribe.filters, vec!["a/+".to_string()]);
                broker.send(Packet::Unsuback {
                    message_id: unsubscribe.message_id,
                });
            }
            other => panic!("expected UNSUBSCRIBE, got {other}"),
        });
        client.unsubscribe(&["a/+"])
    });
    assert!(result.unwrap().is_complete());

    client.disconnect().unwrap();
}

#[test]
fn test_subscribe_times_out() {
    let store = MemoryPersistence::new();
    let (mut client, listener, _seen) = new_client("t16", &store);
    client.set_time_to_wait(Some(Duration::from_millis(100)));
    let (mut broker, _, _) = connect(&client, &listener, &options(true));

    assert_eq!(
        client.subscribe(&[("a", QoS::AtMostOnce)]).err(),
        Some(Error::ClientTimeout)
    );
    assert!(matches!(broker.recv(), Packet::Subscribe(_)));
    assert!(client.is_connected());
    client.disconnect().unwrap();
}

#[test]
fn test_connection_lost_reported_once() {
    let store = MemoryPersistence::new();
    let (client, listener, seen) = new_client("t17", &store);
    let (broker, _, _) = connect(&client, &listener, &options(true));

    let token = client
        .publish("a/b", b"lost".to_vec(), QoS::AtLeastOnce, false)
        .unwrap();
    broker.drop_connection();

    let events = collect(&seen, Duration::from_secs(2));
    let lost = events.iter().filter(|e| matches!(e, Seen::Lost(_))).count();
    assert_eq!(lost, 1);
    assert!(!client.is_connected());
    assert!(token.wait_for(Duration::from_secs(5)).is_err());
    assert!(matches!(
        client.publish("a/b", Vec::new(), QoS::AtMostOnce, false),
        Err(Error::NotConnected)
    ));
    assert_eq!(client.disconnect().err(), Some(Error::NotConnected));
}

#[test]
fn test_requests_need_a_connection() {
    let store = MemoryPersistence::new();
    let (client, _listener, _seen) = new_client("t18", &store);
    assert_eq!(
        client.publish("a", Vec::new(), QoS::AtMostOnce, false).err(),
        Some(Error::NotConnected)
    );
    assert!(matches!(
        client.publish("a/+", Vec::new(), QoS::AtMostOnce, false),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        client.subscribe(&[("a/#/b", QoS::AtMostOnce)]),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(client.disconnect().err(), Some(Error::NotConnected));
}

#[test]
fn test_empty_client_id_requires_clean_session() {
    let store = MemoryPersistence::new();
    let (client, _listener, _seen) = new_client("", &store);
    assert!(matches!(
        client.connect(&options(false)),
        Err(Error::InvalidArgument(_))
    ));
}

struct DisconnectFromCallback {
    client: Arc<OnceLock<Arc<MqttClient<PipeTransport>>>>,
    result: mpsc::Sender<Result<(), Error>>,
}

impl Callback for DisconnectFromCallback {
    fn message_arrived(&mut self, _: &str, _: &Message) {
        if let Some(client) = self.client.get() {
            let _ = self.result.send(client.disconnect());
        }
    }
}

#[test]
fn test_disconnect_from_callback_is_prohibited() {
    let store = MemoryPersistence::new();
    let (transport, listener) = pipe();
    let client = Arc::new(MqttClient::new("t19", transport, Box::new(store)).unwrap());
    let slot = Arc::new(OnceLock::new());
    let _ = slot.set(client.clone());
    let (tx, rx) = mpsc::channel();
    client.set_callback(DisconnectFromCallback {
        client: slot,
        result: tx,
    });
    let (mut broker, _, _) = connect(&client, &listener, &options(true));

    broker.publish("x", b"1", QoS::AtMostOnce, 0);
    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result, Err(Error::DisconnectProhibited));
    assert!(client.is_connected());

    client.disconnect().unwrap();
    broker.expect(Packet::Disconnect);
}
