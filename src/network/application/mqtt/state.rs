//! Session state: message identifiers, send queues, QoS 1/2 bookkeeping
//! and the persisted records that let a session survive restarts.
//!
//! Everything mutable lives in one [`Inner`] behind one mutex. Two
//! condition variables hang off it: `work` wakes the sender when there is
//! something to send, `drained` wakes a quiescing caller when in-flight
//! work completes.
//!
//! Outbound QoS 1 and 2 publishes are persisted under `s-<id>` before they
//! are queued, and the PUBREL of a QoS 2 flow under `sc-<id>`. Inbound
//! QoS 2 publishes are persisted under `r-<id>` before PUBREC is sent.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::callback::CallbackDispatcher;
use super::codec::{ConnackCode, MAX_MESSAGE_ID, MIN_MESSAGE_ID, Packet, Publish, QoS};
use super::error::Error;
use super::token::{Token, TokenKey, TokenStore};
use crate::storage::{Persistence, Record};

const SENT_PREFIX: &str = "s-";
const CONFIRMED_PREFIX: &str = "sc-";
const RECEIVED_PREFIX: &str = "r-";

/// Longest single sleep while quiescing; the dispatcher's progress is
/// polled rather than signalled.
const QUIESCE_POLL: Duration = Duration::from_millis(100);

fn sent_key(id: u16) -> String {
    format!("{SENT_PREFIX}{id}")
}

fn confirmed_key(id: u16) -> String {
    format!("{CONFIRMED_PREFIX}{id}")
}

fn received_key(id: u16) -> String {
    format!("{RECEIVED_PREFIX}{id}")
}

/// Persisted form of a packet: header and payload kept apart, exactly as
/// they go on the wire.
fn to_record(packet: &Packet) -> Result<Record, Error> {
    let (header, payload) = packet.encode_parts()?;
    Ok(Record::new(header, payload.into_owned()))
}

fn from_record(record: &Record) -> Result<Packet, Error> {
    Packet::decode(&record.to_bytes())
}

/// Rotate `items`, sorted by message identifier, so that the list starts
/// after the largest gap between consecutive identifiers.
///
/// Identifiers are handed out in increasing order and wrap at 65535, so
/// after a wrap the oldest message is not the one with the lowest id. The
/// largest gap is taken as the point where allocation wrapped. This is a
/// heuristic: with enough acknowledged messages in between it can pick the
/// wrong starting point.
pub fn reorder<T>(mut items: Vec<T>, id: impl Fn(&T) -> u16) -> Vec<T> {
    if items.is_empty() {
        return items;
    }
    let mut previous = 0u32;
    let mut largest_gap = 0u32;
    let mut start = 0usize;
    for (i, item) in items.iter().enumerate() {
        let current = u32::from(id(item));
        if current - previous > largest_gap {
            largest_gap = current - previous;
            start = i;
        }
        previous = current;
    }
    let lowest = u32::from(id(&items[0]));
    if u32::from(MAX_MESSAGE_ID) - previous + lowest > largest_gap {
        start = 0;
    }
    items.rotate_left(start);
    items
}

/// Timestamps of the last network traffic in each direction.
///
/// Updated from the reader and writer without taking the session lock.
#[derive(Debug)]
pub struct Activity {
    base: Instant,
    last_outbound: AtomicU64,
    last_inbound: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            base: Instant::now(),
            last_outbound: AtomicU64::new(0),
            last_inbound: AtomicU64::new(0),
        }
    }

    fn now(&self) -> u64 {
        self.base.elapsed().as_millis() as u64
    }

    /// Bytes were just written.
    pub fn record_outbound(&self) {
        self.last_outbound.store(self.now(), Ordering::Relaxed);
    }

    /// Bytes were just read.
    pub fn record_inbound(&self) {
        self.last_inbound.store(self.now(), Ordering::Relaxed);
    }

    /// Time since the last write.
    pub fn since_outbound(&self) -> Duration {
        Duration::from_millis(self.now().saturating_sub(self.last_outbound.load(Ordering::Relaxed)))
    }

    /// Time since the last read.
    pub fn since_inbound(&self) -> Duration {
        Duration::from_millis(self.now().saturating_sub(self.last_inbound.load(Ordering::Relaxed)))
    }

    fn reset(&self) {
        self.record_inbound();
        self.record_outbound();
    }
}

/// Work handed to the sender.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Packet to write.
    pub packet: Packet,
    /// Token to mark sent once written.
    pub token: Option<Token>,
}

/// Session parameters fixed for the lifetime of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Forget the session on connect and disconnect.
    pub clean_session: bool,
    /// Ping interval, `None` when disabled.
    pub keep_alive: Option<Duration>,
    /// Most QoS 1 and 2 publishes awaiting acknowledgement at once.
    pub max_inflight: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            clean_session: true,
            keep_alive: Some(Duration::from_secs(60)),
            max_inflight: 10,
        }
    }
}

#[derive(Debug, Clone)]
struct OutboundQos2 {
    publish: Publish,
    /// PUBREC received and PUBREL persisted.
    released: bool,
}

#[derive(Debug, Clone)]
struct InboundQos2 {
    publish: Publish,
    /// PUBREL received and the message handed to the dispatcher.
    delivering: bool,
}

struct Inner {
    settings: SessionSettings,
    connected: bool,
    connecting: bool,
    quiescing: bool,
    /// DISCONNECT has been written; nothing else may follow it.
    disconnect_sent: bool,

    pending_messages: VecDeque<Outbound>,
    pending_flows: VecDeque<Outbound>,
    /// QoS 1 and 2 publishes handed to the sender and not yet acknowledged.
    in_flight: HashSet<u16>,
    in_flight_pubrels: usize,

    outbound_qos1: HashMap<u16, Publish>,
    outbound_qos2: HashMap<u16, OutboundQos2>,
    inbound_qos2: HashMap<u16, InboundQos2>,

    in_use: HashSet<u16>,
    next_id: u16,

    pings_outstanding: u32,
    last_ping: Instant,

    persistence: Box<dyn Persistence>,
    persistence_open: bool,
}

impl Inner {
    /// Walk forward from the last identifier handed out, wrapping at
    /// 65535, and take the first one not in use.
    fn next_message_id(&mut self) -> Result<u16, Error> {
        for _ in MIN_MESSAGE_ID..=MAX_MESSAGE_ID {
            self.next_id = if self.next_id >= MAX_MESSAGE_ID { MIN_MESSAGE_ID } else { self.next_id + 1 };
            if self.in_use.insert(self.next_id) {
                return Ok(self.next_id);
            }
        }
        Err(Error::NoMessageIdsAvailable)
    }

    fn release_message_id(&mut self, id: u16) {
        self.in_use.remove(&id);
    }

    fn open_persistence(&mut self, client_id: &str, server_uri: &str) -> Result<(), Error> {
        if !self.persistence_open {
            self.persistence.open(client_id, server_uri)?;
            self.persistence_open = true;
        }
        Ok(())
    }
}

/// Shared session state of one client.
pub struct ClientState {
    client_id: String,
    server_uri: String,
    inner: Mutex<Inner>,
    work: Condvar,
    drained: Condvar,
    activity: Arc<Activity>,
    tokens: Arc<TokenStore>,
    callbacks: Arc<CallbackDispatcher>,
}

impl std::fmt::Debug for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientState")
            .field("client_id", &self.client_id)
            .field("server_uri", &self.server_uri)
            .finish_non_exhaustive()
    }
}

impl ClientState {
    /// Open `persistence` for this client and rebuild the session from
    /// whatever it holds.
    pub fn new(
        client_id: impl Into<String>,
        server_uri: impl Into<String>,
        persistence: Box<dyn Persistence>,
        tokens: Arc<TokenStore>,
        callbacks: Arc<CallbackDispatcher>,
    ) -> Result<Self, Error> {
        let state = Self {
            client_id: client_id.into(),
            server_uri: server_uri.into(),
            inner: Mutex::new(Inner {
                settings: SessionSettings::default(),
                connected: false,
                connecting: false,
                quiescing: false,
                disconnect_sent: false,
                pending_messages: VecDeque::new(),
                pending_flows: VecDeque::new(),
                in_flight: HashSet::new(),
                in_flight_pubrels: 0,
                outbound_qos1: HashMap::new(),
                outbound_qos2: HashMap::new(),
                inbound_qos2: HashMap::new(),
                in_use: HashSet::new(),
                next_id: MIN_MESSAGE_ID - 1,
                pings_outstanding: 0,
                last_ping: Instant::now(),
                persistence,
                persistence_open: false,
            }),
            work: Condvar::new(),
            drained: Condvar::new(),
            activity: Arc::new(Activity::new()),
            tokens,
            callbacks,
        };
        state.restore_state()?;
        Ok(state)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Traffic timestamps, shared with the reader and writer.
    pub fn activity(&self) -> Arc<Activity> {
        self.activity.clone()
    }

    /// Outstanding request tokens.
    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// Dispatcher that inbound messages and completions are handed to.
    pub fn callbacks(&self) -> &Arc<CallbackDispatcher> {
        &self.callbacks
    }

    /// Rebuild the in-memory tables from persisted records.
    ///
    /// Records that cannot be read or decoded are deleted. `sc-` records
    /// without their `s-` record are deleted. Running it again over the
    /// same records produces the same state.
    pub fn restore_state(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        inner.open_persistence(&self.client_id, &self.server_uri)?;
        let keys = inner.persistence.keys()?;
        log::debug!("{}: restoring from {} records", self.client_id, keys.len());

        let mut restored = Vec::new();
        for key in &keys {
            if let Some(id) = key.strip_prefix(RECEIVED_PREFIX) {
                match self.load_publish(&mut inner, key, id) {
                    Some(publish) => {
                        log::debug!("{}: restored inbound QoS 2 message {}", self.client_id, publish.message_id);
                        inner.inbound_qos2.insert(
                            publish.message_id,
                            InboundQos2 {
                                publish,
                                delivering: false,
                            },
                        );
                    }
                    None => continue,
                }
            } else if let Some(id) = key.strip_prefix(CONFIRMED_PREFIX) {
                let orphan = match id.parse::<u16>() {
                    Ok(id) => !keys.contains(&sent_key(id)),
                    Err(_) => true,
                };
                if orphan {
                    log::warn!("{}: removing orphaned record {key}", self.client_id);
                    self.discard(&mut inner, key);
                }
            } else if let Some(id) = key.strip_prefix(SENT_PREFIX) {
                let Some(mut publish) = self.load_publish(&mut inner, key, id) else {
                    continue;
                };
                let id = publish.message_id;
                publish.dup = true;
                let released = self.load_pubrel(&mut inner, id);
                match publish.qos {
                    QoS::ExactlyOnce => {
                        inner
                            .outbound_qos2
                            .insert(id, OutboundQos2 { publish: publish.clone(), released });
                    }
                    QoS::AtLeastOnce => {
                        inner.outbound_qos1.insert(id, publish.clone());
                    }
                    QoS::AtMostOnce => {
                        log::warn!("{}: removing QoS 0 record {key}", self.client_id);
                        self.discard(&mut inner, key);
                        continue;
                    }
                }
                log::debug!(
                    "{}: restored outbound message {id} (qos {}, released {released})",
                    self.client_id,
                    publish.qos
                );
                inner.in_use.insert(id);
                restored.push(publish);
            } else {
                log::warn!("{}: removing unrecognised record {key}", self.client_id);
                self.discard(&mut inner, key);
            }
        }
        drop(inner);

        for publish in &restored {
            self.tokens.restore_token(publish);
        }
        Ok(())
    }

    /// Read `key` as a PUBLISH carrying message id `id`. Anything else is
    /// deleted.
    fn load_publish(&self, inner: &mut Inner, key: &str, id: &str) -> Option<Publish> {
        let record = match inner.persistence.get(key) {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("{}: discarding unreadable record {key}: {e}", self.client_id);
                self.discard(inner, key);
                return None;
            }
        };
        match (from_record(&record), id.parse::<u16>()) {
            (Ok(Packet::Publish(publish)), Ok(id)) if publish.message_id == id => Some(publish),
            (Ok(other), _) => {
                log::warn!("{}: discarding record {key} holding {other}", self.client_id);
                self.discard(inner, key);
                None
            }
            (Err(e), _) => {
                log::warn!("{}: discarding corrupt record {key}: {e}", self.client_id);
                self.discard(inner, key);
                None
            }
        }
    }

    /// Whether a readable PUBREL is persisted for `id`. Damaged ones are
    /// deleted.
    fn load_pubrel(&self, inner: &mut Inner, id: u16) -> bool {
        let key = confirmed_key(id);
        match inner.persistence.get(&key) {
            Ok(Some(record)) => match from_record(&record) {
                Ok(Packet::Pubrel { message_id }) if message_id == id => true,
                _ => {
                    log::warn!("{}: discarding corrupt record {key}", self.client_id);
                    self.discard(inner, &key);
                    false
                }
            },
            Ok(None) => false,
            Err(e) => {
                log::warn!("{}: discarding unreadable record {key}: {e}", self.client_id);
                self.discard(inner, &key);
                false
            }
        }
    }

    fn discard(&self, inner: &mut Inner, key: &str) {
        if let Err(e) = inner.persistence.remove(key) {
            log::warn!("{}: failed to remove record {key}: {e}", self.client_id);
        }
    }

    /// Forget the whole session, in memory and on disk.
    fn clear_state(&self, inner: &mut Inner) {
        log::debug!("{}: clearing session state", self.client_id);
        if inner.persistence_open {
            if let Err(e) = inner.persistence.clear() {
                log::warn!("{}: failed to clear persistence: {e}", self.client_id);
            }
        }
        inner.outbound_qos1.clear();
        inner.outbound_qos2.clear();
        inner.inbound_qos2.clear();
        inner.in_use.clear();
        inner.in_flight.clear();
        inner.in_flight_pubrels = 0;
        inner.pending_messages.clear();
        inner.pending_flows.clear();
        inner.next_id = MIN_MESSAGE_ID - 1;
        for token in self.tokens.delivery_tokens() {
            if let Some(key) = token.key() {
                self.tokens.remove(&key);
            }
            token.fail(Error::ConnectionLost);
        }
    }

    /// Prepare for a new connection attempt.
    pub fn connecting(&self, settings: SessionSettings) -> Result<(), Error> {
        let mut inner = self.lock();
        inner.open_persistence(&self.client_id, &self.server_uri)?;
        inner.settings = settings;
        inner.connecting = true;
        inner.connected = false;
        inner.quiescing = false;
        inner.disconnect_sent = false;
        inner.pings_outstanding = 0;
        self.activity.reset();
        Ok(())
    }

    /// Queue `packet` for sending.
    ///
    /// Assigns a message identifier if the packet needs one. QoS 1 and 2
    /// publishes are persisted before they are queued. CONNECT and PINGREQ
    /// jump the flow queue; other control packets queue behind earlier
    /// flows but ahead of every publish.
    pub fn send(&self, mut packet: Packet, token: Option<Token>) -> Result<(), Error> {
        let mut inner = self.lock();
        let is_new_request = matches!(
            packet,
            Packet::Publish(_) | Packet::Subscribe(_) | Packet::Unsubscribe(_)
        );
        if inner.quiescing && is_new_request {
            return Err(Error::Disconnecting);
        }

        let mut allocated = None;
        if packet.requires_message_id() && packet.message_id() == 0 {
            let id = inner.next_message_id()?;
            packet.set_message_id(id);
            allocated = Some(id);
        }
        if let Some(token) = &token {
            token.set_message_id(packet.message_id());
        }

        let result = self.enqueue(&mut inner, packet, token);
        if result.is_err() {
            if let Some(id) = allocated {
                inner.release_message_id(id);
            }
        }
        result
    }

    fn enqueue(&self, inner: &mut Inner, packet: Packet, token: Option<Token>) -> Result<(), Error> {
        log::debug!("{}: queue {packet}", self.client_id);
        match &packet {
            Packet::Publish(publish) => {
                let token = token.unwrap_or_default();
                token.set_message(publish);
                if publish.qos == QoS::AtMostOnce {
                    self.tokens.save_token(self.tokens.next_local_key(), &token)?;
                } else {
                    let id = publish.message_id;
                    let key = TokenKey::MessageId(id);
                    self.tokens.save_token(key, &token)?;
                    let stored = to_record(&packet).and_then(|record| {
                        inner.persistence.put(&sent_key(id), &record).map_err(Error::from)
                    });
                    if let Err(e) = stored {
                        self.tokens.remove(&key);
                        return Err(e);
                    }
                    if publish.qos == QoS::AtLeastOnce {
                        inner.outbound_qos1.insert(id, publish.clone());
                    } else {
                        inner.outbound_qos2.insert(
                            id,
                            OutboundQos2 {
                                publish: publish.clone(),
                                released: false,
                            },
                        );
                    }
                }
                inner.pending_messages.push_back(Outbound {
                    packet,
                    token: Some(token),
                });
            }
            Packet::Connect(_) | Packet::Pingreq => {
                if let (Some(key), Some(token)) = (TokenKey::for_request(&packet), &token) {
                    self.tokens.save_token(key, token)?;
                }
                inner.pending_flows.push_front(Outbound { packet, token });
            }
            Packet::Subscribe(_) | Packet::Unsubscribe(_) | Packet::Disconnect => {
                if let (Some(key), Some(token)) = (TokenKey::for_request(&packet), &token) {
                    self.tokens.save_token(key, token)?;
                }
                inner.pending_flows.push_back(Outbound { packet, token });
            }
            Packet::Pubrel { message_id } => {
                let id = *message_id;
                inner.persistence.put(&confirmed_key(id), &to_record(&packet)?)?;
                if let Some(entry) = inner.outbound_qos2.get_mut(&id) {
                    entry.released = true;
                }
                inner.pending_flows.push_back(Outbound { packet, token: None });
            }
            _ => inner.pending_flows.push_back(Outbound { packet, token: None }),
        }
        self.work.notify_all();
        Ok(())
    }

    /// Queue an acknowledgement the client owes the broker. Dropped when
    /// there is no connection to send it on.
    fn enqueue_ack(&self, inner: &mut Inner, packet: Packet) {
        if !inner.connected && !inner.connecting {
            log::debug!("{}: not connected, dropping {packet}", self.client_id);
            return;
        }
        log::debug!("{}: queue {packet}", self.client_id);
        inner.pending_flows.push_back(Outbound { packet, token: None });
        self.work.notify_all();
    }

    /// Take the next thing to send, if any, without blocking.
    fn next_work(&self, inner: &mut Inner) -> Option<Outbound> {
        if inner.disconnect_sent {
            return None;
        }
        if !inner.connected {
            let connect_first = matches!(
                inner.pending_flows.front(),
                Some(Outbound { packet: Packet::Connect(_), .. })
            );
            return if connect_first { inner.pending_flows.pop_front() } else { None };
        }
        if let Some(flow) = inner.pending_flows.pop_front() {
            if matches!(flow.packet, Packet::Pubrel { .. }) {
                inner.in_flight_pubrels += 1;
            }
            return Some(flow);
        }
        if inner.in_flight.len() >= inner.settings.max_inflight {
            return None;
        }
        let next = inner.pending_messages.pop_front()?;
        if next.packet.requires_message_id() {
            inner.in_flight.insert(next.packet.message_id());
        }
        Some(next)
    }

    /// Block until there is something to send.
    ///
    /// Flows always go before publishes, and publishes wait while the
    /// in-flight window is full. While idle the keep-alive is checked and
    /// a PINGREQ queued when due. Returns `Ok(None)` once the session is
    /// disconnected, and [`Error::KeepAliveTimeout`] if a ping went
    /// unanswered for a whole interval.
    pub fn get(&self) -> Result<Option<Outbound>, Error> {
        let mut inner = self.lock();
        loop {
            if let Some(work) = self.next_work(&mut inner) {
                return Ok(Some(work));
            }
            if inner.disconnect_sent || (!inner.connected && !inner.connecting) {
                return Ok(None);
            }
            let wait = if inner.connected {
                self.check_for_activity(&mut inner)?
            } else {
                None
            };
            if let Some(work) = self.next_work(&mut inner) {
                return Ok(Some(work));
            }
            inner = match wait {
                Some(timeout) => {
                    self.work
                        .wait_timeout(inner, timeout.max(Duration::from_millis(1)))
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self.work.wait(inner).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Non-blocking variant of [`get`](Self::get) without keep-alive.
    pub fn try_get(&self) -> Option<Outbound> {
        let mut inner = self.lock();
        self.next_work(&mut inner)
    }

    /// Queue a PINGREQ if the connection has been idle for a keep-alive
    /// interval. Returns how long the sender may sleep before the next
    /// check, or `None` if keep-alive is off.
    fn check_for_activity(&self, inner: &mut Inner) -> Result<Option<Duration>, Error> {
        let Some(keep_alive) = inner.settings.keep_alive else {
            return Ok(None);
        };
        if inner.pings_outstanding > 0 {
            let since_ping = inner.last_ping.elapsed();
            if since_ping >= keep_alive {
                log::warn!(
                    "{}: no PINGRESP within {} ms",
                    self.client_id,
                    keep_alive.as_millis()
                );
                return Err(Error::KeepAliveTimeout);
            }
            return Ok(Some(keep_alive - since_ping));
        }
        let idle = self.activity.since_outbound().max(self.activity.since_inbound());
        if idle < keep_alive {
            return Ok(Some(keep_alive - idle));
        }

        log::debug!("{}: idle for {} ms, sending PINGREQ", self.client_id, idle.as_millis());
        let token = Token::new();
        if let Err(e) = self.tokens.save_token(TokenKey::Ping, &token) {
            log::debug!("{}: not pinging: {e}", self.client_id);
            return Ok(Some(keep_alive));
        }
        inner.pending_flows.push_front(Outbound {
            packet: Packet::Pingreq,
            token: Some(token),
        });
        inner.pings_outstanding += 1;
        inner.last_ping = Instant::now();
        Ok(Some(keep_alive))
    }

    /// Record that `work` has been written to the network.
    ///
    /// Once DISCONNECT is written [`get`](Self::get) returns `Ok(None)`
    /// until the next connection attempt.
    pub fn notify_sent(&self, work: &Outbound) {
        self.activity.record_outbound();
        log::debug!("{}: sent {}", self.client_id, work.packet);
        if matches!(work.packet, Packet::Disconnect) {
            self.lock().disconnect_sent = true;
            self.work.notify_all();
        }
        let Some(token) = &work.token else {
            return;
        };
        token.mark_sent();
        match &work.packet {
            Packet::Publish(publish) if publish.qos == QoS::AtMostOnce => {
                if let Some(key) = token.key() {
                    self.tokens.remove(&key);
                }
                if token.complete(None, None) {
                    self.callbacks.delivery_complete(token.clone());
                }
                self.drained.notify_all();
            }
            Packet::Disconnect => {
                self.tokens.remove(&TokenKey::Disconnect);
            }
            _ => {}
        }
    }

    /// Handle an acknowledgement from the broker.
    ///
    /// An ack that matches nothing outstanding is dropped. A refused
    /// CONNACK is returned as an error after failing the connect token.
    pub fn notify_received_ack(&self, ack: Packet) -> Result<(), Error> {
        self.activity.record_inbound();
        log::debug!("{}: received {ack}", self.client_id);
        let Some(key) = TokenKey::for_response(&ack) else {
            log::warn!("{}: {ack} is not an acknowledgement", self.client_id);
            return Ok(());
        };
        let token = self.tokens.get(&key);
        let mut inner = self.lock();

        match &ack {
            Packet::Pubrec { message_id } => {
                let id = *message_id;
                if !inner.outbound_qos2.contains_key(&id) {
                    log::warn!("{}: PUBREC for unknown message {id}", self.client_id);
                    return Ok(());
                }
                self.enqueue(&mut inner, Packet::Pubrel { message_id: id }, None)?;
            }
            Packet::Puback { message_id } | Packet::Pubcomp { message_id } => {
                let id = *message_id;
                let known = match &ack {
                    Packet::Puback { .. } => inner.outbound_qos1.remove(&id).is_some(),
                    _ => inner.outbound_qos2.remove(&id).is_some(),
                };
                if !known && token.is_none() {
                    log::warn!("{}: {ack} for unknown message", self.client_id);
                    return Ok(());
                }
                self.discard(&mut inner, &sent_key(id));
                if matches!(ack, Packet::Pubcomp { .. }) {
                    self.discard(&mut inner, &confirmed_key(id));
                    inner.in_flight_pubrels = inner.in_flight_pubrels.saturating_sub(1);
                }
                inner.in_flight.remove(&id);
                inner.release_message_id(id);
                if let Some(token) = token {
                    self.tokens.remove(&key);
                    if token.complete(Some(ack.clone()), None) {
                        self.callbacks.delivery_complete(token);
                    }
                }
                self.work.notify_all();
                self.drained.notify_all();
            }
            Packet::Connack(connack) => {
                let Some(token) = token else {
                    log::warn!("{}: unexpected CONNACK", self.client_id);
                    return Ok(());
                };
                self.tokens.remove(&key);
                if connack.code != ConnackCode::Accepted {
                    inner.connecting = false;
                    let err = Error::ConnectionRefused(connack.code);
                    token.fail(err.clone());
                    return Err(err);
                }
                if inner.settings.clean_session {
                    self.clear_state(&mut inner);
                }
                inner.in_flight.clear();
                inner.in_flight_pubrels = 0;
                inner.pings_outstanding = 0;
                self.restore_inflight(&mut inner);
                inner.connected = true;
                inner.connecting = false;
                log::info!(
                    "{}: connected, session present {}",
                    self.client_id,
                    connack.session_present
                );
                token.complete(Some(ack.clone()), None);
                self.work.notify_all();
            }
            Packet::Pingresp => {
                inner.pings_outstanding = 0;
                if let Some(token) = token {
                    self.tokens.remove(&key);
                    token.complete(Some(ack.clone()), None);
                }
            }
            Packet::Suback(_) | Packet::Unsuback { .. } => {
                let id = ack.message_id();
                inner.release_message_id(id);
                match token {
                    Some(token) => {
                        self.tokens.remove(&key);
                        token.complete(Some(ack.clone()), None);
                    }
                    None => log::warn!("{}: {ack} for unknown request", self.client_id),
                }
                self.drained.notify_all();
            }
            _ => {}
        }
        Ok(())
    }

    /// Rebuild the send queues from the outbound tables after CONNACK.
    fn restore_inflight(&self, inner: &mut Inner) {
        let mut publishes: Vec<Publish> = inner.outbound_qos1.values().cloned().collect();
        let mut pubrels: Vec<u16> = Vec::new();
        for (id, entry) in &inner.outbound_qos2 {
            if entry.released {
                pubrels.push(*id);
            } else {
                publishes.push(entry.publish.clone());
            }
        }
        publishes.sort_by_key(|p| p.message_id);
        pubrels.sort_unstable();

        let publishes = reorder(publishes, |p| p.message_id);
        let pubrels = reorder(pubrels, |id| *id);
        if !publishes.is_empty() || !pubrels.is_empty() {
            log::debug!(
                "{}: resending {} publishes and {} PUBRELs",
                self.client_id,
                publishes.len(),
                pubrels.len()
            );
        }

        let mut flows: VecDeque<Outbound> = VecDeque::new();
        for id in pubrels {
            if let Some(entry) = inner.outbound_qos2.get(&id) {
                self.tokens.restore_token(&entry.publish);
            }
            flows.push_back(Outbound {
                packet: Packet::Pubrel { message_id: id },
                token: None,
            });
        }
        flows.extend(inner.pending_flows.drain(..));
        inner.pending_flows = flows;

        let mut messages = VecDeque::new();
        for mut publish in publishes {
            publish.dup = true;
            let token = self.tokens.restore_token(&publish);
            messages.push_back(Outbound {
                packet: Packet::Publish(publish),
                token: Some(token),
            });
        }
        messages.extend(inner.pending_messages.drain(..));
        inner.pending_messages = messages;
    }

    /// Handle an inbound PUBLISH or PUBREL.
    ///
    /// QoS 0 and 1 messages go straight to the dispatcher. QoS 2 messages
    /// are persisted and answered with PUBREC, and reach the dispatcher
    /// once the matching PUBREL arrives. Ignored while quiescing.
    pub fn notify_received_msg(&self, packet: Packet) -> Result<(), Error> {
        self.activity.record_inbound();
        log::debug!("{}: received {packet}", self.client_id);
        let deliver = {
            let mut inner = self.lock();
            if inner.quiescing {
                log::debug!("{}: quiescing, ignoring {packet}", self.client_id);
                return Ok(());
            }
            match packet {
                Packet::Publish(publish) => match publish.qos {
                    QoS::AtMostOnce | QoS::AtLeastOnce => Some(publish),
                    QoS::ExactlyOnce => {
                        let id = publish.message_id;
                        if !inner.inbound_qos2.contains_key(&id) {
                            let record = to_record(&Packet::Publish(publish.clone()))?;
                            inner.persistence.put(&received_key(id), &record)?;
                            inner.inbound_qos2.insert(
                                id,
                                InboundQos2 {
                                    publish,
                                    delivering: false,
                                },
                            );
                        }
                        self.enqueue_ack(&mut inner, Packet::Pubrec { message_id: id });
                        None
                    }
                },
                Packet::Pubrel { message_id } => {
                    let delivering = inner.inbound_qos2.get(&message_id).map(|e| e.delivering);
                    match delivering {
                        Some(false) => inner.inbound_qos2.get_mut(&message_id).map(|entry| {
                            entry.delivering = true;
                            entry.publish.clone()
                        }),
                        Some(true) => {
                            log::debug!("{}: message {message_id} already being delivered", self.client_id);
                            None
                        }
                        None => {
                            self.enqueue_ack(&mut inner, Packet::Pubcomp { message_id });
                            None
                        }
                    }
                }
                other => {
                    log::warn!("{}: unexpected {other}", self.client_id);
                    None
                }
            }
        };

        if let Some(publish) = deliver {
            let (id, qos) = (publish.message_id, publish.qos);
            if !self.callbacks.message_arrived(publish) && qos == QoS::ExactlyOnce {
                self.redeliver_on_pubrel(id);
            }
        }
        Ok(())
    }

    /// The application did not take `publish`. Nothing is acknowledged; a
    /// QoS 2 message is delivered again on the next PUBREL.
    pub fn message_arrival_failed(&self, publish: &Publish) {
        if publish.qos == QoS::ExactlyOnce {
            self.redeliver_on_pubrel(publish.message_id);
        }
        self.drained.notify_all();
    }

    fn redeliver_on_pubrel(&self, message_id: u16) {
        if let Some(entry) = self.lock().inbound_qos2.get_mut(&message_id) {
            entry.delivering = false;
        }
    }

    /// The application has accepted `publish`: acknowledge it.
    pub fn message_arrived_complete(&self, publish: &Publish) {
        let mut inner = self.lock();
        let id = publish.message_id;
        match publish.qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => self.enqueue_ack(&mut inner, Packet::Puback { message_id: id }),
            QoS::ExactlyOnce => {
                if inner.persistence_open {
                    self.discard(&mut inner, &received_key(id));
                }
                inner.inbound_qos2.remove(&id);
                self.enqueue_ack(&mut inner, Packet::Pubcomp { message_id: id });
            }
        }
        self.drained.notify_all();
    }

    fn is_drained(&self, inner: &Inner) -> bool {
        inner.in_flight.is_empty()
            && inner.pending_flows.is_empty()
            && inner.in_flight_pubrels == 0
            && self.callbacks.is_quiesced()
    }

    /// Stop accepting new requests and give in-flight work up to `timeout`
    /// to finish. Whatever is still queued afterwards is dropped and every
    /// outstanding token fails with [`Error::Disconnecting`].
    pub fn quiesce(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        inner.quiescing = true;
        self.callbacks.quiesce();
        self.work.notify_all();
        log::debug!("{}: quiescing for up to {} ms", self.client_id, timeout.as_millis());

        while !self.is_drained(&inner) {
            let now = Instant::now();
            if now >= deadline {
                log::debug!("{}: quiesce timed out", self.client_id);
                break;
            }
            inner = self
                .drained
                .wait_timeout(inner, (deadline - now).min(QUIESCE_POLL))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        let mut dropped: Vec<Outbound> = inner.pending_messages.drain(..).collect();
        dropped.extend(inner.pending_flows.drain(..));
        inner.in_flight.clear();
        inner.in_flight_pubrels = 0;
        drop(inner);

        for work in dropped {
            if let Some(token) = work.token {
                token.fail(Error::Disconnecting);
            }
        }
        self.tokens.no_more_responses(&Error::Disconnecting);
    }

    /// The connection has gone. Queues are emptied, a clean session is
    /// forgotten, and persistence is closed until the next connect.
    pub fn disconnected(&self, reason: Option<&Error>) {
        let mut inner = self.lock();
        match reason {
            Some(reason) => log::debug!("{}: disconnected: {reason}", self.client_id),
            None => log::debug!("{}: disconnected", self.client_id),
        }
        inner.connected = false;
        inner.connecting = false;
        if inner.settings.clean_session {
            self.clear_state(&mut inner);
        }
        inner.pending_messages.clear();
        inner.pending_flows.clear();
        inner.in_flight.clear();
        inner.in_flight_pubrels = 0;
        inner.pings_outstanding = 0;
        inner.quiescing = false;
        // Identifiers of unanswered subscribes die with the connection.
        let held: HashSet<u16> = inner
            .outbound_qos1
            .keys()
            .chain(inner.outbound_qos2.keys())
            .copied()
            .collect();
        inner.in_use = held;
        for entry in inner.inbound_qos2.values_mut() {
            entry.delivering = false;
        }
        if inner.persistence_open {
            if let Err(e) = inner.persistence.close() {
                log::warn!("{}: failed to close persistence: {e}", self.client_id);
            }
            inner.persistence_open = false;
        }
        self.work.notify_all();
        self.drained.notify_all();
    }

    /// Release the persistence store for good.
    pub fn close(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.persistence_open {
            inner.persistence.close()?;
            inner.persistence_open = false;
        }
        Ok(())
    }

    /// CONNACK accepted and not yet disconnected.
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// New requests are being refused ahead of a disconnect.
    pub fn is_quiescing(&self) -> bool {
        self.lock().quiescing
    }

    /// Number of QoS 1 and 2 publishes sent and not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Publishes queued and not yet handed to the sender.
    pub fn pending_messages(&self) -> usize {
        self.lock().pending_messages.len()
    }

    /// Control packets queued and not yet handed to the sender.
    pub fn pending_flows(&self) -> usize {
        self.lock().pending_flows.len()
    }
}
