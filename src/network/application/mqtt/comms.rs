//! Connection lifecycle: starts and stops the transport, the receiver and
//! sender threads and the callback dispatcher around one [`ClientState`].
//!
//! Shutdown always runs in the same order, whoever triggers it:
//!
//! 1. refuse new tokens
//! 2. stop the callback dispatcher, queueing `connection_lost` if the
//!    connection dropped unexpectedly
//! 3. stop the transport and the receiver
//! 4. tell the session it is disconnected, which releases the sender
//! 5. fail whatever tokens are left
//!
//! Each step is best effort. Only one shutdown runs at a time; a worker
//! thread that hits an error while one is already running just exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::codec::{ConnackCode, Connect, LastWill, Packet, ProtocolVersion, Publish};
use super::error::Error;
use super::options::{ConnectOptions, MqttVersion};
use super::state::{ClientState, SessionSettings};
use super::token::{Token, TokenKey};
use super::{receiver, sender};
use crate::network::Transport;

/// Callbacks from the worker threads into the orchestrator.
pub(crate) trait Supervisor: Send + Sync {
    /// CONNACK accepted.
    fn connected(&self);
    /// A worker hit an error the connection cannot survive.
    fn failed(&self, error: Error);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    ShuttingDown,
    Closed,
}

struct Workers {
    receiver: Option<(JoinHandle<()>, Arc<AtomicBool>)>,
    sender: Option<JoinHandle<()>>,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn join(client_id: &str, what: &str, handle: JoinHandle<()>) {
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        log::error!("{client_id}: {what} thread panicked");
    }
}

/// Orchestrates one client's connections.
pub struct Comms<T: Transport> {
    client_id: String,
    me: Weak<Self>,
    state: Arc<ClientState>,
    transport: Mutex<T>,
    lifecycle: Mutex<Lifecycle>,
    lifecycle_changed: Condvar,
    workers: Mutex<Workers>,
}

impl<T: Transport> Comms<T> {
    /// Wrap `transport` and `state`; nothing is started until
    /// [`connect`](Self::connect).
    pub fn new(client_id: impl Into<String>, transport: T, state: Arc<ClientState>) -> Arc<Self> {
        let client_id = client_id.into();
        Arc::new_cyclic(|me| Self {
            client_id,
            me: me.clone(),
            state,
            transport: Mutex::new(transport),
            lifecycle: Mutex::new(Lifecycle::Disconnected),
            lifecycle_changed: Condvar::new(),
            workers: Mutex::new(Workers {
                receiver: None,
                sender: None,
            }),
        })
    }

    /// Session state shared with the worker threads.
    pub fn state(&self) -> &Arc<ClientState> {
        &self.state
    }

    /// See [`Transport::server_uri`].
    pub fn server_uri(&self) -> String {
        relock(&self.transport).server_uri()
    }

    /// Connected and not yet disconnecting.
    pub fn is_connected(&self) -> bool {
        *relock(&self.lifecycle) == Lifecycle::Connected
    }

    /// Error for a request that needs a live connection, if there is none.
    pub fn check_connected(&self) -> Result<(), Error> {
        match *relock(&self.lifecycle) {
            Lifecycle::Connected => Ok(()),
            Lifecycle::Closed => Err(Error::ClientClosed),
            Lifecycle::Disconnecting | Lifecycle::ShuttingDown => Err(Error::Disconnecting),
            Lifecycle::Connecting | Lifecycle::Disconnected => Err(Error::NotConnected),
        }
    }

    fn begin_connect(&self) -> Result<(), Error> {
        let mut lifecycle = relock(&self.lifecycle);
        match *lifecycle {
            Lifecycle::Disconnected => {
                *lifecycle = Lifecycle::Connecting;
                Ok(())
            }
            Lifecycle::Connecting => Err(Error::ConnectInProgress),
            Lifecycle::Connected => Err(Error::AlreadyConnected),
            Lifecycle::Disconnecting | Lifecycle::ShuttingDown => Err(Error::Disconnecting),
            Lifecycle::Closed => Err(Error::ClientClosed),
        }
    }

    /// Connect and wait for CONNACK, up to the options' connection timeout.
    ///
    /// With [`MqttVersion::Default`] a broker that rejects protocol level
    /// 4 is retried once at level 3.
    pub fn connect(&self, options: &ConnectOptions) -> Result<Token, Error> {
        options.validate()?;
        self.begin_connect()?;
        let mut version = options.mqtt_version.first_attempt();
        loop {
            log::info!(
                "{}: connecting to {} with {}",
                self.client_id,
                self.server_uri(),
                version.name()
            );
            let token = Token::new();
            let result = self
                .start_connection(options, version, &token)
                .and_then(|()| token.wait_timeout(options.connect_timeout()));
            let error = match result {
                Ok(()) if self.await_connected() => return Ok(token),
                Ok(()) => Error::ConnectionLost,
                Err(e) => e,
            };
            self.shutdown(None, Some(error.clone()));

            let fallback = options.mqtt_version == MqttVersion::Default
                && version == ProtocolVersion::V311
                && error == Error::ConnectionRefused(ConnackCode::UnacceptableProtocolVersion);
            if !fallback {
                log::warn!("{}: connect failed: {error}", self.client_id);
                return Err(error);
            }
            log::info!("{}: broker rejected {}, retrying", self.client_id, version.name());
            version = ProtocolVersion::V31;
            self.begin_connect()?;
        }
    }

    /// The receiver completes the connect token just before it marks the
    /// connection up; wait for it to do so, or for a shutdown.
    fn await_connected(&self) -> bool {
        let mut lifecycle = relock(&self.lifecycle);
        while *lifecycle == Lifecycle::Connecting {
            lifecycle = self
                .lifecycle_changed
                .wait(lifecycle)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *lifecycle == Lifecycle::Connected
    }

    fn start_connection(&self, options: &ConnectOptions, version: ProtocolVersion, token: &Token) -> Result<(), Error> {
        self.state.tokens().open();
        self.state.connecting(SessionSettings {
            clean_session: options.clean_session,
            keep_alive: options.keep_alive(),
            max_inflight: options.max_inflight,
        })?;

        let connect = Packet::Connect(Connect {
            version,
            client_id: self.client_id.clone(),
            clean_session: options.clean_session,
            keep_alive: options.keep_alive_interval,
            will: options.will.as_ref().map(LastWill::from),
            username: options.username.clone(),
            password: options.password.as_ref().map(|p| p.clone().into_bytes()),
        });
        // Queued before the sender exists, so it is the first thing written.
        self.state.send(connect, Some(token.clone()))?;

        let session = Arc::downgrade(&self.state);
        self.state.callbacks().start(
            options.inbound_queue_depth,
            Box::new(move |publish: &Publish, accepted: bool| {
                if let Some(state) = session.upgrade() {
                    if accepted {
                        state.message_arrived_complete(publish);
                    } else {
                        state.message_arrival_failed(publish);
                    }
                }
            }),
        )?;

        let (input, output) = {
            let mut transport = relock(&self.transport);
            transport.start()?;
            (transport.input_stream()?, transport.output_stream()?)
        };

        let supervisor: Weak<dyn Supervisor> = self.me.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let receiver = receiver::spawn(
            &self.client_id,
            input,
            self.state.clone(),
            supervisor.clone(),
            stop.clone(),
        )?;
        relock(&self.workers).receiver = Some((receiver, stop));
        let sender = sender::spawn(&self.client_id, output, self.state.clone(), supervisor)?;
        relock(&self.workers).sender = Some(sender);
        Ok(())
    }

    /// Queue a request, shutting the connection down if message
    /// identifiers have run out.
    pub fn send(&self, packet: Packet, token: Token) -> Result<(), Error> {
        match self.state.send(packet, Some(token)) {
            Err(Error::NoMessageIdsAvailable) => {
                log::error!("{}: no message identifiers left", self.client_id);
                self.shutdown(None, Some(Error::NoMessageIdsAvailable));
                Err(Error::NoMessageIdsAvailable)
            }
            other => other,
        }
    }

    /// Quiesce for up to `quiesce_timeout`, send DISCONNECT and shut down.
    pub fn disconnect(&self, quiesce_timeout: Duration) -> Result<(), Error> {
        if self.state.callbacks().is_on_callback_thread() {
            return Err(Error::DisconnectProhibited);
        }
        self.begin_disconnect()?;
        log::info!("{}: disconnecting", self.client_id);
        self.state.quiesce(quiesce_timeout);

        let token = Token::new();
        let sent = self
            .state
            .send(Packet::Disconnect, Some(token.clone()))
            .and_then(|()| token.wait_until_sent());
        if let Err(e) = sent {
            log::debug!("{}: DISCONNECT not sent: {e}", self.client_id);
        }
        self.shutdown(Some(token), None);
        Ok(())
    }

    /// Shut down without sending DISCONNECT. Allowed from a callback, in
    /// which case in-flight work is not waited for.
    pub fn disconnect_forcibly(&self, quiesce_timeout: Duration) -> Result<(), Error> {
        self.begin_disconnect()?;
        log::info!("{}: disconnecting forcibly", self.client_id);
        if !self.state.callbacks().is_on_callback_thread() {
            self.state.quiesce(quiesce_timeout);
        }
        self.shutdown(None, None);
        Ok(())
    }

    fn begin_disconnect(&self) -> Result<(), Error> {
        let mut lifecycle = relock(&self.lifecycle);
        match *lifecycle {
            Lifecycle::Connected | Lifecycle::Connecting => {
                *lifecycle = Lifecycle::Disconnecting;
                Ok(())
            }
            Lifecycle::Disconnected => Err(Error::NotConnected),
            Lifecycle::Disconnecting | Lifecycle::ShuttingDown => Err(Error::Disconnecting),
            Lifecycle::Closed => Err(Error::ClientClosed),
        }
    }

    /// Tear the connection down. `reason` is `None` for a requested
    /// disconnect.
    pub fn shutdown(&self, disconnect_token: Option<Token>, reason: Option<Error>) {
        self.shutdown_connection(disconnect_token, reason, false);
    }

    fn shutdown_connection(&self, disconnect_token: Option<Token>, reason: Option<Error>, from_worker: bool) {
        let was_connected = {
            let mut lifecycle = relock(&self.lifecycle);
            loop {
                match *lifecycle {
                    Lifecycle::ShuttingDown if from_worker => return,
                    Lifecycle::ShuttingDown => {
                        lifecycle = self
                            .lifecycle_changed
                            .wait(lifecycle)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    Lifecycle::Disconnected | Lifecycle::Closed => {
                        if let Some(token) = disconnect_token {
                            token.complete(None, None);
                        }
                        return;
                    }
                    _ => break,
                }
            }
            let was_connected = *lifecycle == Lifecycle::Connected;
            *lifecycle = Lifecycle::ShuttingDown;
            was_connected
        };

        match &reason {
            Some(e) if was_connected => log::error!("{}: connection lost: {e}", self.client_id),
            Some(e) => log::debug!("{}: shutting down: {e}", self.client_id),
            None => log::debug!("{}: shutting down", self.client_id),
        }
        let cause = reason.clone().unwrap_or(Error::Disconnecting);
        let tokens = self.state.tokens();
        tokens.close(cause.clone());

        let lost = if was_connected { reason.clone() } else { None };
        self.state.callbacks().stop(lost);

        if let Err(e) = relock(&self.transport).stop() {
            log::debug!("{}: transport stop failed: {e}", self.client_id);
        }

        let (receiver, sender) = {
            let mut workers = relock(&self.workers);
            (workers.receiver.take(), workers.sender.take())
        };
        if let Some((handle, stop)) = receiver {
            stop.store(true, Ordering::SeqCst);
            join(&self.client_id, "receiver", handle);
        }

        self.state.disconnected(reason.as_ref());

        if let Some(handle) = sender {
            join(&self.client_id, "sender", handle);
        }

        tokens.no_more_responses(&cause);
        if let Some(token) = tokens.remove(&TokenKey::Disconnect) {
            token.complete(None, None);
        }
        if let Some(token) = disconnect_token {
            token.complete(None, None);
        }

        *relock(&self.lifecycle) = Lifecycle::Disconnected;
        self.lifecycle_changed.notify_all();
        log::info!("{}: disconnected", self.client_id);
    }

    /// Release the client for good. Only allowed while disconnected.
    pub fn close(&self) -> Result<(), Error> {
        {
            let mut lifecycle = relock(&self.lifecycle);
            match *lifecycle {
                Lifecycle::Closed => return Ok(()),
                Lifecycle::Disconnected => *lifecycle = Lifecycle::Closed,
                Lifecycle::Connected => return Err(Error::AlreadyConnected),
                Lifecycle::Connecting => return Err(Error::ConnectInProgress),
                Lifecycle::Disconnecting | Lifecycle::ShuttingDown => return Err(Error::Disconnecting),
            }
        }
        self.state.tokens().close(Error::ClientClosed);
        self.state.callbacks().join_retired();
        log::debug!("{}: closed", self.client_id);
        self.state.close()
    }
}

impl<T: Transport> Supervisor for Comms<T> {
    fn connected(&self) {
        let mut lifecycle = relock(&self.lifecycle);
        if *lifecycle == Lifecycle::Connecting {
            *lifecycle = Lifecycle::Connected;
            self.lifecycle_changed.notify_all();
        }
    }

    fn failed(&self, error: Error) {
        self.shutdown_connection(None, Some(error), true);
    }
}

impl<T: Transport> std::fmt::Debug for Comms<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comms")
            .field("client_id", &self.client_id)
            .field("lifecycle", &*relock(&self.lifecycle))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::application::mqtt::callback::CallbackDispatcher;
    use crate::network::application::mqtt::codec::{MAX_MESSAGE_ID, MIN_MESSAGE_ID, QoS, Subscribe};
    use crate::network::application::mqtt::token::TokenStore;
    use crate::network::error::Error as NetworkError;
    use crate::network::{Read, Write};
    use crate::storage::MemoryPersistence;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;

    /// Input on which nothing ever arrives.
    struct Silent;

    impl Read for Silent {
        type Error = NetworkError;

        fn read(&mut self, _: &mut [u8]) -> Result<usize, Self::Error> {
            thread::sleep(Duration::from_millis(5));
            Err(NetworkError::Timeout)
        }
    }

    /// Output that swallows everything.
    struct Sink;

    impl Write for Sink {
        type Error = NetworkError;

        fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    /// A transport to a broker that never answers.
    struct Idle {
        stops: Arc<AtomicUsize>,
    }

    impl Transport for Idle {
        type Input = Silent;
        type Output = Sink;

        fn start(&mut self) -> Result<(), NetworkError> {
            Ok(())
        }

        fn input_stream(&mut self) -> Result<Silent, NetworkError> {
            Ok(Silent)
        }

        fn output_stream(&mut self) -> Result<Sink, NetworkError> {
            Ok(Sink)
        }

        fn stop(&mut self) -> Result<(), NetworkError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn server_uri(&self) -> String {
            "test://idle".to_string()
        }
    }

    fn new_comms() -> (Arc<Comms<Idle>>, Arc<AtomicUsize>) {
        let stops = Arc::new(AtomicUsize::new(0));
        let state = ClientState::new(
            "t",
            "test://idle",
            Box::new(MemoryPersistence::new()),
            Arc::new(TokenStore::new("t")),
            Arc::new(CallbackDispatcher::new("t")),
        )
        .unwrap();
        let comms = Comms::new("t", Idle { stops: stops.clone() }, Arc::new(state));
        (comms, stops)
    }

    fn set_lifecycle(comms: &Comms<Idle>, lifecycle: Lifecycle) {
        *relock(&comms.lifecycle) = lifecycle;
    }

    fn subscribe() -> Packet {
        Packet::Subscribe(Subscribe {
            message_id: 0,
            filters: vec![("a/b".to_string(), QoS::AtLeastOnce)],
        })
    }

    #[test]
    fn test_requests_rejected_in_wrong_lifecycle() {
        let (comms, stops) = new_comms();
        assert_eq!(comms.check_connected(), Err(Error::NotConnected));
        assert_eq!(comms.disconnect(Duration::ZERO), Err(Error::NotConnected));

        set_lifecycle(&comms, Lifecycle::Connected);
        assert_eq!(comms.close(), Err(Error::AlreadyConnected));
        assert_eq!(
            comms.connect(&ConnectOptions::default()).err(),
            Some(Error::AlreadyConnected)
        );

        set_lifecycle(&comms, Lifecycle::Connecting);
        assert_eq!(comms.check_connected(), Err(Error::NotConnected));
        assert_eq!(comms.close(), Err(Error::ConnectInProgress));
        assert_eq!(
            comms.connect(&ConnectOptions::default()).err(),
            Some(Error::ConnectInProgress)
        );

        set_lifecycle(&comms, Lifecycle::ShuttingDown);
        assert_eq!(comms.check_connected(), Err(Error::Disconnecting));

        set_lifecycle(&comms, Lifecycle::Disconnected);
        assert_eq!(comms.close(), Ok(()));
        assert_eq!(comms.close(), Ok(()));
        assert_eq!(comms.check_connected(), Err(Error::ClientClosed));
        assert_eq!(
            comms.connect(&ConnectOptions::default()).err(),
            Some(Error::ClientClosed)
        );
        assert_eq!(comms.disconnect(Duration::ZERO), Err(Error::ClientClosed));
        assert_eq!(stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_simultaneous_failures_shut_down_once() {
        let (comms, stops) = new_comms();
        set_lifecycle(&comms, Lifecycle::Connected);
        let token = Token::new();
        comms.state().tokens().save_token(TokenKey::MessageId(9), &token).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let comms = comms.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    comms.failed(Error::ConnectionLost);
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(*relock(&comms.lifecycle), Lifecycle::Disconnected);
        assert_eq!(token.error(), Some(Error::ConnectionLost));

        comms.failed(Error::ConnectionLost);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_running_out_of_message_ids_shuts_down() {
        let (comms, stops) = new_comms();
        set_lifecycle(&comms, Lifecycle::Connected);
        for _ in MIN_MESSAGE_ID..=MAX_MESSAGE_ID {
            comms.state().send(subscribe(), None).unwrap();
        }

        let token = Token::new();
        assert_eq!(comms.send(subscribe(), token), Err(Error::NoMessageIdsAvailable));
        assert_eq!(*relock(&comms.lifecycle), Lifecycle::Disconnected);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(comms.state().pending_flows(), 0);
    }

    #[test]
    fn test_connect_times_out_without_connack() {
        let (comms, stops) = new_comms();
        let options = ConnectOptions {
            connection_timeout: 1,
            ..Default::default()
        };
        assert_eq!(comms.connect(&options).err(), Some(Error::ClientTimeout));
        assert!(!comms.is_connected());
        assert_eq!(*relock(&comms.lifecycle), Lifecycle::Disconnected);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(relock(&comms.workers).sender.is_none());
    }
}
