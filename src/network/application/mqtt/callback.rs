//! Application callbacks and the thread that runs them.
//!
//! The receiver thread never calls into the application directly. Inbound
//! messages go through a bounded queue, completions through an unbounded
//! one, and a single dispatcher thread drains both, so the application
//! sees one notification at a time. Completions are drained first.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, bounded, select, unbounded};

use super::codec::{Publish, QoS};
use super::error::Error;
use super::token::Token;

/// How often a blocked hand-off rechecks whether the dispatcher stopped.
const HANDOFF_POLL: Duration = Duration::from_millis(100);

/// A message delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Broker-assigned identifier; 0 for QoS 0.
    pub id: u16,
    /// Application payload.
    pub payload: Vec<u8>,
    /// QoS the broker delivered the message with.
    pub qos: QoS,
    /// The broker sent this from its retained store.
    pub retained: bool,
    /// The broker may have delivered this message before.
    pub duplicate: bool,
}

impl From<&Publish> for Message {
    fn from(publish: &Publish) -> Self {
        Message {
            id: publish.message_id,
            payload: publish.payload.clone(),
            qos: publish.qos,
            retained: publish.retain,
            duplicate: publish.dup,
        }
    }
}

/// Notifications the application receives.
///
/// All methods run on the client's dispatcher thread, one at a time. A
/// message is acknowledged to the broker only after
/// [`message_arrived`](Callback::message_arrived) returns, so a panic in
/// it leaves the message unacknowledged.
pub trait Callback: Send {
    /// A message matching one of the client's subscriptions arrived.
    fn message_arrived(&mut self, topic: &str, message: &Message) {
        let _ = (topic, message);
    }

    /// A publish completed: handed to the network for QoS 0, acknowledged
    /// by the broker for QoS 1 and 2.
    fn delivery_complete(&mut self, token: &Token) {
        let _ = token;
    }

    /// The connection dropped without the application asking for it.
    fn connection_lost(&mut self, cause: &Error) {
        let _ = cause;
    }
}

/// Hook run after each inbound message has been offered to the
/// application. The flag is `false` if the callback panicked.
pub type Delivered = Box<dyn Fn(&Publish, bool) + Send>;

type SharedCallback = Arc<Mutex<Option<Box<dyn Callback>>>>;

enum Event {
    Arrived(Publish),
    Delivered(Token),
    Stop(Option<Error>),
}

struct Worker {
    messages: Sender<Publish>,
    events: Sender<Event>,
    stopped: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

/// Runs application callbacks on a dedicated thread.
pub struct CallbackDispatcher {
    client_id: String,
    callback: SharedCallback,
    worker: Mutex<Option<Worker>>,
    retired: Mutex<Vec<JoinHandle<()>>>,
    threads: Arc<Mutex<Vec<ThreadId>>>,
    quiescing: AtomicBool,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CallbackDispatcher {
    /// A dispatcher with no callback installed and no thread running.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            callback: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
            retired: Mutex::new(Vec::new()),
            threads: Arc::new(Mutex::new(Vec::new())),
            quiescing: AtomicBool::new(false),
        }
    }

    /// Install the application callback, replacing any previous one.
    ///
    /// Must not be called from inside a callback.
    pub fn set_callback(&self, callback: Box<dyn Callback>) {
        *relock(&self.callback) = Some(callback);
    }

    /// Start a dispatcher thread with room for `queue_depth` undelivered
    /// messages. `delivered` runs after each message with whether the
    /// application accepted it. A running dispatcher is stopped first.
    pub fn start(&self, queue_depth: usize, delivered: Delivered) -> Result<(), Error> {
        self.stop(None);
        self.join_retired();
        self.quiescing.store(false, Ordering::SeqCst);

        let (messages, message_rx) = bounded(queue_depth.max(1));
        let (events, event_rx) = unbounded();
        let stopped = Arc::new(AtomicBool::new(false));
        let pending = Arc::new(AtomicUsize::new(0));

        let run = Run {
            client_id: self.client_id.clone(),
            callback: self.callback.clone(),
            threads: self.threads.clone(),
            pending: pending.clone(),
            delivered,
        };
        let threads = self.threads.clone();
        let handle = thread::Builder::new()
            .name(format!("mqtt-callback-{}", self.client_id))
            .spawn(move || {
                relock(&threads).push(thread::current().id());
                run.run(message_rx, event_rx);
            })
            .map_err(|e| Error::Network(e.into()))?;

        log::debug!("{}: callback dispatcher started", self.client_id);
        *relock(&self.worker) = Some(Worker {
            messages,
            events,
            stopped,
            pending,
            handle,
        });
        Ok(())
    }

    /// Stop the dispatcher thread.
    ///
    /// Completions already queued are still delivered, undelivered messages
    /// are dropped, and `final_event` (if any) is delivered last as
    /// `connection_lost`. Does not wait for the thread to finish.
    pub fn stop(&self, final_event: Option<Error>) {
        let Some(worker) = relock(&self.worker).take() else {
            return;
        };
        worker.stopped.store(true, Ordering::SeqCst);
        let _ = worker.events.send(Event::Stop(final_event));
        log::debug!("{}: callback dispatcher stopping", self.client_id);
        relock(&self.retired).push(worker.handle);
    }

    /// Wait for stopped dispatcher threads to finish, except the calling
    /// thread itself.
    pub fn join_retired(&self) {
        let current = thread::current().id();
        let handles: Vec<JoinHandle<()>> = relock(&self.retired).drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::error!("{}: callback thread panicked", self.client_id);
            }
        }
    }

    /// Stop taking notice of new work; queued work still runs.
    pub fn quiesce(&self) {
        self.quiescing.store(true, Ordering::SeqCst);
    }

    /// Quiescing and nothing left queued or running.
    pub fn is_quiesced(&self) -> bool {
        if !self.quiescing.load(Ordering::SeqCst) {
            return false;
        }
        relock(&self.worker)
            .as_ref()
            .is_none_or(|w| w.pending.load(Ordering::SeqCst) == 0)
    }

    /// Whether the calling thread is one of this client's dispatcher
    /// threads.
    pub fn is_on_callback_thread(&self) -> bool {
        let current = thread::current().id();
        relock(&self.threads).contains(&current)
    }

    /// Queue an inbound message for the application.
    ///
    /// Blocks while the queue is full. Returns `false` if the dispatcher
    /// is not running or stops before the message could be queued.
    pub fn message_arrived(&self, publish: Publish) -> bool {
        let (messages, stopped, pending) = match relock(&self.worker).as_ref() {
            Some(w) => (w.messages.clone(), w.stopped.clone(), w.pending.clone()),
            None => return false,
        };
        pending.fetch_add(1, Ordering::SeqCst);
        let mut item = publish;
        loop {
            if stopped.load(Ordering::SeqCst) {
                pending.fetch_sub(1, Ordering::SeqCst);
                return false;
            }
            match messages.send_timeout(item, HANDOFF_POLL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    log::trace!("{}: inbound queue full", self.client_id);
                    item = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    pending.fetch_sub(1, Ordering::SeqCst);
                    return false;
                }
            }
        }
    }

    /// Queue a delivery-complete notification.
    pub fn delivery_complete(&self, token: Token) {
        if let Some(w) = relock(&self.worker).as_ref() {
            w.pending.fetch_add(1, Ordering::SeqCst);
            if w.events.send(Event::Delivered(token)).is_err() {
                w.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

impl std::fmt::Debug for CallbackDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackDispatcher")
            .field("client_id", &self.client_id)
            .field("running", &relock(&self.worker).is_some())
            .finish()
    }
}

/// State owned by one dispatcher thread.
struct Run {
    client_id: String,
    callback: SharedCallback,
    threads: Arc<Mutex<Vec<ThreadId>>>,
    pending: Arc<AtomicUsize>,
    delivered: Delivered,
}

impl Run {
    fn run(self, messages: Receiver<Publish>, events: Receiver<Event>) {
        loop {
            let event = match events.try_recv() {
                Ok(event) => Some(event),
                Err(_) => select! {
                    recv(events) -> event => event.ok(),
                    recv(messages) -> message => match message {
                        Ok(publish) => Some(Event::Arrived(publish)),
                        Err(_) => events.recv().ok(),
                    },
                },
            };
            match event {
                Some(Event::Arrived(publish)) => {
                    let message = Message::from(&publish);
                    let accepted = self.invoke("message_arrived", |cb| {
                        cb.message_arrived(&publish.topic, &message)
                    });
                    (self.delivered)(&publish, accepted);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                Some(Event::Delivered(token)) => {
                    self.invoke("delivery_complete", |cb| cb.delivery_complete(&token));
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                Some(Event::Stop(cause)) => {
                    if let Some(cause) = cause {
                        log::info!("{}: connection lost: {cause}", self.client_id);
                        self.invoke("connection_lost", |cb| cb.connection_lost(&cause));
                    }
                    break;
                }
                None => break,
            }
        }
        let current = thread::current().id();
        relock(&self.threads).retain(|id| *id != current);
        log::debug!("{}: callback dispatcher stopped", self.client_id);
    }

    /// Run `f` against the installed callback. Returns `false` if it
    /// panicked.
    fn invoke(&self, what: &str, f: impl FnOnce(&mut dyn Callback)) -> bool {
        let mut guard = relock(&self.callback);
        let Some(callback) = guard.as_mut() else {
            return true;
        };
        match catch_unwind(AssertUnwindSafe(|| f(callback.as_mut()))) {
            Ok(()) => true,
            Err(_) => {
                log::error!("{}: {what} callback panicked", self.client_id);
                false
            }
        }
    }
}
