//! Completion tokens and the store that correlates them with responses.
//!
//! Every request the client sends is tracked by a [`Token`]. The caller
//! keeps one clone and waits on it; the engine keeps another in the
//! [`TokenStore`], keyed by message identifier or by the singleton role of
//! the request, and completes it when the matching response arrives or the
//! connection goes away.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::codec::{Packet, Publish, QoS};
use super::error::Error;

/// Identity under which a token is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKey {
    /// Requests carrying a message identifier.
    MessageId(u16),
    /// The single outstanding CONNECT.
    Connect,
    /// The single outstanding DISCONNECT.
    Disconnect,
    /// The single outstanding PINGREQ.
    Ping,
    /// QoS 0 publishes, which have no identifier on the wire.
    Local(u64),
}

impl TokenKey {
    /// Key of the request that `response` answers, if it answers one.
    pub fn for_response(response: &Packet) -> Option<TokenKey> {
        match response {
            Packet::Connack(_) => Some(TokenKey::Connect),
            Packet::Pingresp => Some(TokenKey::Ping),
            Packet::Puback { message_id }
            | Packet::Pubrec { message_id }
            | Packet::Pubcomp { message_id }
            | Packet::Unsuback { message_id } => Some(TokenKey::MessageId(*message_id)),
            Packet::Suback(suback) => Some(TokenKey::MessageId(suback.message_id)),
            _ => None,
        }
    }

    /// Key a request is tracked under. QoS 0 publishes and pure acks have
    /// none of their own.
    pub fn for_request(request: &Packet) -> Option<TokenKey> {
        match request {
            Packet::Connect(_) => Some(TokenKey::Connect),
            Packet::Disconnect => Some(TokenKey::Disconnect),
            Packet::Pingreq => Some(TokenKey::Ping),
            Packet::Publish(p) if p.qos != QoS::AtMostOnce => Some(TokenKey::MessageId(p.message_id)),
            Packet::Subscribe(s) => Some(TokenKey::MessageId(s.message_id)),
            Packet::Unsubscribe(u) => Some(TokenKey::MessageId(u.message_id)),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct TokenState {
    key: Option<TokenKey>,
    message_id: u16,
    message: Option<Publish>,
    sent: bool,
    complete: bool,
    error: Option<Error>,
    response: Option<Packet>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<TokenState>,
    changed: Condvar,
}

/// Handle on the outcome of one request.
///
/// Clones refer to the same request. A token completes exactly once; later
/// attempts to complete it are ignored.
#[derive(Clone, Default)]
pub struct Token {
    shared: Arc<Shared>,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Token")
            .field("key", &state.key)
            .field("sent", &state.sent)
            .field("complete", &state.complete)
            .field("error", &state.error)
            .finish()
    }
}

impl Token {
    /// A fresh, incomplete token.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token tracking delivery of `publish`.
    pub(crate) fn for_publish(publish: &Publish) -> Self {
        let token = Self::new();
        token.set_message(publish);
        token
    }

    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the request completes.
    pub fn wait(&self) -> Result<(), Error> {
        let mut state = self.lock();
        while !state.complete {
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.error.clone().map_or(Ok(()), Err)
    }

    /// Block until the request completes or `timeout` elapses.
    ///
    /// Expiry yields [`Error::ClientTimeout`]; the request itself stays
    /// outstanding and may still complete later.
    pub fn wait_for(&self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while !state.complete {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::ClientTimeout);
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        state.error.clone().map_or(Ok(()), Err)
    }

    /// Wait with an optional bound; `None` waits indefinitely.
    pub fn wait_timeout(&self, timeout: Option<Duration>) -> Result<(), Error> {
        match timeout {
            Some(timeout) => self.wait_for(timeout),
            None => self.wait(),
        }
    }

    /// Block until the request has been written to the network, or has
    /// failed without being written.
    pub fn wait_until_sent(&self) -> Result<(), Error> {
        let mut state = self.lock();
        while !state.sent && !state.complete {
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match &state.error {
            Some(e) if !state.sent => Err(e.clone()),
            _ => Ok(()),
        }
    }

    /// Completed, successfully or not.
    pub fn is_complete(&self) -> bool {
        self.lock().complete
    }

    /// Written to the network.
    pub fn is_sent(&self) -> bool {
        self.lock().sent
    }

    /// The failure the request completed with, if any.
    pub fn error(&self) -> Option<Error> {
        self.lock().error.clone()
    }

    /// Message identifier assigned to the request, or 0.
    pub fn message_id(&self) -> u16 {
        self.lock().message_id
    }

    /// The message a delivery token tracks.
    pub fn message(&self) -> Option<Publish> {
        self.lock().message.clone()
    }

    /// The packet that completed the request, if it was answered.
    pub fn response(&self) -> Option<Packet> {
        self.lock().response.clone()
    }

    /// SUBACK return codes: the granted QoS per filter, or 0x80 for a
    /// rejected filter.
    pub fn granted_qos(&self) -> Option<Vec<u8>> {
        match &self.lock().response {
            Some(Packet::Suback(suback)) => Some(suback.return_codes.clone()),
            _ => None,
        }
    }

    /// Whether the broker resumed an existing session, from CONNACK.
    pub fn session_present(&self) -> bool {
        matches!(&self.lock().response, Some(Packet::Connack(c)) if c.session_present)
    }

    /// Whether two handles refer to the same request.
    pub fn same_as(&self, other: &Token) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn key(&self) -> Option<TokenKey> {
        self.lock().key
    }

    pub(crate) fn set_key(&self, key: TokenKey) {
        self.lock().key = Some(key);
    }

    pub(crate) fn set_message_id(&self, id: u16) {
        let mut state = self.lock();
        state.message_id = id;
        if let Some(message) = &mut state.message {
            message.message_id = id;
        }
    }

    /// Attach the message a delivery token tracks.
    pub(crate) fn set_message(&self, publish: &Publish) {
        let mut state = self.lock();
        state.message_id = publish.message_id;
        state.message = Some(publish.clone());
    }

    pub(crate) fn mark_sent(&self) {
        let mut state = self.lock();
        state.sent = true;
        self.shared.changed.notify_all();
    }

    /// Complete the token. Returns `false` if it was already complete.
    pub(crate) fn complete(&self, response: Option<Packet>, error: Option<Error>) -> bool {
        let mut state = self.lock();
        if state.complete {
            return false;
        }
        state.complete = true;
        state.response = response;
        state.error = error;
        self.shared.changed.notify_all();
        true
    }

    pub(crate) fn fail(&self, error: Error) -> bool {
        self.complete(None, Some(error))
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    tokens: HashMap<TokenKey, Token>,
    closed: Option<Error>,
    next_local: u64,
}

/// Outstanding tokens, keyed by [`TokenKey`].
#[derive(Debug)]
pub struct TokenStore {
    client_id: String,
    inner: Mutex<StoreInner>,
}

impl TokenStore {
    /// An empty, open store.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            inner: Mutex::new(StoreInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `token` under `key`.
    ///
    /// While the store is closed the token is failed straight away with
    /// the reason the store was closed, and that reason is returned.
    pub fn save_token(&self, key: TokenKey, token: &Token) -> Result<(), Error> {
        let mut inner = self.lock();
        if let Some(reason) = inner.closed.clone() {
            drop(inner);
            token.fail(reason.clone());
            return Err(reason);
        }
        token.set_key(key);
        log::trace!("{}: save token {key:?}", self.client_id);
        inner.tokens.insert(key, token.clone());
        Ok(())
    }

    /// A key for a request with no identifier of its own.
    pub fn next_local_key(&self) -> TokenKey {
        let mut inner = self.lock();
        inner.next_local += 1;
        TokenKey::Local(inner.next_local)
    }

    /// Token saved under `key`.
    pub fn get(&self, key: &TokenKey) -> Option<Token> {
        self.lock().tokens.get(key).cloned()
    }

    /// Forget the token saved under `key` and return it.
    pub fn remove(&self, key: &TokenKey) -> Option<Token> {
        self.lock().tokens.remove(key)
    }

    /// Whether a token is saved under `key`.
    pub fn contains(&self, key: &TokenKey) -> bool {
        self.lock().tokens.contains_key(key)
    }

    /// Number of outstanding tokens.
    pub fn len(&self) -> usize {
        self.lock().tokens.len()
    }

    /// No outstanding tokens.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find or create the delivery token of a publish being restored.
    ///
    /// An incomplete token already stored for the identifier is reused so
    /// that callers still holding it see the eventual outcome.
    pub fn restore_token(&self, publish: &Publish) -> Token {
        let key = TokenKey::MessageId(publish.message_id);
        let mut inner = self.lock();
        if let Some(existing) = inner.tokens.get(&key) {
            if !existing.is_complete() {
                return existing.clone();
            }
        }
        let token = Token::for_publish(publish);
        token.set_key(key);
        log::trace!("{}: restore token {key:?}", self.client_id);
        inner.tokens.insert(key, token.clone());
        token
    }

    /// Delivery tokens of publishes still waiting for their ack.
    pub fn delivery_tokens(&self) -> Vec<Token> {
        let inner = self.lock();
        let mut tokens: Vec<Token> = inner
            .tokens
            .iter()
            .filter(|(key, token)| {
                matches!(key, TokenKey::MessageId(_))
                    && token.message().is_some()
                    && !token.is_complete()
            })
            .map(|(_, token)| token.clone())
            .collect();
        tokens.sort_by_key(Token::message_id);
        tokens
    }

    /// Accept new tokens again.
    pub fn open(&self) {
        self.lock().closed = None;
    }

    /// Refuse new tokens, failing them with `reason`.
    pub fn close(&self, reason: Error) {
        self.lock().closed = Some(reason);
    }

    /// New tokens are being failed.
    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// No response will arrive for any outstanding request: fail and drop
    /// every token except the DISCONNECT one, which the shutdown path
    /// completes itself.
    pub fn no_more_responses(&self, reason: &Error) {
        let failed: Vec<Token> = {
            let mut inner = self.lock();
            let keys: Vec<TokenKey> = inner
                .tokens
                .keys()
                .filter(|key| **key != TokenKey::Disconnect)
                .copied()
                .collect();
            keys.iter().filter_map(|key| inner.tokens.remove(key)).collect()
        };
        if !failed.is_empty() {
            log::debug!(
                "{}: failing {} outstanding tokens: {reason}",
                self.client_id,
                failed.len()
            );
        }
        for token in failed {
            token.fail(reason.clone());
        }
    }

    /// Drop every token without completing it.
    pub fn clear(&self) {
        self.lock().tokens.clear();
    }
}
