//! Receiver thread: reads packets from the transport and feeds them to the
//! session state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use super::codec::{Packet, PacketReader};
use super::comms::Supervisor;
use super::error::Error;
use super::state::ClientState;
use crate::network::Read;
use crate::network::error::Error as NetworkError;

/// Spawn the receiver for one connection.
///
/// The thread runs until `stop` is set and the next read returns, or until
/// a fatal error, which it reports to `supervisor` before exiting.
pub(crate) fn spawn<R>(
    client_id: &str,
    input: R,
    state: Arc<ClientState>,
    supervisor: Weak<dyn Supervisor>,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, Error>
where
    R: Read<Error = NetworkError> + Send + 'static,
{
    let activity = state.activity();
    let reader = PacketReader::new(input).with_progress(move |_| activity.record_inbound());
    let receiver = Receiver {
        client_id: client_id.to_string(),
        reader,
        state,
        supervisor,
        stop,
    };
    thread::Builder::new()
        .name(format!("mqtt-rec-{client_id}"))
        .spawn(move || receiver.run())
        .map_err(|e| Error::Network(e.into()))
}

struct Receiver<R> {
    client_id: String,
    reader: PacketReader<R>,
    state: Arc<ClientState>,
    supervisor: Weak<dyn Supervisor>,
    stop: Arc<AtomicBool>,
}

impl<R> Receiver<R>
where
    R: Read<Error = NetworkError>,
{
    fn run(mut self) {
        log::debug!("{}: receiver started", self.client_id);
        while !self.stop.load(Ordering::SeqCst) {
            let result = match self.reader.read_packet() {
                Ok(Some(packet)) => self.dispatch(packet),
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                if !self.stop.load(Ordering::SeqCst) {
                    log::debug!("{}: receiver stopping: {e}", self.client_id);
                    if let Some(supervisor) = self.supervisor.upgrade() {
                        supervisor.failed(e);
                    }
                }
                break;
            }
        }
        log::debug!("{}: receiver stopped", self.client_id);
    }

    fn dispatch(&self, packet: Packet) -> Result<(), Error> {
        if !packet.is_ack() {
            return self.state.notify_received_msg(packet);
        }
        let is_connack = matches!(packet, Packet::Connack(_));
        self.state.notify_received_ack(packet)?;
        if is_connack {
            if let Some(supervisor) = self.supervisor.upgrade() {
                supervisor.connected();
            }
        }
        Ok(())
    }
}
