//! Sender thread: takes work from the session state and writes it to the
//! transport.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use super::codec::PacketWriter;
use super::comms::Supervisor;
use super::error::Error;
use super::state::ClientState;
use crate::network::Write;
use crate::network::error::Error as NetworkError;

/// Spawn the sender for one connection.
///
/// The thread exits once DISCONNECT is written or the session reports it
/// is disconnected, or after reporting a write failure or keep-alive expiry
/// to `supervisor`.
pub(crate) fn spawn<W>(
    client_id: &str,
    output: W,
    state: Arc<ClientState>,
    supervisor: Weak<dyn Supervisor>,
) -> Result<JoinHandle<()>, Error>
where
    W: Write<Error = NetworkError> + Send + 'static,
{
    let activity = state.activity();
    let mut writer = PacketWriter::new(output).with_progress(move |_| activity.record_outbound());
    let id = client_id.to_string();
    thread::Builder::new()
        .name(format!("mqtt-snd-{client_id}"))
        .spawn(move || {
            log::debug!("{id}: sender started");
            if let Err(e) = run(&state, &mut writer) {
                log::debug!("{id}: sender stopping: {e}");
                if let Some(supervisor) = supervisor.upgrade() {
                    supervisor.failed(e);
                }
            }
            log::debug!("{id}: sender stopped");
        })
        .map_err(|e| Error::Network(e.into()))
}

fn run<W>(state: &ClientState, writer: &mut PacketWriter<W>) -> Result<(), Error>
where
    W: Write<Error = NetworkError>,
{
    while let Some(work) = state.get()? {
        writer.write_packet(&work.packet)?;
        state.notify_sent(&work);
    }
    Ok(())
}
