//! Simulated BMU answering on an in-memory bus

use std::time::Duration;

use bmu_isotp::transport::mock::MockBus;
use bmu_isotp::{IsoTpSession, LinkConfig, SessionError, SessionEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Echoes every complete message back to the viewer.
///
/// Runs its own ISO-TP session with the viewer's IDs mirrored. Stops when
/// dropped.
pub struct EchoPeer {
    task: JoinHandle<()>,
}

impl EchoPeer {
    pub fn spawn(
        bus: &MockBus,
        viewer: &LinkConfig,
        poll_interval: Duration,
    ) -> Result<Self, SessionError> {
        let mut config = viewer.clone();
        std::mem::swap(&mut config.tx_id, &mut config.rx_id);

        let session = IsoTpSession::open(bus.attach("bmu"), config, poll_interval)?;

        let mut events = session.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Message(payload)) => {
                        debug!(len = payload.len(), "BMU echoing message");
                        if let Err(e) = session.send(&payload).await {
                            warn!(error = %e, "BMU echo failed");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Ok(Self { task })
    }
}

impl Drop for EchoPeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
