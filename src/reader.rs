//! Chip detection tracking
//!
//! [`ChipReader`] runs the adapter's background search and turns each
//! batch of detected ids into connect and disconnect events.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use echip_core::transport::Transport;
use echip_core::RomId;
use echip_ds2490::{AdapterConfig, OneWireAdapter};
use log::{debug, info};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::chip::Chip;
use crate::error::Result;

/// Change in the set of chips on the bus
pub enum ChipEvent<T: Transport> {
    /// A chip of a known family appeared
    Connected(Chip<T>),
    /// A previously connected chip is gone
    Disconnected(RomId),
}

impl<T: Transport> std::fmt::Debug for ChipEvent<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChipEvent::Connected(chip) => write!(f, "Connected({:?})", chip),
            ChipEvent::Disconnected(id) => write!(f, "Disconnected({})", id),
        }
    }
}

/// Diffs detected batches against the chips already reported
struct Tracker<T: Transport> {
    adapter: OneWireAdapter<T>,
    active: Mutex<BTreeSet<RomId>>,
    events: UnboundedSender<ChipEvent<T>>,
}

impl<T: Transport> Tracker<T> {
    fn update(&self, detected: Vec<RomId>) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);

        for id in &detected {
            if active.contains(id) {
                continue;
            }
            // Unknown families are ignored
            if let Some(chip) = Chip::new(self.adapter.clone(), *id) {
                info!("{} connected: {}", chip.family(), id);
                active.insert(*id);
                if self.events.send(ChipEvent::Connected(chip)).is_err() {
                    debug!("Event receiver dropped, connect of {} not reported", id);
                }
            }
        }

        let gone: Vec<RomId> = active
            .iter()
            .filter(|id| !detected.contains(id))
            .copied()
            .collect();
        for id in gone {
            active.remove(&id);
            if let Some(family) = id.family() {
                info!("{} disconnected: {}", family, id);
            }
            if self.events.send(ChipEvent::Disconnected(id)).is_err() {
                debug!("Event receiver dropped, disconnect of {} not reported", id);
            }
        }
    }
}

/// A claimed adapter with its background search running
pub struct ChipReader<T: Transport> {
    adapter: OneWireAdapter<T>,
}

impl<T: Transport> ChipReader<T> {
    /// Claim the adapter and start watching the bus.
    ///
    /// Must be called from within a tokio runtime. Events arrive on the
    /// returned receiver.
    pub async fn open(
        transport: T,
        config: AdapterConfig,
    ) -> Result<(Self, UnboundedReceiver<ChipEvent<T>>)> {
        let adapter = OneWireAdapter::new(transport, config);
        adapter.claim().await?;
        info!("Chip reader connected");

        let (events, receiver) = unbounded_channel();
        let tracker = Tracker {
            adapter: adapter.clone(),
            active: Mutex::new(BTreeSet::new()),
            events,
        };
        adapter.on_detect(move |ids| tracker.update(ids));
        adapter.start_search()?;

        Ok((Self { adapter }, receiver))
    }

    /// The underlying adapter
    pub fn adapter(&self) -> &OneWireAdapter<T> {
        &self.adapter
    }

    /// Stop searching and release the adapter.
    pub async fn close(&self) {
        self.adapter.close().await;
        info!("Chip reader disconnected");
    }
}

impl<T: Transport> Drop for ChipReader<T> {
    fn drop(&mut self) {
        // Chips handed out keep the adapter alive, only the search goes
        self.adapter.abort_search();
    }
}
