//! DS2490 bus engine
//!
//! [`OneWireAdapter`] owns the transport and serializes every bus
//! transaction through one lock. Foreground operations and the background
//! ROM search loop compete for that lock; neither preempts the other.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use echip_core::image::{self, Page, PAGE_COUNT, PAGE_SIZE};
use echip_core::transport::{Transport, TransportError};
use echip_core::RomId;
use log::{debug, info, trace, warn};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{error::Elapsed, timeout};

use crate::config::AdapterConfig;
use crate::error::{Error, Phase, Result};
use crate::protocol::*;
use crate::retry::with_retry;
use crate::search::{RomSearch, SearchBus};
use crate::status::{ResultFlags, Status};

/// Receives the ids found by one background search pass
pub type DetectCallback = Arc<dyn Fn(Vec<RomId>) + Send + Sync>;

/// Device resets tried before a reset failure is surfaced
const DEVICE_RESET_ATTEMPTS: usize = 3;

/// Lifecycle state of an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Interface not claimed yet
    Unclaimed,
    /// Claimed and idle
    Claimed,
    /// Claimed, background ROM search running
    Searching,
    /// Closed; the adapter cannot be used again
    Closed,
}

/// DS2490 USB 1-Wire adapter
///
/// Cloning yields another handle to the same adapter.
pub struct OneWireAdapter<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for OneWireAdapter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    bus: Mutex<Bus<T>>,
    config: AdapterConfig,
    claimed: AtomicBool,
    closed: AtomicBool,
    searching: AtomicBool,
    /// A search pass was cut off mid-transaction
    search_aborted: AtomicBool,
    on_detect: StdMutex<Option<DetectCallback>>,
    search_task: StdMutex<Option<JoinHandle<()>>>,
}

impl<T> Inner<T> {
    fn notify(&self, ids: Vec<RomId>) {
        let callback = self
            .on_detect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(ids);
        }
    }
}

impl<T: Transport> OneWireAdapter<T> {
    /// Wrap a transport. Nothing is sent until [`claim`](Self::claim).
    pub fn new(transport: T, config: AdapterConfig) -> Self {
        let bus = Bus {
            transport,
            phase: Phase::Claim,
            transfer_timeout: config.transfer_timeout,
            abandoned: false,
        };
        Self {
            inner: Arc::new(Inner {
                bus: Mutex::new(bus),
                config,
                claimed: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                searching: AtomicBool::new(false),
                search_aborted: AtomicBool::new(false),
                on_detect: StdMutex::new(None),
                search_task: StdMutex::new(None),
            }),
        }
    }

    /// Configuration the adapter was created with
    pub fn config(&self) -> &AdapterConfig {
        &self.inner.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> AdapterState {
        if self.inner.closed.load(Ordering::SeqCst) {
            AdapterState::Closed
        } else if !self.inner.claimed.load(Ordering::SeqCst) {
            AdapterState::Unclaimed
        } else if self.inner.searching.load(Ordering::SeqCst) {
            AdapterState::Searching
        } else {
            AdapterState::Claimed
        }
    }

    /// Claim the adapter's interface and reset it.
    ///
    /// Claiming an already claimed adapter is a no-op. On failure the adapter
    /// stays unclaimed.
    pub async fn claim(&self) -> Result<bool> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let mut bus = self.inner.bus.lock().await;
        if self.inner.claimed.load(Ordering::SeqCst) {
            return Ok(true);
        }
        bus.phase = Phase::Claim;

        let deadline = bus.transfer_timeout;
        let claimed = bus.transport.claim(CONFIGURATION, INTERFACE, ALTERNATE_SETTING);
        match timeout(deadline, claimed).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Error::Claim(e)),
            Err(_) => return Err(Error::Timeout { phase: Phase::Claim }.into_claim()),
        }

        if let Err(e) = bus.device_reset().await {
            warn!("DS2490 handshake failed: {}", e);
            if let Err(e) = bus.transport.release().await {
                warn!("Failed to release interface: {}", e);
            }
            return Err(e.into_claim());
        }

        self.inner.claimed.store(true, Ordering::SeqCst);
        info!("DS2490 1-Wire adapter claimed");
        Ok(true)
    }

    /// Register the receiver of background search results.
    ///
    /// Each completed pass delivers its whole id set as one batch. Replaces
    /// any previously registered callback.
    pub fn on_detect<F>(&self, callback: F)
    where
        F: Fn(Vec<RomId>) + Send + Sync + 'static,
    {
        *self
            .inner
            .on_detect
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Start the background ROM search loop.
    ///
    /// Must be called from within a tokio runtime. Starting an already
    /// running search is a no-op.
    pub fn start_search(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if !self.inner.claimed.load(Ordering::SeqCst) {
            return Err(Error::NotClaimed);
        }
        if self.inner.searching.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let handle = tokio::spawn(search_loop(Arc::clone(&self.inner)));
        if let Some(old) = self
            .inner
            .search_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle)
        {
            old.abort();
        }
        info!("Background ROM search started");
        Ok(())
    }

    /// Stop the background ROM search loop after its current pass.
    pub fn stop_search(&self) {
        if self.inner.searching.swap(false, Ordering::SeqCst) {
            debug!("Background ROM search stopping");
        }
    }

    /// Stop the background search at once and drop the detection callback.
    ///
    /// Unlike [`stop_search`](Self::stop_search) a running pass is cut off;
    /// the adapter is reset before the next transaction. Does not need to
    /// await, so it can run from `Drop`.
    pub fn abort_search(&self) {
        self.inner.searching.store(false, Ordering::SeqCst);
        if self.drop_search() {
            self.inner.search_aborted.store(true, Ordering::SeqCst);
            debug!("Background ROM search aborted");
        }
    }

    /// Abort the search task and forget the callback, which may hold a
    /// handle to this adapter. Returns whether a task was running.
    fn drop_search(&self) -> bool {
        let task = self
            .inner
            .search_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inner
            .on_detect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match task {
            Some(task) => {
                let running = !task.is_finished();
                task.abort();
                running
            }
            None => false,
        }
    }

    /// Run one enumeration of the bus in the foreground.
    pub async fn search(&self) -> Result<Vec<RomId>> {
        let mut bus = self.lock(Phase::Search).await?;
        bus.abandoned = false;
        match timeout(self.inner.config.search_timeout, bus.search_all()).await {
            Ok(Ok(ids)) => Ok(ids),
            Ok(Err(e)) => {
                bus.recover().await;
                Err(e)
            }
            Err(_) => {
                bus.recover().await;
                Err(Error::Timeout {
                    phase: Phase::Search,
                })
            }
        }
    }

    /// Read the whole memory of a chip.
    pub async fn read_all(&self, id: &RomId, overdrive: bool) -> Result<Vec<Page>> {
        with_retry(&self.inner.config.retry, Phase::Read, move || async move {
            let mut bus = self.lock(Phase::Read).await?;
            let pages = bus.read_pages(id, overdrive).await;
            bus.finish(pages)
        })
        .await
    }

    /// Write every page of an image.
    pub async fn write_all(&self, id: &RomId, pages: &[Page], overdrive: bool) -> Result<()> {
        debug!("Writing all {} pages to {}", pages.len(), id);
        with_retry(&self.inner.config.retry, Phase::Write, move || async move {
            let mut bus = self.lock(Phase::Write).await?;
            let mut written = Ok(());
            for (index, page) in pages.iter().enumerate() {
                written = bus.write_page(id, page_address(index), page, overdrive).await;
                if written.is_err() {
                    break;
                }
            }
            bus.finish(written)
        })
        .await
    }

    /// Write only the pages of `new` that differ from `old`.
    pub async fn write_diff(
        &self,
        id: &RomId,
        new: &[Page],
        old: &[Page],
        overdrive: bool,
    ) -> Result<()> {
        if new.len() != old.len() {
            return Err(Error::LengthMismatch {
                new: new.len(),
                old: old.len(),
            });
        }

        let changed: Vec<usize> = image::changed_pages(new, old).map(|(i, _)| i).collect();
        debug!("Writing {} of {} pages to {}", changed.len(), new.len(), id);
        let changed = &changed;

        with_retry(&self.inner.config.retry, Phase::Write, move || async move {
            let mut bus = self.lock(Phase::Write).await?;
            let mut written = Ok(());
            for &index in changed {
                written = bus.write_page(id, page_address(index), &new[index], overdrive).await;
                if written.is_err() {
                    break;
                }
            }
            bus.finish(written)
        })
        .await
    }

    /// Write a small payload at a fixed address, verify and commit it.
    ///
    /// Returns `false` when the scratchpad never read back correctly; other
    /// failures are errors.
    pub async fn write_fixed_region(&self, id: &RomId, data: &[u8], address: u16) -> Result<bool> {
        let written = with_retry(&self.inner.config.retry, Phase::Write, move || async move {
            let mut bus = self.lock(Phase::Write).await?;
            let written = bus.write_page(id, address, data, false).await;
            bus.finish(written)
        })
        .await;

        match written {
            Ok(()) => Ok(true),
            Err(Error::WriteVerificationFailed { address }) => {
                warn!("Fixed region at {:#06x} of {} not accepted", address, id);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Stop searching and release the interface.
    ///
    /// Release errors are logged, not returned. Closing twice is a no-op.
    pub async fn close(&self) {
        self.inner.searching.store(false, Ordering::SeqCst);
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut bus = self.inner.bus.lock().await;
        self.drop_search();

        if self.inner.claimed.swap(false, Ordering::SeqCst) {
            if let Err(e) = bus.transport.release().await {
                warn!("Failed to release DS2490 interface: {}", e);
            }
        }
        info!("DS2490 1-Wire adapter closed");
    }

    /// Take the bus lock for a foreground transaction.
    async fn lock(&self, phase: Phase) -> Result<MutexGuard<'_, Bus<T>>> {
        let mut bus = self.inner.bus.lock().await;
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if !self.inner.claimed.load(Ordering::SeqCst) {
            return Err(Error::NotClaimed);
        }
        bus.phase = phase;
        let aborted = self.inner.search_aborted.swap(false, Ordering::SeqCst);
        if bus.abandoned || aborted {
            debug!("Resetting DS2490 after an abandoned transaction");
            bus.recover().await;
        }
        // Cleared by `finish` once the transaction completes
        bus.abandoned = true;
        Ok(bus)
    }
}

fn page_address(index: usize) -> u16 {
    (index * PAGE_SIZE) as u16
}

async fn search_loop<T: Transport>(inner: Arc<Inner<T>>) {
    while inner.searching.load(Ordering::SeqCst) {
        let found = {
            let mut bus = inner.bus.lock().await;
            if !inner.searching.load(Ordering::SeqCst) {
                break;
            }
            bus.phase = Phase::Search;
            if bus.abandoned || inner.search_aborted.swap(false, Ordering::SeqCst) {
                bus.recover().await;
                bus.abandoned = false;
            }

            match timeout(inner.config.search_timeout, bus.search_all()).await {
                Ok(Ok(ids)) => Some(ids),
                Ok(Err(e)) => {
                    debug!("Search pass failed: {}", e);
                    bus.recover().await;
                    None
                }
                Err(_) => {
                    debug!("Search pass timed out");
                    bus.recover().await;
                    None
                }
            }
        };

        if let Some(ids) = found {
            trace!("Search pass found {} devices", ids.len());
            inner.notify(ids);
        }
        tokio::time::sleep(inner.config.search_interval).await;
    }
    debug!("Background ROM search stopped");
}

/// A transfer raced against its deadline
type TransferOutcome<R> = std::result::Result<std::result::Result<R, TransportError>, Elapsed>;

/// Exclusive access to the adapter, held under the engine's lock
struct Bus<T> {
    transport: T,
    /// Stage reported by errors raised from here
    phase: Phase,
    transfer_timeout: Duration,
    /// A foreground transaction was dropped before it finished
    abandoned: bool,
}

impl<T: Transport> Bus<T> {
    /// Mark the transaction started by [`OneWireAdapter::lock`] complete.
    fn finish<R>(&mut self, result: Result<R>) -> Result<R> {
        self.abandoned = false;
        result
    }

    /// Turn the outcome of a transfer into a result, resetting the adapter
    /// on failure.
    async fn settle<R>(&mut self, outcome: TransferOutcome<R>) -> Result<R> {
        let error = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(source)) => Error::Transport {
                phase: self.phase,
                source,
            },
            Err(_) => Error::Timeout { phase: self.phase },
        };
        self.recover().await;
        Err(error)
    }

    /// Best-effort device reset after a failure.
    async fn recover(&mut self) {
        match timeout(
            self.transfer_timeout,
            self.transport.control_out(CONTROL_CMD, CTL_RESET_DEVICE, 0),
        )
        .await
        {
            Ok(Ok(())) => debug!("DS2490 reset after {} failure", self.phase),
            Ok(Err(e)) => warn!("DS2490 reset failed: {}", e),
            Err(_) => warn!("DS2490 reset timed out"),
        }
    }

    async fn control(&mut self, request: u8, value: u16, index: u16) -> Result<()> {
        trace!("CTRL {:02x} value={:04x} index={:04x}", request, value, index);
        let outcome = timeout(
            self.transfer_timeout,
            self.transport.control_out(request, value, index),
        )
        .await;
        self.settle(outcome).await
    }

    async fn bulk_out(&mut self, data: &[u8]) -> Result<()> {
        trace!("OUT {:02x?}", data);
        let outcome = timeout(
            self.transfer_timeout,
            self.transport.bulk_out(BULK_OUT_EP, data),
        )
        .await;
        self.settle(outcome).await
    }

    async fn bulk_in(&mut self, len: usize) -> Result<Vec<u8>> {
        let outcome = timeout(self.transfer_timeout, self.transport.bulk_in(BULK_IN_EP, len)).await;
        let data = self.settle(outcome).await?;
        trace!("IN  {:02x?}", data);
        Ok(data)
    }

    async fn status(&mut self) -> Result<Status> {
        let outcome = timeout(
            self.transfer_timeout,
            self.transport.interrupt_in(STATUS_EP, STATUS_LEN),
        )
        .await;
        let raw = self.settle(outcome).await?;
        Status::parse(&raw).ok_or_else(|| Error::InvalidResponse {
            phase: self.phase,
            message: format!("status register of {} bytes", raw.len()),
        })
    }

    /// Poll the status register until the command buffer is empty.
    ///
    /// Returns the error bits of the result codes seen while waiting.
    async fn wait_clear(&mut self) -> Result<ResultFlags> {
        let mut errors = ResultFlags::empty();
        for _ in 0..STATUS_POLLS {
            let status = self.status().await?;
            if status.short_detected() {
                self.recover().await;
                return Err(Error::BusShort { phase: self.phase });
            }
            errors |= status.errors();
            if status.is_buffer_clear() {
                return Ok(errors);
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
        self.recover().await;
        Err(Error::BusBusy { phase: self.phase })
    }

    /// Full adapter reset followed by the buffer-clear check, retried.
    async fn device_reset(&mut self) -> Result<()> {
        let mut attempt = 1;
        loop {
            let result = match self.control(CONTROL_CMD, CTL_RESET_DEVICE, 0).await {
                Ok(()) => self.wait_clear().await.map(drop),
                Err(e) => Err(e),
            };
            match result {
                Err(e) if attempt < DEVICE_RESET_ATTEMPTS && e.is_retryable() => {
                    debug!("Device reset attempt {} failed: {}", attempt, e);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// 1-Wire reset. Returns whether any chip answered with a presence
    /// pulse.
    ///
    /// When the pulse cannot be issued the adapter is reset and the pulse
    /// sent once more. A short is surfaced after the adapter reset.
    async fn reset(&mut self) -> Result<bool> {
        let phase = mem::replace(&mut self.phase, Phase::Reset);

        let result = match self.pulse().await {
            Err(short @ Error::BusShort { .. }) => self.device_reset().await.and(Err(short)),
            Err(e) => {
                debug!("1-Wire reset failed ({}), resetting adapter", e);
                match self.device_reset().await {
                    Ok(()) => self.pulse().await,
                    Err(e) => Err(e),
                }
            }
            present => present,
        };

        self.phase = phase;
        result
    }

    async fn pulse(&mut self) -> Result<bool> {
        self.control(COMM_CMD, RESET_VALUE, RESET_INDEX).await?;
        let errors = self.wait_clear().await?;
        Ok(!errors.contains(ResultFlags::NRS))
    }

    async fn set_speed(&mut self, overdrive: bool) -> Result<()> {
        let speed = if overdrive {
            SPEED_OVERDRIVE
        } else {
            SPEED_STANDARD
        };
        self.control(MODE_CMD, MOD_1WIRE_SPEED, speed).await
    }

    async fn write_bit(&mut self, bit: bool) -> Result<()> {
        self.control(COMM_CMD, bit_io_value(bit, false), 0).await
    }

    async fn read_bit(&mut self) -> Result<bool> {
        self.control(COMM_CMD, bit_io_value(true, true), 0).await?;
        let data = self.bulk_in(1).await?;
        match data.first() {
            Some(b) => Ok(b & 0x01 != 0),
            None => Err(Error::InvalidResponse {
                phase: self.phase,
                message: "empty bit read".into(),
            }),
        }
    }

    /// Send bytes on the wire in chunks. With `clear_wire` the bytes the
    /// adapter samples back are drained; otherwise they are left for
    /// [`read`](Self::read).
    async fn write(&mut self, data: &[u8], clear_wire: bool) -> Result<()> {
        for chunk in data.chunks(CHUNK_SIZE) {
            self.bulk_out(chunk).await?;
            self.control(COMM_CMD, BLOCK_IO_VALUE, chunk.len() as u16).await?;
            if clear_wire {
                self.read(chunk.len()).await?;
            }
        }
        Ok(())
    }

    /// Collect exactly `len` sampled bytes.
    async fn read(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            let remaining = len - data.len();
            let chunk = self.bulk_in(remaining.min(CHUNK_SIZE)).await?;
            if chunk.is_empty() || chunk.len() > remaining {
                return Err(Error::InvalidResponse {
                    phase: self.phase,
                    message: format!("read {} bytes, expected {}", chunk.len(), remaining),
                });
            }
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    /// Send a ROM function command. Match commands address `id`, skip
    /// commands everything on the bus.
    async fn rom_command(&mut self, command: RomCommand, id: Option<&RomId>) -> Result<()> {
        self.control(COMM_CMD, MATCH_ACCESS_VALUE, u16::from(command.code())).await?;
        self.set_speed(command.is_overdrive()).await?;
        let target = match id {
            Some(id) if command.addresses_one() => *id.as_bytes(),
            _ => [0u8; 8],
        };
        self.bulk_out(&target).await
    }

    /// Reset the bus and address one chip.
    async fn select(&mut self, id: &RomId, overdrive: bool) -> Result<()> {
        if !self.reset().await? {
            return Err(Error::NoPresence { phase: self.phase });
        }
        self.rom_command(RomCommand::matching(overdrive), Some(id)).await
    }

    async fn search_all(&mut self) -> Result<Vec<RomId>> {
        let ids = RomSearch::new().all(self).await?;
        debug!("ROM search found {} devices", ids.len());
        Ok(ids)
    }

    /// Read the chip's whole memory from address 0.
    async fn read_pages(&mut self, id: &RomId, overdrive: bool) -> Result<Vec<Page>> {
        debug!("Reading {} pages from {}", PAGE_COUNT, id);
        self.select(id, overdrive).await?;
        self.write(&[MEM_READ_MEMORY, 0x00, 0x00], true).await?;

        let mut pages = Vec::with_capacity(PAGE_COUNT);
        for index in 0..PAGE_COUNT {
            self.write(&[0xFF; PAGE_SIZE], false).await?;
            let data = self.read(PAGE_SIZE).await?;
            let page = Page::try_from(data.as_slice()).map_err(|_| Error::InvalidResponse {
                phase: self.phase,
                message: format!("page {} has {} bytes", index, data.len()),
            })?;
            pages.push(page);
        }
        Ok(pages)
    }

    /// Write `data` at `address` through the scratchpad: write, read back
    /// and compare, then copy to memory.
    async fn write_page(
        &mut self,
        id: &RomId,
        address: u16,
        data: &[u8],
        overdrive: bool,
    ) -> Result<()> {
        let offset = usize::from(address) % SCRATCHPAD_SIZE;
        if data.is_empty() || offset + data.len() > SCRATCHPAD_SIZE {
            return Err(Error::InvalidParameter(format!(
                "{} bytes at {:#06x} cross a scratchpad boundary",
                data.len(),
                address
            )));
        }
        let [ta1, ta2] = address.to_le_bytes();
        let end_offset = (offset + data.len() - 1) as u8;

        for cycle in 1..=VERIFY_CYCLES {
            self.phase = Phase::Write;
            self.select(id, overdrive).await?;
            self.write(&[MEM_WRITE_SCRATCHPAD, ta1, ta2], true).await?;
            self.write(data, true).await?;

            self.phase = Phase::Verify;
            self.select(id, overdrive).await?;
            self.write(&[MEM_READ_SCRATCHPAD], true).await?;
            self.write(&vec![0xFF; 3 + data.len()], false).await?;
            let readback = self.read(3 + data.len()).await?;

            let es = readback[2];
            if readback[0] == ta1
                && readback[1] == ta2
                && es & 0x1F == end_offset
                && readback[3..] == *data
            {
                self.phase = Phase::Write;
                self.select(id, overdrive).await?;
                self.write(&[MEM_COPY_SCRATCHPAD, ta1, ta2, es], true).await?;
                self.wait_clear().await?;
                trace!("Committed {} bytes at {:#06x}", data.len(), address);
                return Ok(());
            }

            warn!(
                "Scratchpad mismatch at {:#06x} of {} (cycle {}/{})",
                address, id, cycle, VERIFY_CYCLES
            );
        }

        Err(Error::WriteVerificationFailed { address })
    }
}

impl<T: Transport> SearchBus for Bus<T> {
    async fn begin(&mut self) -> Result<()> {
        // An empty bus shows up as a failed pass
        self.reset().await?;
        self.set_speed(false).await?;
        self.write(&[ROM_SEARCH], true).await
    }

    async fn read_bit(&mut self) -> Result<bool> {
        Bus::read_bit(self).await
    }

    async fn write_bit(&mut self, bit: bool) -> Result<()> {
        Bus::write_bit(self, bit).await
    }
}
