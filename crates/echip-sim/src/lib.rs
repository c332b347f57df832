//! echip-sim - In-memory DS2490 adapter emulator for testing
//!
//! [`SimTransport`] implements the [`Transport`] seam by emulating a DS2490
//! with a 1-Wire bus of [`SimChip`]s behind it: control requests, the bulk
//! FIFOs, the status register, ROM search at bit level and the memory
//! function commands of scratchpad memory chips. It's useful for testing
//! the bus engine without hardware.
//!
//! A [`SimHandle`] stays with the test after the transport is handed to an
//! engine; it attaches and detaches chips, injects faults and exposes what
//! happened on the bus.

mod chip;

use std::collections::VecDeque;
use std::future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use echip_core::image::Page;
use echip_core::transport::{Transport, TransportError};
use echip_core::RomId;
use log::trace;

pub use chip::{SimChip, SCRATCHPAD_SIZE};

// The emulated device's side of the DS2490 command set
const CONTROL_CMD: u8 = 0x00;
const COMM_CMD: u8 = 0x01;
const MODE_CMD: u8 = 0x02;

const CTL_RESET_DEVICE: u16 = 0x0000;

const COMM_CMD_MASK: u16 = 0x00F6;
const COMM_BIT_IO: u16 = 0x0020;
const COMM_1_WIRE_RESET: u16 = 0x0042;
const COMM_MATCH_ACCESS: u16 = 0x0064;
const COMM_BLOCK_IO: u16 = 0x0074;
const COMM_D: u16 = 0x0008;
const COMM_ICP: u16 = 0x0200;

const MOD_1WIRE_SPEED: u16 = 0x0002;
const SPEED_OVERDRIVE: u16 = 0x0002;

const BULK_OUT_EP: u8 = 0x02;
const BULK_IN_EP: u8 = 0x83;
const STATUS_EP: u8 = 0x81;

const ROM_MATCH: u8 = 0x55;
const ROM_SKIP: u8 = 0xCC;
const ROM_SEARCH: u8 = 0xF0;
const ROM_OVERDRIVE_MATCH: u8 = 0x69;
const ROM_OVERDRIVE_SKIP: u8 = 0x3C;

const STATUS_IDLE: u8 = 0x20;
const RESULT_NRS: u8 = 0x01;
const RESULT_SH: u8 = 0x02;

/// Which chips listen on the bus
#[derive(Debug, Clone)]
enum Wire {
    /// Nobody is addressed
    Idle,
    /// Reset done, chips wait for a ROM command
    Rom,
    /// ROM search in progress
    Search {
        bit: usize,
        slot: SearchSlot,
        active: Vec<bool>,
    },
    /// One chip (by index) addressed
    One(usize),
    /// Every chip addressed
    All,
}

#[derive(Debug, Clone, Copy)]
enum SearchSlot {
    Bit,
    Complement,
    Direction,
}

/// Things that happened on the emulated adapter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Full device resets (CTL_RESET_DEVICE)
    pub device_resets: usize,
    /// 1-Wire reset pulses
    pub bus_resets: usize,
    /// Largest payload of a single bulk transfer
    pub max_bulk_len: usize,
    /// Transfers of any kind
    pub transfers: usize,
}

#[derive(Debug)]
struct SimState {
    chips: Vec<SimChip>,
    claimed: bool,
    fail_claim: bool,
    overdrive: bool,
    out_fifo: VecDeque<u8>,
    in_fifo: VecDeque<u8>,
    results: Vec<u8>,
    pending_match: Option<u8>,
    wire: Wire,
    busy_polls: usize,
    shorted: bool,
    failing_transfers: usize,
    stalling_transfers: usize,
    counters: Counters,
}

impl SimState {
    fn new() -> Self {
        Self {
            chips: Vec::new(),
            claimed: false,
            fail_claim: false,
            overdrive: false,
            out_fifo: VecDeque::new(),
            in_fifo: VecDeque::new(),
            results: Vec::new(),
            pending_match: None,
            wire: Wire::Idle,
            busy_polls: 0,
            shorted: false,
            failing_transfers: 0,
            stalling_transfers: 0,
            counters: Counters::default(),
        }
    }

    /// Common checks at the start of every transfer.
    fn begin_transfer(&mut self) -> Result<(), TransportError> {
        if !self.claimed {
            return Err(TransportError::NotClaimed);
        }
        self.counters.transfers += 1;
        if self.failing_transfers > 0 {
            self.failing_transfers -= 1;
            return Err(TransportError::Transfer("injected failure".into()));
        }
        Ok(())
    }

    fn take_stall(&mut self) -> bool {
        if self.claimed && self.stalling_transfers > 0 {
            self.stalling_transfers -= 1;
            return true;
        }
        false
    }

    fn device_reset(&mut self) {
        self.counters.device_resets += 1;
        self.out_fifo.clear();
        self.in_fifo.clear();
        self.results.clear();
        self.pending_match = None;
        self.deselect_all();
    }

    fn deselect_all(&mut self) {
        self.wire = Wire::Idle;
        for chip in &mut self.chips {
            chip.deselect();
        }
    }

    fn bus_reset(&mut self) {
        self.counters.bus_resets += 1;
        self.deselect_all();
        if self.shorted {
            self.results.push(RESULT_SH);
            return;
        }
        if self.chips.is_empty() {
            self.results.push(RESULT_NRS);
        }
        self.wire = Wire::Rom;
    }

    fn comm(&mut self, value: u16, index: u16) {
        match value & COMM_CMD_MASK {
            COMM_1_WIRE_RESET => self.bus_reset(),
            COMM_MATCH_ACCESS => self.pending_match = Some(index as u8),
            COMM_BLOCK_IO => {
                let count = usize::from(index).min(self.out_fifo.len());
                for _ in 0..count {
                    if let Some(byte) = self.out_fifo.pop_front() {
                        let sampled = self.exchange_byte(byte);
                        self.in_fifo.push_back(sampled);
                    }
                }
            }
            COMM_BIT_IO => {
                let sampled = self.exchange_bit(value & COMM_D != 0);
                if value & COMM_ICP == 0 {
                    self.in_fifo.push_back(u8::from(sampled));
                }
            }
            other => trace!("sim: ignoring COMM command {:#06x}", other),
        }
    }

    /// ROM id written after a match access request.
    fn rom_command(&mut self, command: u8, target: &[u8]) {
        if !matches!(self.wire, Wire::Rom) {
            trace!("sim: ROM command {:#04x} without reset", command);
            self.deselect_all();
            return;
        }

        self.wire = match command {
            ROM_MATCH | ROM_OVERDRIVE_MATCH => {
                match self
                    .chips
                    .iter()
                    .position(|chip| chip.id().as_bytes()[..] == *target)
                {
                    Some(index) => {
                        self.chips[index].select();
                        Wire::One(index)
                    }
                    None => Wire::Idle,
                }
            }
            ROM_SKIP | ROM_OVERDRIVE_SKIP => {
                for chip in &mut self.chips {
                    chip.select();
                }
                Wire::All
            }
            _ => Wire::Idle,
        };
    }

    /// One byte slot; returns the wired-AND of master and chips.
    fn exchange_byte(&mut self, byte: u8) -> u8 {
        match &self.wire {
            Wire::Rom => {
                if byte == ROM_SEARCH {
                    self.wire = Wire::Search {
                        bit: 0,
                        slot: SearchSlot::Bit,
                        active: vec![true; self.chips.len()],
                    };
                } else if byte == ROM_SKIP {
                    for chip in &mut self.chips {
                        chip.select();
                    }
                    self.wire = Wire::All;
                } else {
                    self.wire = Wire::Idle;
                }
                byte
            }
            Wire::One(index) => {
                let index = *index;
                match self.chips.get_mut(index) {
                    Some(chip) => byte & chip.exchange(byte),
                    None => byte,
                }
            }
            Wire::All => self
                .chips
                .iter_mut()
                .fold(byte, |wire, chip| wire & chip.exchange(byte)),
            Wire::Idle | Wire::Search { .. } => byte,
        }
    }

    /// One bit slot; only a ROM search answers at bit level.
    fn exchange_bit(&mut self, bit: bool) -> bool {
        let chips = &self.chips;
        let Wire::Search {
            bit: position,
            slot,
            active,
        } = &mut self.wire
        else {
            return bit;
        };

        let id_bit =
            |chip: &SimChip| chip.id().as_bytes()[*position / 8] & (1 << (*position % 8)) != 0;
        let responders = || {
            chips
                .iter()
                .zip(active.iter())
                .filter(|(_, a)| **a)
                .map(|(c, _)| c)
        };

        match slot {
            SearchSlot::Bit => {
                *slot = SearchSlot::Complement;
                bit && responders().all(|c| id_bit(c))
            }
            SearchSlot::Complement => {
                *slot = SearchSlot::Direction;
                bit && responders().all(|c| !id_bit(c))
            }
            SearchSlot::Direction => {
                for (chip, a) in chips.iter().zip(active.iter_mut()) {
                    if id_bit(chip) != bit {
                        *a = false;
                    }
                }
                *slot = SearchSlot::Bit;
                *position += 1;
                if *position == 64 {
                    self.wire = Wire::Idle;
                }
                bit
            }
        }
    }

    fn status(&mut self) -> Vec<u8> {
        let mut raw = vec![0u8; 16];
        raw[8] = STATUS_IDLE;
        if self.busy_polls > 0 {
            self.busy_polls -= 1;
            raw[11] = 1;
        }
        raw[12] = self.out_fifo.len().min(usize::from(u8::MAX)) as u8;
        raw[13] = self.in_fifo.len().min(usize::from(u8::MAX)) as u8;
        raw.append(&mut self.results);
        raw
    }
}

/// Park the calling transfer forever when a stall is pending.
async fn stall_point(state: &Mutex<SimState>) {
    let stalled = lock(state).take_stall();
    if stalled {
        trace!("sim: stalling transfer");
        future::pending::<()>().await;
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Emulated DS2490 implementing [`Transport`]
#[derive(Debug)]
pub struct SimTransport {
    state: Arc<Mutex<SimState>>,
}

impl SimTransport {
    /// Adapter with an empty bus
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    /// Adapter with `chips` on its bus
    pub fn with_chips(chips: impl IntoIterator<Item = SimChip>) -> Self {
        let transport = Self::new();
        lock(&transport.state).chips.extend(chips);
        transport
    }

    /// Handle for inspecting and steering the emulation
    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimTransport {
    async fn claim(
        &mut self,
        _configuration: u8,
        _interface: u8,
        _alternate: u8,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.fail_claim {
            return Err(TransportError::Transfer("interface busy".into()));
        }
        state.claimed = true;
        Ok(())
    }

    async fn release(&mut self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.claimed = false;
        Ok(())
    }

    async fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
    ) -> Result<(), TransportError> {
        stall_point(&self.state).await;
        let mut state = lock(&self.state);
        state.begin_transfer()?;
        match request {
            CONTROL_CMD if value == CTL_RESET_DEVICE => state.device_reset(),
            COMM_CMD => state.comm(value, index),
            MODE_CMD if value == MOD_1WIRE_SPEED => state.overdrive = index == SPEED_OVERDRIVE,
            _ => trace!("sim: ignoring request {:#04x} value {:#06x}", request, value),
        }
        Ok(())
    }

    async fn bulk_out(&mut self, endpoint: u8, data: &[u8]) -> Result<(), TransportError> {
        stall_point(&self.state).await;
        let mut state = lock(&self.state);
        state.begin_transfer()?;
        if endpoint != BULK_OUT_EP {
            return Err(TransportError::Stall(endpoint));
        }
        state.counters.max_bulk_len = state.counters.max_bulk_len.max(data.len());

        match state.pending_match.take() {
            Some(command) => state.rom_command(command, data),
            None => state.out_fifo.extend(data),
        }
        Ok(())
    }

    async fn bulk_in(&mut self, endpoint: u8, len: usize) -> Result<Vec<u8>, TransportError> {
        stall_point(&self.state).await;
        let mut state = lock(&self.state);
        state.begin_transfer()?;
        if endpoint != BULK_IN_EP {
            return Err(TransportError::Stall(endpoint));
        }
        state.counters.max_bulk_len = state.counters.max_bulk_len.max(len);

        let count = len.min(state.in_fifo.len());
        Ok(state.in_fifo.drain(..count).collect())
    }

    async fn interrupt_in(&mut self, endpoint: u8, _len: usize) -> Result<Vec<u8>, TransportError> {
        stall_point(&self.state).await;
        let mut state = lock(&self.state);
        state.begin_transfer()?;
        if endpoint != STATUS_EP {
            return Err(TransportError::Stall(endpoint));
        }
        Ok(state.status())
    }
}

/// Test-side view of a [`SimTransport`]
#[derive(Debug, Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    /// Put a chip on the bus.
    pub fn attach(&self, chip: SimChip) {
        lock(&self.state).chips.push(chip);
    }

    /// Take a chip off the bus.
    pub fn detach(&self, id: &RomId) -> Option<SimChip> {
        let mut state = lock(&self.state);
        let index = state.chips.iter().position(|chip| chip.id() == *id)?;
        state.deselect_all();
        Some(state.chips.remove(index))
    }

    /// Ids of the chips on the bus
    pub fn chip_ids(&self) -> Vec<RomId> {
        lock(&self.state).chips.iter().map(SimChip::id).collect()
    }

    /// Committed memory of a chip as pages
    pub fn pages(&self, id: &RomId) -> Option<Vec<Page>> {
        self.with_chip(id, |chip| chip.pages())
    }

    /// Target addresses of a chip's committed scratchpad copies
    pub fn copies(&self, id: &RomId) -> Vec<u16> {
        self.with_chip(id, |chip| chip.copies().to_vec())
            .unwrap_or_default()
    }

    /// Forget a chip's recorded copies.
    pub fn clear_copies(&self, id: &RomId) {
        self.with_chip(id, SimChip::clear_copies);
    }

    /// Corrupt the payload of a chip's next `count` scratchpad reads.
    pub fn corrupt_scratchpad_reads(&self, id: &RomId, count: usize) {
        self.with_chip(id, |chip| chip.corrupt_scratchpad_reads(count));
    }

    /// Fail the next `count` transfers of any kind.
    pub fn fail_transfers(&self, count: usize) {
        lock(&self.state).failing_transfers = count;
    }

    /// Never complete the next `count` transfers.
    pub fn stall_transfers(&self, count: usize) {
        lock(&self.state).stalling_transfers = count;
    }

    /// Report a busy command buffer on the next `count` status polls.
    pub fn busy_polls(&self, count: usize) {
        lock(&self.state).busy_polls = count;
    }

    /// Short the bus: every reset pulse reports a short.
    pub fn set_short(&self, shorted: bool) {
        lock(&self.state).shorted = shorted;
    }

    /// Make `claim` fail.
    pub fn fail_claim(&self, fail: bool) {
        lock(&self.state).fail_claim = fail;
    }

    /// Whether the interface is claimed
    pub fn is_claimed(&self) -> bool {
        lock(&self.state).claimed
    }

    /// Whether the last speed request selected overdrive
    pub fn is_overdrive(&self) -> bool {
        lock(&self.state).overdrive
    }

    /// Snapshot of the adapter counters
    pub fn counters(&self) -> Counters {
        lock(&self.state).counters
    }

    fn with_chip<R>(&self, id: &RomId, f: impl FnOnce(&mut SimChip) -> R) -> Option<R> {
        let mut state = lock(&self.state);
        state.chips.iter_mut().find(|chip| chip.id() == *id).map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const RESET_VALUE: u16 = 0x0C4B;
    const BLOCK_IO_VALUE: u16 = 0x1075;
    const MATCH_ACCESS_VALUE: u16 = 0x0065;

    async fn claimed(chips: Vec<SimChip>) -> (SimTransport, SimHandle) {
        let mut transport = SimTransport::with_chips(chips);
        let handle = transport.handle();
        transport.claim(1, 0, 1).await.unwrap();
        (transport, handle)
    }

    async fn block(transport: &mut SimTransport, data: &[u8]) -> Vec<u8> {
        transport.bulk_out(BULK_OUT_EP, data).await.unwrap();
        transport
            .control_out(COMM_CMD, BLOCK_IO_VALUE, data.len() as u16)
            .await
            .unwrap();
        transport.bulk_in(BULK_IN_EP, data.len()).await.unwrap()
    }

    #[tokio::test]
    async fn test_transfers_need_claim() {
        let mut transport = SimTransport::new();
        assert_eq!(
            transport.control_out(CONTROL_CMD, CTL_RESET_DEVICE, 0).await,
            Err(TransportError::NotClaimed)
        );
    }

    #[tokio::test]
    async fn test_read_memory_through_match() {
        let mut page = [0x55; 32];
        page[0] = 0x42;
        let chip = SimChip::data_chip([1, 2, 3, 4, 5, 6], &[page]);
        let id = chip.id();
        let (mut transport, _) = claimed(vec![chip]).await;

        transport.control_out(COMM_CMD, RESET_VALUE, 1).await.unwrap();
        transport
            .control_out(COMM_CMD, MATCH_ACCESS_VALUE, u16::from(ROM_MATCH))
            .await
            .unwrap();
        transport.bulk_out(BULK_OUT_EP, id.as_bytes()).await.unwrap();

        let data = block(&mut transport, &[0xF0, 0x00, 0x00, 0xFF, 0xFF]).await;
        assert_eq!(&data[3..], &[0x42, 0x55]);
    }

    #[tokio::test]
    async fn test_match_without_reset_is_ignored() {
        let chip = SimChip::data_chip([1, 2, 3, 4, 5, 6], &[[0x00; 32]]);
        let id = chip.id();
        let (mut transport, _) = claimed(vec![chip]).await;

        transport
            .control_out(COMM_CMD, MATCH_ACCESS_VALUE, u16::from(ROM_MATCH))
            .await
            .unwrap();
        transport.bulk_out(BULK_OUT_EP, id.as_bytes()).await.unwrap();

        let data = block(&mut transport, &[0xF0, 0x00, 0x00, 0xFF]).await;
        assert_eq!(data[3], 0xFF);
    }

    #[tokio::test]
    async fn test_status_reports_results() {
        let (mut transport, handle) = claimed(Vec::new()).await;
        handle.set_short(true);
        handle.busy_polls(1);

        transport.control_out(COMM_CMD, RESET_VALUE, 1).await.unwrap();
        let status = transport.interrupt_in(STATUS_EP, 32).await.unwrap();
        assert_eq!(status[11], 1);
        assert_eq!(&status[16..], &[RESULT_SH]);

        let status = transport.interrupt_in(STATUS_EP, 32).await.unwrap();
        assert_eq!(status[11], 0);
        assert_eq!(status.len(), 16);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let (mut transport, handle) = claimed(Vec::new()).await;
        handle.fail_transfers(1);

        assert!(transport.control_out(CONTROL_CMD, CTL_RESET_DEVICE, 0).await.is_err());
        assert!(transport.control_out(CONTROL_CMD, CTL_RESET_DEVICE, 0).await.is_ok());
        assert_eq!(handle.counters().device_resets, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_transfer_never_completes() {
        let (mut transport, handle) = claimed(Vec::new()).await;
        handle.stall_transfers(1);

        let stalled = tokio::time::timeout(
            Duration::from_secs(1),
            transport.control_out(CONTROL_CMD, CTL_RESET_DEVICE, 0),
        )
        .await;
        assert!(stalled.is_err());
        assert_eq!(handle.counters().device_resets, 0);

        assert!(transport.control_out(CONTROL_CMD, CTL_RESET_DEVICE, 0).await.is_ok());
        assert_eq!(handle.counters().device_resets, 1);
    }
}
