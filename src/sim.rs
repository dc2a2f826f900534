//! Simulated SMIF peripheral with a NOR part behind it.
//!
//! Models what the block device depends on: page wrap-around on program,
//! the write enable latch, bit-clearing program, sector erase to `0xFF`, the
//! quad-enable bit, write-in-progress that clears after a number of busy
//! polls, and an engine that stays busy for a few polls after a read. Every
//! command is recorded and any command can be made to fail.
use alloc::vec;
use alloc::vec::Vec;

use crate::peripheral::{MemoryInterface, SmifConfig, SmifMode};
use crate::slot::{
    BusWidth, DataSelect, MemCmd, MemDeviceConfig, MemSlot, SlaveSelect, Status, ADDRESS_SIZE,
    ERASE_VALUE,
};

/// Small part for tests: 64 KiB, 256 B pages, 4 KiB sectors.
pub static SIM_PART: MemDeviceConfig = MemDeviceConfig {
    num_of_addr_bytes: ADDRESS_SIZE as u8,
    mem_size: 64 * 1024,
    read_cmd: MemCmd {
        command: 0x6B,
        command_width: BusWidth::Single,
        address_width: BusWidth::Single,
        mode: None,
        mode_width: BusWidth::Single,
        dummy_cycles: 8,
        data_width: BusWidth::Quad,
    },
    write_en_cmd: MemCmd::single(0x06),
    write_dis_cmd: MemCmd::single(0x04),
    erase_cmd: MemCmd::single(0x20),
    erase_size: 4096,
    chip_erase_cmd: MemCmd::single(0xC7),
    program_cmd: MemCmd::single(0x02),
    program_size: 256,
    read_sts_reg_wip_cmd: MemCmd::single(0x05),
    read_sts_reg_qe_cmd: MemCmd::single(0x35),
    write_sts_reg_qe_cmd: MemCmd::single(0x01),
    sts_reg_busy_mask: Status::WIP.bits(),
    sts_reg_quad_enable_mask: 0x02,
    sts_reg_program_error_mask: Status::P_ERR.bits(),
    erase_time_ms: 50,
    chip_erase_time_ms: 1000,
    program_time_us: 1000,
};

pub static SIM_SLOT: MemSlot = MemSlot {
    slave_select: SlaveSelect::Ss0,
    data_select: DataSelect::Sel0,
    device: &SIM_PART,
};

/// Peripheral operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    InstallInterrupt,
    Init,
    QuadEnable,
    ReadStatus,
    WriteEnable,
    Read,
    Program,
    SectorErase,
    IsMemoryBusy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimError {
    /// Failure requested with [`SimFlash::fail_nth`].
    Injected(Op),
    /// Command issued while the engine is not initialised and enabled, or
    /// while it is in memory-mapped mode.
    Disabled,
    /// Command issued while the part still has a write in progress.
    Busy,
    /// Status read with an opcode the part does not know.
    UnknownCommand(u8),
}

/// One recorded peripheral call. Busy polls are counted, not recorded.
///
/// `command` is the opcode taken from the slot the call was issued through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    InstallInterrupt { priority: u8 },
    Init,
    Deinit,
    SetDataSelect(SlaveSelect, DataSelect),
    Enable,
    EnableInterrupt,
    QuadEnable { command: u8 },
    ReadStatus { command: u8 },
    WriteEnable,
    Read { command: u8, addr: u32, len: usize },
    Program { command: u8, addr: u32, len: usize },
    SectorErase { command: u8, addr: u32 },
}

/// How many busy polls each operation keeps the part or the engine busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimTiming {
    pub program_busy_polls: u32,
    pub erase_busy_polls: u32,
    pub status_write_busy_polls: u32,
    pub transfer_busy_polls: u32,
}

impl Default for SimTiming {
    fn default() -> Self {
        Self {
            program_busy_polls: 4,
            erase_busy_polls: 64,
            status_write_busy_polls: 2,
            transfer_busy_polls: 3,
        }
    }
}

pub struct SimFlash {
    device: &'static MemDeviceConfig,
    mem: Vec<u8>,
    status: Status,
    config_reg: u8,
    timing: SimTiming,
    chip_busy_polls: u32,
    engine_busy_polls: u32,
    initialized: bool,
    mode: SmifMode,
    enabled: bool,
    interrupt_installed: bool,
    interrupt_enabled: bool,
    program_error: bool,
    calls: Vec<Call>,
    memory_polls: u32,
    engine_polls: u32,
    op_counts: Vec<(Op, u32)>,
    faults: Vec<(Op, u32)>,
}

impl SimFlash {
    /// A fully erased part as described by `slot`.
    pub fn new(slot: &MemSlot) -> Self {
        Self {
            device: slot.device,
            mem: vec![ERASE_VALUE; slot.device.mem_size as usize],
            status: Status::empty(),
            config_reg: 0,
            timing: SimTiming::default(),
            chip_busy_polls: 0,
            engine_busy_polls: 0,
            initialized: false,
            mode: SmifMode::Normal,
            enabled: false,
            interrupt_installed: false,
            interrupt_enabled: false,
            program_error: false,
            calls: Vec::new(),
            memory_polls: 0,
            engine_polls: 0,
            op_counts: Vec::new(),
            faults: Vec::new(),
        }
    }

    pub fn with_timing(mut self, timing: SimTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Makes the `nth` (1-based) call of `op` from now on fail with
    /// [`SimError::Injected`]. Calls made before this one do not count.
    pub fn fail_nth(&mut self, op: Op, nth: u32) {
        let target = self.op_count(op).saturating_add(nth);
        self.faults.push((op, target));
    }

    /// Makes every following page program report a program error.
    pub fn set_program_error(&mut self, on: bool) {
        self.program_error = on;
    }

    /// Writes `data` straight into the array, bypassing the command set.
    pub fn preload(&mut self, addr: usize, data: &[u8]) {
        self.mem[addr..addr + data.len()].copy_from_slice(data);
    }

    pub fn memory(&self) -> &[u8] {
        &self.mem
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Number of chip busy polls so far.
    pub fn memory_polls(&self) -> u32 {
        self.memory_polls
    }

    /// Number of engine busy polls so far.
    pub fn engine_polls(&self) -> u32 {
        self.engine_polls
    }

    pub fn is_enabled(&self) -> bool {
        self.initialized && self.enabled
    }

    /// Number of calls of `op` so far.
    pub fn op_count(&self, op: Op) -> u32 {
        self.op_counts
            .iter()
            .find(|(o, _)| *o == op)
            .map_or(0, |(_, n)| *n)
    }

    pub fn interrupt_enabled(&self) -> bool {
        self.interrupt_installed && self.interrupt_enabled
    }

    pub fn quad_enabled(&self) -> bool {
        self.config_reg & self.device.sts_reg_quad_enable_mask != 0
    }

    fn check(&mut self, op: Op) -> Result<(), SimError> {
        let count = match self.op_counts.iter_mut().find(|(o, _)| *o == op) {
            Some((_, n)) => {
                *n += 1;
                *n
            }
            None => {
                self.op_counts.push((op, 1));
                1
            }
        };
        if self.faults.contains(&(op, count)) {
            return Err(SimError::Injected(op));
        }
        Ok(())
    }

    /// Gate for commands that need a running engine and an idle part.
    fn command(&mut self, op: Op) -> Result<(), SimError> {
        self.check(op)?;
        if !self.is_enabled() || self.mode == SmifMode::MemoryMapped {
            return Err(SimError::Disabled);
        }
        if self.chip_busy_polls > 0 {
            return Err(SimError::Busy);
        }
        Ok(())
    }

    fn index(&self, addr: u32) -> usize {
        addr as usize % self.mem.len()
    }
}

fn decode(addr: [u8; ADDRESS_SIZE]) -> u32 {
    (addr[0] as u32) << 16 | (addr[1] as u32) << 8 | addr[2] as u32
}

impl MemoryInterface for SimFlash {
    type Error = SimError;

    fn install_interrupt(&mut self, priority: u8) -> Result<(), SimError> {
        self.calls.push(Call::InstallInterrupt { priority });
        self.check(Op::InstallInterrupt)?;
        self.interrupt_installed = true;
        Ok(())
    }

    fn init(&mut self, config: &SmifConfig) -> Result<(), SimError> {
        self.calls.push(Call::Init);
        self.check(Op::Init)?;
        self.mode = config.mode;
        self.initialized = true;
        Ok(())
    }

    fn deinit(&mut self) {
        self.calls.push(Call::Deinit);
        self.initialized = false;
        self.enabled = false;
    }

    fn set_data_select(&mut self, slave_select: SlaveSelect, data_select: DataSelect) {
        self.calls.push(Call::SetDataSelect(slave_select, data_select));
    }

    fn enable(&mut self) {
        self.calls.push(Call::Enable);
        self.enabled = true;
    }

    fn enable_interrupt(&mut self) {
        self.calls.push(Call::EnableInterrupt);
        self.interrupt_enabled = true;
    }

    fn quad_enable(&mut self, slot: &MemSlot) -> Result<(), SimError> {
        self.calls.push(Call::QuadEnable {
            command: slot.device.write_sts_reg_qe_cmd.command,
        });
        self.command(Op::QuadEnable)?;
        if !self.quad_enabled() {
            self.config_reg |= slot.device.sts_reg_quad_enable_mask;
            self.chip_busy_polls = self.timing.status_write_busy_polls;
        }
        Ok(())
    }

    fn read_status(&mut self, slot: &MemSlot, command: u8) -> Result<u8, SimError> {
        self.calls.push(Call::ReadStatus { command });
        self.check(Op::ReadStatus)?;
        if !self.is_enabled() {
            return Err(SimError::Disabled);
        }
        if command == slot.device.read_sts_reg_qe_cmd.command {
            Ok(self.config_reg)
        } else if command == slot.device.read_sts_reg_wip_cmd.command {
            let mut status = self.status;
            status.set(Status::WIP, self.chip_busy_polls > 0);
            Ok(status.bits())
        } else {
            Err(SimError::UnknownCommand(command))
        }
    }

    fn write_enable(&mut self, _slot: &MemSlot) -> Result<(), SimError> {
        self.calls.push(Call::WriteEnable);
        self.command(Op::WriteEnable)?;
        self.status.insert(Status::WEL);
        Ok(())
    }

    fn read(
        &mut self,
        slot: &MemSlot,
        addr: [u8; ADDRESS_SIZE],
        buf: &mut [u8],
    ) -> Result<(), SimError> {
        let addr = decode(addr);
        self.calls.push(Call::Read {
            command: slot.device.read_cmd.command,
            addr,
            len: buf.len(),
        });
        self.command(Op::Read)?;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.mem[self.index(addr + i as u32)];
        }
        self.engine_busy_polls = self.timing.transfer_busy_polls;
        Ok(())
    }

    fn program(
        &mut self,
        slot: &MemSlot,
        addr: [u8; ADDRESS_SIZE],
        data: &[u8],
    ) -> Result<(), SimError> {
        let addr = decode(addr);
        self.calls.push(Call::Program {
            command: slot.device.program_cmd.command,
            addr,
            len: data.len(),
        });
        self.command(Op::Program)?;
        // Without the latch the part ignores the command.
        if !self.status.contains(Status::WEL) {
            return Ok(());
        }
        let page = self.device.program_size;
        let base = addr - addr % page;
        for (i, b) in data.iter().enumerate() {
            // Addresses wrap inside the page, as on real parts.
            let offset = (addr % page + i as u32) % page;
            let idx = self.index(base + offset);
            self.mem[idx] &= *b;
        }
        self.status.remove(Status::WEL);
        self.status.set(Status::P_ERR, self.program_error);
        self.chip_busy_polls = self.timing.program_busy_polls;
        Ok(())
    }

    fn sector_erase(&mut self, slot: &MemSlot, addr: [u8; ADDRESS_SIZE]) -> Result<(), SimError> {
        let addr = decode(addr);
        self.calls.push(Call::SectorErase {
            command: slot.device.erase_cmd.command,
            addr,
        });
        self.command(Op::SectorErase)?;
        if !self.status.contains(Status::WEL) {
            return Ok(());
        }
        let sector = self.device.erase_size as usize;
        let base = self.index(addr) / sector * sector;
        self.mem[base..base + sector].fill(ERASE_VALUE);
        self.status.remove(Status::WEL);
        self.chip_busy_polls = self.timing.erase_busy_polls;
        Ok(())
    }

    fn is_memory_busy(&mut self, slot: &MemSlot) -> Result<bool, SimError> {
        self.memory_polls += 1;
        self.check(Op::IsMemoryBusy)?;
        let mut status = self.status;
        status.set(Status::WIP, self.chip_busy_polls > 0);
        self.chip_busy_polls = self.chip_busy_polls.saturating_sub(1);
        Ok(status.bits() & slot.device.sts_reg_busy_mask != 0)
    }

    fn is_busy(&mut self) -> bool {
        self.engine_polls += 1;
        if self.engine_busy_polls > 0 {
            self.engine_busy_polls -= 1;
            true
        } else {
            false
        }
    }
}

/// Delay that only accounts for the time it was asked to wait.
#[derive(Debug, Default)]
pub struct SimDelay {
    elapsed_ns: u64,
}

impl SimDelay {
    pub fn elapsed_ns(&self) -> u64 {
        self.elapsed_ns
    }
}

impl embedded_hal::delay::DelayNs for SimDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.elapsed_ns += u64::from(ns);
    }
}

impl embedded_hal_async::delay::DelayNs for SimDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.elapsed_ns += u64::from(ns);
    }
}
