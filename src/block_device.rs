use core::cmp;
use core::fmt::Debug;

use embedded_hal::delay::DelayNs;

use crate::config::BlockDeviceConfig;
use crate::error::{peripheral, Error};
use crate::peripheral::MemoryInterface;
use crate::poll::PollBudget;
use crate::slot::{address_bytes, Geometry, MemSlot, ADDRESS_SIZE, ERASE_VALUE};
use crate::traits::{BdAddr, BdSize, BlockDevice};

/// Block device over one memory slot of a SMIF peripheral.
///
/// Every operation blocks until the part reports completion. The device
/// starts uninitialised; data operations fail until [`BlockDevice::init`].
pub struct SmifBlockDevice<P, D> {
    smif: P,
    delay: D,
    slot: &'static MemSlot,
    config: BlockDeviceConfig,
    geometry: Geometry,
    initialized: bool,
}

impl<P, D> Debug for SmifBlockDevice<P, D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SmifBlockDevice")
            .field("geometry", &self.geometry)
            .field("initialized", &self.initialized)
            .finish()
    }
}

impl<P, D> SmifBlockDevice<P, D> {
    /// # Panics
    ///
    /// If the slot's page and sector sizes do not tile the part, or if it
    /// does not use [`ADDRESS_SIZE`] address bytes.
    pub fn new(smif: P, delay: D, slot: &'static MemSlot, config: BlockDeviceConfig) -> Self {
        let geometry = Geometry::of(slot.device);
        assert!(geometry.is_consistent(), "inconsistent slot geometry");
        assert!(
            usize::from(slot.device.num_of_addr_bytes) == ADDRESS_SIZE,
            "unsupported address length"
        );
        Self {
            smif,
            delay,
            slot,
            config,
            geometry,
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn peripheral(&self) -> &P {
        &self.smif
    }

    pub fn peripheral_mut(&mut self) -> &mut P {
        &mut self.smif
    }

    /// Gives back the peripheral and the delay.
    pub fn release(self) -> (P, D) {
        (self.smif, self.delay)
    }
}

impl<P, D> SmifBlockDevice<P, D>
where
    P: MemoryInterface,
    D: DelayNs,
{
    fn check_request(&self, addr: BdAddr, size: BdSize) -> Result<(), Error<P::Error>> {
        if !self.initialized {
            warn!("access before init");
            return Err(Error::NotInitialized);
        }
        if !self.geometry.contains(addr, size) {
            warn!("{} bytes at {:#x} exceed the device", size, addr);
            return Err(Error::OutOfBounds { addr, size });
        }
        Ok(())
    }

    /// Block until the part no longer reports a write in progress.
    fn wait_memory_ready(&mut self, timeout_us: u32) -> Result<(), Error<P::Error>> {
        let slot = self.slot;
        let mut budget = PollBudget::new(&self.config.poll, timeout_us);
        while self.smif.is_memory_busy(slot).map_err(peripheral("busy poll"))? {
            let interval_us = match budget.spend() {
                Ok(us) => us,
                Err(e) => {
                    error!("part still busy after {} us", timeout_us);
                    return Err(e);
                }
            };
            self.delay.delay_us(interval_us);
        }
        Ok(())
    }

    /// Block until the peripheral engine has finished its transaction.
    fn wait_transfer_done(&mut self) -> Result<(), Error<P::Error>> {
        let mut budget = PollBudget::new(&self.config.poll, self.config.poll.transfer_timeout_us);
        while self.smif.is_busy() {
            let interval_us = match budget.spend() {
                Ok(us) => us,
                Err(e) => {
                    error!("transfer still running after {} us", self.config.poll.transfer_timeout_us);
                    return Err(e);
                }
            };
            self.delay.delay_us(interval_us);
        }
        Ok(())
    }

    /// Set QE, wait for the status write to land and read the bit back.
    fn enable_quad(&mut self) -> Result<(), Error<P::Error>> {
        let slot = self.slot;
        self.smif.quad_enable(slot).map_err(peripheral("quad enable"))?;
        self.wait_memory_ready(self.config.poll.status_write_timeout_us)?;

        let command = slot.device.read_sts_reg_qe_cmd.command;
        let reg = self
            .smif
            .read_status(slot, command)
            .map_err(peripheral("quad enable read-back"))?;
        trace!("QE register ({:#x}): {:#x}", command, reg);
        if reg & slot.device.sts_reg_quad_enable_mask == 0 {
            warn!("QE bit not set after quad enable: {:#x}", reg);
        }
        Ok(())
    }

    /// Programs one chunk that does not cross a page boundary.
    fn program_page(&mut self, addr: BdAddr, data: &[u8]) -> Result<(), Error<P::Error>> {
        let slot = self.slot;
        self.enable_quad()?;
        self.smif
            .write_enable(slot)
            .map_err(peripheral("write enable"))?;

        trace!("page program: {} bytes at {:#x}", data.len(), addr);
        self.smif
            .program(slot, address_bytes(addr), data)
            .map_err(peripheral("page program"))?;
        self.wait_memory_ready(slot.device.program_time_us)?;

        let status = self
            .smif
            .read_status(slot, slot.device.read_sts_reg_wip_cmd.command)
            .map_err(peripheral("status read"))?;
        trace!("status after program: {:#x}", status);
        if status & slot.device.sts_reg_program_error_mask != 0 {
            error!("program error at {:#x}, status {:#x}", addr, status);
            return Err(Error::ProgramFailed { status });
        }
        Ok(())
    }

    fn erase_sector(&mut self, addr: BdAddr) -> Result<(), Error<P::Error>> {
        let slot = self.slot;
        self.smif
            .write_enable(slot)
            .map_err(peripheral("write enable"))?;

        trace!("sector erase at {:#x}", addr);
        self.smif
            .sector_erase(slot, address_bytes(addr))
            .map_err(peripheral("sector erase"))?;
        self.wait_memory_ready(slot.device.erase_time_ms.saturating_mul(1000))
    }
}

impl<P, D> BlockDevice for SmifBlockDevice<P, D>
where
    P: MemoryInterface,
    D: DelayNs,
{
    type Error = Error<P::Error>;

    fn init(&mut self) -> Result<(), Self::Error> {
        if self.initialized {
            return Ok(());
        }
        let slot = self.slot;
        self.smif
            .install_interrupt(self.config.irq_priority)
            .map_err(peripheral("interrupt setup"))?;
        self.smif
            .init(&self.config.smif)
            .map_err(peripheral("peripheral init"))?;
        self.smif.set_data_select(slot.slave_select, slot.data_select);
        self.smif.enable();
        self.smif.enable_interrupt();
        self.initialized = true;

        debug!(
            "block device ready: {} bytes, {} byte pages, {} byte sectors",
            self.geometry.device_size,
            self.geometry.page_size,
            self.geometry.sector_size
        );
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), Self::Error> {
        if self.initialized {
            self.smif.deinit();
            self.initialized = false;
            debug!("block device shut down");
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], addr: BdAddr) -> Result<(), Self::Error> {
        self.check_request(addr, buf.len() as BdSize)?;
        if buf.is_empty() {
            return Ok(());
        }
        self.enable_quad()?;

        let slot = self.slot;
        let max_len = self.config.max_read_len.unwrap_or(buf.len()).max(1);
        let mut addr = addr;
        for chunk in buf.chunks_mut(max_len) {
            trace!("read: {} bytes at {:#x}", chunk.len(), addr);
            self.smif
                .read(slot, address_bytes(addr), chunk)
                .map_err(peripheral("read"))?;
            self.wait_transfer_done()?;
            addr += chunk.len() as BdAddr;
        }
        Ok(())
    }

    fn program(&mut self, data: &[u8], addr: BdAddr) -> Result<(), Self::Error> {
        self.check_request(addr, data.len() as BdSize)?;

        let page_size = self.geometry.page_size;
        let mut addr = addr;
        let mut rest = data;
        while !rest.is_empty() {
            let offset = addr % page_size;
            let chunk = cmp::min(rest.len() as BdSize, page_size - offset) as usize;
            let (head, tail) = rest.split_at(chunk);
            self.program_page(addr, head)?;
            addr += chunk as BdAddr;
            rest = tail;
        }
        Ok(())
    }

    fn erase(&mut self, addr: BdAddr, size: BdSize) -> Result<(), Self::Error> {
        self.check_request(addr, size)?;
        if size == 0 {
            return Ok(());
        }

        // The last sector is erased whole even if the request ends inside it.
        let sector_size = self.geometry.sector_size;
        let end = addr + size;
        let mut sector = addr - addr % sector_size;
        while sector < end {
            self.erase_sector(sector)?;
            sector += sector_size;
        }
        Ok(())
    }

    fn read_size(&self) -> BdSize {
        self.geometry.page_size
    }

    fn program_size(&self) -> BdSize {
        self.geometry.page_size
    }

    fn erase_size(&self) -> BdSize {
        self.geometry.sector_size
    }

    fn size(&self) -> BdSize {
        self.geometry.device_size
    }

    fn erase_value(&self) -> u8 {
        ERASE_VALUE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BD_ERROR_DEVICE_ERROR;
    use crate::sim::{Call, Op, SimDelay, SimError, SimFlash, SimTiming, SIM_PART, SIM_SLOT};
    use crate::slot::{DataSelect, MemDeviceConfig, SlaveSelect};

    const PAGE: usize = 256;
    const SECTOR: usize = 4096;

    fn device() -> SmifBlockDevice<SimFlash, SimDelay> {
        SmifBlockDevice::new(
            SimFlash::new(&SIM_SLOT),
            SimDelay::default(),
            &SIM_SLOT,
            BlockDeviceConfig::default(),
        )
    }

    fn ready() -> SmifBlockDevice<SimFlash, SimDelay> {
        let mut bd = device();
        bd.init().unwrap();
        bd.peripheral_mut().clear_calls();
        bd
    }

    fn count(calls: &[Call], pred: impl Fn(&Call) -> bool) -> usize {
        calls.iter().filter(|&c| pred(c)).count()
    }

    #[test]
    fn init_twice_is_init_once() {
        let mut bd = device();
        bd.init().unwrap();
        bd.init().unwrap();
        assert!(bd.is_initialized());
        assert_eq!(
            bd.peripheral().calls(),
            &[
                Call::InstallInterrupt { priority: 1 },
                Call::Init,
                Call::SetDataSelect(SlaveSelect::Ss0, DataSelect::Sel0),
                Call::Enable,
                Call::EnableInterrupt,
            ]
        );
        assert!(bd.peripheral().is_enabled());
        assert!(bd.peripheral().interrupt_enabled());
    }

    #[test]
    fn deinit_before_init_is_a_noop() {
        let mut bd = device();
        assert_eq!(bd.deinit(), Ok(()));
        assert_eq!(bd.deinit(), Ok(()));
        assert!(bd.peripheral().calls().is_empty());
        assert!(!bd.is_initialized());
    }

    #[test]
    fn deinit_returns_to_uninitialized() {
        let mut bd = ready();
        bd.deinit().unwrap();
        bd.deinit().unwrap();
        assert_eq!(bd.peripheral().calls(), &[Call::Deinit]);
        assert!(!bd.peripheral().is_enabled());

        let mut buf = [0u8; 4];
        assert_eq!(bd.read(&mut buf, 0), Err(Error::NotInitialized));

        bd.init().unwrap();
        assert_eq!(bd.read(&mut buf, 0), Ok(()));
        assert_eq!(buf, [ERASE_VALUE; 4]);
    }

    #[test]
    fn uninitialized_data_operations_touch_no_hardware() {
        let mut bd = device();
        let mut buf = [0u8; 16];

        let err = bd.read(&mut buf, 0).unwrap_err();
        assert_eq!(err, Error::NotInitialized);
        assert_eq!(err.code(), BD_ERROR_DEVICE_ERROR);
        assert_eq!(bd.program(&buf, 0), Err(Error::NotInitialized));
        assert_eq!(bd.erase(0, SECTOR as BdSize), Err(Error::NotInitialized));

        assert!(bd.peripheral().calls().is_empty());
        assert_eq!(bd.peripheral().memory_polls(), 0);
        assert_eq!(bd.peripheral().engine_polls(), 0);
    }

    #[test]
    fn failed_init_leaves_the_device_down() {
        let mut bd = device();
        bd.peripheral_mut().fail_nth(Op::Init, 1);
        assert_eq!(
            bd.init(),
            Err(Error::Peripheral(SimError::Injected(Op::Init)))
        );
        assert!(!bd.is_initialized());
        assert!(!bd.peripheral().is_enabled());

        let mut buf = [0u8; 1];
        assert_eq!(bd.read(&mut buf, 0), Err(Error::NotInitialized));

        bd.init().unwrap();
        assert!(bd.is_initialized());
    }

    #[test]
    fn failed_interrupt_setup_stops_init_early() {
        let mut bd = device();
        bd.peripheral_mut().fail_nth(Op::InstallInterrupt, 1);
        assert!(bd.init().is_err());
        assert_eq!(
            bd.peripheral().calls(),
            &[Call::InstallInterrupt { priority: 1 }]
        );
    }

    #[test]
    fn out_of_bounds_requests_are_rejected() {
        let mut bd = ready();
        let size = bd.size();
        let mut buf = [0u8; 2];
        assert_eq!(
            bd.read(&mut buf, size - 1),
            Err(Error::OutOfBounds {
                addr: size - 1,
                size: 2
            })
        );
        assert!(bd.program(&buf, size).is_err());
        assert!(bd.erase(SECTOR as BdAddr, size).is_err());
        assert!(bd.peripheral().calls().is_empty());
    }

    #[test]
    fn read_sequence() {
        let mut bd = ready();
        let mut buf = [0u8; 32];
        bd.read(&mut buf, 0x1234).unwrap();
        assert_eq!(
            bd.peripheral().calls(),
            &[
                Call::QuadEnable { command: 0x01 },
                Call::ReadStatus { command: 0x35 },
                Call::Read {
                    command: 0x6B,
                    addr: 0x1234,
                    len: 32
                },
            ]
        );
        assert!(bd.peripheral().quad_enabled());
        assert!(bd.peripheral().engine_polls() > 0);
    }

    #[test]
    fn program_sequence_for_one_page() {
        let mut bd = ready();
        bd.program(&[0x5A; 16], 0x200).unwrap();
        assert_eq!(
            bd.peripheral().calls(),
            &[
                Call::QuadEnable { command: 0x01 },
                Call::ReadStatus { command: 0x35 },
                Call::WriteEnable,
                Call::Program {
                    command: 0x02,
                    addr: 0x200,
                    len: 16
                },
                Call::ReadStatus { command: 0x05 },
            ]
        );
    }

    #[test]
    fn erase_then_read_yields_erase_value() {
        let mut bd = ready();
        bd.peripheral_mut().preload(0, &[0u8; 3 * SECTOR]);

        let (addr, size) = (0x123, 5000);
        bd.erase(addr, size).unwrap();

        let mut buf = [0u8; 5000];
        bd.read(&mut buf, addr).unwrap();
        assert!(buf.iter().all(|b| *b == bd.erase_value()));
        assert!(bd.peripheral().memory()[2 * SECTOR..3 * SECTOR]
            .iter()
            .all(|b| *b == 0));
    }

    #[test]
    fn erase_tail_smaller_than_a_sector() {
        let mut bd = ready();
        bd.erase(0, SECTOR as BdSize + 1).unwrap();
        assert_eq!(
            bd.peripheral().calls(),
            &[
                Call::WriteEnable,
                Call::SectorErase {
                    command: 0x20,
                    addr: 0
                },
                Call::WriteEnable,
                Call::SectorErase {
                    command: 0x20,
                    addr: SECTOR as u32
                },
            ]
        );
    }

    #[test]
    fn erase_of_nothing_issues_nothing() {
        let mut bd = ready();
        bd.erase(0x10, 0).unwrap();
        bd.program(&[], 0x10).unwrap();
        bd.read(&mut [0u8; 0], 0x10).unwrap();
        assert!(bd.peripheral().calls().is_empty());
    }

    #[test]
    fn erase_program_read_round_trip() {
        let mut bd = ready();
        let data: [u8; 200] = core::array::from_fn(|i| i as u8);
        bd.erase(0, SECTOR as BdSize).unwrap();
        bd.program(&data, 0x100).unwrap();

        let mut out = [0u8; 200];
        bd.read(&mut out, 0x100).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn program_splits_at_the_page_boundary() {
        let mut bd = ready();
        let addr = (PAGE - 1) as BdAddr;
        bd.program(&[0xAA, 0x55], addr).unwrap();

        let programs: alloc::vec::Vec<_> = bd
            .peripheral()
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Program { .. }))
            .cloned()
            .collect();
        assert_eq!(
            programs,
            [
                Call::Program {
                    command: 0x02,
                    addr: PAGE as u32 - 1,
                    len: 1
                },
                Call::Program {
                    command: 0x02,
                    addr: PAGE as u32,
                    len: 1
                },
            ]
        );

        let mut out = [0u8; 2];
        bd.read(&mut out, addr).unwrap();
        assert_eq!(out, [0xAA, 0x55]);
        assert_eq!(bd.peripheral().memory()[0], ERASE_VALUE);
    }

    #[test]
    fn long_program_uses_whole_pages_after_the_first() {
        let mut bd = ready();
        let data = [0x00u8; 3 * PAGE];
        bd.program(&data, 16).unwrap();
        let lens: alloc::vec::Vec<_> = bd
            .peripheral()
            .calls()
            .iter()
            .filter_map(|c| match c {
                Call::Program { len, .. } => Some(*len),
                _ => None,
            })
            .collect();
        assert_eq!(lens, [PAGE - 16, PAGE, PAGE, 16]);
        assert!(bd.peripheral().memory()[16..16 + 3 * PAGE]
            .iter()
            .all(|b| *b == 0));
    }

    #[test]
    fn chunked_reads_honour_the_transfer_limit() {
        let config = BlockDeviceConfig {
            max_read_len: Some(100),
            ..BlockDeviceConfig::default()
        };
        let mut bd = SmifBlockDevice::new(
            SimFlash::new(&SIM_SLOT),
            SimDelay::default(),
            &SIM_SLOT,
            config,
        );
        bd.init().unwrap();
        let data: [u8; 250] = core::array::from_fn(|i| (i * 7) as u8);
        bd.peripheral_mut().preload(0x400, &data);
        bd.peripheral_mut().clear_calls();

        let mut out = [0u8; 250];
        bd.read(&mut out, 0x400).unwrap();
        assert_eq!(out, data);
        let reads = count(bd.peripheral().calls(), |c| matches!(c, Call::Read { .. }));
        assert_eq!(reads, 3);
        let quad = count(bd.peripheral().calls(), |c| {
            matches!(c, Call::QuadEnable { .. })
        });
        assert_eq!(quad, 1);
    }

    #[test]
    fn geometry_is_constant() {
        let bd = device();
        assert_eq!(bd.read_size(), PAGE as BdSize);
        assert_eq!(bd.program_size(), PAGE as BdSize);
        assert_eq!(bd.erase_size(), SECTOR as BdSize);
        assert_eq!(bd.size(), 64 * 1024);
        assert_eq!(bd.erase_value(), 0xFF);
        assert_eq!(bd.erase_size() % bd.program_size(), 0);
        for addr in (0..bd.size()).step_by(1000) {
            assert_eq!(bd.erase_size_at(addr), bd.erase_size());
        }
    }

    #[test]
    fn validity_helpers_follow_the_geometry() {
        let bd = device();
        assert!(bd.is_valid_program(0, PAGE as BdSize));
        assert!(!bd.is_valid_program(1, PAGE as BdSize));
        assert!(bd.is_valid_erase(SECTOR as BdAddr, SECTOR as BdSize));
        assert!(!bd.is_valid_erase(0, PAGE as BdSize));
        assert!(!bd.is_valid_read(bd.size(), PAGE as BdSize));
    }

    #[test]
    fn failed_program_keeps_earlier_pages() {
        let mut bd = ready();
        let data: [u8; 600] = core::array::from_fn(|i| (i % 251) as u8);
        bd.peripheral_mut().fail_nth(Op::Program, 2);

        let err = bd.program(&data, 0).unwrap_err();
        assert_eq!(err, Error::Peripheral(SimError::Injected(Op::Program)));

        let mut out = [0u8; 600];
        bd.read(&mut out, 0).unwrap();
        assert_eq!(out[..PAGE], data[..PAGE]);
        assert!(out[PAGE..].iter().all(|b| *b == ERASE_VALUE));
        assert_eq!(&out[..], &bd.peripheral().memory()[..600]);
    }

    #[test]
    fn failed_erase_keeps_earlier_sectors() {
        let mut bd = ready();
        bd.peripheral_mut().preload(0, &[0u8; 3 * SECTOR]);
        bd.peripheral_mut().fail_nth(Op::SectorErase, 2);

        assert!(bd.erase(0, 3 * SECTOR as BdSize).is_err());
        let mem = bd.peripheral().memory();
        assert!(mem[..SECTOR].iter().all(|b| *b == ERASE_VALUE));
        assert!(mem[SECTOR..3 * SECTOR].iter().all(|b| *b == 0));
        let erases = count(bd.peripheral().calls(), |c| {
            matches!(c, Call::SectorErase { .. })
        });
        assert_eq!(erases, 2);
    }

    #[test]
    fn failed_write_enable_aborts_before_program() {
        let mut bd = ready();
        bd.peripheral_mut().fail_nth(Op::WriteEnable, 1);
        assert!(bd.program(&[0u8; 4], 0).is_err());
        assert_eq!(
            count(bd.peripheral().calls(), |c| matches!(c, Call::Program { .. })),
            0
        );
    }

    #[test]
    fn failed_status_read_fails_the_read() {
        let mut bd = ready();
        bd.peripheral_mut().fail_nth(Op::ReadStatus, 1);
        let mut buf = [0u8; 8];
        assert_eq!(
            bd.read(&mut buf, 0),
            Err(Error::Peripheral(SimError::Injected(Op::ReadStatus)))
        );
        assert_eq!(
            count(bd.peripheral().calls(), |c| matches!(c, Call::Read { .. })),
            0
        );
    }

    #[test]
    fn program_error_bit_fails_the_call() {
        let mut bd = ready();
        bd.peripheral_mut().set_program_error(true);
        match bd.program(&[0u8; 4], 0) {
            Err(Error::ProgramFailed { status }) => assert_ne!(status & 0x40, 0),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn busy_part_times_out() {
        let timing = SimTiming {
            erase_busy_polls: 1_000_000,
            ..SimTiming::default()
        };
        let mut bd = SmifBlockDevice::new(
            SimFlash::new(&SIM_SLOT).with_timing(timing),
            SimDelay::default(),
            &SIM_SLOT,
            BlockDeviceConfig::default(),
        );
        bd.init().unwrap();
        assert_eq!(bd.erase(0, 1), Err(Error::Timeout));

        let (_, delay) = bd.release();
        // 50 ms erase budget at 10 µs per poll.
        assert_eq!(delay.elapsed_ns(), 50_000 * 1000);
    }

    #[test]
    fn waits_until_the_part_is_idle() {
        let mut bd = ready();
        bd.erase(0, 1).unwrap();
        // Default sim timing keeps an erase busy for 64 polls, plus the final idle poll.
        assert_eq!(bd.peripheral().memory_polls(), 65);
    }

    #[test]
    fn borrowed_peripheral() {
        let mut sim = SimFlash::new(&SIM_SLOT);
        {
            let mut bd = SmifBlockDevice::new(
                &mut sim,
                SimDelay::default(),
                &SIM_SLOT,
                BlockDeviceConfig::default(),
            );
            bd.init().unwrap();
            bd.erase(0, SECTOR as BdSize).unwrap();
            bd.program(b"smif", 0x10).unwrap();
        }
        assert_eq!(&sim.memory()[0x10..0x14], b"smif");
    }

    #[test]
    fn failed_read_command_fails_the_read() {
        let mut bd = ready();
        bd.peripheral_mut().fail_nth(Op::Read, 1);
        let mut buf = [0u8; 8];
        assert_eq!(
            bd.read(&mut buf, 0),
            Err(Error::Peripheral(SimError::Injected(Op::Read)))
        );
        assert_eq!(bd.peripheral().engine_polls(), 0);
    }

    #[test]
    fn failed_busy_poll_fails_a_later_erase() {
        let mut bd = ready();
        let mut buf = [0u8; 8];
        bd.read(&mut buf, 0).unwrap();
        assert!(bd.peripheral().op_count(Op::IsMemoryBusy) > 0);

        bd.peripheral_mut().fail_nth(Op::IsMemoryBusy, 1);
        assert_eq!(
            bd.erase(0, 1),
            Err(Error::Peripheral(SimError::Injected(Op::IsMemoryBusy)))
        );
    }

    #[test]
    fn failed_status_read_after_program_fails_the_program() {
        let mut bd = ready();
        // The first status read of a chunk is the QE read-back.
        bd.peripheral_mut().fail_nth(Op::ReadStatus, 2);
        let err = bd.program(&[0x12; 4], 0).unwrap_err();
        assert_eq!(err, Error::Peripheral(SimError::Injected(Op::ReadStatus)));
        assert_eq!(err.code(), BD_ERROR_DEVICE_ERROR);
        assert_eq!(bd.peripheral().memory()[..4], [0x12; 4]);
    }

    #[test]
    fn program_that_never_finishes_times_out() {
        let timing = SimTiming {
            program_busy_polls: u32::MAX,
            ..SimTiming::default()
        };
        let mut bd = SmifBlockDevice::new(
            SimFlash::new(&SIM_SLOT).with_timing(timing),
            SimDelay::default(),
            &SIM_SLOT,
            BlockDeviceConfig::default(),
        );
        bd.init().unwrap();
        let err = bd.program(&[0u8; 4], 0).unwrap_err();
        assert_eq!(err, Error::Timeout);
        assert_eq!(err.code(), BD_ERROR_DEVICE_ERROR);
        // No status read once the wait gave up.
        assert_eq!(
            count(bd.peripheral().calls(), |c| *c == Call::ReadStatus { command: 0x05 }),
            0
        );
    }

    #[test]
    fn stuck_engine_times_out() {
        let timing = SimTiming {
            transfer_busy_polls: u32::MAX,
            ..SimTiming::default()
        };
        let mut bd = SmifBlockDevice::new(
            SimFlash::new(&SIM_SLOT).with_timing(timing),
            SimDelay::default(),
            &SIM_SLOT,
            BlockDeviceConfig::default(),
        );
        bd.init().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(bd.read(&mut buf, 0), Err(Error::Timeout));

        let (sim, delay) = bd.release();
        // 5 ms transfer budget at 10 µs per poll, plus the final poll.
        assert_eq!(sim.engine_polls(), 501);
        assert_eq!(delay.elapsed_ns(), 5_000 * 1000);
    }

    #[test]
    #[should_panic(expected = "inconsistent slot geometry")]
    fn zero_page_size_is_rejected() {
        let part: &'static MemDeviceConfig = alloc::boxed::Box::leak(alloc::boxed::Box::new(
            MemDeviceConfig {
                program_size: 0,
                ..SIM_PART
            },
        ));
        let slot: &'static MemSlot = alloc::boxed::Box::leak(alloc::boxed::Box::new(MemSlot {
            device: part,
            ..SIM_SLOT
        }));
        SmifBlockDevice::new(
            SimFlash::new(&SIM_SLOT),
            SimDelay::default(),
            slot,
            BlockDeviceConfig::default(),
        );
    }

    const OFFSETS: [usize; 8] = [
        0,
        1,
        PAGE - 1,
        PAGE,
        PAGE + 1,
        SECTOR - 1,
        SECTOR + 1,
        2 * SECTOR - 3,
    ];
    const LENGTHS: [usize; 7] = [1, 2, PAGE - 1, PAGE, PAGE + 1, 2 * PAGE + 1, SECTOR + 1];

    #[test]
    fn erase_sweep_reads_back_erased_and_keeps_neighbours() {
        for addr in OFFSETS {
            for len in LENGTHS {
                let mut bd = ready();
                let total = bd.size() as usize;
                bd.peripheral_mut().preload(0, &alloc::vec![0u8; total]);
                bd.erase(addr as BdAddr, len as BdSize).unwrap();

                let mut out = alloc::vec![0u8; len];
                bd.read(&mut out, addr as BdAddr).unwrap();
                assert!(out.iter().all(|b| *b == ERASE_VALUE), "{addr:#x}+{len}");

                let first = addr / SECTOR * SECTOR;
                let last = (addr + len).div_ceil(SECTOR) * SECTOR;
                let mem = bd.peripheral().memory();
                assert!(mem[first..last].iter().all(|b| *b == ERASE_VALUE));
                assert!(mem[..first].iter().all(|b| *b == 0), "{addr:#x}+{len}");
                assert!(mem[last..].iter().all(|b| *b == 0), "{addr:#x}+{len}");
            }
        }
    }

    #[test]
    fn program_sweep_round_trips_and_keeps_neighbours() {
        for addr in OFFSETS {
            for len in LENGTHS {
                let mut bd = ready();
                let data: alloc::vec::Vec<u8> =
                    (0..len).map(|i| (i % 251) as u8 ^ 0x5A).collect();
                bd.program(&data, addr as BdAddr).unwrap();

                let mut out = alloc::vec![0u8; len];
                bd.read(&mut out, addr as BdAddr).unwrap();
                assert_eq!(out, data, "{addr:#x}+{len}");

                let mem = bd.peripheral().memory();
                assert!(mem[..addr].iter().all(|b| *b == ERASE_VALUE));
                assert!(mem[addr + len..].iter().all(|b| *b == ERASE_VALUE));

                let programs = count(bd.peripheral().calls(), |c| {
                    matches!(c, Call::Program { .. })
                });
                let pages = (addr + len).div_ceil(PAGE) - addr / PAGE;
                assert_eq!(programs, pages, "{addr:#x}+{len}");
            }
        }
    }
}
