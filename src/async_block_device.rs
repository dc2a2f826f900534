use core::cmp;
use core::fmt::Debug;

use embedded_hal_async::delay::DelayNs;

use crate::config::BlockDeviceConfig;
use crate::error::{peripheral, Error};
use crate::peripheral::MemoryInterface;
use crate::poll::PollBudget;
use crate::slot::{address_bytes, Geometry, MemSlot, ADDRESS_SIZE, ERASE_VALUE};
use crate::traits::{AsyncBlockDevice, BdAddr, BdSize};

/// [`crate::SmifBlockDevice`] that yields to the executor between busy polls.
///
/// Commands are still issued synchronously; only the waits for the part and
/// the engine await the delay. Operations return after the hardware is done.
pub struct AsyncSmifBlockDevice<P, D> {
    smif: P,
    delay: D,
    slot: &'static MemSlot,
    config: BlockDeviceConfig,
    geometry: Geometry,
    initialized: bool,
}

impl<P, D> Debug for AsyncSmifBlockDevice<P, D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AsyncSmifBlockDevice")
            .field("geometry", &self.geometry)
            .field("initialized", &self.initialized)
            .finish()
    }
}

impl<P, D> AsyncSmifBlockDevice<P, D> {
    /// # Panics
    ///
    /// Under the same conditions as [`crate::SmifBlockDevice::new`].
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

    pub fn release(self) -> (P, D) {
        (self.smif, self.delay)
    }
}

impl<P, D> AsyncSmifBlockDevice<P, D>
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

    async fn wait_memory_ready(&mut self, timeout_us: u32) -> Result<(), Error<P::Error>> {
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
            self.delay.delay_us(interval_us).await;
        }
        Ok(())
    }

    async fn wait_transfer_done(&mut self) -> Result<(), Error<P::Error>> {
        let timeout_us = self.config.poll.transfer_timeout_us;
        let mut budget = PollBudget::new(&self.config.poll, timeout_us);
        while self.smif.is_busy() {
            let interval_us = match budget.spend() {
                Ok(us) => us,
                Err(e) => {
                    error!("transfer still running after {} us", timeout_us);
                    return Err(e);
                }
            };
            self.delay.delay_us(interval_us).await;
        }
        Ok(())
    }

    async fn enable_quad(&mut self) -> Result<(), Error<P::Error>> {
        let slot = self.slot;
        self.smif.quad_enable(slot).map_err(peripheral("quad enable"))?;
        self.wait_memory_ready(self.config.poll.status_write_timeout_us)
            .await?;

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

    async fn program_page(&mut self, addr: BdAddr, data: &[u8]) -> Result<(), Error<P::Error>> {
        let slot = self.slot;
        self.enable_quad().await?;
        self.smif
            .write_enable(slot)
            .map_err(peripheral("write enable"))?;

        trace!("page program: {} bytes at {:#x}", data.len(), addr);
        self.smif
            .program(slot, address_bytes(addr), data)
            .map_err(peripheral("page program"))?;
        self.wait_memory_ready(slot.device.program_time_us).await?;

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

    async fn erase_sector(&mut self, addr: BdAddr) -> Result<(), Error<P::Error>> {
        let slot = self.slot;
        self.smif
            .write_enable(slot)
            .map_err(peripheral("write enable"))?;

        trace!("sector erase at {:#x}", addr);
        self.smif
            .sector_erase(slot, address_bytes(addr))
            .map_err(peripheral("sector erase"))?;
        self.wait_memory_ready(slot.device.erase_time_ms.saturating_mul(1000))
            .await
    }
}

impl<P, D> AsyncBlockDevice for AsyncSmifBlockDevice<P, D>
where
    P: MemoryInterface,
    D: DelayNs,
{
    type Error = Error<P::Error>;

    async fn init(&mut self) -> Result<(), Self::Error> {
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
            "async block device ready: {} bytes, {} byte pages, {} byte sectors",
            self.geometry.device_size,
            self.geometry.page_size,
            self.geometry.sector_size
        );
        Ok(())
    }

    async fn deinit(&mut self) -> Result<(), Self::Error> {
        if self.initialized {
            self.smif.deinit();
            self.initialized = false;
            debug!("async block device shut down");
        }
        Ok(())
    }

    async fn sync(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], addr: BdAddr) -> Result<(), Self::Error> {
        self.check_request(addr, buf.len() as BdSize)?;
        if buf.is_empty() {
            return Ok(());
        }
        self.enable_quad().await?;

        let slot = self.slot;
        let max_len = self.config.max_read_len.unwrap_or(buf.len()).max(1);
        let mut addr = addr;
        for chunk in buf.chunks_mut(max_len) {
            trace!("read: {} bytes at {:#x}", chunk.len(), addr);
            self.smif
                .read(slot, address_bytes(addr), chunk)
                .map_err(peripheral("read"))?;
            self.wait_transfer_done().await?;
            addr += chunk.len() as BdAddr;
        }
        Ok(())
    }

    async fn program(&mut self, data: &[u8], addr: BdAddr) -> Result<(), Self::Error> {
        self.check_request(addr, data.len() as BdSize)?;

        let page_size = self.geometry.page_size;
        let mut addr = addr;
        let mut rest = data;
        while !rest.is_empty() {
            let offset = addr % page_size;
            let chunk = cmp::min(rest.len() as BdSize, page_size - offset) as usize;
            let (head, tail) = rest.split_at(chunk);
            self.program_page(addr, head).await?;
            addr += chunk as BdAddr;
            rest = tail;
        }
        Ok(())
    }

    async fn erase(&mut self, addr: BdAddr, size: BdSize) -> Result<(), Self::Error> {
        self.check_request(addr, size)?;
        if size == 0 {
            return Ok(());
        }

        // The last sector is erased whole even if the request ends inside it.
        let sector_size = self.geometry.sector_size;
        let end = addr + size;
        let mut sector = addr - addr % sector_size;
        while sector < end {
            self.erase_sector(sector).await?;
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
