/// Byte address on a block device.
pub type BdAddr = u64;
/// Byte count on a block device.
pub type BdSize = u64;

/// Block device contract shared by storage drivers.
///
/// Programmed regions must have been erased first; the device does not
/// enforce this.
pub trait BlockDevice {
    type Error;

    /// Brings the device up. Calling it on a ready device is a no-op.
    fn init(&mut self) -> Result<(), Self::Error>;

    /// Shuts the device down. Calling it on a device that is not ready is a no-op.
    fn deinit(&mut self) -> Result<(), Self::Error>;

    /// Ensures data on storage is in sync with the driver.
    fn sync(&mut self) -> Result<(), Self::Error>;

    /// Reads `buf.len()` bytes starting at `addr`.
    fn read(&mut self, buf: &mut [u8], addr: BdAddr) -> Result<(), Self::Error>;

    /// Programs `data` starting at `addr`. The region must have been erased.
    fn program(&mut self, data: &[u8], addr: BdAddr) -> Result<(), Self::Error>;

    /// Erases every erase block touched by `[addr, addr + size)`.
    ///
    /// Erased bytes read back as [`BlockDevice::erase_value`].
    fn erase(&mut self, addr: BdAddr, size: BdSize) -> Result<(), Self::Error>;

    /// Size of a readable block in bytes.
    fn read_size(&self) -> BdSize;

    /// Size of a programmable block in bytes. A multiple of the read size.
    fn program_size(&self) -> BdSize;

    /// Size of an erasable block in bytes. A multiple of the program size.
    fn erase_size(&self) -> BdSize;

    /// Size of the erasable block containing `addr`.
    ///
    /// Parts with a non-uniform sector map override this.
    fn erase_size_at(&self, _addr: BdAddr) -> BdSize {
        self.erase_size()
    }

    /// Total size of the device in bytes.
    fn size(&self) -> BdSize;

    /// Value erased bytes read as.
    fn erase_value(&self) -> u8;

    fn is_valid_read(&self, addr: BdAddr, size: BdSize) -> bool {
        is_valid(addr, size, self.read_size(), self.size())
    }

    fn is_valid_program(&self, addr: BdAddr, size: BdSize) -> bool {
        is_valid(addr, size, self.program_size(), self.size())
    }

    fn is_valid_erase(&self, addr: BdAddr, size: BdSize) -> bool {
        is_valid(addr, size, self.erase_size_at(addr), self.size())
    }
}

/// Async flavour of [`BlockDevice`]. Geometry stays synchronous.
#[allow(async_fn_in_trait)]
pub trait AsyncBlockDevice {
    type Error;

    async fn init(&mut self) -> Result<(), Self::Error>;

    async fn deinit(&mut self) -> Result<(), Self::Error>;

    async fn sync(&mut self) -> Result<(), Self::Error>;

    async fn read(&mut self, buf: &mut [u8], addr: BdAddr) -> Result<(), Self::Error>;

    async fn program(&mut self, data: &[u8], addr: BdAddr) -> Result<(), Self::Error>;

    async fn erase(&mut self, addr: BdAddr, size: BdSize) -> Result<(), Self::Error>;

    fn read_size(&self) -> BdSize;

    fn program_size(&self) -> BdSize;

    fn erase_size(&self) -> BdSize;

    fn erase_size_at(&self, _addr: BdAddr) -> BdSize {
        self.erase_size()
    }

    fn size(&self) -> BdSize;

    fn erase_value(&self) -> u8;
}

fn is_valid(addr: BdAddr, size: BdSize, granularity: BdSize, device_size: BdSize) -> bool {
    granularity != 0
        && addr % granularity == 0
        && size % granularity == 0
        && addr.checked_add(size).is_some_and(|end| end <= device_size)
}
