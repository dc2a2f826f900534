//! The memory interface peripheral as seen by the block device.
//!
//! Implementors own the peripheral registers and its transaction context
//! (including whatever the interrupt handler needs). The block device only
//! sequences calls and looks at their results.
use crate::slot::{DataSelect, MemSlot, SlaveSelect, ADDRESS_SIZE};

/// Peripheral operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SmifMode {
    /// Commands are issued one transaction at a time.
    Normal,
    /// The part is mapped into the address space. Commands are refused in
    /// this mode, so the block device needs [`SmifMode::Normal`].
    MemoryMapped,
}

/// Clock the peripheral samples incoming data with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxClockSel {
    InternalClk,
    InvInternalClk,
    FeedbackClk,
    InvFeedbackClk,
}

/// What the peripheral does with an access it cannot serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BlockEvent {
    /// Raise a bus error.
    BusError,
    /// Stall with wait states.
    WaitStates,
}

/// Peripheral engine configuration applied by [`MemoryInterface::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SmifConfig {
    pub mode: SmifMode,
    /// Minimum slave deselect time between transactions, in interface clocks.
    pub deselect_delay: u8,
    pub rx_clock_sel: RxClockSel,
    pub block_event: BlockEvent,
}

impl Default for SmifConfig {
    fn default() -> Self {
        Self {
            mode: SmifMode::Normal,
            deselect_delay: 7,
            rx_clock_sel: RxClockSel::InvInternalClk,
            block_event: BlockEvent::BusError,
        }
    }
}

/// Serial memory interface peripheral driving a flash part.
///
/// Command methods issue one transaction described by `slot` and return once
/// the peripheral has accepted it. Completion is observed separately through
/// [`MemoryInterface::is_memory_busy`] (chip side) and
/// [`MemoryInterface::is_busy`] (engine side).
pub trait MemoryInterface {
    type Error;

    /// Configures the peripheral interrupt at `priority` and installs the
    /// handler bound to this peripheral's transaction context.
    fn install_interrupt(&mut self, priority: u8) -> Result<(), Self::Error>;

    /// Initialises the peripheral engine.
    fn init(&mut self, config: &SmifConfig) -> Result<(), Self::Error>;

    /// Tears down the peripheral engine.
    fn deinit(&mut self);

    /// Routes `slave_select` to the `data_select` data-line group.
    fn set_data_select(&mut self, slave_select: SlaveSelect, data_select: DataSelect);

    /// Enables the peripheral engine.
    fn enable(&mut self);

    /// Unmasks the peripheral interrupt line.
    fn enable_interrupt(&mut self);

    /// Sets the part's quad-enable bit so the following commands may use
    /// four data lines.
    fn quad_enable(&mut self, slot: &MemSlot) -> Result<(), Self::Error>;

    /// Reads one status register with opcode `command`.
    fn read_status(&mut self, slot: &MemSlot, command: u8) -> Result<u8, Self::Error>;

    /// Sets the part's write enable latch.
    fn write_enable(&mut self, slot: &MemSlot) -> Result<(), Self::Error>;

    /// Reads `buf.len()` bytes starting at `addr`.
    fn read(
        &mut self,
        slot: &MemSlot,
        addr: [u8; ADDRESS_SIZE],
        buf: &mut [u8],
    ) -> Result<(), Self::Error>;

    /// Page program of `data` at `addr`. `data` must not cross a page.
    fn program(
        &mut self,
        slot: &MemSlot,
        addr: [u8; ADDRESS_SIZE],
        data: &[u8],
    ) -> Result<(), Self::Error>;

    /// Erases the sector containing `addr`.
    fn sector_erase(&mut self, slot: &MemSlot, addr: [u8; ADDRESS_SIZE])
        -> Result<(), Self::Error>;

    /// Whether the part reports a write in progress.
    fn is_memory_busy(&mut self, slot: &MemSlot) -> Result<bool, Self::Error>;

    /// Whether the peripheral engine is still running a transaction.
    fn is_busy(&mut self) -> bool;
}

impl<T: MemoryInterface + ?Sized> MemoryInterface for &mut T {
    type Error = T::Error;

    fn install_interrupt(&mut self, priority: u8) -> Result<(), Self::Error> {
        (**self).install_interrupt(priority)
    }

    fn init(&mut self, config: &SmifConfig) -> Result<(), Self::Error> {
        (**self).init(config)
    }

    fn deinit(&mut self) {
        (**self).deinit()
    }

    fn set_data_select(&mut self, slave_select: SlaveSelect, data_select: DataSelect) {
        (**self).set_data_select(slave_select, data_select)
    }

    fn enable(&mut self) {
        (**self).enable()
    }

    fn enable_interrupt(&mut self) {
        (**self).enable_interrupt()
    }

    fn quad_enable(&mut self, slot: &MemSlot) -> Result<(), Self::Error> {
        (**self).quad_enable(slot)
    }

    fn read_status(&mut self, slot: &MemSlot, command: u8) -> Result<u8, Self::Error> {
        (**self).read_status(slot, command)
    }

    fn write_enable(&mut self, slot: &MemSlot) -> Result<(), Self::Error> {
        (**self).write_enable(slot)
    }

    fn read(
        &mut self,
        slot: &MemSlot,
        addr: [u8; ADDRESS_SIZE],
        buf: &mut [u8],
    ) -> Result<(), Self::Error> {
        (**self).read(slot, addr, buf)
    }

    fn program(
        &mut self,
        slot: &MemSlot,
        addr: [u8; ADDRESS_SIZE],
        data: &[u8],
    ) -> Result<(), Self::Error> {
        (**self).program(slot, addr, data)
    }

    fn sector_erase(
        &mut self,
        slot: &MemSlot,
        addr: [u8; ADDRESS_SIZE],
    ) -> Result<(), Self::Error> {
        (**self).sector_erase(slot, addr)
    }

    fn is_memory_busy(&mut self, slot: &MemSlot) -> Result<bool, Self::Error> {
        (**self).is_memory_busy(slot)
    }

    fn is_busy(&mut self) -> bool {
        (**self).is_busy()
    }
}
