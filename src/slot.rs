//! Memory slot descriptors: which commands a flash part understands, how the
//! peripheral should clock them out, and the part's geometry and timings.
//!
//! Refer to the S25FL512S datasheet:
//! https://www.infineon.com/dgdl/Infineon-S25FL512S_512_Mb_(64_MB)_3.0_V_SPI_Flash_Memory-DataSheet-v20_00-EN.pdf
use crate::traits::{BdAddr, BdSize};

/// Every command carries a 3-byte address.
pub const ADDRESS_SIZE: usize = 3;

/// Erased NOR cells read back as all ones.
pub const ERASE_VALUE: u8 = 0xFF;

/// Number of data lines used for one phase of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusWidth {
    Single,
    Dual,
    Quad,
    Octal,
}

/// One flash command as the peripheral should issue it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MemCmd {
    pub command: u8,
    pub command_width: BusWidth,
    pub address_width: BusWidth,
    /// Mode byte sent after the address, if the command takes one.
    pub mode: Option<u8>,
    pub mode_width: BusWidth,
    pub dummy_cycles: u8,
    pub data_width: BusWidth,
}

impl MemCmd {
    /// A command issued entirely on one data line.
    pub const fn single(command: u8) -> Self {
        Self {
            command,
            command_width: BusWidth::Single,
            address_width: BusWidth::Single,
            mode: None,
            mode_width: BusWidth::Single,
            dummy_cycles: 0,
            data_width: BusWidth::Single,
        }
    }
}

/// Peripheral slave-select line the part is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlaveSelect {
    Ss0,
    Ss1,
    Ss2,
    Ss3,
}

/// Peripheral data-line group the part is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataSelect {
    Sel0,
    Sel1,
    Sel2,
    Sel3,
}

/// Command set, status masks, geometry and timings of one flash part.
///
/// The table lists the part's full command set as the peripheral driver
/// expects it. The block device itself never issues write disable or chip
/// erase; those entries are there for other users of the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemDeviceConfig {
    /// Must be [`ADDRESS_SIZE`].
    pub num_of_addr_bytes: u8,
    pub mem_size: u32,
    pub read_cmd: MemCmd,
    pub write_en_cmd: MemCmd,
    pub write_dis_cmd: MemCmd,
    pub erase_cmd: MemCmd,
    pub erase_size: u32,
    pub chip_erase_cmd: MemCmd,
    pub program_cmd: MemCmd,
    pub program_size: u32,
    /// Reads the register holding the write-in-progress bit.
    pub read_sts_reg_wip_cmd: MemCmd,
    /// Reads the register holding the quad-enable bit.
    pub read_sts_reg_qe_cmd: MemCmd,
    /// Writes the register holding the quad-enable bit.
    pub write_sts_reg_qe_cmd: MemCmd,
    /// Write-in-progress bits in the register read by `read_sts_reg_wip_cmd`.
    pub sts_reg_busy_mask: u8,
    pub sts_reg_quad_enable_mask: u8,
    /// Status bits flagging a failed page program. Zero if the part has none.
    pub sts_reg_program_error_mask: u8,
    /// Max sector erase time, ms.
    pub erase_time_ms: u32,
    /// Max chip erase time, ms.
    pub chip_erase_time_ms: u32,
    /// Max page program time, µs.
    pub program_time_us: u32,
}

/// One populated memory slot of the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemSlot {
    pub slave_select: SlaveSelect,
    pub data_select: DataSelect,
    pub device: &'static MemDeviceConfig,
}

/// Program, erase and total sizes of a part. Fixed for the part's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Geometry {
    pub page_size: BdSize,
    pub sector_size: BdSize,
    pub device_size: BdSize,
}

impl Geometry {
    pub const fn of(device: &MemDeviceConfig) -> Self {
        Self {
            page_size: device.program_size as BdSize,
            sector_size: device.erase_size as BdSize,
            device_size: device.mem_size as BdSize,
        }
    }

    /// Pages tile sectors and sectors tile the device.
    pub const fn is_consistent(&self) -> bool {
        self.page_size != 0
            && self.sector_size % self.page_size == 0
            && self.sector_size != 0
            && self.device_size % self.sector_size == 0
    }

    /// Whether `[addr, addr + size)` lies inside the device.
    pub fn contains(&self, addr: BdAddr, size: BdSize) -> bool {
        addr.checked_add(size)
            .is_some_and(|end| end <= self.device_size)
    }
}

bitflags::bitflags! {
    /// Status register 1 bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u8 {
        /// Erase or write in progress.
        const WIP = 1 << 0;
        /// Status of the **W**rite **E**nable **L**atch.
        const WEL = 1 << 1;
        /// The 3 block protection bits.
        const BP = 0b0001_1100;
        /// Last erase failed.
        const E_ERR = 1 << 5;
        /// Last program failed.
        const P_ERR = 1 << 6;
        /// **S**tatus **R**egister **W**rite **D**isable bit.
        const SRWD = 1 << 7;
    }
}

/// Big-endian 3-byte command address. Bits above 23 are dropped, so parts
/// larger than 16 MiB alias their upper regions onto the lower ones.
pub const fn address_bytes(addr: BdAddr) -> [u8; ADDRESS_SIZE] {
    [(addr >> 16) as u8, (addr >> 8) as u8, addr as u8]
}

/// Cypress S25FL512S, 64 MiB, quad I/O read and quad page program.
pub static S25FL512S: MemDeviceConfig = MemDeviceConfig {
    num_of_addr_bytes: ADDRESS_SIZE as u8,
    mem_size: 0x0400_0000,
    read_cmd: MemCmd {
        command: 0xEB,
        command_width: BusWidth::Single,
        address_width: BusWidth::Quad,
        mode: Some(0x01),
        mode_width: BusWidth::Quad,
        dummy_cycles: 4,
        data_width: BusWidth::Quad,
    },
    write_en_cmd: MemCmd::single(0x06),
    write_dis_cmd: MemCmd::single(0x04),
    erase_cmd: MemCmd::single(0xD8),
    erase_size: 256 * 1024,
    chip_erase_cmd: MemCmd::single(0x60),
    program_cmd: MemCmd {
        command: 0x38,
        command_width: BusWidth::Single,
        address_width: BusWidth::Single,
        mode: None,
        mode_width: BusWidth::Single,
        dummy_cycles: 0,
        data_width: BusWidth::Quad,
    },
    program_size: 512,
    read_sts_reg_wip_cmd: MemCmd::single(0x05),
    read_sts_reg_qe_cmd: MemCmd::single(0x35),
    write_sts_reg_qe_cmd: MemCmd::single(0x01),
    sts_reg_busy_mask: Status::WIP.bits(),
    sts_reg_quad_enable_mask: 0x02,
    sts_reg_program_error_mask: Status::P_ERR.bits(),
    erase_time_ms: 2600,
    chip_erase_time_ms: 460_000,
    program_time_us: 1300,
};

/// S25FL512S on slave select 0, data lines 0-3.
pub static S25FL512S_SLOT: MemSlot = MemSlot {
    slave_select: SlaveSelect::Ss0,
    data_select: DataSelect::Sel0,
    device: &S25FL512S,
};
