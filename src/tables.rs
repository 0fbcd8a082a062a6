use crate::{op_region::RegionSpace, AmlError, Handler};
use bitflags::bitflags;
use core::fmt;

/// The common header that every System Description Table starts with: signature, length,
/// revision, checksum, and the OEM/creator identification fields.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SdtHeader {
    pub signature: [u8; 4],
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: [u8; 4],
    pub creator_revision: u32,
}

pub const SDT_HEADER_LENGTH: usize = 36;

impl SdtHeader {
    /// Parse an SDT header from the front of `data`, validating that the table's declared length
    /// fits in the slice and that the whole table sums to zero.
    pub fn parse(data: &[u8]) -> Result<SdtHeader, AmlError> {
        if data.len() < SDT_HEADER_LENGTH {
            return Err(AmlError::RunOutOfStream);
        }

        let header = SdtHeader {
            signature: [data[0], data[1], data[2], data[3]],
            length: read_u32(data, 4),
            revision: data[8],
            checksum: data[9],
            oem_id: data[10..16].try_into().unwrap(),
            oem_table_id: data[16..24].try_into().unwrap(),
            oem_revision: read_u32(data, 24),
            creator_id: data[28..32].try_into().unwrap(),
            creator_revision: read_u32(data, 32),
        };

        if (header.length as usize) < SDT_HEADER_LENGTH || (header.length as usize) > data.len() {
            return Err(AmlError::TableInvalidLength(header.length));
        }
        let sum = data[0..header.length as usize].iter().fold(0u8, |sum, &b| sum.wrapping_add(b));
        if sum != 0 {
            return Err(AmlError::TableInvalidChecksum(header.signature));
        }

        Ok(header)
    }
}

/// An address in the ACPI Generic Address Structure format: an address space, a register bit
/// width and offset, an access size, and a 64-bit address. The event subsystem reads and writes
/// all of its hardware registers through these.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct GenericAddress {
    pub space: RegionSpace,
    pub bit_width: u8,
    pub bit_offset: u8,
    pub access_size: u8,
    pub address: u64,
}

impl GenericAddress {
    pub(crate) fn parse(data: &[u8], offset: usize) -> Option<GenericAddress> {
        if data.len() < offset + 12 {
            return None;
        }
        Some(GenericAddress {
            space: RegionSpace::from(data[offset]),
            bit_width: data[offset + 1],
            bit_offset: data[offset + 2],
            access_size: data[offset + 3],
            address: read_u64(data, offset + 4),
        })
    }

    /// A legacy 32-bit register block address from the FADT, expressed as system I/O.
    pub(crate) fn from_legacy_io(address: u32, byte_width: u8) -> GenericAddress {
        GenericAddress {
            space: RegionSpace::SystemIO,
            bit_width: byte_width.saturating_mul(8),
            bit_offset: 0,
            access_size: 0,
            address: address as u64,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.address != 0
    }

    fn access_width(&self) -> usize {
        match self.access_size {
            1 => 1,
            2 => 2,
            3 => 4,
            4 => 8,
            // Undefined access size: fall back to the register width
            _ => usize::max(1, (self.bit_width as usize) / 8),
        }
    }

    pub fn read<H>(&self, handler: &H) -> Result<u64, AmlError>
    where
        H: Handler,
    {
        let width = self.access_width();
        match self.space {
            RegionSpace::SystemMemory => Ok(match width {
                1 => handler.read_u8(self.address as usize) as u64,
                2 => handler.read_u16(self.address as usize) as u64,
                4 => handler.read_u32(self.address as usize) as u64,
                8 => handler.read_u64(self.address as usize),
                _ => return Err(AmlError::InvalidAccessWidth(width)),
            }),
            RegionSpace::SystemIO => Ok(match width {
                1 => handler.read_io_u8(self.address as u16) as u64,
                2 => handler.read_io_u16(self.address as u16) as u64,
                4 => handler.read_io_u32(self.address as u16) as u64,
                _ => return Err(AmlError::InvalidAccessWidth(width)),
            }),
            space => Err(AmlError::UnsupportedRegisterSpace(space)),
        }
    }

    pub fn write<H>(&self, handler: &H, value: u64) -> Result<(), AmlError>
    where
        H: Handler,
    {
        let width = self.access_width();
        match self.space {
            RegionSpace::SystemMemory => {
                match width {
                    1 => handler.write_u8(self.address as usize, value as u8),
                    2 => handler.write_u16(self.address as usize, value as u16),
                    4 => handler.write_u32(self.address as usize, value as u32),
                    8 => handler.write_u64(self.address as usize, value),
                    _ => return Err(AmlError::InvalidAccessWidth(width)),
                }
                Ok(())
            }
            RegionSpace::SystemIO => {
                match width {
                    1 => handler.write_io_u8(self.address as u16, value as u8),
                    2 => handler.write_io_u16(self.address as u16, value as u16),
                    4 => handler.write_io_u32(self.address as u16, value as u32),
                    _ => return Err(AmlError::InvalidAccessWidth(width)),
                }
                Ok(())
            }
            space => Err(AmlError::UnsupportedRegisterSpace(space)),
        }
    }
}

bitflags! {
    /// The fixed-feature flag dword of the FADT. Only the bits the event subsystem consumes are
    /// named here.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct FadtFlags: u32 {
        const NO_FIXED_POWER_BUTTON = 1 << 4;
        const NO_FIXED_SLEEP_BUTTON = 1 << 5;
        const RESET_REGISTER_SUPPORTED = 1 << 10;
    }
}

/// The subset of the Fixed ACPI Description Table consumed by the event subsystem: the SCI
/// interrupt, the SMI command port and its enable/disable commands, the PM1 event/control and GPE
/// register blocks, and the reset register.
///
/// In cases where the FADT contains both a 32-bit and 64-bit (`x_*`) form of the same address,
/// the 64-bit one is preferred, provided the table is long enough to contain it and the address
/// is nonzero.
#[derive(Clone, Debug)]
pub struct Fadt {
    pub header: SdtHeader,
    pub sci_interrupt: u16,
    pub smi_cmd_port: u32,
    pub acpi_enable: u8,
    pub acpi_disable: u8,
    pub pm1a_event_block: Option<GenericAddress>,
    pub pm1b_event_block: Option<GenericAddress>,
    pub pm1a_control_block: Option<GenericAddress>,
    pub pm1b_control_block: Option<GenericAddress>,
    pub pm1_event_length: u8,
    pub gpe0_block: Option<GenericAddress>,
    pub gpe1_block: Option<GenericAddress>,
    pub gpe0_block_length: u8,
    pub gpe1_block_length: u8,
    pub gpe1_base: u8,
    pub flags: FadtFlags,
    pub reset_register: Option<GenericAddress>,
    pub reset_value: u8,
}

/*
 * Byte offsets of the FADT fields we consume, per the fixed layout of the table. The x_* blocks
 * only exist from ACPI 2.0 on; `field_address` checks the declared table length before trusting
 * them.
 */
const FADT_SCI_INT: usize = 46;
const FADT_SMI_CMD: usize = 48;
const FADT_ACPI_ENABLE: usize = 52;
const FADT_ACPI_DISABLE: usize = 53;
const FADT_PM1A_EVT_BLK: usize = 56;
const FADT_PM1B_EVT_BLK: usize = 60;
const FADT_PM1A_CNT_BLK: usize = 64;
const FADT_PM1B_CNT_BLK: usize = 68;
const FADT_PM1_EVT_LEN: usize = 88;
const FADT_PM1_CNT_LEN: usize = 89;
const FADT_GPE0_BLK: usize = 80;
const FADT_GPE1_BLK: usize = 84;
const FADT_GPE0_BLK_LEN: usize = 92;
const FADT_GPE1_BLK_LEN: usize = 93;
const FADT_GPE1_BASE: usize = 94;
const FADT_FLAGS: usize = 112;
const FADT_RESET_REG: usize = 116;
const FADT_RESET_VALUE: usize = 128;
const FADT_X_PM1A_EVT_BLK: usize = 148;
const FADT_X_PM1B_EVT_BLK: usize = 160;
const FADT_X_PM1A_CNT_BLK: usize = 172;
const FADT_X_PM1B_CNT_BLK: usize = 184;
const FADT_X_GPE0_BLK: usize = 220;
const FADT_X_GPE1_BLK: usize = 232;

impl Fadt {
    /// Parse a full `FACP` table image.
    pub fn parse(data: &[u8]) -> Result<Fadt, AmlError> {
        let header = SdtHeader::parse(data)?;
        if &header.signature != b"FACP" {
            return Err(AmlError::TableInvalidSignature(header.signature));
        }
        let data = &data[0..header.length as usize];

        let pm1_event_length = read_u8(data, FADT_PM1_EVT_LEN);
        let pm1_control_length = read_u8(data, FADT_PM1_CNT_LEN);
        let gpe0_block_length = read_u8(data, FADT_GPE0_BLK_LEN);
        let gpe1_block_length = read_u8(data, FADT_GPE1_BLK_LEN);

        Ok(Fadt {
            header,
            sci_interrupt: read_u16(data, FADT_SCI_INT),
            smi_cmd_port: read_u32(data, FADT_SMI_CMD),
            acpi_enable: read_u8(data, FADT_ACPI_ENABLE),
            acpi_disable: read_u8(data, FADT_ACPI_DISABLE),
            pm1a_event_block: field_address(data, FADT_X_PM1A_EVT_BLK, FADT_PM1A_EVT_BLK, pm1_event_length),
            pm1b_event_block: field_address(data, FADT_X_PM1B_EVT_BLK, FADT_PM1B_EVT_BLK, pm1_event_length),
            pm1a_control_block: field_address(data, FADT_X_PM1A_CNT_BLK, FADT_PM1A_CNT_BLK, pm1_control_length),
            pm1b_control_block: field_address(data, FADT_X_PM1B_CNT_BLK, FADT_PM1B_CNT_BLK, pm1_control_length),
            pm1_event_length,
            gpe0_block: field_address(data, FADT_X_GPE0_BLK, FADT_GPE0_BLK, 1),
            gpe1_block: field_address(data, FADT_X_GPE1_BLK, FADT_GPE1_BLK, 1),
            gpe0_block_length,
            gpe1_block_length,
            gpe1_base: read_u8(data, FADT_GPE1_BASE),
            flags: FadtFlags::from_bits_retain(read_u32(data, FADT_FLAGS)),
            reset_register: GenericAddress::parse(data, FADT_RESET_REG).filter(GenericAddress::is_valid),
            reset_value: read_u8(data, FADT_RESET_VALUE),
        })
    }

    pub fn supports_fixed_power_button(&self) -> bool {
        !self.flags.contains(FadtFlags::NO_FIXED_POWER_BUTTON)
    }

    pub fn supports_fixed_sleep_button(&self) -> bool {
        !self.flags.contains(FadtFlags::NO_FIXED_SLEEP_BUTTON)
    }

    pub fn supports_reset_register(&self) -> bool {
        self.flags.contains(FadtFlags::RESET_REGISTER_SUPPORTED) && self.reset_register.is_some()
    }
}

/// Prefer the extended (`x_*`) form of a register block when the table carries it and its address
/// is nonzero; otherwise synthesize a system-I/O address from the legacy 32-bit field.
fn field_address(data: &[u8], extended: usize, legacy: usize, byte_width: u8) -> Option<GenericAddress> {
    if let Some(address) = GenericAddress::parse(data, extended) {
        if address.is_valid() {
            return Some(address);
        }
    }

    let legacy = read_u32(data, legacy);
    if legacy != 0 {
        Some(GenericAddress::from_legacy_io(legacy, byte_width))
    } else {
        None
    }
}

fn read_u8(data: &[u8], offset: usize) -> u8 {
    data.get(offset).copied().unwrap_or(0)
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    if data.len() < offset + 2 {
        return 0;
    }
    u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap())
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    if data.len() < offset + 4 {
        return 0;
    }
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    if data.len() < offset + 8 {
        return 0;
    }
    u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap())
}

impl fmt::Display for SdtHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (rev {}, length {:#x})",
            core::str::from_utf8(&self.signature).unwrap_or("????"),
            self.revision,
            self.length
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::build_fadt;

    #[test]
    fn header_checksum() {
        let fadt = build_fadt(|_| {});
        assert!(SdtHeader::parse(&fadt).is_ok());

        let mut corrupted = fadt.clone();
        corrupted[40] ^= 0xff;
        assert_eq!(SdtHeader::parse(&corrupted), Err(AmlError::TableInvalidChecksum(*b"FACP")));
    }

    #[test]
    fn legacy_blocks_become_io_addresses() {
        let fadt = build_fadt(|data| {
            data[FADT_PM1A_EVT_BLK..FADT_PM1A_EVT_BLK + 4].copy_from_slice(&0x600u32.to_le_bytes());
            data[FADT_PM1_EVT_LEN] = 4;
        });
        let fadt = Fadt::parse(&fadt).unwrap();
        let pm1a = fadt.pm1a_event_block.unwrap();
        assert_eq!(pm1a.space, RegionSpace::SystemIO);
        assert_eq!(pm1a.address, 0x600);
        assert_eq!(pm1a.bit_width, 32);
        assert!(fadt.pm1b_event_block.is_none());
    }

    #[test]
    fn extended_blocks_override_legacy() {
        let fadt = build_fadt(|data| {
            data[FADT_GPE0_BLK..FADT_GPE0_BLK + 4].copy_from_slice(&0x800u32.to_le_bytes());
            data[FADT_GPE0_BLK_LEN] = 8;
            // x_gpe0_blk: system memory, address 0xfed0_0000
            data[FADT_X_GPE0_BLK] = 0;
            data[FADT_X_GPE0_BLK + 1] = 8;
            data[FADT_X_GPE0_BLK + 3] = 1;
            data[FADT_X_GPE0_BLK + 4..FADT_X_GPE0_BLK + 12].copy_from_slice(&0xfed0_0000u64.to_le_bytes());
        });
        let fadt = Fadt::parse(&fadt).unwrap();
        let gpe0 = fadt.gpe0_block.unwrap();
        assert_eq!(gpe0.space, RegionSpace::SystemMemory);
        assert_eq!(gpe0.address, 0xfed0_0000);
    }
}
