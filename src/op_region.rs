use crate::{namespace::AmlName, AmlError};
use core::fmt;
use pci_types::PciAddress;

/// A declared window into one of the ACPI address spaces. Accesses through field units land here,
/// and are serviced either natively (`SystemMemory`, `SystemIO`, `PciConfig`) or through a
/// [`RegionHandler`] registered for the region's space.
#[derive(Clone, PartialEq)]
pub struct OpRegion {
    pub space: RegionSpace,
    pub base: u64,
    pub length: u64,
    /// The scope the region was declared in. Used to find the regulating device for `_REG`, and
    /// to resolve the PCI address of `PciConfig` regions.
    pub parent_device_path: AmlName,
    /// For `PciConfig` regions, the address resolved by walking up to the owning host bridge.
    /// Filled in on first access.
    pub pci_address: Option<PciAddress>,
    /// Whether the handler for this region's space has had its `attach` callback run.
    pub attached: bool,
    /// Whether `_REG(space, 1)` has been run for this region.
    pub regged: bool,
}

impl OpRegion {
    pub fn new(space: RegionSpace, base: u64, length: u64, parent_device_path: AmlName) -> OpRegion {
        OpRegion { space, base, length, parent_device_path, pci_address: None, attached: false, regged: false }
    }

    /// Whether `_REG` must run before this region is usable. `SystemMemory` and `SystemIO` are
    /// always available and skip the protocol.
    pub fn needs_reg(&self) -> bool {
        !matches!(self.space, RegionSpace::SystemMemory | RegionSpace::SystemIO)
    }
}

impl fmt::Debug for OpRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OpRegion {{ {:?}, base: {:#x}, length: {:#x}, parent: {} }}",
            self.space, self.base, self.length, self.parent_device_path
        )
    }
}

/// A handler for operation-region accesses the interpreter cannot perform natively (everything
/// except `SystemMemory`, `SystemIO`, and `PciConfig`). Handlers are registered per address space
/// with [`Interpreter::install_region_handler`](crate::Interpreter::install_region_handler).
///
/// `attach` is called once per region, before the first access through the handler. `read` and
/// `write` are called with byte offsets relative to the region's base, and widths of 1, 2, 4, or
/// 8 bytes. A handler is allowed to block; the interpreter simply suspends on the calling thread.
pub trait RegionHandler: Send + Sync {
    fn attach(&self, _region: &OpRegion) -> Result<(), AmlError> {
        Ok(())
    }

    fn read(&self, region: &OpRegion, offset: u64, width: usize) -> Result<u64, AmlError>;
    fn write(&self, region: &OpRegion, offset: u64, width: usize, value: u64) -> Result<(), AmlError>;
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum RegionSpace {
    SystemMemory,
    SystemIO,
    PciConfig,
    EmbeddedControl,
    SmBus,
    SystemCmos,
    PciBarTarget,
    Ipmi,
    GeneralPurposeIo,
    GenericSerialBus,
    Pcc,
    Oem(u8),
}

impl RegionSpace {
    /// The raw address-space id, as encoded in AML and passed to `_REG`.
    pub fn id(self) -> u8 {
        match self {
            RegionSpace::SystemMemory => 0,
            RegionSpace::SystemIO => 1,
            RegionSpace::PciConfig => 2,
            RegionSpace::EmbeddedControl => 3,
            RegionSpace::SmBus => 4,
            RegionSpace::SystemCmos => 5,
            RegionSpace::PciBarTarget => 6,
            RegionSpace::Ipmi => 7,
            RegionSpace::GeneralPurposeIo => 8,
            RegionSpace::GenericSerialBus => 9,
            RegionSpace::Pcc => 10,
            RegionSpace::Oem(value) => value,
        }
    }
}

impl From<u8> for RegionSpace {
    fn from(value: u8) -> Self {
        match value {
            0 => RegionSpace::SystemMemory,
            1 => RegionSpace::SystemIO,
            2 => RegionSpace::PciConfig,
            3 => RegionSpace::EmbeddedControl,
            4 => RegionSpace::SmBus,
            5 => RegionSpace::SystemCmos,
            6 => RegionSpace::PciBarTarget,
            7 => RegionSpace::Ipmi,
            8 => RegionSpace::GeneralPurposeIo,
            9 => RegionSpace::GenericSerialBus,
            10 => RegionSpace::Pcc,
            _ => RegionSpace::Oem(value),
        }
    }
}
