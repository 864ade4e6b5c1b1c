//! Limine boot requests and their translation into [`BootMemoryInfo`].
//!
//! The bootloader scans `.requests` (bracketed by the start/end markers) and
//! fills in responses before jumping to `kmain`.

use arrayvec::ArrayVec;
use kernel_info::boot::{BootMemoryInfo, MemoryRegion, MemoryRegionKind};
use kernel_info::memory::MAX_MEMORY_REGIONS;
use limine::BaseRevision;
use limine::memory_map::EntryType;
use limine::request::{HhdmRequest, MemoryMapRequest, RequestsEndMarker, RequestsStartMarker};
use log::{debug, warn};

#[used]
#[unsafe(link_section = ".requests")]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[unsafe(link_section = ".requests")]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".requests_start_marker")]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[unsafe(link_section = ".requests_end_marker")]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootError {
    #[error("bootloader does not support the requested base revision")]
    UnsupportedRevision,
    #[error("bootloader provided no memory map")]
    NoMemoryMap,
    #[error("bootloader provided no higher-half direct map")]
    NoHhdm,
}

/// The memory map copied out of the bootloader's response.
pub struct BootMemory {
    regions: ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS>,
    hhdm_offset: u64,
}

impl BootMemory {
    /// Read the Limine responses.
    ///
    /// # Errors
    /// See [`BootError`].
    pub fn from_limine() -> Result<Self, BootError> {
        if !BASE_REVISION.is_supported() {
            return Err(BootError::UnsupportedRevision);
        }
        let map = MEMORY_MAP_REQUEST
            .get_response()
            .ok_or(BootError::NoMemoryMap)?;
        let hhdm = HHDM_REQUEST.get_response().ok_or(BootError::NoHhdm)?;

        let mut regions = ArrayVec::new();
        for entry in map.entries() {
            let region = MemoryRegion::new(entry.base, entry.length, region_kind(entry.entry_type));
            debug!(
                "boot: {:#014x}..{:#014x} {}",
                region.base,
                region.end(),
                region.kind.as_str()
            );
            if regions.try_push(region).is_err() {
                warn!(
                    "boot: memory map has {} entries, keeping the first {MAX_MEMORY_REGIONS}",
                    map.entries().len()
                );
                break;
            }
        }

        Ok(Self {
            regions,
            hhdm_offset: hhdm.offset(),
        })
    }

    pub fn info(&mut self) -> BootMemoryInfo<'_> {
        BootMemoryInfo {
            regions: &mut self.regions,
            hhdm_offset: self.hhdm_offset,
        }
    }
}

/// Limine types without a counterpart are treated as occupied by the kernel.
fn region_kind(kind: EntryType) -> MemoryRegionKind {
    if kind == EntryType::USABLE {
        MemoryRegionKind::Usable
    } else if kind == EntryType::RESERVED {
        MemoryRegionKind::Reserved
    } else if kind == EntryType::ACPI_RECLAIMABLE {
        MemoryRegionKind::AcpiReclaimable
    } else if kind == EntryType::ACPI_NVS {
        MemoryRegionKind::AcpiNvs
    } else if kind == EntryType::BAD_MEMORY {
        MemoryRegionKind::BadMemory
    } else if kind == EntryType::BOOTLOADER_RECLAIMABLE {
        MemoryRegionKind::BootloaderReclaimable
    } else if kind == EntryType::FRAMEBUFFER {
        MemoryRegionKind::Framebuffer
    } else {
        MemoryRegionKind::KernelAndModules
    }
}
