//! # Interrupt Descriptor Table
//!
//! The kernel installs exactly one gate: the page-fault handler. Interrupts
//! stay masked, so every other vector is left non-present.
//!
//! ```text
//! gate (16 bytes): offset[15:0] | selector | IST, type, DPL, P | offset[31:16]
//!                  | offset[63:32] | zero
//! ```

pub mod page_fault;

use bitfield_struct::bitfield;
use core::arch::asm;
use core::ops::{Index, IndexMut};

const _: () = assert!(size_of::<IdtEntry>() == 16);
const _: () = assert!(align_of::<Idt>() == 16);

/// IST index and type/attribute byte of a gate.
#[bitfield(u16)]
struct IdtGateAttr {
    #[bits(3)]
    ist: u8,
    #[bits(5)]
    __zero0: u8,
    /// 0xE = interrupt gate, 0xF = trap gate.
    #[bits(4)]
    typ: u8,
    /// System bit, zero for gates.
    #[bits(1)]
    __system: u8,
    #[bits(2)]
    dpl: u8,
    present: bool,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct IdtEntry {
    offset_lo: u16,
    selector: u16,
    attr: u16,
    offset_mid: u16,
    offset_hi: u32,
    zero: u32,
}

impl IdtEntry {
    const MISSING: Self = Self {
        offset_lo: 0,
        selector: 0,
        attr: IdtGateAttr::new().into_bits(),
        offset_mid: 0,
        offset_hi: 0,
        zero: 0,
    };

    /// Point this entry at `handler` as a present ring-0 interrupt gate in
    /// the current code segment.
    #[allow(clippy::cast_possible_truncation)]
    fn set_interrupt_gate(&mut self, handler: extern "C" fn()) {
        let addr = handler as usize as u64;
        self.offset_lo = (addr & 0xFFFF) as u16;
        self.offset_mid = ((addr >> 16) & 0xFFFF) as u16;
        self.offset_hi = (addr >> 32) as u32;
        self.selector = current_cs();
        self.attr = IdtGateAttr::new()
            .with_typ(0xE)
            .with_dpl(0)
            .with_ist(0)
            .with_present(true)
            .into_bits();
    }
}

#[repr(C, align(16))]
pub struct Idt {
    entries: [IdtEntry; 256],
}

impl Idt {
    const fn new() -> Self {
        Self {
            entries: [IdtEntry::MISSING; 256],
        }
    }

    /// # Safety
    /// Must run at CPL0; present gates must point at valid handlers.
    unsafe fn load(&'static self) {
        #[allow(clippy::cast_possible_truncation)]
        let idtr = Idtr {
            limit: (size_of::<Self>() - 1) as u16,
            base: core::ptr::from_ref(self) as u64,
        };
        unsafe {
            asm!("lidt [{}]", in(reg) &raw const idtr, options(nostack, preserves_flags, readonly));
        }
    }
}

impl Index<usize> for Idt {
    type Output = IdtEntry;
    fn index(&self, i: usize) -> &Self::Output {
        &self.entries[i]
    }
}

impl IndexMut<usize> for Idt {
    fn index_mut(&mut self, i: usize) -> &mut Self::Output {
        &mut self.entries[i]
    }
}

#[repr(C, packed)]
struct Idtr {
    limit: u16,
    base: u64,
}

static mut IDT: Idt = Idt::new();

/// Build the IDT and load it.
///
/// # Safety
/// Call once, at CPL0, before anything can fault.
pub unsafe fn install() {
    // SAFETY: single call during boot; nothing else references the table yet.
    let idt: &'static mut Idt = unsafe { &mut *(&raw mut IDT) };
    idt[page_fault::PAGE_FAULT_VECTOR].set_interrupt_gate(page_fault::page_fault_entry);

    let idt: &'static Idt = idt;
    unsafe { idt.load() };
}

/// Stop this processor for good.
pub fn halt() -> ! {
    loop {
        unsafe { asm!("cli", "hlt", options(nomem, nostack)) };
    }
}

fn current_cs() -> u16 {
    let cs: u16;
    unsafe {
        asm!("mov {0:x}, cs", out(reg) cs, options(nomem, nostack, preserves_flags));
    }
    cs
}
