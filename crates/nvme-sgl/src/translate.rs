/// Maps a virtual buffer address to the bus address a controller must DMA to.
pub trait AddressTranslator {
    fn virt_to_phys(&self, vaddr: u64) -> u64;
}

impl<T: AddressTranslator + ?Sized> AddressTranslator for &T {
    fn virt_to_phys(&self, vaddr: u64) -> u64 {
        (**self).virt_to_phys(vaddr)
    }
}

/// Virtual and physical addresses are the same.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTranslator;

impl AddressTranslator for IdentityTranslator {
    fn virt_to_phys(&self, vaddr: u64) -> u64 {
        vaddr
    }
}

/// Physical address = virtual address - `virt_base` + `phys_base` (a single linear mapping).
#[derive(Debug, Clone, Copy)]
pub struct OffsetTranslator {
    pub virt_base: u64,
    pub phys_base: u64,
}

impl AddressTranslator for OffsetTranslator {
    fn virt_to_phys(&self, vaddr: u64) -> u64 {
        vaddr
            .wrapping_sub(self.virt_base)
            .wrapping_add(self.phys_base)
    }
}
