use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiskError {
    #[error("access beyond end of disk")]
    OutOfRange,

    #[error("buffer length {len} is not a multiple of the sector size {sector_size}")]
    UnalignedLength { len: usize, sector_size: u32 },
}

/// Block storage behind a namespace.
pub trait DiskBackend {
    fn sector_size(&self) -> u32;
    /// Capacity in sectors.
    fn capacity(&self) -> u64;
    fn read_sectors(&self, lba: u64, buffer: &mut [u8]) -> Result<(), DiskError>;
    fn write_sectors(&mut self, lba: u64, buffer: &[u8]) -> Result<(), DiskError>;
    fn flush(&mut self) -> Result<(), DiskError>;
}

/// In-memory disk that only stores sectors that were written.
///
/// Unwritten sectors read back as zeroes, so namespaces far larger than host memory are cheap.
#[derive(Debug, Clone)]
pub struct SparseMemDisk {
    sector_size: u32,
    sectors: u64,
    data: HashMap<u64, Box<[u8]>>,
}

impl SparseMemDisk {
    pub fn new(sector_size: u32, sectors: u64) -> Self {
        SparseMemDisk {
            sector_size,
            sectors,
            data: HashMap::new(),
        }
    }

    fn check(&self, lba: u64, len: usize) -> Result<u64, DiskError> {
        let sector_size = self.sector_size as usize;
        if len % sector_size != 0 {
            return Err(DiskError::UnalignedLength {
                len,
                sector_size: self.sector_size,
            });
        }
        let count = (len / sector_size) as u64;
        match lba.checked_add(count) {
            Some(end) if end <= self.sectors => Ok(count),
            _ => Err(DiskError::OutOfRange),
        }
    }
}

impl DiskBackend for SparseMemDisk {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn capacity(&self) -> u64 {
        self.sectors
    }

    fn read_sectors(&self, lba: u64, buffer: &mut [u8]) -> Result<(), DiskError> {
        self.check(lba, buffer.len())?;
        for (i, chunk) in buffer.chunks_mut(self.sector_size as usize).enumerate() {
            match self.data.get(&(lba + i as u64)) {
                Some(sector) => chunk.copy_from_slice(sector),
                None => chunk.fill(0),
            }
        }
        Ok(())
    }

    fn write_sectors(&mut self, lba: u64, buffer: &[u8]) -> Result<(), DiskError> {
        self.check(lba, buffer.len())?;
        for (i, chunk) in buffer.chunks(self.sector_size as usize).enumerate() {
            self.data.insert(lba + i as u64, chunk.into());
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DiskError> {
        Ok(())
    }
}
