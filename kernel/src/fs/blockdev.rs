//! Block device abstraction
//!
//! The interface the on-disk filesystem drives. Devices take `&self`
//! and manage their own interior locking so a superblock can hold the
//! device behind an `Arc`.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{Errno, KResult};

/// Block device trait.
pub trait BlockDevice: Send + Sync {
    /// Device name (diagnostics, devfs).
    fn name(&self) -> &str;

    /// Transfer granularity in bytes.
    fn block_size(&self) -> usize;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Read whole blocks starting at `start_block`. The buffer length
    /// must be a multiple of the block size.
    fn read_blocks(&self, start_block: u64, buffer: &mut [u8]) -> KResult<()>;

    /// Write whole blocks starting at `start_block`.
    fn write_blocks(&self, start_block: u64, buffer: &[u8]) -> KResult<()>;

    /// Flush any cached writes.
    fn flush(&self) -> KResult<()> {
        Ok(())
    }
}

/// Read an arbitrary byte range, spanning device blocks as needed.
pub fn read_at(dev: &dyn BlockDevice, offset: u64, buf: &mut [u8]) -> KResult<()> {
    let bs = dev.block_size() as u64;
    let mut block = offset / bs;
    let mut skip = (offset % bs) as usize;
    let mut done = 0usize;
    let mut scratch = vec![0u8; bs as usize];
    while done < buf.len() {
        dev.read_blocks(block, &mut scratch)?;
        let take = (buf.len() - done).min(bs as usize - skip);
        buf[done..done + take].copy_from_slice(&scratch[skip..skip + take]);
        done += take;
        skip = 0;
        block += 1;
    }
    Ok(())
}

/// Write an arbitrary byte range with read-modify-write at the edges.
pub fn write_at(dev: &dyn BlockDevice, offset: u64, buf: &[u8]) -> KResult<()> {
    let bs = dev.block_size() as u64;
    let mut block = offset / bs;
    let mut skip = (offset % bs) as usize;
    let mut done = 0usize;
    let mut scratch = vec![0u8; bs as usize];
    while done < buf.len() {
        let take = (buf.len() - done).min(bs as usize - skip);
        if take != bs as usize {
            dev.read_blocks(block, &mut scratch)?;
        }
        scratch[skip..skip + take].copy_from_slice(&buf[done..done + take]);
        dev.write_blocks(block, &scratch)?;
        done += take;
        skip = 0;
        block += 1;
    }
    Ok(())
}

#[cfg(target_os = "none")]
mod disks {
    use alloc::string::String;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use spin::RwLock;

    use super::BlockDevice;

    static DISKS: RwLock<Vec<(String, Arc<dyn BlockDevice>)>> = RwLock::new(Vec::new());

    pub fn with<R>(f: impl FnOnce(&mut Vec<(String, Arc<dyn BlockDevice>)>) -> R) -> R {
        f(&mut DISKS.write())
    }
}

#[cfg(not(target_os = "none"))]
mod disks {
    use alloc::string::String;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use std::cell::RefCell;

    use super::BlockDevice;

    std::thread_local! {
        #[allow(clippy::type_complexity)]
        static DISKS: RefCell<Vec<(String, Arc<dyn BlockDevice>)>> =
            const { RefCell::new(Vec::new()) };
    }

    pub fn with<R>(f: impl FnOnce(&mut Vec<(String, Arc<dyn BlockDevice>)>) -> R) -> R {
        DISKS.with(|d| f(&mut d.borrow_mut()))
    }
}

/// Register a mountable disk under a name (`mount` resolves sources
/// against this table).
pub fn register_disk(name: &str, dev: Arc<dyn BlockDevice>) -> KResult<()> {
    disks::with(|table| {
        if table.iter().any(|(n, _)| n == name) {
            return Err(Errno::Eexist);
        }
        table.push((String::from(name), dev));
        Ok(())
    })
}

/// Find a registered disk by name.
pub fn find_disk(name: &str) -> Option<Arc<dyn BlockDevice>> {
    disks::with(|table| {
        table
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d.clone())
    })
}

/// RAM-backed block device for tests, ramdisks, and the boot image.
pub struct RamDisk {
    name: String,
    block_size: usize,
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(name: &str, block_size: usize, block_count: u64) -> Arc<Self> {
        Arc::new(Self {
            name: String::from(name),
            block_size,
            data: Mutex::new(vec![0u8; block_size * block_count as usize]),
        })
    }

    /// Total size in bytes.
    pub fn size(&self) -> usize {
        self.data.lock().len()
    }
}

impl BlockDevice for RamDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        (self.data.lock().len() / self.block_size) as u64
    }

    fn read_blocks(&self, start_block: u64, buffer: &mut [u8]) -> KResult<()> {
        let data = self.data.lock();
        let start = start_block as usize * self.block_size;
        let end = start + buffer.len();
        if buffer.len() % self.block_size != 0 || end > data.len() {
            return Err(Errno::Eio);
        }
        buffer.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_blocks(&self, start_block: u64, buffer: &[u8]) -> KResult<()> {
        let mut data = self.data.lock();
        let start = start_block as usize * self.block_size;
        let end = start + buffer.len();
        if buffer.len() % self.block_size != 0 || end > data.len() {
            return Err(Errno::Eio);
        }
        data[start..end].copy_from_slice(buffer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_round_trip() {
        let dev = RamDisk::new("ram0", 512, 100);
        let block = [0x42u8; 512];
        dev.write_blocks(3, &block).unwrap();
        let mut back = [0u8; 512];
        dev.read_blocks(3, &mut back).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn out_of_range_is_eio() {
        let dev = RamDisk::new("ram0", 512, 4);
        let block = [0u8; 512];
        assert_eq!(dev.write_blocks(4, &block), Err(Errno::Eio));
        let mut buf = [0u8; 512];
        assert_eq!(dev.read_blocks(9, &mut buf), Err(Errno::Eio));
    }

    #[test]
    fn byte_granular_io_crosses_blocks() {
        let dev = RamDisk::new("ram0", 512, 8);
        let payload: Vec<u8> = (0..700).map(|i| (i % 251) as u8).collect();
        write_at(&*dev, 300, &payload).unwrap();
        let mut back = vec![0u8; 700];
        read_at(&*dev, 300, &mut back).unwrap();
        assert_eq!(back, payload);
        // Neighbouring bytes stay untouched.
        let mut edge = [0u8; 4];
        read_at(&*dev, 296, &mut edge).unwrap();
        assert_eq!(edge, [0, 0, 0, 0]);
    }
}
