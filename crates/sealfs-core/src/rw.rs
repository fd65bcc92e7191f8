//! Positional read/write engine.
//!
//! Logical offsets split into three zones: the first 3072 bytes live inline
//! in the sealed metadata (small files never touch the MHT), and everything
//! beyond maps onto 4096-byte data nodes. Head and tail fragments are
//! read-modify-written through the cache; interior spans stream one node at
//! a time.

use sealfs_error::{Result, SealError};
use sealfs_types::layout::MD_USER_DATA_SIZE;
use sealfs_types::NODE_SIZE;
use sealfs_vfs::Vfs;

use crate::file::FileInner;

impl<V: Vfs> FileInner<V> {
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.mode.read && !self.mode.update {
            return Err(SealError::invalid_argument("file is not open for reading"));
        }

        let size = self.logical_size();
        if self.offset >= size {
            self.eof = true;
            return Ok(0);
        }
        let to_read = usize::try_from(size - self.offset)
            .unwrap_or(usize::MAX)
            .min(buf.len());
        if to_read < buf.len() {
            self.eof = true;
        }

        let inline = MD_USER_DATA_SIZE as u64;
        let mut done = 0_usize;

        if self.offset < inline {
            let start = usize::try_from(self.offset).expect("inline offset fits in usize");
            let n = (MD_USER_DATA_SIZE - start).min(to_read);
            buf[..n].copy_from_slice(&self.meta_encrypted.data[start..start + n]);
            self.offset += n as u64;
            done += n;
        }

        while done < to_read {
            let rel = self.offset - inline;
            let index = rel / NODE_SIZE as u64;
            let in_node = usize::try_from(rel % NODE_SIZE as u64).expect("node offset fits");
            let n = (NODE_SIZE - in_node).min(to_read - done);

            let node = self.get_data_node(index)?;
            buf[done..done + n].copy_from_slice(&node.data()[in_node..in_node + n]);

            self.offset += n as u64;
            done += n;
        }

        Ok(done)
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.read_only {
            return Err(SealError::ReadOnly);
        }
        if self.mode.append {
            self.offset = self.logical_size();
        }

        let inline = MD_USER_DATA_SIZE as u64;
        let mut done = 0_usize;

        if self.offset < inline {
            let start = usize::try_from(self.offset).expect("inline offset fits in usize");
            let n = (MD_USER_DATA_SIZE - start).min(buf.len());
            self.meta_encrypted.data[start..start + n].copy_from_slice(&buf[..n]);
            self.offset += n as u64;
            done += n;
            self.need_writing = true;
            self.grow_size();
        }

        while done < buf.len() {
            let rel = self.offset - inline;
            let index = rel / NODE_SIZE as u64;
            let in_node = usize::try_from(rel % NODE_SIZE as u64).expect("node offset fits");
            let n = (NODE_SIZE - in_node).min(buf.len() - done);

            let node = self.get_data_node(index)?;
            node.data_mut()[in_node..in_node + n].copy_from_slice(&buf[done..done + n]);
            node.dirty = true;

            self.offset += n as u64;
            done += n;
            self.need_writing = true;
            self.grow_size();
        }

        Ok(done)
    }

    /// The logical size grows monotonically with the write position.
    fn grow_size(&mut self) {
        if self.offset > self.logical_size() {
            self.meta_encrypted.size =
                i64::try_from(self.offset).expect("logical size fits in i64");
        }
    }

    pub(crate) fn seek(&mut self, pos: std::io::SeekFrom) -> Result<u64> {
        let size = i128::from(self.logical_size());
        let target: i128 = match pos {
            std::io::SeekFrom::Start(o) => i128::from(o),
            std::io::SeekFrom::Current(d) => i128::from(self.offset) + i128::from(d),
            std::io::SeekFrom::End(d) => size + i128::from(d),
        };

        // No sparse growth: the only legal positions are inside the file.
        if target < 0 || target > size {
            return Err(SealError::SeekOutOfRange {
                offset: i64::try_from(target).unwrap_or(i64::MAX),
            });
        }

        self.offset = u64::try_from(target).expect("in-range seek target");
        self.eof = false;
        Ok(self.offset)
    }
}
