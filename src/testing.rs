//! In-memory positional file used by unit tests.

use std::sync::Mutex;

#[derive(Debug)]
pub(crate) struct MemoryFile {
    data: Mutex<Vec<u8>>,
    limit: u64,
}

impl MemoryFile {
    pub(crate) fn new(limit: u64) -> Self {
        Self {
            data: Mutex::new(Vec::new()),
            limit,
        }
    }

    pub(crate) fn len(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    pub(crate) fn truncate(&self, len: u64) {
        self.data.lock().unwrap().truncate(len as usize);
    }

    pub(crate) fn corrupt(&self, offset: u64, bytes: &[u8]) {
        let mut data = self.data.lock().unwrap();
        let offset = offset as usize;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn read_at_impl(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        let data = self.data.lock().unwrap();
        let start = std::cmp::min(offset as usize, data.len());
        let to_read = std::cmp::min(buf.len(), data.len() - start);
        buf[..to_read].copy_from_slice(&data[start..start + to_read]);
        Ok(to_read)
    }

    fn write_at_impl(&self, mut buf: &[u8], offset: u64) -> std::io::Result<usize> {
        if offset >= self.limit {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "Write exceeds limit",
            ));
        }
        if buf.len() as u64 + offset > self.limit {
            buf = &buf[..(self.limit - offset) as usize];
        }

        let mut data = self.data.lock().unwrap();
        let end = offset as usize + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }
}

#[cfg(unix)]
impl std::os::unix::fs::FileExt for MemoryFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        self.read_at_impl(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
        self.write_at_impl(buf, offset)
    }
}

#[cfg(windows)]
impl std::os::windows::fs::FileExt for MemoryFile {
    fn seek_read(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        self.read_at_impl(buf, offset)
    }

    fn seek_write(&self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
        self.write_at_impl(buf, offset)
    }
}
