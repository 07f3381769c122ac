use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use memmap2::Mmap;

use crate::error::{Error, Result};

/// Uniform random access over a file handle, a shared memory-mapped region,
/// or an in-memory buffer. Parsers are written against byte slices so any
/// variant can feed them; mapped and in-memory sources hand out borrowed
/// slices, the file variant allocates per read.
#[derive(Debug)]
pub enum ByteSource {
    File { file: File, len: u64 },
    Mapped(Arc<Mmap>),
    Memory(Vec<u8>),
}

impl ByteSource {
    /// Opens `path` through the shared mapping cache. Empty files cannot be
    /// mapped and degrade to an empty in-memory buffer.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NoSuchFile(path.to_path_buf()));
        }
        let len = std::fs::metadata(path)?.len();
        if len == 0 {
            return Ok(ByteSource::Memory(Vec::new()));
        }
        Ok(ByteSource::Mapped(open_mapped(path)?))
    }

    /// Positioned-read variant for callers that must not map (tests, or
    /// platforms where mapping the input is undesirable).
    pub fn open_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NoSuchFile(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(ByteSource::File { file, len })
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        ByteSource::Memory(bytes.into())
    }

    pub fn len(&self) -> u64 {
        match self {
            ByteSource::File { len, .. } => *len,
            ByteSource::Mapped(map) => map.len() as u64,
            ByteSource::Memory(buf) => buf.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads exactly `len` bytes at `offset`; a read past the end is an
    /// `UnexpectedEof` I/O error.
    pub fn read(&self, offset: u64, len: usize) -> Result<Cow<'_, [u8]>> {
        let end = offset
            .checked_add(len as u64)
            .filter(|&end| end <= self.len())
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("read of {len} bytes at offset {offset} past end of source"),
                ))
            })?;
        match self {
            ByteSource::File { file, .. } => {
                let mut buf = vec![0u8; len];
                read_at(file, offset, &mut buf)?;
                Ok(Cow::Owned(buf))
            }
            ByteSource::Mapped(map) => Ok(Cow::Borrowed(&map[offset as usize..end as usize])),
            ByteSource::Memory(bytes) => Ok(Cow::Borrowed(&bytes[offset as usize..end as usize])),
        }
    }

    pub fn read_all(&self) -> Result<Cow<'_, [u8]>> {
        self.read(0, self.len() as usize)
    }
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.seek_read(&mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "short read"));
        }
        filled += n;
    }
    Ok(())
}

/// Process-wide mapped-region cache keyed by canonical path. Datasources
/// opening the same file share one mapping; an entry dies once the last
/// holder drops its `Arc`.
fn mapping_cache() -> &'static Mutex<HashMap<PathBuf, Weak<Mmap>>> {
    static CACHE: OnceLock<Mutex<HashMap<PathBuf, Weak<Mmap>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn open_mapped(path: &Path) -> Result<Arc<Mmap>> {
    let key = path.canonicalize()?;
    let mut cache = mapping_cache().lock().expect("mapping cache poisoned");
    if let Some(live) = cache.get(&key).and_then(Weak::upgrade) {
        return Ok(live);
    }
    let file = File::open(&key)?;
    let map = Arc::new(unsafe { Mmap::map(&file)? });
    cache.retain(|_, weak| weak.strong_count() > 0);
    cache.insert(key, Arc::downgrade(&map));
    Ok(map)
}
