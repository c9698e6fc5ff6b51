//! Reassembly storage: a seekable sink pre-sized to the declared file length.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Prefix of every received file name.
pub const RECEIVED_PREFIX: &str = "received_";

/// Local name for a declared file name: final path component only, prefixed.
pub fn received_file_name(declared: &str) -> String {
    let base = declared
        .rsplit(['/', '\\'])
        .next()
        .filter(|b| !b.is_empty() && *b != "." && *b != "..")
        .unwrap_or("unnamed");
    format!("{RECEIVED_PREFIX}{base}")
}

/// Scratch name for one transfer's reassembly: `received_<name>.<tag>.part`.
/// Characters outside `[A-Za-z0-9._-]` in the tag become `_`.
pub fn part_file_name(declared: &str, transfer_tag: &str) -> String {
    let tag: String = transfer_tag
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.{tag}.part", received_file_name(declared))
}

/// Where inbound transfers are written while they are reassembled.
pub trait TransferStore: Send {
    type Sink: Read + Write + Seek + Send;

    /// Allocate a sink of `size` bytes for `file_name`. `transfer_tag` is unique per
    /// inbound transfer, so concurrent transfers of the same name never share storage.
    fn create(&mut self, file_name: &str, transfer_tag: &str, size: u64)
        -> io::Result<Self::Sink>;

    /// Keep the reassembled file. Returns where it lives.
    fn commit(&mut self, file_name: &str, sink: Self::Sink) -> io::Result<PathBuf>;

    /// Drop the sink and delete whatever it wrote. A committed file is left alone.
    fn discard(&mut self, file_name: &str, sink: Self::Sink) -> io::Result<()>;
}

/// Files under a download directory. Each transfer is reassembled in its own sparse
/// `.part` file and renamed to `received_<name>` once verified.
#[derive(Debug, Clone)]
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.dir.join(received_file_name(file_name))
    }
}

/// An open `.part` file and where it lives.
#[derive(Debug)]
pub struct PartFile {
    file: File,
    path: PathBuf,
}

impl PartFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Read for PartFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for PartFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for PartFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl TransferStore for DiskStore {
    type Sink = PartFile;

    fn create(&mut self, file_name: &str, transfer_tag: &str, size: u64) -> io::Result<PartFile> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(part_file_name(file_name, transfer_tag));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size)?;
        Ok(PartFile { file, path })
    }

    fn commit(&mut self, file_name: &str, sink: PartFile) -> io::Result<PathBuf> {
        sink.file.sync_all()?;
        let PartFile { file, path } = sink;
        drop(file);
        let dest = self.path_for(file_name);
        fs::rename(&path, &dest)?;
        Ok(dest)
    }

    fn discard(&mut self, _file_name: &str, sink: PartFile) -> io::Result<()> {
        let PartFile { file, path } = sink;
        drop(file);
        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// In-memory store. Committed files are kept by received name.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: HashMap<String, Vec<u8>>,
    /// Refuse allocations larger than this many bytes.
    limit: Option<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: u64) -> Self {
        Self {
            files: HashMap::new(),
            limit: Some(limit),
        }
    }

    pub fn get(&self, file_name: &str) -> Option<&[u8]> {
        self.files
            .get(&received_file_name(file_name))
            .map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl TransferStore for MemoryStore {
    type Sink = Cursor<Vec<u8>>;

    fn create(
        &mut self,
        _file_name: &str,
        _transfer_tag: &str,
        size: u64,
    ) -> io::Result<Self::Sink> {
        if self.limit.is_some_and(|l| size > l) {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "declared size exceeds store limit",
            ));
        }
        let size = usize::try_from(size)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok(Cursor::new(vec![0u8; size]))
    }

    fn commit(&mut self, file_name: &str, sink: Self::Sink) -> io::Result<PathBuf> {
        let name = received_file_name(file_name);
        self.files.insert(name.clone(), sink.into_inner());
        Ok(PathBuf::from(name))
    }

    fn discard(&mut self, _file_name: &str, _sink: Self::Sink) -> io::Result<()> {
        Ok(())
    }
}
