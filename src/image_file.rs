use crate::checked_file::{
    logical_to_physical, physical_to_logical, CheckedFile, ChecksumPolicy, OffsetMode,
};
use crate::error::Converter;
use crate::node::{NodeId, NodeTree};
use crate::packet_cache::{PacketLock, PacketReadCache, DEFAULT_CACHE_SLOTS};
use crate::xml;
use crate::{
    CompressedVectorReader, CompressedVectorWriter, Error, Header, Result, SourceDestBuffer,
};
use log::{debug, warn};
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fs::File;
use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;

/// Options for opening existing files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageFileOptions {
    /// Share of pages whose checksum is verified when reading.
    pub checksum_policy: ChecksumPolicy,
    /// Number of binary packets kept in memory for readers.
    pub packet_cache_slots: usize,
}

impl Default for ImageFileOptions {
    fn default() -> Self {
        Self {
            checksum_policy: ChecksumPolicy::ALL,
            packet_cache_slots: DEFAULT_CACHE_SLOTS,
        }
    }
}

/// Container with the XML metadata tree and the binary sections of an E57 file.
///
/// Files are either created empty and writable or opened read-only.
/// Any I/O or checksum error poisons the container and all later calls will fail.
/// Dropping a writable container without calling [`ImageFile::close`] discards the metadata.
pub struct ImageFile<T: Read + Write + Seek> {
    file: RefCell<CheckedFile<T>>,
    tree: RefCell<NodeTree>,
    cache: PacketReadCache,
    writable: bool,
    open: Cell<bool>,
    writers: Cell<usize>,
    readers: Cell<usize>,
    unused_logical_start: Cell<u64>,
}

impl ImageFile<File> {
    /// Creates a new file at the given path, existing files are truncated.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::OpenFailed {
                reason: format!("Unable to create file {}", path.display()),
                source: Some(Box::new(e)),
            })?;
        Self::new(file)
    }

    /// Opens an existing file for reading with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, ImageFileOptions::default())
    }

    /// Opens an existing file for reading.
    pub fn open_with(path: impl AsRef<Path>, options: ImageFileOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::OpenFailed {
            reason: format!("Unable to open file {}", path.display()),
            source: Some(Box::new(e)),
        })?;
        Self::from_storage(file, options)
    }
}

impl ImageFile<Cursor<Vec<u8>>> {
    /// Opens the content of an E57 file in memory for reading.
    pub fn from_bytes(bytes: Vec<u8>, options: ImageFileOptions) -> Result<Self> {
        Self::from_storage(Cursor::new(bytes), options)
    }
}

impl<T: Read + Write + Seek> ImageFile<T> {
    /// Creates a new writable file on top of empty storage.
    pub fn new(storage: T) -> Result<Self> {
        let mut file = CheckedFile::create(storage)?;

        // Placeholder header that will be replaced when closing
        Header::default().write(&mut file)?;
        let unused = file.length(OffsetMode::Logical);

        debug!("Created new writable E57 file");
        Ok(Self {
            file: RefCell::new(file),
            tree: RefCell::new(NodeTree::new()),
            cache: PacketReadCache::new(DEFAULT_CACHE_SLOTS),
            writable: true,
            open: Cell::new(true),
            writers: Cell::new(0),
            readers: Cell::new(0),
            unused_logical_start: Cell::new(unused),
        })
    }

    /// Opens existing storage read-only, validates the header and parses the XML section.
    pub fn from_storage(storage: T, options: ImageFileOptions) -> Result<Self> {
        let mut file = CheckedFile::open(storage, options.checksum_policy)?;
        let header = Header::read(&mut file)?;
        let length = file.length(OffsetMode::Physical);
        if header.phys_length != length {
            Err(Error::BadFileLength {
                reason: format!(
                    "Header declares {} bytes, but the file has {length} bytes",
                    header.phys_length
                ),
            })?
        }

        let xml_end = physical_to_logical(header.phys_xml_offset).checked_add(header.xml_length);
        let logical_length = file.length(OffsetMode::Logical);
        if !matches!(xml_end, Some(end) if end <= logical_length) {
            Err(Error::BadFileLength {
                reason: format!(
                    "XML section with {} bytes at offset {} exceeds the file length {length}",
                    header.xml_length, header.phys_xml_offset
                ),
            })?
        }
        let xml_length = usize::try_from(header.xml_length).internal_err("XML section too large")?;
        let mut xml = vec![0_u8; xml_length];
        file.seek(header.phys_xml_offset, OffsetMode::Physical)?;
        file.read(&mut xml)?;
        let xml = String::from_utf8(xml).xml_err("XML section is not valid UTF-8")?;
        let tree = xml::parse(&xml)?;

        debug!(
            "Opened E57 file with {length} bytes and {} bytes of XML",
            header.xml_length
        );
        let unused = file.length(OffsetMode::Logical);
        Ok(Self {
            file: RefCell::new(file),
            tree: RefCell::new(tree),
            cache: PacketReadCache::new(options.packet_cache_slots),
            writable: false,
            open: Cell::new(true),
            writers: Cell::new(0),
            readers: Cell::new(0),
            unused_logical_start: Cell::new(unused),
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.get()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn writer_count(&self) -> usize {
        self.writers.get()
    }

    pub fn reader_count(&self) -> usize {
        self.readers.get()
    }

    /// Read access to the metadata tree.
    pub fn tree(&self) -> Result<Ref<'_, NodeTree>> {
        self.check_open()?;
        self.tree.try_borrow().internal_err("Node tree is borrowed mutably")
    }

    /// Write access to the metadata tree of a writable file.
    pub fn tree_mut(&self) -> Result<RefMut<'_, NodeTree>> {
        self.check_writable()?;
        self.tree.try_borrow_mut().internal_err("Node tree is already borrowed")
    }

    /// Declares a namespace prefix for extension elements.
    pub fn register_extension(&self, prefix: &str, uri: &str) -> Result<()> {
        self.tree_mut()?.register_extension(prefix, uri)
    }

    /// Opens a writer for an empty compressed vector that is attached to the root.
    ///
    /// Buffers are required for all fields of the prototype.
    pub fn writer(
        &self,
        compressed_vector: NodeId,
        buffers: Vec<SourceDestBuffer>,
    ) -> Result<CompressedVectorWriter<'_, T>> {
        CompressedVectorWriter::new(self, compressed_vector, buffers)
    }

    /// Opens a reader for a compressed vector, buffers can be supplied for any subset of fields.
    pub fn reader(
        &self,
        compressed_vector: NodeId,
        buffers: Vec<SourceDestBuffer>,
    ) -> Result<CompressedVectorReader<'_, T>> {
        CompressedVectorReader::new(self, compressed_vector, buffers)
    }

    /// Writes the XML section and the final header of writable files.
    /// Closing an already closed file does nothing.
    pub fn close(&mut self) -> Result<()> {
        if !self.open.get() {
            return Ok(());
        }
        if self.writable {
            let result = self.write_metadata();
            self.open.set(false);
            result?;
        } else {
            self.open.set(false);
        }
        debug!("Closed E57 file");
        Ok(())
    }

    /// Closes the file if needed and returns the underlying storage.
    pub fn into_inner(mut self) -> Result<T> {
        if self.open.get() && self.writable {
            self.close()?;
        }
        self.file.into_inner().into_inner()
    }

    fn write_metadata(&mut self) -> Result<()> {
        let file = self.file.get_mut();
        let tree = self.tree.get_mut();

        let start = align(self.unused_logical_start.get());
        file.extend(start, OffsetMode::Logical)?;
        file.seek(start, OffsetMode::Logical)?;
        xml::serialize(tree, file)?;
        let xml_length = file.position(OffsetMode::Logical) - start;

        let header = Header {
            phys_length: file.length(OffsetMode::Physical),
            phys_xml_offset: logical_to_physical(start),
            xml_length,
            ..Default::default()
        };
        header.write(file)?;
        file.flush()?;
        debug!(
            "Wrote {xml_length} bytes of XML, file has {} bytes",
            header.phys_length
        );
        Ok(())
    }

    /// Runs the operation and poisons the container on fatal errors.
    pub(crate) fn guard<R>(&self, operation: impl FnOnce() -> Result<R>) -> Result<R> {
        let result = operation();
        if let Err(err) = &result {
            self.poison_on(err);
        }
        result
    }

    pub(crate) fn poison_on(&self, err: &Error) {
        if err.is_fatal() && self.open.get() {
            warn!("Closing E57 file after fatal error: {err}");
            self.open.set(false);
        }
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if !self.open.get() {
            Err(Error::ImageFileNotOpen {
                reason: String::from("The E57 file is closed"),
            })?
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if !self.writable {
            Err(Error::FileReadOnly {
                reason: String::from("The E57 file was opened for reading"),
            })?
        }
        Ok(())
    }

    pub(crate) fn file(&self) -> Result<RefMut<'_, CheckedFile<T>>> {
        self.file.try_borrow_mut().internal_err("Paged file is already borrowed")
    }

    pub(crate) fn lock_packet(&self, physical_offset: u64) -> Result<PacketLock<'_>> {
        let mut file = self.file()?;
        self.cache.lock(&mut file, physical_offset)
    }

    /// Reserves space at the end of the file and returns its 4 byte aligned logical start.
    /// Only the open writer may allocate while it is open.
    pub(crate) fn allocate_space(&self, size: u64, by_writer: bool) -> Result<u64> {
        self.check_writable()?;
        if !by_writer && self.writers.get() > 0 {
            Error::bad_api("Cannot allocate space while a compressed vector writer is open")?
        }
        let start = align(self.unused_logical_start.get());
        let end = start
            .checked_add(size)
            .internal_err("Allocation exceeds maximum file size")?;
        self.file()?.extend(end, OffsetMode::Logical)?;
        self.unused_logical_start.set(end);
        Ok(start)
    }

    pub(crate) fn unused_logical_start(&self) -> u64 {
        self.unused_logical_start.get()
    }

    pub(crate) fn begin_writer(&self) -> Result<()> {
        self.check_writable()?;
        if self.writers.get() > 0 {
            Err(Error::TooManyWriters {
                reason: String::from("Only one compressed vector writer can be open"),
            })?
        }
        if self.readers.get() > 0 {
            Err(Error::TooManyReaders {
                reason: format!("Cannot open writer while {} readers are open", self.readers.get()),
            })?
        }
        self.writers.set(1);
        Ok(())
    }

    pub(crate) fn end_writer(&self) {
        self.writers.set(self.writers.get().saturating_sub(1));
    }

    pub(crate) fn begin_reader(&self) -> Result<()> {
        self.check_open()?;
        if self.writers.get() > 0 {
            Err(Error::TooManyWriters {
                reason: String::from("Cannot open reader while a writer is open"),
            })?
        }
        self.readers.set(self.readers.get() + 1);
        Ok(())
    }

    pub(crate) fn end_reader(&self) {
        self.readers.set(self.readers.get().saturating_sub(1));
    }
}

fn align(offset: u64) -> u64 {
    (offset + 3) & !3
}
