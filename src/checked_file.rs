use crate::crc32::checksum_bytes;
use crate::error::Converter;
use crate::{Error, Result};
use log::trace;
use std::io::{Read, Seek, SeekFrom, Write};

/// Size of a physical page including its checksum.
pub const PHYSICAL_PAGE_SIZE: u64 = 1 << PAGE_SIZE_LOG2;
/// Size of the checksum at the end of each physical page.
pub const CHECKSUM_SIZE: u64 = 4;
/// Number of payload bytes in each physical page.
pub const LOGICAL_PAGE_SIZE: u64 = PHYSICAL_PAGE_SIZE - CHECKSUM_SIZE;

const PAGE_SIZE_LOG2: u32 = 10;
const PAGE_MASK: u64 = PHYSICAL_PAGE_SIZE - 1;
const PAGE_BUFFER_SIZE: usize = PHYSICAL_PAGE_SIZE as usize;
const PAYLOAD_SIZE: usize = LOGICAL_PAGE_SIZE as usize;

/// Maps a checksum-free logical offset to its physical file offset.
pub fn logical_to_physical(logical: u64) -> u64 {
    let page = logical / LOGICAL_PAGE_SIZE;
    let remainder = logical - page * LOGICAL_PAGE_SIZE;
    page * PHYSICAL_PAGE_SIZE + remainder
}

/// Maps a physical file offset to its logical offset.
/// Offsets pointing into a checksum are mapped to the start of the next page.
pub fn physical_to_logical(physical: u64) -> u64 {
    let page = physical >> PAGE_SIZE_LOG2;
    let remainder = (physical & PAGE_MASK).min(LOGICAL_PAGE_SIZE);
    page * LOGICAL_PAGE_SIZE + remainder
}

/// Selects the offset space for seeking, positions and lengths.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OffsetMode {
    /// Offsets without the interleaved page checksums.
    Logical,
    /// Offsets in the actual file, including page checksums.
    Physical,
}

/// Percentage of pages whose checksum is verified when reading.
///
/// The last page touched by a read is always verified, regardless of the policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChecksumPolicy(u8);

impl ChecksumPolicy {
    /// Only the last page of each read is verified.
    pub const NONE: Self = Self(0);
    /// Every fourth page is verified.
    pub const SPARSE: Self = Self(25);
    /// Every second page is verified.
    pub const HALF: Self = Self(50);
    /// All pages are verified.
    pub const ALL: Self = Self(100);

    /// Creates a policy from a percentage between 0 and 100.
    pub fn new(percent: u8) -> Result<Self> {
        if percent > 100 {
            Error::bad_api(format!(
                "Checksum policy must be between 0 and 100, got {percent}"
            ))?
        }
        Ok(Self(percent))
    }

    /// Returns the percentage of verified pages.
    pub fn percent(self) -> u8 {
        self.0
    }

    fn verifies(self, page: u64) -> bool {
        if self.0 == 0 {
            return false;
        }
        let stride = 100 / self.0 as u64;
        page % stride == 0
    }
}

impl Default for ChecksumPolicy {
    fn default() -> Self {
        Self::ALL
    }
}

/// Presents a page-checksummed storage as a contiguous logical byte stream.
///
/// One physical page is buffered at a time.
/// Written pages get their checksum once the cursor leaves the page or on flush.
pub struct CheckedFile<T: Read + Write + Seek> {
    inner: T,
    read_only: bool,
    policy: ChecksumPolicy,
    logical_length: u64,
    position: u64,
    disk_pages: u64,
    page: Option<u64>,
    page_verified: bool,
    page_dirty: bool,
    buffer: [u8; PAGE_BUFFER_SIZE],
}

impl<T: Read + Write + Seek> CheckedFile<T> {
    /// Opens existing paged data for reading only.
    pub fn open(mut inner: T, policy: ChecksumPolicy) -> Result<Self> {
        let physical_length = inner
            .seek(SeekFrom::End(0))
            .seek_err("Failed to determine storage length")?;
        if physical_length % PHYSICAL_PAGE_SIZE != 0 {
            Err(Error::BadFileLength {
                reason: format!(
                    "Length {physical_length} is not a multiple of the page size {PHYSICAL_PAGE_SIZE}"
                ),
            })?
        }
        let disk_pages = physical_length / PHYSICAL_PAGE_SIZE;
        Ok(Self {
            inner,
            read_only: true,
            policy,
            logical_length: disk_pages * LOGICAL_PAGE_SIZE,
            position: 0,
            disk_pages,
            page: None,
            page_verified: false,
            page_dirty: false,
            buffer: [0_u8; PAGE_BUFFER_SIZE],
        })
    }

    /// Creates a writable paged file on top of empty storage.
    pub fn create(mut inner: T) -> Result<Self> {
        let end = inner
            .seek(SeekFrom::End(0))
            .seek_err("Failed to determine storage length")?;
        if end != 0 {
            Error::bad_api("Supplied storage for a new file is not empty")?
        }
        Ok(Self {
            inner,
            read_only: false,
            policy: ChecksumPolicy::ALL,
            logical_length: 0,
            position: 0,
            disk_pages: 0,
            page: None,
            page_verified: false,
            page_dirty: false,
            buffer: [0_u8; PAGE_BUFFER_SIZE],
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn checksum_policy(&self) -> ChecksumPolicy {
        self.policy
    }

    /// Moves the cursor. Seeking behind the end of the file is not allowed.
    pub fn seek(&mut self, offset: u64, mode: OffsetMode) -> Result<()> {
        let logical = match mode {
            OffsetMode::Logical => offset,
            OffsetMode::Physical => physical_to_logical(offset),
        };
        if logical > self.logical_length {
            Err(Error::SeekFailed {
                reason: format!(
                    "Cannot seek to logical offset {logical} behind the end at {}",
                    self.logical_length
                ),
                source: None,
            })?
        }
        self.position = logical;
        Ok(())
    }

    pub fn position(&self, mode: OffsetMode) -> u64 {
        match mode {
            OffsetMode::Logical => self.position,
            OffsetMode::Physical => logical_to_physical(self.position),
        }
    }

    /// Length of the file, in physical mode always a whole number of pages.
    pub fn length(&self, mode: OffsetMode) -> u64 {
        match mode {
            OffsetMode::Logical => self.logical_length,
            OffsetMode::Physical => {
                let pages = self.logical_length.div_ceil(LOGICAL_PAGE_SIZE);
                pages * PHYSICAL_PAGE_SIZE
            }
        }
    }

    /// Fills the buffer with data starting at the current logical position.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let end = self.position + buf.len() as u64;
        if end > self.logical_length {
            Err(Error::ReadFailed {
                reason: format!(
                    "Cannot read {} bytes at logical offset {}, file length is {}",
                    buf.len(),
                    self.position,
                    self.logical_length
                ),
                source: None,
            })?
        }

        let last_page = (end - 1) / LOGICAL_PAGE_SIZE;
        let mut done = 0;
        while done < buf.len() {
            let page = self.position / LOGICAL_PAGE_SIZE;
            let offset = (self.position % LOGICAL_PAGE_SIZE) as usize;
            let count = (PAYLOAD_SIZE - offset).min(buf.len() - done);
            let verify = page == last_page || self.policy.verifies(page);
            self.load_page(page, verify)?;
            buf[done..done + count].copy_from_slice(&self.buffer[offset..offset + count]);
            done += count;
            self.position += count as u64;
        }
        Ok(())
    }

    /// Writes data at the current logical position and extends the file if needed.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.read_only {
            Err(Error::FileReadOnly {
                reason: String::from("Cannot write into a file opened for reading"),
            })?
        }
        let mut done = 0;
        while done < data.len() {
            let page = self.position / LOGICAL_PAGE_SIZE;
            let offset = (self.position % LOGICAL_PAGE_SIZE) as usize;
            let count = (PAYLOAD_SIZE - offset).min(data.len() - done);
            self.load_page(page, false)?;
            self.buffer[offset..offset + count].copy_from_slice(&data[done..done + count]);
            self.page_dirty = true;
            done += count;
            self.position += count as u64;
            self.logical_length = self.logical_length.max(self.position);
        }
        Ok(())
    }

    /// Grows the file with zeros up to the new length, the cursor does not move.
    pub fn extend(&mut self, new_length: u64, mode: OffsetMode) -> Result<()> {
        let new_logical = match mode {
            OffsetMode::Logical => new_length,
            OffsetMode::Physical => physical_to_logical(new_length),
        };
        if new_logical < self.logical_length {
            Error::bad_api(format!(
                "Cannot shrink file from {} to {new_logical} bytes",
                self.logical_length
            ))?
        }
        let position = self.position;
        self.position = self.logical_length;
        let zeros = [0_u8; PAYLOAD_SIZE];
        while self.position < new_logical {
            let count = (new_logical - self.position).min(zeros.len() as u64) as usize;
            self.write(&zeros[..count])?;
        }
        self.position = position;
        Ok(())
    }

    pub fn append_str(&mut self, value: &str) -> Result<()> {
        self.write(value.as_bytes())
    }

    pub fn append_i64(&mut self, value: i64) -> Result<()> {
        self.append_str(&value.to_string())
    }

    pub fn append_u64(&mut self, value: u64) -> Result<()> {
        self.append_str(&value.to_string())
    }

    /// Appends the shortest scientific notation that parses back to the same value.
    pub fn append_f32(&mut self, value: f32) -> Result<()> {
        self.append_str(&format!("{value:e}"))
    }

    /// Appends the shortest scientific notation that parses back to the same value.
    pub fn append_f64(&mut self, value: f64) -> Result<()> {
        self.append_str(&format!("{value:e}"))
    }

    /// Persists the buffered page and flushes the underlying storage.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_page()?;
        if !self.read_only {
            self.inner
                .flush()
                .write_err("Failed to flush underlying storage")?;
        }
        Ok(())
    }

    /// Flushes and returns the underlying storage.
    pub fn into_inner(mut self) -> Result<T> {
        self.flush()?;
        Ok(self.inner)
    }

    fn load_page(&mut self, page: u64, verify: bool) -> Result<()> {
        if self.page == Some(page) {
            if verify && !self.page_verified && !self.page_dirty {
                self.verify_page(page)?;
            }
            return Ok(());
        }

        self.flush_page()?;
        self.page = None;
        if page < self.disk_pages {
            self.inner
                .seek(SeekFrom::Start(page * PHYSICAL_PAGE_SIZE))
                .seek_err(format!("Failed to seek to page {page}"))?;
            self.inner
                .read_exact(&mut self.buffer)
                .read_err(format!("Failed to read page {page}"))?;
            self.page_verified = false;
            if verify {
                self.verify_page(page)?;
            }
        } else {
            self.buffer.fill(0);
            self.page_verified = true;
        }
        self.page = Some(page);
        self.page_dirty = false;
        Ok(())
    }

    fn verify_page(&mut self, page: u64) -> Result<()> {
        let expected = &self.buffer[PAYLOAD_SIZE..];
        let calculated = checksum_bytes(&self.buffer[..PAYLOAD_SIZE]);
        if expected != calculated {
            let reason = format!(
                "Page {page} has checksum {expected:?}, but its content has checksum {calculated:?}"
            );
            self.page = None;
            Err(Error::BadChecksum { reason })?
        }
        self.page_verified = true;
        Ok(())
    }

    fn flush_page(&mut self) -> Result<()> {
        let page = match self.page {
            Some(page) if self.page_dirty => page,
            _ => return Ok(()),
        };
        let crc = checksum_bytes(&self.buffer[..PAYLOAD_SIZE]);
        self.buffer[PAYLOAD_SIZE..].copy_from_slice(&crc);
        self.inner
            .seek(SeekFrom::Start(page * PHYSICAL_PAGE_SIZE))
            .seek_err(format!("Failed to seek to page {page}"))?;
        self.inner
            .write_all(&self.buffer)
            .write_err(format!("Failed to write page {page}"))?;
        trace!("Wrote page {page} with checksum {crc:?}");
        self.disk_pages = self.disk_pages.max(page + 1);
        self.page_dirty = false;
        self.page_verified = true;
        Ok(())
    }
}

/// Verifies the checksum of every page, regardless of any policy.
/// Returns the number of validated pages.
pub fn validate_checksums<R: Read + Seek>(mut reader: R) -> Result<u64> {
    let length = reader
        .seek(SeekFrom::End(0))
        .seek_err("Failed to determine file length")?;
    if length % PHYSICAL_PAGE_SIZE != 0 {
        Err(Error::BadFileLength {
            reason: format!("Length {length} is not a multiple of the page size"),
        })?
    }
    reader
        .seek(SeekFrom::Start(0))
        .seek_err("Failed to seek to start of file")?;

    let pages = length / PHYSICAL_PAGE_SIZE;
    let mut buffer = [0_u8; PAGE_BUFFER_SIZE];
    for page in 0..pages {
        reader
            .read_exact(&mut buffer)
            .read_err(format!("Failed to read page {page}"))?;
        let calculated = checksum_bytes(&buffer[..PAYLOAD_SIZE]);
        if buffer[PAYLOAD_SIZE..] != calculated {
            Err(Error::BadChecksum {
                reason: format!("Detected invalid checksum for page {page}"),
            })?
        }
    }
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn new_file() -> CheckedFile<Cursor<Vec<u8>>> {
        CheckedFile::create(Cursor::new(Vec::new())).unwrap()
    }

    fn finish(file: CheckedFile<Cursor<Vec<u8>>>) -> Vec<u8> {
        file.into_inner().unwrap().into_inner()
    }

    proptest! {
        #[test]
        fn page_mapping_round_trip(logical in 0_u64..u64::MAX / 2) {
            let physical = logical_to_physical(logical);
            prop_assert_eq!(physical_to_logical(physical), logical);
            prop_assert!(physical & PAGE_MASK < LOGICAL_PAGE_SIZE);
        }
    }

    #[test]
    fn page_mapping_boundaries() {
        assert_eq!(logical_to_physical(0), 0);
        assert_eq!(logical_to_physical(1019), 1019);
        assert_eq!(logical_to_physical(1020), 1024);
        assert_eq!(logical_to_physical(2040), 2048);
        assert_eq!(physical_to_logical(1020), 1020);
        assert_eq!(physical_to_logical(1023), 1020);
        assert_eq!(physical_to_logical(1024), 1020);
        assert_eq!(physical_to_logical(1025), 1021);
    }

    #[test]
    fn policy_sampling() {
        assert!(!ChecksumPolicy::NONE.verifies(0));
        assert!((0..8).all(|p| ChecksumPolicy::ALL.verifies(p)));
        assert!(ChecksumPolicy::HALF.verifies(2));
        assert!(!ChecksumPolicy::HALF.verifies(3));
        assert!(ChecksumPolicy::SPARSE.verifies(8));
        assert!(!ChecksumPolicy::SPARSE.verifies(6));

        // Stride is the truncated quotient of 100 and the percentage
        let sixty = ChecksumPolicy::new(60).unwrap();
        assert!((0..8).all(|p| sixty.verifies(p)));
        let thirty = ChecksumPolicy::new(30).unwrap();
        assert!(thirty.verifies(3) && thirty.verifies(6));
        assert!(!thirty.verifies(4));
        assert!(ChecksumPolicy::new(101).is_err());
        assert_eq!(ChecksumPolicy::new(33).unwrap().percent(), 33);
    }

    #[test]
    fn empty() {
        let file = new_file();
        assert_eq!(file.length(OffsetMode::Physical), 0);
        assert_eq!(finish(file).len(), 0);
    }

    #[test]
    fn partial_page() {
        let mut file = new_file();
        file.write(&[0_u8, 1_u8, 2_u8]).unwrap();
        assert_eq!(file.length(OffsetMode::Logical), 3);
        assert_eq!(file.length(OffsetMode::Physical), PHYSICAL_PAGE_SIZE);

        let content = finish(file);
        assert_eq!(content.len(), PAGE_BUFFER_SIZE);
        assert_eq!(&content[..3], &[0, 1, 2]);
        assert!(content[3..PAYLOAD_SIZE].iter().all(|b| *b == 0));
        assert_eq!(&content[PAYLOAD_SIZE..], &[156, 69, 208, 231]);
    }

    #[test]
    fn single_page() {
        let mut file = new_file();
        file.write(&[1_u8; PAYLOAD_SIZE]).unwrap();
        let content = finish(file);
        assert_eq!(content.len(), PAGE_BUFFER_SIZE);
        assert_eq!(&content[PAYLOAD_SIZE..], &[25, 85, 144, 35]);
    }

    #[test]
    fn multi_page() {
        let mut data = vec![1_u8; PAYLOAD_SIZE + 1];
        data[PAYLOAD_SIZE] = 2;
        let mut file = new_file();
        file.write(&data).unwrap();
        assert_eq!(file.position(OffsetMode::Physical), PHYSICAL_PAGE_SIZE + 1);

        let content = finish(file);
        assert_eq!(content.len(), 2 * PAGE_BUFFER_SIZE);
        assert_eq!(&content[PAYLOAD_SIZE..PAGE_BUFFER_SIZE], &[25, 85, 144, 35]);
        assert_eq!(content[PAGE_BUFFER_SIZE], 2);
        assert_eq!(&content[PAGE_BUFFER_SIZE + PAYLOAD_SIZE..], &[40, 41, 250, 169]);
    }

    #[test]
    fn flush_in_page() {
        let mut file = new_file();
        file.write(&[0, 1, 2]).unwrap();
        file.flush().unwrap();
        file.write(&[3, 4, 5]).unwrap();

        let content = finish(file);
        assert_eq!(content.len(), PAGE_BUFFER_SIZE);
        assert_eq!(&content[..6], &[0, 1, 2, 3, 4, 5]);
        assert_eq!(&content[PAYLOAD_SIZE..], &[50, 14, 64, 153]);
    }

    #[test]
    fn overwrite_across_page_boundary() {
        let mut file = new_file();
        file.write(&[1; PAYLOAD_SIZE]).unwrap();
        file.write(&[2; PAYLOAD_SIZE]).unwrap();
        file.seek(LOGICAL_PAGE_SIZE - 1, OffsetMode::Logical).unwrap();
        file.write(&[3, 3]).unwrap();

        let content = finish(file);
        assert_eq!(content[PAYLOAD_SIZE - 2], 1);
        assert_eq!(content[PAYLOAD_SIZE - 1], 3);
        assert_eq!(content[PAGE_BUFFER_SIZE], 3);
        assert_eq!(content[PAGE_BUFFER_SIZE + 1], 2);
        assert_eq!(validate_checksums(Cursor::new(content)).unwrap(), 2);
    }

    #[test]
    fn read_back_all_pages() {
        let data: Vec<u8> = (0..5000_u32).map(|i| (i % 251) as u8).collect();
        let mut file = new_file();
        file.write(&data).unwrap();

        // Reading from the writable file goes through the page buffer
        file.seek(100, OffsetMode::Logical).unwrap();
        let mut chunk = [0_u8; 2000];
        file.read(&mut chunk).unwrap();
        assert_eq!(&chunk[..], &data[100..2100]);

        let content = finish(file);
        let mut file = CheckedFile::open(Cursor::new(content), ChecksumPolicy::ALL).unwrap();
        assert!(file.is_read_only());
        let mut read = vec![0_u8; data.len()];
        file.read(&mut read).unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn corrupted_page_is_detected() {
        let mut file = new_file();
        file.write(&vec![7_u8; 3 * PAYLOAD_SIZE]).unwrap();
        let mut content = finish(file);
        content[PAGE_BUFFER_SIZE + 10] ^= 0xFF;

        // Page 1 is not the last page of the read and is skipped without verification
        let mut file =
            CheckedFile::open(Cursor::new(content.clone()), ChecksumPolicy::NONE).unwrap();
        let mut buf = vec![0_u8; 3 * PAYLOAD_SIZE];
        file.read(&mut buf).unwrap();

        // The last page of a read is always verified
        file.seek(LOGICAL_PAGE_SIZE, OffsetMode::Logical).unwrap();
        let err = file.read(&mut [0_u8; 4]).unwrap_err();
        assert!(matches!(err, Error::BadChecksum { .. }));

        let mut file =
            CheckedFile::open(Cursor::new(content.clone()), ChecksumPolicy::ALL).unwrap();
        let err = file.read(&mut buf).unwrap_err();
        assert!(matches!(err, Error::BadChecksum { .. }));

        let err = validate_checksums(Cursor::new(content)).unwrap_err();
        assert!(matches!(err, Error::BadChecksum { .. }));
    }

    #[test]
    fn read_and_seek_limits() {
        let mut file = new_file();
        file.write(&[1, 2, 3, 4]).unwrap();
        file.seek(4, OffsetMode::Logical).unwrap();
        let err = file.seek(5, OffsetMode::Logical).unwrap_err();
        assert!(matches!(err, Error::SeekFailed { .. }));

        file.seek(2, OffsetMode::Logical).unwrap();
        let err = file.read(&mut [0_u8; 3]).unwrap_err();
        assert!(matches!(err, Error::ReadFailed { .. }));
    }

    #[test]
    fn physical_seek_maps_to_logical() {
        let mut file = new_file();
        file.write(&[9_u8; 2 * PAYLOAD_SIZE]).unwrap();
        file.seek(PHYSICAL_PAGE_SIZE + 4, OffsetMode::Physical).unwrap();
        assert_eq!(file.position(OffsetMode::Logical), LOGICAL_PAGE_SIZE + 4);
        assert_eq!(file.position(OffsetMode::Physical), PHYSICAL_PAGE_SIZE + 4);
    }

    #[test]
    fn read_only_rejects_writes() {
        let mut file = new_file();
        file.write(&[1]).unwrap();
        let content = finish(file);
        let mut file = CheckedFile::open(Cursor::new(content), ChecksumPolicy::ALL).unwrap();
        let err = file.write(&[2]).unwrap_err();
        assert!(matches!(err, Error::FileReadOnly { .. }));
    }

    #[test]
    fn open_rejects_partial_pages() {
        let err = CheckedFile::open(Cursor::new(vec![0_u8; 1000]), ChecksumPolicy::ALL).err();
        assert!(matches!(err, Some(Error::BadFileLength { .. })));
    }

    #[test]
    fn create_rejects_non_empty_storage() {
        let err = CheckedFile::create(Cursor::new(vec![0_u8; 4])).err();
        assert!(matches!(err, Some(Error::BadAPIArgument { .. })));
    }

    #[test]
    fn extend_with_zeros() {
        let mut file = new_file();
        file.write(&[5, 5]).unwrap();
        file.seek(1, OffsetMode::Logical).unwrap();
        file.extend(3000, OffsetMode::Logical).unwrap();
        assert_eq!(file.length(OffsetMode::Logical), 3000);
        assert_eq!(file.length(OffsetMode::Physical), 3 * PHYSICAL_PAGE_SIZE);
        assert_eq!(file.position(OffsetMode::Logical), 1);
        assert!(file.extend(10, OffsetMode::Logical).is_err());

        let content = finish(file);
        assert_eq!(content.len(), 3 * PAGE_BUFFER_SIZE);
        assert_eq!(validate_checksums(Cursor::new(content)).unwrap(), 3);
    }

    #[test]
    fn appenders() {
        let mut file = new_file();
        file.append_str("<a>").unwrap();
        file.append_i64(-42).unwrap();
        file.append_str(" ").unwrap();
        file.append_u64(u64::MAX).unwrap();
        file.append_str(" ").unwrap();
        file.append_f32(0.1).unwrap();
        file.append_str(" ").unwrap();
        file.append_f64(2500.5).unwrap();

        let length = file.length(OffsetMode::Logical) as usize;
        let mut text = vec![0_u8; length];
        file.seek(0, OffsetMode::Logical).unwrap();
        file.read(&mut text).unwrap();
        let text = String::from_utf8(text).unwrap();
        assert_eq!(text, "<a>-42 18446744073709551615 1e-1 2.5005e3");

        let parts: Vec<&str> = text.split(' ').collect();
        assert_eq!(parts[2].parse::<f32>().unwrap(), 0.1_f32);
        assert_eq!(parts[3].parse::<f64>().unwrap(), 2500.5);
    }
}
