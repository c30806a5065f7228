use e57_codec::{
    validate_checksums, BufferData, ChecksumPolicy, Error, Header, ImageFile, ImageFileOptions,
    Node, SourceDestBuffer, PHYSICAL_PAGE_SIZE,
};
use std::io::Cursor;
use tempfile::NamedTempFile;

const RECORDS: usize = 10_000;

/// Creates a file with a compressed vector at `/points` holding one unsigned byte per record.
fn create_file() -> Vec<u8> {
    let image = ImageFile::new(Cursor::new(Vec::new())).unwrap();
    let cv = {
        let mut tree = image.tree_mut().unwrap();
        let prototype = tree.add(Node::structure());
        tree.insert(prototype, "value", Node::integer(0, 0, 255).unwrap())
            .unwrap();
        let codecs = tree.add(Node::vector(true));
        let cv = tree.compressed_vector(prototype, codecs).unwrap();
        let root = tree.root();
        tree.set_child(root, "points", cv).unwrap();
        cv
    };
    let values = (0..RECORDS).map(|i| (i % 256) as u8).collect();
    let buffers = vec![SourceDestBuffer::new("value", BufferData::UInt8(values))];
    let mut writer = image.writer(cv, buffers).unwrap();
    writer.write(RECORDS).unwrap();
    writer.close().unwrap();
    drop(writer);
    image.into_inner().unwrap().into_inner()
}

fn value_buffer(size: usize) -> Vec<SourceDestBuffer> {
    vec![SourceDestBuffer::new(
        "value",
        BufferData::UInt8(vec![0; size]),
    )]
}

#[test]
fn header() {
    let bytes = create_file();
    let header = Header::from_bytes(bytes[..Header::SIZE].try_into().unwrap()).unwrap();
    assert_eq!(&header.signature, b"ASTM-E57");
    assert_eq!(header.major, 1);
    assert_eq!(header.minor, 0);
    assert_eq!(header.page_size, PHYSICAL_PAGE_SIZE);
    assert_eq!(header.phys_length, bytes.len() as u64);
    assert!(header.xml_length > 0);
}

#[test]
fn validate_crc() {
    let bytes = create_file();
    let pages = validate_checksums(Cursor::new(&bytes)).unwrap();
    assert_eq!(pages, bytes.len() as u64 / PHYSICAL_PAGE_SIZE);
}

#[test]
fn seek_boundaries() {
    let image = ImageFile::from_bytes(create_file(), ImageFileOptions::default()).unwrap();
    let cv = image.tree().unwrap().lookup("/points").unwrap().unwrap();
    let mut reader = image.reader(cv, value_buffer(100)).unwrap();

    reader.seek(RECORDS as u64).unwrap();
    assert_eq!(reader.read().unwrap(), 0);

    reader.seek(RECORDS as u64 - 50).unwrap();
    assert_eq!(reader.read().unwrap(), 50);
    let BufferData::UInt8(values) = reader.buffers()[0].data() else {
        panic!("Unexpected buffer type");
    };
    assert_eq!(values[0], ((RECORDS - 50) % 256) as u8);

    let err = reader.seek(RECORDS as u64 + 1).unwrap_err();
    assert!(matches!(err, Error::BadAPIArgument { .. }));

    reader.seek(0).unwrap();
    assert_eq!(reader.read().unwrap(), 100);
    let BufferData::UInt8(values) = reader.buffers()[0].data() else {
        panic!("Unexpected buffer type");
    };
    assert_eq!(values[99], 99);
}

#[test]
fn corrupted_page_is_detected() {
    let mut bytes = create_file();
    // Inside the payload of the second page, which holds packet data
    bytes[PHYSICAL_PAGE_SIZE as usize + 100] ^= 0xFF;

    let err = validate_checksums(Cursor::new(&bytes)).unwrap_err();
    assert!(matches!(err, Error::BadChecksum { .. }));

    let image = ImageFile::from_bytes(bytes, ImageFileOptions::default()).unwrap();
    let cv = image.tree().unwrap().lookup("/points").unwrap().unwrap();
    let mut reader = image.reader(cv, value_buffer(RECORDS)).unwrap();
    let err = reader.read().unwrap_err();
    assert!(matches!(err, Error::BadChecksum { .. }));
    assert!(!reader.is_open());
    assert!(!image.is_open());
}

#[test]
fn invalid_checksum_policy() {
    assert!(ChecksumPolicy::new(101).is_err());
    assert_eq!(ChecksumPolicy::new(50).unwrap(), ChecksumPolicy::HALF);
}

#[test]
fn truncated_file() {
    let mut bytes = create_file();
    bytes.truncate(bytes.len() - 10);
    let err = ImageFile::from_bytes(bytes, ImageFileOptions::default())
        .err()
        .unwrap();
    assert!(matches!(err, Error::BadFileLength { .. }));
}

#[test]
#[cfg_attr(debug_assertions, ignore = "writes more than 128 MiB, run with --release")]
fn seek_through_multi_level_index() {
    // 64 bit records fill a data packet with 8184 records,
    // so 2049 packets need a second index level.
    const PER_PACKET: u64 = 8184;
    const BLOCK: usize = 1 << 20;
    let total = 2049 * PER_PACKET + 17;

    let file = NamedTempFile::new().unwrap();
    let mut image = ImageFile::create(file.path()).unwrap();
    let cv = {
        let mut tree = image.tree_mut().unwrap();
        let prototype = tree.add(Node::structure());
        tree.insert(prototype, "value", Node::integer(0, i64::MIN, i64::MAX).unwrap())
            .unwrap();
        let codecs = tree.add(Node::vector(true));
        let cv = tree.compressed_vector(prototype, codecs).unwrap();
        let root = tree.root();
        tree.set_child(root, "points", cv).unwrap();
        cv
    };
    let buffers = vec![SourceDestBuffer::new(
        "value",
        BufferData::Int64(vec![0; BLOCK]),
    )];
    let mut writer = image.writer(cv, buffers).unwrap();
    let mut written = 0;
    while written < total {
        let count = (total - written).min(BLOCK as u64) as usize;
        if let BufferData::Int64(values) = writer.buffers_mut()[0].data_mut() {
            for (i, value) in values[..count].iter_mut().enumerate() {
                *value = 3 * (written + i as u64) as i64;
            }
        }
        writer.write(count).unwrap();
        written += count as u64;
    }
    writer.close().unwrap();
    drop(writer);
    image.close().unwrap();
    drop(image);

    let image = ImageFile::open(file.path()).unwrap();
    let cv = image.tree().unwrap().lookup("/points").unwrap().unwrap();
    let buffers = vec![SourceDestBuffer::new("value", BufferData::Int64(vec![0; 4]))];
    let mut reader = image.reader(cv, buffers).unwrap();
    assert_eq!(reader.record_count(), total);

    let targets = [
        0,
        5,
        2048 * PER_PACKET - 1,
        2048 * PER_PACKET + 1,
        12_345_678,
        total - 3,
    ];
    for record in targets {
        reader.seek(record).unwrap();
        let count = reader.read().unwrap();
        assert_eq!(count as u64, (total - record).min(4));
        let BufferData::Int64(values) = reader.buffers()[0].data() else {
            panic!("Unexpected buffer type");
        };
        for (i, value) in values[..count].iter().enumerate() {
            assert_eq!(*value, 3 * (record + i as u64) as i64);
        }
    }
}
