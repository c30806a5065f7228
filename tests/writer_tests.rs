use e57_codec::{
    BufferData, Error, ImageFile, ImageFileOptions, Node, NodeId, SourceDestBuffer,
};
use std::io::{Cursor, Read, Seek, Write};
use tempfile::NamedTempFile;

fn add_points<T: Read + Write + Seek>(image: &ImageFile<T>) -> NodeId {
    let mut tree = image.tree_mut().unwrap();
    let prototype = tree.add(Node::structure());
    tree.insert(prototype, "x", Node::integer(0, 0, 1023).unwrap())
        .unwrap();
    tree.insert(prototype, "y", Node::double(0.0)).unwrap();
    let codecs = tree.add(Node::vector(true));
    let cv = tree.compressed_vector(prototype, codecs).unwrap();
    let root = tree.root();
    tree.set_child(root, "points", cv).unwrap();
    cv
}

fn point_buffers(start: usize, count: usize) -> Vec<SourceDestBuffer> {
    let x = (start..start + count).map(|i| (i % 1024) as i64).collect();
    let y = (start..start + count).map(|i| i as f64 * 0.5).collect();
    vec![
        SourceDestBuffer::new("x", BufferData::Int64(x)),
        SourceDestBuffer::new("y", BufferData::Real64(y)),
    ]
}

fn record_count<T: Read + Write + Seek>(image: &ImageFile<T>, path: &str) -> u64 {
    let tree = image.tree().unwrap();
    let cv = tree.lookup(path).unwrap().unwrap();
    match tree.get(cv).unwrap() {
        Node::CompressedVector { record_count, .. } => *record_count,
        other => panic!("Expected compressed vector, found {}", other.type_name()),
    }
}

#[test]
fn write_read_cycle_file() {
    let file = NamedTempFile::new().unwrap();
    let mut image = ImageFile::create(file.path()).unwrap();
    let cv = add_points(&image);
    let mut writer = image.writer(cv, point_buffers(0, 1000)).unwrap();
    for block in 0..10 {
        writer
            .write_with(point_buffers(block * 1000, 1000), 1000)
            .unwrap();
    }
    writer.close().unwrap();
    drop(writer);
    image.close().unwrap();
    drop(image);

    let image = ImageFile::open(file.path()).unwrap();
    assert!(!image.is_writable());
    assert_eq!(record_count(&image, "/points"), 10_000);

    let cv = image.tree().unwrap().lookup("/points").unwrap().unwrap();
    let buffers = vec![
        SourceDestBuffer::new("x", BufferData::Int64(vec![0; 777])),
        SourceDestBuffer::new("y", BufferData::Real64(vec![0.0; 777])),
    ];
    let mut reader = image.reader(cv, buffers).unwrap();
    let mut x_values = Vec::new();
    let mut y_values = Vec::new();
    loop {
        let count = reader.read().unwrap();
        if count == 0 {
            break;
        }
        let buffers = reader.buffers();
        if let BufferData::Int64(x) = buffers[0].data() {
            x_values.extend_from_slice(&x[..count]);
        }
        if let BufferData::Real64(y) = buffers[1].data() {
            y_values.extend_from_slice(&y[..count]);
        }
    }
    assert_eq!(x_values.len(), 10_000);
    assert_eq!(y_values.len(), 10_000);
    assert_eq!(x_values[5000], 5000 % 1024);
    assert_eq!(y_values[5000], 2500.0);
    assert_eq!(x_values[9999], 9999 % 1024);
}

#[test]
fn failed_writer_leaves_vector_empty() {
    let mut image = ImageFile::new(Cursor::new(Vec::new())).unwrap();
    let cv = add_points(&image);
    let mut buffers = point_buffers(0, 1000);
    if let BufferData::Int64(x) = buffers[0].data_mut() {
        x[500] = 5000;
    }
    let mut writer = image.writer(cv, buffers).unwrap();
    let err = writer.write(1000).unwrap_err();
    assert!(matches!(err, Error::ValueOutOfBounds { .. }));
    assert!(writer.close().is_err());
    drop(writer);
    assert_eq!(record_count(&image, "/points"), 0);
    image.close().unwrap();

    let bytes = image.into_inner().unwrap().into_inner();
    let image = ImageFile::from_bytes(bytes, ImageFileOptions::default()).unwrap();
    assert_eq!(record_count(&image, "/points"), 0);
    let mut reader = image
        .reader(cv_of(&image), vec![SourceDestBuffer::new("x", BufferData::Int64(vec![0; 10]))])
        .unwrap();
    assert_eq!(reader.read().unwrap(), 0);
}

fn cv_of<T: Read + Write + Seek>(image: &ImageFile<T>) -> NodeId {
    image.tree().unwrap().lookup("/points").unwrap().unwrap()
}

#[test]
fn abandoned_writer_discards_records() {
    let image = ImageFile::new(Cursor::new(Vec::new())).unwrap();
    let cv = add_points(&image);
    let mut writer = image.writer(cv, point_buffers(0, 100)).unwrap();
    writer.write(100).unwrap();
    drop(writer);
    assert_eq!(image.writer_count(), 0);

    let bytes = image.into_inner().unwrap().into_inner();
    let image = ImageFile::from_bytes(bytes, ImageFileOptions::default()).unwrap();
    assert_eq!(record_count(&image, "/points"), 0);
}

#[test]
fn metadata_and_extensions_survive() {
    let image = ImageFile::new(Cursor::new(Vec::new())).unwrap();
    image
        .register_extension("demo", "http://example.com/demo")
        .unwrap();
    {
        let mut tree = image.tree_mut().unwrap();
        let root = tree.root();
        tree.insert(root, "formatName", Node::string("ASTM E57 3D Imaging Data File"))
            .unwrap();
        tree.insert(root, "demo:answer", Node::integer(42, 0, 100).unwrap())
            .unwrap();
        let list = tree.insert(root, "list", Node::vector(false)).unwrap();
        let first = tree.add(Node::double(1.5));
        tree.append(list, first).unwrap();
        let second = tree.add(Node::string("text"));
        let err = tree.append(list, second).unwrap_err();
        assert!(matches!(err, Error::HomogeneousViolation { .. }));
    }

    let bytes = image.into_inner().unwrap().into_inner();
    let image = ImageFile::from_bytes(bytes, ImageFileOptions::default()).unwrap();
    let tree = image.tree().unwrap();
    assert_eq!(
        tree.extension_uri("demo"),
        Some("http://example.com/demo")
    );
    let answer = tree.lookup("/demo:answer").unwrap().unwrap();
    assert!(matches!(tree.get(answer).unwrap(), Node::Integer { value: 42, .. }));
    let name = tree.lookup("/formatName").unwrap().unwrap();
    assert!(matches!(
        tree.get(name).unwrap(),
        Node::String { value } if value == "ASTM E57 3D Imaging Data File"
    ));
    let first = tree.lookup("/list/0").unwrap().unwrap();
    assert!(matches!(tree.get(first).unwrap(), Node::Float { value, .. } if *value == 1.5));
    assert!(tree.lookup("/list/1").unwrap().is_none());
}

#[test]
fn blob_cycle() {
    let image = ImageFile::new(Cursor::new(Vec::new())).unwrap();
    let data: Vec<u8> = (0..5000).map(|i| (i * 7 % 256) as u8).collect();
    let blob = image.new_blob(data.len() as u64).unwrap();
    image.write_blob(blob, 0, &data).unwrap();
    {
        let mut tree = image.tree_mut().unwrap();
        let root = tree.root();
        tree.set_child(root, "image", blob).unwrap();
    }

    let bytes = image.into_inner().unwrap().into_inner();
    let image = ImageFile::from_bytes(bytes, ImageFileOptions::default()).unwrap();
    let blob = image.tree().unwrap().lookup("/image").unwrap().unwrap();
    let mut buffer = vec![0_u8; 5000];
    image.read_blob(blob, 0, &mut buffer).unwrap();
    assert_eq!(buffer, data);
    let err = image.write_blob(blob, 0, &[1, 2, 3]).unwrap_err();
    assert!(matches!(err, Error::FileReadOnly { .. }));
}
