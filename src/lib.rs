//! Low level codec for the ASTM E57 file format.
//!
//! Provides the checksummed paging layer, the node tree with its XML representation
//! and bit-packed compressed vectors with their binary sections.
//!
//! ```
//! use e57_codec::{BufferData, ImageFile, Node, SourceDestBuffer};
//! use std::io::Cursor;
//!
//! let image = ImageFile::new(Cursor::new(Vec::new())).unwrap();
//! let cv = {
//!     let mut tree = image.tree_mut().unwrap();
//!     let prototype = tree.add(Node::structure());
//!     let x = tree.add(Node::integer(0, 0, 1023).unwrap());
//!     tree.set_child(prototype, "x", x).unwrap();
//!     let codecs = tree.add(Node::vector(true));
//!     let cv = tree.compressed_vector(prototype, codecs).unwrap();
//!     let root = tree.root();
//!     tree.set_child(root, "points", cv).unwrap();
//!     cv
//! };
//!
//! let values = (0..100).collect();
//! let buffer = SourceDestBuffer::new("x", BufferData::Int64(values));
//! let mut writer = image.writer(cv, vec![buffer]).unwrap();
//! writer.write(100).unwrap();
//! writer.close().unwrap();
//! drop(writer);
//!
//! let bytes = image.into_inner().unwrap().into_inner();
//! let image = ImageFile::from_bytes(bytes, Default::default()).unwrap();
//! let cv = image.tree().unwrap().lookup("/points").unwrap().unwrap();
//! let buffer = SourceDestBuffer::new("x", BufferData::Int64(vec![0; 100]));
//! let mut reader = image.reader(cv, vec![buffer]).unwrap();
//! assert_eq!(reader.read().unwrap(), 100);
//! ```

#![forbid(unsafe_code)]

mod bitpack;
mod blob;
mod bs_read;
mod bs_write;
mod buffer;
mod checked_file;
mod crc32;
mod cv_index;
mod cv_reader;
mod cv_section;
mod cv_writer;
mod error;
mod header;
mod image_file;
mod node;
mod packet;
mod packet_cache;
mod xml;

pub use self::bitpack::bits_needed;
pub use self::blob::BlobSectionHeader;
pub use self::buffer::raw_from_scaled;
pub use self::buffer::scaled_from_raw;
pub use self::buffer::BufferData;
pub use self::buffer::SourceDestBuffer;
pub use self::checked_file::logical_to_physical;
pub use self::checked_file::physical_to_logical;
pub use self::checked_file::validate_checksums;
pub use self::checked_file::CheckedFile;
pub use self::checked_file::ChecksumPolicy;
pub use self::checked_file::OffsetMode;
pub use self::checked_file::LOGICAL_PAGE_SIZE;
pub use self::checked_file::PHYSICAL_PAGE_SIZE;
pub use self::crc32::checksum;
pub use self::cv_reader::CompressedVectorReader;
pub use self::cv_section::CompressedVectorSectionHeader;
pub use self::cv_writer::CompressedVectorWriter;
pub use self::error::Error;
pub use self::error::Result;
pub use self::header::Header;
pub use self::image_file::ImageFile;
pub use self::image_file::ImageFileOptions;
pub use self::node::Extension;
pub use self::node::FloatPrecision;
pub use self::node::Node;
pub use self::node::NodeId;
pub use self::node::NodeTree;
pub use self::packet::DataPacket;
pub use self::packet::DataPacketHeader;
pub use self::packet::EmptyPacket;
pub use self::packet::IndexEntry;
pub use self::packet::IndexPacket;
pub use self::packet::Packet;
pub use self::xml::E57_NAMESPACE;
