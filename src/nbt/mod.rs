//! Named binary tag trees.
//!
//! Chunk payloads and `level.dat` are both stored as a tree of typed tags.
//! The tree types come from `quartz_nbt`, built with `preserve_order` so a
//! compound which is loaded and saved again keeps its key order. This module
//! adds the root and file helpers the world code uses, plus byte array
//! conversion between `quartz_nbt`'s signed bytes and the unsigned voxel arrays.

use std::{
    fmt,
    fs::File,
    io::{self, BufReader, BufWriter, Cursor, Write},
    path::Path,
};

use quartz_nbt::io::{read_nbt, write_nbt, Flavor, NbtIoError};
pub use quartz_nbt::{NbtCompound, NbtList, NbtTag};

/// Names and strings are stored with a u16 byte length.
pub const MAX_STRING_BYTES: usize = u16::MAX as usize;

#[derive(Debug)]
pub enum NbtError {
    Codec(NbtIoError),
    Io(io::Error),
    /// A name or string would not fit its length prefix once encoded.
    StringTooLong(usize),
}

impl fmt::Display for NbtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::StringTooLong(len) => write!(
                f,
                "string encodes to {len} bytes, the limit is {MAX_STRING_BYTES}"
            ),
        }
    }
}

impl std::error::Error for NbtError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::StringTooLong(_) => None,
        }
    }
}

impl From<NbtIoError> for NbtError {
    fn from(err: NbtIoError) -> Self {
        NbtError::Codec(err)
    }
}

impl From<io::Error> for NbtError {
    fn from(err: io::Error) -> Self {
        NbtError::Io(err)
    }
}

/// Decodes an uncompressed named root compound.
pub fn read_root(data: &[u8]) -> Result<(String, NbtCompound), NbtError> {
    let (root, name) = read_nbt(&mut Cursor::new(data), Flavor::Uncompressed)?;
    Ok((name, root))
}

pub fn write_root(name: &str, root: &NbtCompound) -> Result<Vec<u8>, NbtError> {
    check_strings(name, root)?;
    let mut data = Vec::new();
    write_nbt(&mut data, Some(name), root, Flavor::Uncompressed)?;
    Ok(data)
}

/// Reads a gzip-compressed tree such as `level.dat`.
pub fn read_gzip_file(path: &Path) -> Result<(String, NbtCompound), NbtError> {
    let mut reader = BufReader::new(File::open(path)?);
    let (root, name) = read_nbt(&mut reader, Flavor::GzCompressed)?;
    Ok((name, root))
}

pub fn write_gzip_file(path: &Path, name: &str, root: &NbtCompound) -> Result<(), NbtError> {
    check_strings(name, root)?;
    let mut writer = BufWriter::new(File::create(path)?);
    write_nbt(&mut writer, Some(name), root, Flavor::GzCompressed)?;
    writer.flush()?;
    Ok(())
}

pub fn byte_array(values: &[u8]) -> NbtTag {
    NbtTag::ByteArray(values.iter().map(|v| *v as i8).collect())
}

/// The named byte array as unsigned bytes, `None` if absent or of another type.
pub fn get_bytes(compound: &NbtCompound, name: &str) -> Option<Vec<u8>> {
    match compound.inner().get(name)? {
        NbtTag::ByteArray(values) => Some(values.iter().map(|v| *v as u8).collect()),
        _ => None,
    }
}

pub fn get_compound<'a>(compound: &'a NbtCompound, name: &str) -> Option<&'a NbtCompound> {
    match compound.inner().get(name)? {
        NbtTag::Compound(inner) => Some(inner),
        _ => None,
    }
}

pub fn get_compound_mut<'a>(
    compound: &'a mut NbtCompound,
    name: &str,
) -> Option<&'a mut NbtCompound> {
    match compound.inner_mut().get_mut(name)? {
        NbtTag::Compound(inner) => Some(inner),
        _ => None,
    }
}

/// Length of `s` in Java's modified UTF-8: NUL takes two bytes and characters
/// outside the BMP are written as two three-byte surrogates.
pub fn encoded_len(s: &str) -> usize {
    s.chars()
        .map(|c| match c as u32 {
            0 => 2,
            0x01..=0x7f => 1,
            0x80..=0x7ff => 2,
            0x800..=0xffff => 3,
            _ => 6,
        })
        .sum()
}

fn check_str(s: &str) -> Result<(), NbtError> {
    match encoded_len(s) {
        len if len > MAX_STRING_BYTES => Err(NbtError::StringTooLong(len)),
        _ => Ok(()),
    }
}

fn check_strings(name: &str, root: &NbtCompound) -> Result<(), NbtError> {
    check_str(name)?;
    check_compound(root)
}

fn check_compound(compound: &NbtCompound) -> Result<(), NbtError> {
    for (name, tag) in compound.inner() {
        check_str(name)?;
        check_tag(tag)?;
    }
    Ok(())
}

fn check_tag(tag: &NbtTag) -> Result<(), NbtError> {
    match tag {
        NbtTag::String(s) => check_str(s),
        NbtTag::Compound(compound) => check_compound(compound),
        NbtTag::List(list) => list.iter().try_for_each(check_tag),
        _ => Ok(()),
    }
}
