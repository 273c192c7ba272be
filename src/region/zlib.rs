use std::io::{self, Read, Write};

use flate2::{
    read::{GzDecoder, ZlibDecoder},
    write::ZlibEncoder,
    Compression,
};

pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 4), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out_vec = Vec::with_capacity(data.len() * 4);
    ZlibDecoder::new(data).read_to_end(&mut out_vec)?;
    Ok(out_vec)
}

pub fn gunzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out_vec = Vec::with_capacity(data.len() * 4);
    GzDecoder::new(data).read_to_end(&mut out_vec)?;
    Ok(out_vec)
}
