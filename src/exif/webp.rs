//! RIFF-level EXIF embedding for WebP.
//!
//! A simple (lossy `VP8 ` or lossless `VP8L`) WebP has no place for metadata.
//! Before attaching an `EXIF` chunk the file is upgraded to the extended
//! layout: a `VP8X` header carrying the canvas size and feature flags goes
//! first, the bitstream chunks follow unchanged.

use crate::error::{ExportError, Result};

const FLAG_EXIF: u8 = 0x08;
const FLAG_ALPHA: u8 = 0x10;

const VP8_START_CODE: [u8; 3] = [0x9d, 0x01, 0x2a];
const VP8L_SIGNATURE: u8 = 0x2f;

struct Chunk<'a> {
    fourcc: [u8; 4],
    data: &'a [u8],
}

fn malformed(msg: &str) -> ExportError {
    ExportError::MetadataWrite(format!("Malformed WebP: {msg}"))
}

fn parse_chunks(bytes: &[u8]) -> Result<Vec<Chunk<'_>>> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WEBP" {
        return Err(malformed("missing RIFF/WEBP header"));
    }

    let mut chunks = Vec::new();
    let mut offset = 12;
    while offset + 8 <= bytes.len() {
        let fourcc = [
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ];
        let size = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]) as usize;
        let start = offset + 8;
        let end = start
            .checked_add(size)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| malformed("chunk extends past end of file"))?;
        chunks.push(Chunk {
            fourcc,
            data: &bytes[start..end],
        });
        // chunks are padded to even length
        offset = end + (size & 1);
    }

    if chunks.is_empty() {
        return Err(malformed("no chunks"));
    }
    Ok(chunks)
}

/// Canvas size and alpha presence read from a simple-format bitstream.
fn bitstream_info(chunks: &[Chunk<'_>]) -> Result<(u32, u32, bool)> {
    let has_alph = chunks.iter().any(|c| &c.fourcc == b"ALPH");

    for chunk in chunks {
        match &chunk.fourcc {
            b"VP8 " => {
                let d = chunk.data;
                if d.len() < 10 || d[3..6] != VP8_START_CODE {
                    return Err(malformed("bad VP8 frame header"));
                }
                let width = u16::from_le_bytes([d[6], d[7]]) as u32 & 0x3fff;
                let height = u16::from_le_bytes([d[8], d[9]]) as u32 & 0x3fff;
                return Ok((width, height, has_alph));
            }
            b"VP8L" => {
                let d = chunk.data;
                if d.len() < 5 || d[0] != VP8L_SIGNATURE {
                    return Err(malformed("bad VP8L header"));
                }
                let bits = u32::from_le_bytes([d[1], d[2], d[3], d[4]]);
                let width = (bits & 0x3fff) + 1;
                let height = ((bits >> 14) & 0x3fff) + 1;
                let alpha = (bits >> 28) & 1 == 1;
                return Ok((width, height, alpha || has_alph));
            }
            _ => {}
        }
    }

    Err(malformed("no VP8/VP8L bitstream"))
}

fn vp8x_payload(width: u32, height: u32, alpha: bool) -> Vec<u8> {
    let mut payload = vec![0u8; 10];
    if alpha {
        payload[0] |= FLAG_ALPHA;
    }
    payload[4..7].copy_from_slice(&(width - 1).to_le_bytes()[..3]);
    payload[7..10].copy_from_slice(&(height - 1).to_le_bytes()[..3]);
    payload
}

fn push_chunk(out: &mut Vec<u8>, fourcc: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(fourcc);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    if data.len() % 2 == 1 {
        out.push(0);
    }
}

/// Whether the file already uses the extended (`VP8X`) layout.
pub fn is_extended(bytes: &[u8]) -> bool {
    parse_chunks(bytes)
        .map(|chunks| &chunks[0].fourcc == b"VP8X")
        .unwrap_or(false)
}

/// The TIFF payload of the `EXIF` chunk, if any.
pub fn exif_payload(bytes: &[u8]) -> Option<Vec<u8>> {
    let chunks = parse_chunks(bytes).ok()?;
    chunks
        .iter()
        .find(|c| &c.fourcc == b"EXIF")
        .map(|c| c.data.to_vec())
}

/// Return a copy of `bytes` with `tiff` as its only `EXIF` chunk.
///
/// Simple-format files are upgraded to `VP8X` first. The EXIF flag is set in
/// the header and the chunk goes after the image data, ahead of any `XMP `.
pub fn embed_exif(bytes: &[u8], tiff: &[u8]) -> Result<Vec<u8>> {
    let chunks = parse_chunks(bytes)?;

    let mut header = if &chunks[0].fourcc == b"VP8X" {
        if chunks[0].data.len() < 10 {
            return Err(malformed("short VP8X chunk"));
        }
        chunks[0].data.to_vec()
    } else {
        let (width, height, alpha) = bitstream_info(&chunks)?;
        log::debug!("Upgrading simple WebP ({width}x{height}) to VP8X");
        vp8x_payload(width, height, alpha)
    };
    header[0] |= FLAG_EXIF;

    let mut body = Vec::with_capacity(bytes.len() + tiff.len() + 32);
    body.extend_from_slice(b"WEBP");
    push_chunk(&mut body, b"VP8X", &header);

    let mut exif_written = false;
    for chunk in &chunks {
        match &chunk.fourcc {
            b"VP8X" | b"EXIF" => continue,
            b"XMP " if !exif_written => {
                push_chunk(&mut body, b"EXIF", tiff);
                exif_written = true;
            }
            _ => {}
        }
        push_chunk(&mut body, &chunk.fourcc, chunk.data);
    }
    if !exif_written {
        push_chunk(&mut body, b"EXIF", tiff);
    }

    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}
