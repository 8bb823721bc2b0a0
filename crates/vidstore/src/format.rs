//! On-disk formats, parsed with nom
//!
//! Segment file (`<id>.vseg`):
//! ```text
//! VSEG001\n
//! [4 bytes: version u32]
//! [8 bytes: stamp u64]
//! [8 bytes: range start u64]
//! [8 bytes: range end u64]
//! [4 bytes: resource length u32]
//! [resource bytes, UTF-8]
//! [8 bytes: payload length u64]
//! [payload]
//! ```
//!
//! Recency index (`access.vidx`):
//! ```text
//! VIDX0001
//! [4 bytes: count u32]
//! [count x (file id u64, stamp u64)]
//! ```
//!
//! All integers are little-endian.

use nom::{
    bytes::complete::tag,
    combinator::verify,
    multi::{length_count, length_data},
    number::complete::{le_u32, le_u64},
    sequence::{preceded, tuple},
    IResult,
};

use crate::error::{Error, Result};
use crate::key::{ByteRange, CacheKey};

/// Magic header for segment files
pub const SEGMENT_MAGIC: &[u8] = b"VSEG001\n";

/// Magic header for the recency index
pub const INDEX_MAGIC: &[u8] = b"VIDX0001";

/// Current segment format version
pub const FORMAT_VERSION: u32 = 1;

/// Longest resource identifier a segment file may carry
pub const MAX_RESOURCE_LEN: usize = 4096;

/// Upper bound on an encoded segment header
pub const MAX_HEADER_LEN: usize = SEGMENT_MAGIC.len() + 4 + 8 * 3 + 4 + MAX_RESOURCE_LEN + 8;

/// Decoded segment header
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentHeader {
    /// Format version
    pub version: u32,
    /// Access tick when the segment was written
    pub stamp: u64,
    /// Key the payload belongs to
    pub key: CacheKey,
    /// Payload length following the header
    pub payload_len: u64,
}

struct RawHeader<'a> {
    version: u32,
    stamp: u64,
    start: u64,
    end: u64,
    resource: &'a [u8],
    payload_len: u64,
}

fn raw_header(input: &[u8]) -> IResult<&[u8], RawHeader<'_>> {
    let (input, _) = tag(SEGMENT_MAGIC)(input)?;
    let (input, (version, stamp, start, end)) = tuple((le_u32, le_u64, le_u64, le_u64))(input)?;
    let (input, resource) = length_data(verify(le_u32, |len: &u32| {
        *len as usize <= MAX_RESOURCE_LEN
    }))(input)?;
    let (input, payload_len) = le_u64(input)?;

    Ok((
        input,
        RawHeader {
            version,
            stamp,
            start,
            end,
            resource,
            payload_len,
        },
    ))
}

/// Parse a segment header
///
/// Returns the header and the number of bytes it occupies.
pub fn parse_segment_header(input: &[u8]) -> Result<(SegmentHeader, usize)> {
    let (rest, raw) = raw_header(input)?;

    if raw.version != FORMAT_VERSION {
        return Err(Error::Parse(format!(
            "Unsupported segment version {}",
            raw.version
        )));
    }

    let resource = std::str::from_utf8(raw.resource)
        .map_err(|e| Error::Parse(format!("Resource is not UTF-8: {}", e)))?;
    let range = ByteRange::new(raw.start, raw.end)?;

    let header = SegmentHeader {
        version: raw.version,
        stamp: raw.stamp,
        key: CacheKey::new(resource, range),
        payload_len: raw.payload_len,
    };
    Ok((header, input.len() - rest.len()))
}

/// Encode a segment header for `key`
pub fn encode_segment_header(key: &CacheKey, stamp: u64, payload_len: u64) -> Result<Vec<u8>> {
    let resource = key.resource().as_bytes();
    if resource.len() > MAX_RESOURCE_LEN {
        return Err(Error::Parse(format!(
            "Resource identifier too long: {} bytes (max {})",
            resource.len(),
            MAX_RESOURCE_LEN
        )));
    }

    let mut header = Vec::with_capacity(MAX_HEADER_LEN.min(64 + resource.len()));
    header.extend_from_slice(SEGMENT_MAGIC);
    header.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    header.extend_from_slice(&stamp.to_le_bytes());
    header.extend_from_slice(&key.range().start().to_le_bytes());
    header.extend_from_slice(&key.range().end().to_le_bytes());
    header.extend_from_slice(&(resource.len() as u32).to_le_bytes());
    header.extend_from_slice(resource);
    header.extend_from_slice(&payload_len.to_le_bytes());
    Ok(header)
}

fn index(input: &[u8]) -> IResult<&[u8], Vec<(u64, u64)>> {
    preceded(tag(INDEX_MAGIC), length_count(le_u32, tuple((le_u64, le_u64))))(input)
}

/// Parse the recency index into `(file id, stamp)` pairs
pub fn parse_index(input: &[u8]) -> Result<Vec<(u64, u64)>> {
    let (_, stamps) = index(input)?;
    Ok(stamps)
}

/// Encode `(file id, stamp)` pairs as a recency index
pub fn encode_index(stamps: &[(u64, u64)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(INDEX_MAGIC.len() + 4 + stamps.len() * 16);
    out.extend_from_slice(INDEX_MAGIC);
    out.extend_from_slice(&(stamps.len() as u32).to_le_bytes());
    for (id, stamp) in stamps {
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&stamp.to_le_bytes());
    }
    out
}
