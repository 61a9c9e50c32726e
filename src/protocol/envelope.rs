use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::DecodeError;
use crate::protocol::Headers;

/// Upper bound for a header block, in both framings.
pub const MAX_HEADER_SIZE: usize = 128 * 1024;

/// Reads a 32-bit big-endian length prefix and the header block it frames.
///
/// Nothing past the prefix is consumed when the declared length is too large.
pub async fn read_envelope<R>(reader: &mut R) -> Result<Option<Headers>, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    if !read_or_eof(reader, &mut prefix).await? {
        return Ok(None);
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_HEADER_SIZE {
        return Err(DecodeError::HeaderTooLarge(len));
    }

    let mut block = vec![0u8; len];
    if !read_or_eof(reader, &mut block).await? {
        return Ok(None);
    }

    parse_header_block(&block).map(Some)
}

/// Returns `false` when the stream ended before `buf` was filled.
async fn read_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> Result<bool, DecodeError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Parses `(name NUL value NUL)*`.
///
/// Names must be non-empty; values may be empty. A later duplicate name
/// replaces an earlier one.
pub fn parse_header_block(block: &[u8]) -> Result<Headers, DecodeError> {
    let mut headers = Headers::new();
    if block.is_empty() {
        return Ok(headers);
    }
    if block.last() != Some(&0) {
        return Err(DecodeError::Malformed("header block is not NUL terminated"));
    }

    let mut fields = block[..block.len() - 1].split(|&b| b == 0);
    while let Some(name) = fields.next() {
        let value = fields
            .next()
            .ok_or(DecodeError::Malformed("header name without a value"))?;
        if name.is_empty() {
            return Err(DecodeError::Malformed("empty header name"));
        }
        headers.insert(
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        );
    }

    Ok(headers)
}

pub fn encode_header_block<'a, I>(pairs: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut block = Vec::new();
    for (name, value) in pairs {
        block.extend_from_slice(name.as_bytes());
        block.push(0);
        block.extend_from_slice(value.as_bytes());
        block.push(0);
    }
    block
}

/// Length prefix plus header block, ready to be followed by a body.
pub fn encode_envelope<'a, I>(pairs: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let block = encode_header_block(pairs);
    let mut frame = Vec::with_capacity(block.len() + 4);
    frame.extend_from_slice(&(block.len() as u32).to_be_bytes());
    frame.extend_from_slice(&block);
    frame
}
