use std::io::{self, Read, Write};

/// Frames are a 4-byte little-endian length prefix followed by that many
/// bytes of bincode-encoded [`quickdist_proto::Message`]. Mirrors the
/// length-prefixed framing the channel implementation this was grounded on
/// uses, without that implementation's optional stream encryption -- every
/// link here is assumed to run on a trusted network.
const MAX_FRAME_LEN: u32 = 1 << 30;

pub fn send_frame<W: Write>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(payload)?;
    w.flush()
}

/// Reads one frame, or `Ok(None)` if the peer closed the connection cleanly
/// before sending any bytes of the next frame.
pub fn recv_frame<R: Read>(r: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match read_exact_or_eof(r, &mut len_buf)? {
        false => return Ok(None),
        true => {}
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(Some(buf))
}

/// Like `read_exact`, but returns `Ok(false)` instead of erroring when the
/// peer closes the connection before any byte of this read arrives.
fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        match r.read(&mut buf[read..]) {
            Ok(0) if read == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                ))
            }
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_frame() {
        let mut buf = Vec::new();
        send_frame(&mut buf, b"hello").unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let frame = recv_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(frame, b"hello");
    }

    #[test]
    fn empty_stream_is_clean_eof() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(recv_frame(&mut cursor).unwrap().is_none());
    }
}
