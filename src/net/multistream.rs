//! Line-oriented protocol selection.
//!
//! Every message is one UTF-8 protocol id terminated by `\n`, prefixed with a
//! varint of the whole line length including the terminator. Both sides open
//! by announcing the selector id itself; the dialer then names the protocol it
//! wants and the acceptor echoes it back (or answers `na` and keeps listening).

use super::stream::Stream;
use super::NetError;
use crate::wire::put_uvarint;

pub const MULTISTREAM_ID: &str = "/multistream/1.0.0";
pub const PROTOCOL_NA: &str = "na";

/// Longest acceptable protocol id line.
const MAX_LINE_LEN: usize = 1024;

/// Write one varint-framed protocol line.
pub async fn write_line(stream: &mut Stream, line: &str) -> Result<(), NetError> {
    let mut buf = Vec::with_capacity(line.len() + 3);
    put_uvarint(&mut buf, (line.len() + 1) as u64);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    stream.write(&buf).await
}

/// Read one varint-framed protocol line, without the terminator.
pub async fn read_line(stream: &mut Stream) -> Result<String, NetError> {
    let len = stream.read_uvarint().await? as usize;
    if len == 0 || len > MAX_LINE_LEN {
        return Err(NetError::Protocol(format!("bad selector line length {len}")));
    }
    let mut raw = stream.read_exact(len).await?;
    if raw.last() == Some(&b'\n') {
        raw.pop();
    }
    String::from_utf8(raw).map_err(|_| NetError::Protocol("selector line is not utf-8".into()))
}

/// Exchange selector ids; both sides send theirs first, so the exchange
/// cannot deadlock.
async fn exchange_header(stream: &mut Stream) -> Result<(), NetError> {
    write_line(stream, MULTISTREAM_ID).await?;
    let remote = read_line(stream).await?;
    if remote != MULTISTREAM_ID {
        return Err(NetError::Protocol(format!("unexpected selector id {remote:?}")));
    }
    Ok(())
}

/// Dialer side: request `protocol`, succeed once the acceptor echoes it.
pub async fn dial(stream: &mut Stream, protocol: &str) -> Result<(), NetError> {
    exchange_header(stream).await?;
    write_line(stream, protocol).await?;
    let echo = read_line(stream).await?;
    if echo == protocol {
        Ok(())
    } else if echo == PROTOCOL_NA {
        Err(NetError::Protocol(format!("remote does not speak {protocol}")))
    } else {
        Err(NetError::Protocol(format!("expected echo of {protocol}, got {echo:?}")))
    }
}

/// Acceptor side: answer candidates until one we support arrives.
pub async fn accept(stream: &mut Stream, supported: &[&str]) -> Result<String, NetError> {
    exchange_header(stream).await?;
    loop {
        let candidate = read_line(stream).await?;
        if supported.contains(&candidate.as_str()) {
            write_line(stream, &candidate).await?;
            return Ok(candidate);
        }
        write_line(stream, PROTOCOL_NA).await?;
    }
}
