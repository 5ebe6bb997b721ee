//! Line-oriented reads: command lines and the DATA body.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::time::timeout;

use crate::error::ListenerError;

/// Longest accepted command line, terminator included (RFC 5321 §4.5.3.1.4).
pub const MAX_COMMAND_LINE: usize = 512;

/// Per-read chunk while receiving DATA.
const DATA_CHUNK: u64 = 8 * 1024;

/// Result of reading a DATA body up to the terminating `.` line.
#[derive(Debug, PartialEq, Eq)]
pub enum DataBody {
    /// Dot-unstuffed message bytes, terminator excluded.
    Complete(Vec<u8>),
    /// The body exceeded the size cap; it was drained and discarded.
    TooLarge,
}

/// Read one command line.
///
/// Returns `Ok(None)` when the peer closed the connection between commands.
/// Lines longer than [`MAX_COMMAND_LINE`] are a protocol violation.
pub async fn read_command_line<R>(
    reader: &mut R,
    idle: Duration,
) -> Result<Option<String>, ListenerError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(128);
    let mut limited = (&mut *reader).take(MAX_COMMAND_LINE as u64);
    let read = limited.read_until(b'\n', &mut line);
    let n = timeout(idle, read)
        .await
        .map_err(|_| ListenerError::Timeout(idle))??;

    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with(b"\n") {
        if n >= MAX_COMMAND_LINE {
            return Err(ListenerError::ProtocolViolation(format!(
                "command line exceeds {MAX_COMMAND_LINE} bytes"
            )));
        }
        // Peer closed mid-line.
        return Ok(None);
    }

    let text = String::from_utf8_lossy(&line);
    Ok(Some(text.trim_end_matches(['\r', '\n']).to_string()))
}

/// Read a DATA body until the `.` terminator line.
///
/// Leading dots are unstuffed. Once the accumulated body would exceed
/// `max_bytes` the rest is drained and dropped so the connection stays in
/// sync. A peer disconnect before the terminator is a transport error and
/// nothing read so far is returned.
pub async fn read_data<R>(
    reader: &mut R,
    max_bytes: usize,
    idle: Duration,
) -> Result<DataBody, ListenerError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    let mut chunk = Vec::with_capacity(DATA_CHUNK as usize);
    let mut at_line_start = true;
    let mut oversized = false;

    loop {
        chunk.clear();
        let mut limited = (&mut *reader).take(DATA_CHUNK);
        let read = limited.read_until(b'\n', &mut chunk);
        let n = timeout(idle, read)
            .await
            .map_err(|_| ListenerError::Timeout(idle))??;
        if n == 0 {
            return Err(ListenerError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during DATA",
            )));
        }

        let line_complete = chunk.ends_with(b"\n");
        if at_line_start && (chunk.as_slice() == b".\r\n" || chunk.as_slice() == b".\n") {
            break;
        }

        let mut piece = chunk.as_slice();
        if at_line_start && piece.first() == Some(&b'.') {
            piece = &piece[1..];
        }

        if !oversized {
            if body.len() + piece.len() > max_bytes {
                oversized = true;
                body = Vec::new();
            } else {
                body.extend_from_slice(piece);
            }
        }
        at_line_start = line_complete;
    }

    if oversized {
        Ok(DataBody::TooLarge)
    } else {
        Ok(DataBody::Complete(body))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::BufReader;

    use super::*;

    const IDLE: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn reads_command_lines() {
        let mut reader = BufReader::new(&b"EHLO a\r\nNOOP\n"[..]);
        assert_eq!(
            read_command_line(&mut reader, IDLE).await.unwrap().as_deref(),
            Some("EHLO a")
        );
        assert_eq!(
            read_command_line(&mut reader, IDLE).await.unwrap().as_deref(),
            Some("NOOP")
        );
        assert_eq!(read_command_line(&mut reader, IDLE).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_overlong_command_line() {
        let long = format!("NOOP {}\r\n", "x".repeat(MAX_COMMAND_LINE));
        let mut reader = BufReader::new(long.as_bytes());
        let err = read_command_line(&mut reader, IDLE).await.unwrap_err();
        assert!(matches!(err, ListenerError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn partial_command_then_eof_is_a_disconnect() {
        let mut reader = BufReader::new(&b"MAIL FR"[..]);
        assert_eq!(read_command_line(&mut reader, IDLE).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reads_body_until_terminator() {
        let input = b"Subject: hi\r\n\r\nbody\r\n.\r\nQUIT\r\n";
        let mut reader = BufReader::new(&input[..]);
        let body = read_data(&mut reader, 1024, IDLE).await.unwrap();
        assert_eq!(body, DataBody::Complete(b"Subject: hi\r\n\r\nbody\r\n".to_vec()));

        // The reader is positioned after the terminator.
        assert_eq!(
            read_command_line(&mut reader, IDLE).await.unwrap().as_deref(),
            Some("QUIT")
        );
    }

    #[tokio::test]
    async fn unstuffs_leading_dots() {
        let input = b"Subject: dots\r\n\r\n..hidden\r\n.. \r\n.\r\n";
        let mut reader = BufReader::new(&input[..]);
        let body = read_data(&mut reader, 1024, IDLE).await.unwrap();
        assert_eq!(
            body,
            DataBody::Complete(b"Subject: dots\r\n\r\n.hidden\r\n. \r\n".to_vec())
        );
    }

    #[tokio::test]
    async fn accepts_bare_lf_terminator() {
        let mut reader = BufReader::new(&b"Subject: x\n\nbody\n.\n"[..]);
        let body = read_data(&mut reader, 1024, IDLE).await.unwrap();
        assert_eq!(body, DataBody::Complete(b"Subject: x\n\nbody\n".to_vec()));
    }

    #[tokio::test]
    async fn oversized_body_is_drained() {
        let mut input = Vec::new();
        for _ in 0..100 {
            input.extend_from_slice(b"0123456789012345678901234567890123456789\r\n");
        }
        input.extend_from_slice(b".\r\nNOOP\r\n");
        let mut reader = BufReader::new(input.as_slice());

        let body = read_data(&mut reader, 256, IDLE).await.unwrap();
        assert_eq!(body, DataBody::TooLarge);
        assert_eq!(
            read_command_line(&mut reader, IDLE).await.unwrap().as_deref(),
            Some("NOOP")
        );
    }

    #[tokio::test]
    async fn disconnect_mid_body_is_an_error() {
        let mut reader = BufReader::new(&b"Subject: cut\r\n\r\nhalf a bo"[..]);
        let err = read_data(&mut reader, 1024, IDLE).await.unwrap_err();
        assert!(matches!(err, ListenerError::Transport(_)));
    }

    #[tokio::test]
    async fn dot_inside_a_line_is_not_a_terminator() {
        let mut reader = BufReader::new(&b"a.\r\n.\r\n"[..]);
        let body = read_data(&mut reader, 1024, IDLE).await.unwrap();
        assert_eq!(body, DataBody::Complete(b"a.\r\n".to_vec()));
    }
}
