//! CRLF line framing
//!
//! One algorithm for every line source: the SMTP and POP3 sessions read from
//! a [`Transport`](crate::transport::Transport), the relay streams from a
//! cache file. Lines are split exactly at CRLF regardless of how the source
//! chunks its bytes, and a line that reaches [`MAX_LINE_LENGTH`] before its
//! terminator is a framing error that ends the connection.

use crate::error::{MailError, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum accumulated line length, terminator included
pub const MAX_LINE_LENGTH: usize = 4096;

/// Read one CRLF-terminated line from `source`.
///
/// Returns `Ok(None)` on a clean EOF at a line boundary. An EOF in the
/// middle of a line yields the unterminated tail, which lets file streaming
/// forward a final line that was written without a terminator.
pub async fn read_line<R>(source: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        let n = source.read(&mut byte).await?;
        if n == 0 {
            if line.is_empty() {
                return Ok(None);
            }
            return Ok(Some(line));
        }
        line.push(byte[0]);
        if line.len() >= MAX_LINE_LENGTH {
            return Err(MailError::LineTooLong);
        }
        if line.len() >= 2 && line[line.len() - 2] == b'\r' && line[line.len() - 1] == b'\n' {
            return Ok(Some(line));
        }
    }
}
