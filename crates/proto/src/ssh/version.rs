//! SSH identification exchange (RFC 4253 Section 4.2).
//!
//! Both sides send one identification line before any binary packet:
//!
//! ```text
//! SSH-2.0-softwareversion SP comments CR LF
//! ```
//!
//! A server may send other text lines first. The client skips them until a
//! line starting with `SSH-` arrives. Only protocol version 2.0 is accepted.
//!
//! # Security
//!
//! - Maximum line length: 255 bytes including CR LF
//! - No null bytes allowed in the identification line
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::version::Version;
//!
//! let version = Version::new("kestrel_0.1", None);
//! assert_eq!(version.to_string(), "SSH-2.0-kestrel_0.1");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9 Ubuntu").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! assert_eq!(parsed.comments(), Some("Ubuntu"));
//! ```

use kestrel_platform::{KestrelError, KestrelResult, Logger};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum length of one identification-phase line, CR LF included.
pub const MAX_LINE_LENGTH: usize = 255;

/// Prefix every acceptable identification line starts with.
pub const IDENT_PREFIX: &str = "SSH-2.0-";

/// SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Creates an SSH-2.0 identification.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Parses an identification line, with or without the trailing CR LF.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Protocol`] if the line is too long, contains
    /// a null byte, or is not an SSH-2.0 identification.
    pub fn parse(line: &str) -> KestrelResult<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.len() + 2 > MAX_LINE_LENGTH {
            return Err(KestrelError::Protocol(format!(
                "Identification line too long: {} bytes (max {})",
                line.len() + 2,
                MAX_LINE_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(KestrelError::Protocol(
                "Identification line contains null byte".to_string(),
            ));
        }

        let rest = match line.strip_prefix(IDENT_PREFIX) {
            Some(rest) => rest,
            None if line.starts_with("SSH-") => {
                return Err(KestrelError::Protocol(format!(
                    "Unsupported protocol version: '{}'",
                    line
                )))
            }
            None => {
                return Err(KestrelError::Protocol(format!(
                    "Not an identification line: '{}'",
                    line
                )))
            }
        };

        let (software, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software, Some(comments.trim())),
            None => (rest, None),
        };

        if software.is_empty() {
            return Err(KestrelError::Protocol(
                "Identification line has no software version".to_string(),
            ));
        }

        Ok(Self::new(software, comments))
    }

    /// Returns the software version (e.g., "OpenSSH_8.9").
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> String {
        format!("{}\r\n", self)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", IDENT_PREFIX, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Reads one line of at most [`MAX_LINE_LENGTH`] bytes, without its line ending.
async fn read_line<R>(reader: &mut R) -> KestrelResult<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(64);
    let read = (&mut *reader)
        .take(MAX_LINE_LENGTH as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;

    if read == 0 {
        return Err(KestrelError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed during identification exchange",
        )));
    }

    if buf.last() != Some(&b'\n') {
        if buf.len() > MAX_LINE_LENGTH {
            return Err(KestrelError::Protocol(
                "Identification line too long".to_string(),
            ));
        }
        return Err(KestrelError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed inside identification line",
        )));
    }

    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Sends `local` and waits for the peer's SSH-2.0 identification line.
///
/// Returns the peer's line without CR LF, exactly as it enters the
/// exchange hash.
pub async fn exchange<R, W>(
    reader: &mut R,
    writer: &mut W,
    local: &Version,
    logger: &dyn Logger,
) -> KestrelResult<String>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(local.to_wire_format().as_bytes()).await?;
    writer.flush().await?;
    logger.debug(format_args!("sent identification {}", local));

    loop {
        let line = read_line(reader).await?;
        if line.starts_with("SSH-") {
            Version::parse(&line)?;
            logger.info(format_args!("peer identification {}", line));
            return Ok(line);
        }
        logger.debug(format_args!("skipping pre-identification line: {}", line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_platform::NullLogger;
    use tokio::io::BufReader;

    #[test]
    fn test_version_display() {
        let version = Version::new("kestrel_0.1", Some("test build"));
        assert_eq!(version.to_string(), "SSH-2.0-kestrel_0.1 test build");
        assert_eq!(version.to_wire_format(), "SSH-2.0-kestrel_0.1 test build\r\n");
    }

    #[test]
    fn test_parse_rejects_other_versions() {
        assert!(matches!(
            Version::parse("SSH-1.5-OldServer"),
            Err(KestrelError::Protocol(_))
        ));
        assert!(Version::parse("SSH-1.99-Compat").is_err());
        assert!(Version::parse("HTTP/1.1 200 OK").is_err());
    }

    #[test]
    fn test_parse_too_long() {
        let long = format!("SSH-2.0-{}", "x".repeat(300));
        assert!(matches!(
            Version::parse(&long),
            Err(KestrelError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_null_byte() {
        assert!(Version::parse("SSH-2.0-Bad\0Server").is_err());
    }

    #[tokio::test]
    async fn test_exchange_skips_banner_lines() {
        let input = b"Welcome to the server\r\nSSH-2.0-OpenSSH_x\r\nrest".to_vec();
        let mut reader = BufReader::new(&input[..]);
        let mut sent = Vec::new();

        let peer = exchange(
            &mut reader,
            &mut sent,
            &Version::new("kestrel_0.1", None),
            &NullLogger,
        )
        .await
        .unwrap();

        assert_eq!(peer, "SSH-2.0-OpenSSH_x");
        assert_eq!(sent, b"SSH-2.0-kestrel_0.1\r\n");

        // Bytes after the identification line stay buffered
        let mut rest = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut rest)
            .await
            .unwrap();
        assert_eq!(rest, "rest");
    }

    #[tokio::test]
    async fn test_exchange_unsupported_version() {
        let input = b"SSH-1.5-Legacy\r\n".to_vec();
        let mut reader = BufReader::new(&input[..]);
        let mut sent = Vec::new();

        let result = exchange(
            &mut reader,
            &mut sent,
            &Version::new("kestrel_0.1", None),
            &NullLogger,
        )
        .await;
        assert!(matches!(result, Err(KestrelError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_exchange_line_too_long() {
        let mut input = vec![b'a'; 400];
        input.extend_from_slice(b"\r\nSSH-2.0-OpenSSH_x\r\n");
        let mut reader = BufReader::new(&input[..]);
        let mut sent = Vec::new();

        let result = exchange(
            &mut reader,
            &mut sent,
            &Version::new("kestrel_0.1", None),
            &NullLogger,
        )
        .await;
        match result {
            Err(KestrelError::Protocol(msg)) => assert!(msg.contains("too long")),
            other => panic!("expected line too long, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exchange_eof() {
        let input = b"SSH-2.0-trunc".to_vec();
        let mut reader = BufReader::new(&input[..]);
        let mut sent = Vec::new();

        let result = exchange(
            &mut reader,
            &mut sent,
            &Version::new("kestrel_0.1", None),
            &NullLogger,
        )
        .await;
        assert!(matches!(result, Err(KestrelError::Io(_))));
    }
}
