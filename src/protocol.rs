//! Length-prefixed, big-endian framing shared by the client and the server.
//!
//! A string travels as a `u32` length that counts a trailing NUL byte,
//! followed by the bytes and the NUL itself. A [`Command`] is its kind,
//! its flags (kind, presence marker, optional value) and its file list.
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single string on the wire, terminator included.
pub const MAX_STRING_LEN: u32 = 64 * 1024;
/// Upper bound for a `Query` reply, which grows with a job's history.
pub const MAX_REPLY_LEN: u32 = 16 * 1024 * 1024;
pub const MAX_FLAGS: u32 = 64;
pub const MAX_FILES: u32 = 4096;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error("Unknown command kind {0}")]
    UnknownCommand(u32),

    #[error("Unknown flag kind {0}")]
    UnknownFlag(u32),

    #[error("String of {0} bytes exceeds limit of {1}")]
    StringTooLong(u32, u32),

    #[error("{what} count {count} exceeds limit of {max}")]
    TooMany { what: &'static str, count: u32, max: u32 },

    #[error("String is missing its terminator")]
    MissingTerminator,

    #[error("String contains an interior NUL byte")]
    InteriorNul,

    #[error("String is not valid utf8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Execute,
    Query,
    EnforceMemory,
}

impl From<CommandKind> for u32 {
    fn from(kind: CommandKind) -> Self {
        match kind {
            CommandKind::Execute => 0,
            CommandKind::Query => 1,
            CommandKind::EnforceMemory => 2,
        }
    }
}

impl TryFrom<u32> for CommandKind {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CommandKind::Execute),
            1 => Ok(CommandKind::Query),
            2 => Ok(CommandKind::EnforceMemory),
            x => Err(Error::UnknownCommand(x)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagKind {
    Output,
    Log,
    Timeout,
    Mem,
    MemKill,
}

impl From<FlagKind> for u32 {
    fn from(kind: FlagKind) -> Self {
        match kind {
            FlagKind::Output => 0,
            FlagKind::Log => 1,
            FlagKind::Timeout => 2,
            FlagKind::Mem => 3,
            FlagKind::MemKill => 4,
        }
    }
}

impl TryFrom<u32> for FlagKind {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FlagKind::Output),
            1 => Ok(FlagKind::Log),
            2 => Ok(FlagKind::Timeout),
            3 => Ok(FlagKind::Mem),
            4 => Ok(FlagKind::MemKill),
            x => Err(Error::UnknownFlag(x)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flag {
    pub kind: FlagKind,
    pub value: Option<String>,
}

impl Flag {
    pub fn new(kind: FlagKind, value: Option<String>) -> Self {
        Self { kind, value }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub flags: Vec<Flag>,
    pub files: Vec<String>,
}

impl Command {
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), Error> {
        writer.write_u32(self.kind.into()).await?;

        writer.write_u32(count(self.flags.len(), "flag", MAX_FLAGS)?).await?;
        for flag in &self.flags {
            writer.write_u32(flag.kind.into()).await?;
            match &flag.value {
                Some(value) => {
                    writer.write_u16(1).await?;
                    write_str(writer, value).await?;
                }
                None => writer.write_u16(0).await?,
            }
        }

        writer.write_u32(count(self.files.len(), "file", MAX_FILES)?).await?;
        for file in &self.files {
            write_str(writer, file).await?;
        }

        writer.flush().await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, Error> {
        let kind = CommandKind::try_from(reader.read_u32().await?)?;

        let flag_count = bounded(reader.read_u32().await?, "flag", MAX_FLAGS)?;
        let mut flags = Vec::with_capacity(flag_count);
        for _ in 0..flag_count {
            let kind = FlagKind::try_from(reader.read_u32().await?)?;
            let value = match reader.read_u16().await? {
                0 => None,
                _ => Some(read_str(reader).await?),
            };
            flags.push(Flag { kind, value });
        }

        let file_count = bounded(reader.read_u32().await?, "file", MAX_FILES)?;
        let mut files = Vec::with_capacity(file_count);
        for _ in 0..file_count {
            files.push(read_str(reader).await?);
        }

        Ok(Self { kind, flags, files })
    }
}

pub async fn write_str<W: AsyncWrite + Unpin>(writer: &mut W, value: &str) -> Result<(), Error> {
    write_bounded(writer, value, MAX_STRING_LEN).await
}

pub async fn read_str<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, Error> {
    read_bounded(reader, MAX_STRING_LEN).await
}

/// Sends the answer to a `Query`, framed like any other string.
pub async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, reply: &str) -> Result<(), Error> {
    write_bounded(writer, reply, MAX_REPLY_LEN).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_reply<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, Error> {
    read_bounded(reader, MAX_REPLY_LEN).await
}

/// The newest whole lines of `reply` that fit in a reply frame.
pub fn fit_reply(reply: &str) -> &str {
    newest_lines(reply, MAX_REPLY_LEN)
}

// Keeps a suffix starting on a line boundary, at most `max` bytes once the
// terminator is counted.
fn newest_lines(reply: &str, max: u32) -> &str {
    let budget = max.saturating_sub(1) as usize;
    if reply.len() <= budget {
        return reply;
    }

    let cut = reply.len() - budget;
    match reply.as_bytes()[cut - 1..].iter().position(|&b| b == b'\n') {
        Some(offset) => &reply[cut + offset..],
        None => "",
    }
}

async fn write_bounded<W: AsyncWrite + Unpin>(
    writer: &mut W,
    value: &str,
    max: u32,
) -> Result<(), Error> {
    if value.as_bytes().contains(&0) {
        return Err(Error::InteriorNul);
    }

    let len = u32::try_from(value.len() + 1).map_err(|_| Error::StringTooLong(u32::MAX, max))?;
    if len > max {
        return Err(Error::StringTooLong(len, max));
    }

    writer.write_u32(len).await?;
    writer.write_all(value.as_bytes()).await?;
    writer.write_u8(0).await?;
    Ok(())
}

async fn read_bounded<R: AsyncRead + Unpin>(reader: &mut R, max: u32) -> Result<String, Error> {
    let len = reader.read_u32().await?;
    if len > max {
        return Err(Error::StringTooLong(len, max));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;

    match buf.pop() {
        Some(0) => (),
        _ => return Err(Error::MissingTerminator),
    }
    if buf.contains(&0) {
        return Err(Error::InteriorNul);
    }

    Ok(String::from_utf8(buf)?)
}

fn count(len: usize, what: &'static str, max: u32) -> Result<u32, Error> {
    let count = u32::try_from(len).unwrap_or(u32::MAX);
    bounded(count, what, max)?;
    Ok(count)
}

fn bounded(count: u32, what: &'static str, max: u32) -> Result<usize, Error> {
    if count > max {
        return Err(Error::TooMany { what, count, max });
    }
    Ok(count as usize)
}

#[cfg(test)]
mod tests {
    use super::{
        fit_reply, newest_lines, read_reply, read_str, write_reply, write_str, Command,
        CommandKind, Error, Flag, FlagKind, MAX_STRING_LEN,
    };
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    fn execute_command() -> Command {
        Command {
            kind: CommandKind::Execute,
            flags: vec![
                Flag::new(FlagKind::Output, Some("out.txt".into())),
                Flag::new(FlagKind::Log, Some("log.txt".into())),
                Flag::new(FlagKind::Timeout, Some("3".into())),
            ],
            files: vec!["/bin/sleep".into(), "5".into()],
        }
    }

    #[tokio::test]
    async fn given_command_sent_over_loopback_then_decoded_value_is_equal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sent = execute_command();

        let expected = sent.clone();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            sent.write_to(&mut stream).await.unwrap();
        });

        let (mut stream, _) = listener.accept().await.unwrap();
        let received = Command::read_from(&mut stream).await.unwrap();
        client.await.unwrap();

        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn given_query_without_pid_then_flag_value_stays_absent() {
        let sent = Command {
            kind: CommandKind::Query,
            flags: vec![Flag::new(FlagKind::Mem, None)],
            files: vec![],
        };
        let mut buf = Vec::new();
        sent.write_to(&mut buf).await.unwrap();

        // kind, flag count, flag kind, presence, file count
        assert_eq!(buf.len(), 4 + 4 + 4 + 2 + 4);
        let received = Command::read_from(&mut buf.as_slice()).await.unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn given_string_then_length_counts_terminator() {
        let mut buf = Vec::new();
        write_str(&mut buf, "abc").await.unwrap();
        assert_eq!(buf, vec![0, 0, 0, 4, b'a', b'b', b'c', 0]);
    }

    #[tokio::test]
    async fn given_truncated_message_then_fails_with_io_error() {
        let mut buf = Vec::new();
        execute_command().write_to(&mut buf).await.unwrap();
        buf.truncate(buf.len() - 3);

        let outcome = Command::read_from(&mut buf.as_slice()).await;
        assert!(matches!(outcome, Err(Error::IOError(_))));
    }

    #[tokio::test]
    async fn given_unknown_command_kind_then_rejected() {
        let buf: Vec<u8> = vec![0, 0, 0, 9, 0, 0, 0, 0, 0, 0, 0, 0];
        let outcome = Command::read_from(&mut buf.as_slice()).await;
        assert!(matches!(outcome, Err(Error::UnknownCommand(9))));
    }

    #[tokio::test]
    async fn given_oversized_string_length_then_rejected_before_allocation() {
        let buf: Vec<u8> = vec![0xff, 0xff, 0xff, 0xff];
        let outcome = read_str(&mut buf.as_slice()).await;
        assert!(matches!(outcome, Err(Error::StringTooLong(u32::MAX, _))));
    }

    #[tokio::test]
    async fn given_string_without_terminator_then_rejected() {
        let buf: Vec<u8> = vec![0, 0, 0, 2, b'h', b'i'];
        let outcome = read_str(&mut buf.as_slice()).await;
        assert!(matches!(outcome, Err(Error::MissingTerminator)));
    }

    #[tokio::test]
    async fn given_zero_length_string_then_rejected() {
        let buf: Vec<u8> = vec![0, 0, 0, 0];
        let outcome = read_str(&mut buf.as_slice()).await;
        assert!(matches!(outcome, Err(Error::MissingTerminator)));
    }

    #[tokio::test]
    async fn given_reply_over_duplex_then_reader_sees_same_text() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_reply(&mut a, "1234 4096 /bin/sleep 5 \n").await.unwrap();
        a.shutdown().await.unwrap();
        assert_eq!(read_reply(&mut b).await.unwrap(), "1234 4096 /bin/sleep 5 \n");
    }

    #[tokio::test]
    async fn given_long_history_then_reply_exceeds_request_string_limit() {
        let history = "2020-09-29 13:05:07 - PID:3 - Mem:77\n".repeat(4096);
        assert!(history.len() > MAX_STRING_LEN as usize);

        let mut buf = Vec::new();
        assert!(matches!(write_str(&mut buf, &history).await, Err(Error::StringTooLong(..))));

        buf.clear();
        write_reply(&mut buf, &history).await.unwrap();
        assert_eq!(read_reply(&mut buf.as_slice()).await.unwrap(), history);
    }

    #[test]
    fn given_reply_over_limit_then_only_newest_whole_lines_are_kept() {
        let reply = "line-1\nline-2\nline-3\n";
        // 14 bytes plus the terminator
        assert_eq!(newest_lines(reply, 15), "line-2\nline-3\n");
        assert_eq!(newest_lines(reply, 14), "line-3\n");
        assert_eq!(newest_lines(reply, 22), reply);
    }

    #[test]
    fn given_single_line_longer_than_limit_then_nothing_is_kept() {
        assert_eq!(newest_lines("a very long line\n", 5), "");
    }

    #[tokio::test]
    async fn given_oversized_history_then_fitted_reply_can_be_sent() {
        let history = "2020-09-29 13:05:07 - PID:3 - Mem:77\n".repeat(500_000);
        let fitted = fit_reply(&history);
        assert!(fitted.len() < history.len());
        assert!(fitted.ends_with("Mem:77\n") && fitted.starts_with("2020-09-29"));

        let mut buf = Vec::new();
        write_reply(&mut buf, fitted).await.unwrap();
    }
}
