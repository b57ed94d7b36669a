// beanstalkd connection - one socket speaking the text protocol

use conveyor_core::domain::{Job, JobId};
use conveyor_core::port::ManagerError;
use std::io;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

/// Upper bound on waiting for any reply beyond the server-side timeout
const REPLY_GRACE: Duration = Duration::from_secs(5);

const MAX_TUBE_NAME: usize = 200;

/// Largest job body accepted from the server, matching beanstalkd's default `-z`
pub const DEFAULT_MAX_JOB_SIZE: usize = 65_535;

/// Check a tube name against the server's naming rules
pub(crate) fn validate_tube(name: &str) -> Result<(), ManagerError> {
    let valid_char = |c: char| c.is_ascii_alphanumeric() || "-+/;.$_()".contains(c);
    if name.is_empty()
        || name.len() > MAX_TUBE_NAME
        || name.starts_with('-')
        || !name.chars().all(valid_char)
    {
        return Err(ManagerError::Rejected(format!("invalid tube name: {name:?}")));
    }
    Ok(())
}

/// Map an unexpected status line to the error kinds the durable queue understands
pub(crate) fn reply_error(line: &str) -> ManagerError {
    let status = line.split(' ').next().unwrap_or_default();
    match status {
        "TIMED_OUT" | "DEADLINE_SOON" => ManagerError::Timeout,
        "BURIED" | "JOB_TOO_BIG" | "DRAINING" | "EXPECTED_CRLF" | "NOT_FOUND" | "NOT_IGNORED" => {
            ManagerError::Rejected(line.to_string())
        }
        _ => ManagerError::Protocol(format!("unexpected reply: {line:?}")),
    }
}

/// Arguments following `status`, or the mapped error when the status differs
fn expect_status<'a>(line: &'a str, status: &str) -> Result<Vec<&'a str>, ManagerError> {
    let mut parts = line.split(' ');
    match parts.next() {
        Some(word) if word == status => Ok(parts.collect()),
        _ => Err(reply_error(line)),
    }
}

fn parse_field<N: FromStr>(line: &str, field: Option<&&str>) -> Result<N, ManagerError> {
    field
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| ManagerError::Protocol(format!("malformed reply: {line:?}")))
}

/// Whole seconds, rounding any fraction up
fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

pub(crate) struct Connection<S = TcpStream> {
    stream: BufStream<S>,
    max_body: usize,
}

impl Connection<TcpStream> {
    pub(crate) async fn dial(addr: &str) -> Result<Self, ManagerError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
            max_body: DEFAULT_MAX_JOB_SIZE,
        }
    }

    pub(crate) fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }

    async fn send(&mut self, command: &str, body: Option<&[u8]>) -> Result<(), ManagerError> {
        self.stream.write_all(command.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        if let Some(body) = body {
            self.stream.write_all(body).await?;
            self.stream.write_all(b"\r\n").await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<String, ManagerError> {
        let mut raw = Vec::new();
        let n = self.stream.read_until(b'\n', &mut raw).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "server closed the connection").into());
        }
        if !raw.ends_with(b"\r\n") {
            return Err(ManagerError::Protocol("reply not terminated by CRLF".into()));
        }
        raw.truncate(raw.len() - 2);
        String::from_utf8(raw).map_err(|_| ManagerError::Protocol("reply is not UTF-8".into()))
    }

    /// Read a reply, failing as a network error if none arrives in `wait`
    async fn reply_within(&mut self, wait: Duration) -> Result<String, ManagerError> {
        match tokio::time::timeout(wait, self.read_reply()).await {
            Ok(reply) => reply,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "no reply from server").into()),
        }
    }

    async fn command(&mut self, command: &str, body: Option<&[u8]>) -> Result<String, ManagerError> {
        self.send(command, body).await?;
        self.reply_within(REPLY_GRACE).await
    }

    async fn read_body(&mut self, len: usize) -> Result<Vec<u8>, ManagerError> {
        if len > self.max_body {
            return Err(ManagerError::Protocol(format!(
                "job body of {len} bytes exceeds the {} byte limit",
                self.max_body
            )));
        }
        let framed = len
            .checked_add(2)
            .ok_or_else(|| ManagerError::Protocol(format!("job body length overflows: {len}")))?;
        let mut body = vec![0u8; framed];
        self.stream.read_exact(&mut body).await?;
        if !body.ends_with(b"\r\n") {
            return Err(ManagerError::Protocol("job body not terminated by CRLF".into()));
        }
        body.truncate(len);
        Ok(body)
    }

    pub(crate) async fn use_tube(&mut self, tube: &str) -> Result<(), ManagerError> {
        let line = self.command(&format!("use {tube}"), None).await?;
        let args = expect_status(&line, "USING")?;
        if args.first() != Some(&tube) {
            return Err(ManagerError::Protocol(format!("server is using another tube: {line:?}")));
        }
        Ok(())
    }

    /// Watch `tube`; returns the number of tubes now watched
    pub(crate) async fn watch(&mut self, tube: &str) -> Result<u32, ManagerError> {
        let line = self.command(&format!("watch {tube}"), None).await?;
        let args = expect_status(&line, "WATCHING")?;
        parse_field(&line, args.first())
    }

    pub(crate) async fn ignore(&mut self, tube: &str) -> Result<u32, ManagerError> {
        let line = self.command(&format!("ignore {tube}"), None).await?;
        let args = expect_status(&line, "WATCHING")?;
        parse_field(&line, args.first())
    }

    pub(crate) async fn put(
        &mut self,
        body: &[u8],
        priority: u32,
        delay: Duration,
        ttr: Duration,
    ) -> Result<JobId, ManagerError> {
        let command = format!(
            "put {priority} {} {} {}",
            delay.as_secs(),
            ceil_secs(ttr).max(1),
            body.len()
        );
        let line = self.command(&command, Some(body)).await?;
        let args = expect_status(&line, "INSERTED")?;
        parse_field(&line, args.first())
    }

    pub(crate) async fn reserve(&mut self, timeout: Duration) -> Result<Job, ManagerError> {
        let secs = ceil_secs(timeout);
        self.send(&format!("reserve-with-timeout {secs}"), None).await?;
        let line = self.reply_within(Duration::from_secs(secs) + REPLY_GRACE).await?;

        let args = expect_status(&line, "RESERVED")?;
        let id: JobId = parse_field(&line, args.first())?;
        let len: usize = parse_field(&line, args.get(1))?;
        let body = self.read_body(len).await?;
        Ok(Job::new(id, body))
    }

    pub(crate) async fn delete(&mut self, id: JobId) -> Result<(), ManagerError> {
        let line = self.command(&format!("delete {id}"), None).await?;
        expect_status(&line, "DELETED")?;
        Ok(())
    }

    /// Tell the server we are leaving; the socket closes on drop either way
    pub(crate) async fn quit(mut self) -> Result<(), ManagerError> {
        self.send("quit", None).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[test]
    fn test_reply_error_mapping() {
        assert!(reply_error("TIMED_OUT").is_timeout());
        assert!(reply_error("DEADLINE_SOON").is_timeout());

        for line in ["BURIED 12", "JOB_TOO_BIG", "DRAINING", "EXPECTED_CRLF", "NOT_FOUND"] {
            assert!(
                matches!(reply_error(line), ManagerError::Rejected(ref msg) if msg == line),
                "{line} should be a rejection"
            );
        }

        for line in ["OUT_OF_MEMORY", "INTERNAL_ERROR", "BAD_FORMAT", "UNKNOWN_COMMAND", "WAT"] {
            let err = reply_error(line);
            assert!(matches!(err, ManagerError::Protocol(_)), "{line} should be a protocol error");
            assert!(!err.is_network());
        }
    }

    #[test]
    fn test_validate_tube() {
        assert!(validate_tube("emails").is_ok());
        assert!(validate_tube("jobs.v2_(high)+$;/").is_ok());
        assert!(validate_tube("").is_err());
        assert!(validate_tube("-leading").is_err());
        assert!(validate_tube("has space").is_err());
        assert!(validate_tube(&"t".repeat(201)).is_err());
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::ZERO), 0);
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
        assert_eq!(ceil_secs(Duration::from_secs(2)), 2);
        assert_eq!(ceil_secs(Duration::from_millis(2500)), 3);
    }

    #[tokio::test]
    async fn test_put_reserve_delete_exchange() {
        let mock = Builder::new()
            .write(b"put 1024 0 60 5\r\nhello\r\n")
            .read(b"INSERTED 7\r\n")
            .write(b"reserve-with-timeout 1\r\n")
            .read(b"RESERVED 7 5\r\nhello\r\n")
            .write(b"delete 7\r\n")
            .read(b"DELETED\r\n")
            .build();
        let mut conn = Connection::new(mock);

        let id = conn
            .put(b"hello", 1024, Duration::ZERO, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(id, 7);

        let job = conn.reserve(Duration::from_millis(300)).await.unwrap();
        assert_eq!(job.id, 7);
        assert_eq!(job.body, b"hello");

        conn.delete(7).await.unwrap();
    }

    #[tokio::test]
    async fn test_tube_commands() {
        let mock = Builder::new()
            .write(b"use emails\r\n")
            .read(b"USING emails\r\n")
            .write(b"watch emails\r\n")
            .read(b"WATCHING 2\r\n")
            .write(b"ignore default\r\n")
            .read(b"WATCHING 1\r\n")
            .build();
        let mut conn = Connection::new(mock);

        conn.use_tube("emails").await.unwrap();
        assert_eq!(conn.watch("emails").await.unwrap(), 2);
        assert_eq!(conn.ignore("default").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reserve_timeout_and_rejections() {
        let mock = Builder::new()
            .write(b"reserve-with-timeout 1\r\n")
            .read(b"TIMED_OUT\r\n")
            .write(b"delete 3\r\n")
            .read(b"NOT_FOUND\r\n")
            .write(b"put 0 0 1 1\r\nx\r\n")
            .read(b"JOB_TOO_BIG\r\n")
            .build();
        let mut conn = Connection::new(mock);

        assert!(conn.reserve(Duration::from_secs(1)).await.unwrap_err().is_timeout());
        assert!(matches!(
            conn.delete(3).await.unwrap_err(),
            ManagerError::Rejected(_)
        ));
        assert!(matches!(
            conn.put(b"x", 0, Duration::ZERO, Duration::ZERO).await.unwrap_err(),
            ManagerError::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn test_malformed_replies_are_protocol_errors() {
        let mock = Builder::new()
            .write(b"put 0 0 1 1\r\nx\r\n")
            .read(b"INSERTED banana\r\n")
            .write(b"reserve-with-timeout 0\r\n")
            .read(b"RESERVED 1 3\r\nabcXY")
            .build();
        let mut conn = Connection::new(mock);

        assert!(matches!(
            conn.put(b"x", 0, Duration::ZERO, Duration::from_secs(1)).await.unwrap_err(),
            ManagerError::Protocol(_)
        ));
        assert!(matches!(
            conn.reserve(Duration::ZERO).await.unwrap_err(),
            ManagerError::Protocol(_)
        ));
    }

    #[tokio::test]
    async fn test_oversized_body_length_is_rejected_unread() {
        let mock = Builder::new()
            .write(b"reserve-with-timeout 0\r\n")
            .read(b"RESERVED 1 18446744073709551615\r\n")
            .write(b"reserve-with-timeout 0\r\n")
            .read(b"RESERVED 2 65536\r\n")
            .build();
        let mut conn = Connection::new(mock);

        for _ in 0..2 {
            let err = conn.reserve(Duration::ZERO).await.unwrap_err();
            assert!(matches!(err, ManagerError::Protocol(_)), "got {err}");
            assert!(!err.is_network());
        }
    }

    #[tokio::test]
    async fn test_body_limit_is_configurable() {
        let mock = Builder::new()
            .write(b"reserve-with-timeout 0\r\n")
            .read(b"RESERVED 4 6\r\nabcdef\r\n")
            .write(b"reserve-with-timeout 0\r\n")
            .read(b"RESERVED 5 4\r\n")
            .build();
        let mut conn = Connection::new(mock).with_max_body(6);

        assert_eq!(conn.reserve(Duration::ZERO).await.unwrap().body, b"abcdef");
        assert!(matches!(
            conn.reserve(Duration::ZERO).await.unwrap_err(),
            ManagerError::Protocol(_)
        ));
    }

    #[tokio::test]
    async fn test_closed_socket_is_network_error() {
        let mock = Builder::new().write(b"delete 1\r\n").build();
        let mut conn = Connection::new(mock);

        let err = conn.delete(1).await.unwrap_err();
        assert!(err.is_network(), "EOF should classify as network: {err}");
    }
}
