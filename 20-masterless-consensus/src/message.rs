//! The broadcast envelope and its line-oriented wire encoding.
//!
//! A [`Message`] is only ever built by [`LogicalClock::stamp_carries`], so
//! every message in flight carries the sender's clocks as they were at
//! broadcast time. The payload is the whole set of carries the sender holds
//! for the slot, in carry order.
//!
//! On the wire each message is one JSON object terminated by `\n`:
//!
//! ```text
//! {"sender":0,"stamp":3,"step":1,"carries":[[104,105],[106]]}
//! ```
//!
//! [`read_message`] and [`write_message`] frame any serde type this way, so a
//! node's port can be watched or fed by hand with netcat-style tools.
//!
//! [`LogicalClock::stamp_carries`]: crate::clock::LogicalClock::stamp_carries

use std::io;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::carry::Carries;
use crate::clock::{NodeId, Stamp, StepId};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    sender: NodeId,
    stamp: Stamp,
    step: StepId,
    carries: Carries,
}

impl Message {
    pub(crate) fn new(sender: NodeId, stamp: Stamp, step: StepId, carries: Carries) -> Self {
        Self {
            sender,
            stamp,
            step,
            carries,
        }
    }

    pub fn sender(&self) -> NodeId {
        self.sender
    }

    pub fn stamp(&self) -> Stamp {
        self.stamp
    }

    pub fn step(&self) -> StepId {
        self.step
    }

    /// Everything the sender held for `step` when it broadcast.
    pub fn carries(&self) -> &Carries {
        &self.carries
    }

    pub fn into_carries(self) -> Carries {
        self.carries
    }
}

/// Reads the next JSON line, skipping blank ones. `Ok(None)` means EOF.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

/// Writes `message` as a single JSON line and flushes.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carry::Carry;

    fn carries(items: &[&str]) -> Carries {
        items.iter().map(|item| Carry::from(*item)).collect()
    }

    #[test]
    fn wire_fields_are_flat() {
        let message = Message::new(NodeId(2), Stamp(5), StepId(1), carries(&["k", "hi"]));
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(
            json,
            r#"{"sender":2,"stamp":5,"step":1,"carries":[[104,105],[107]]}"#
        );
    }

    #[tokio::test]
    async fn messages_survive_line_framing() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        let first = Message::new(NodeId(0), Stamp(1), StepId(0), carries(&["a"]));
        let second = Message::new(NodeId(0), Stamp(2), StepId(1), carries(&["a", "b"]));

        write_message(&mut writer, &first).await.expect("write first");
        write_message(&mut writer, &second).await.expect("write second");
        drop(writer);

        let read_first = read_message::<_, Message>(&mut reader)
            .await
            .expect("read first")
            .expect("first message");
        let read_second = read_message::<_, Message>(&mut reader)
            .await
            .expect("read second")
            .expect("second message");

        assert_eq!(read_first, first);
        assert_eq!(read_second, second);
        assert!(read_message::<_, Message>(&mut reader)
            .await
            .expect("read eof")
            .is_none());
    }

    /// What a terminal session sends: CRLF endings and stray empty lines.
    #[tokio::test]
    async fn hand_typed_lines_are_read() {
        let (mut writer, reader) = tokio::io::duplex(256);
        let mut reader = tokio::io::BufReader::new(reader);
        writer
            .write_all(b"\r\n{\"sender\":1,\"stamp\":4,\"step\":0,\"carries\":[[120]]}\r\n\r\n")
            .await
            .unwrap();
        drop(writer);

        let message = read_message::<_, Message>(&mut reader)
            .await
            .expect("read typed line")
            .expect("typed message");
        assert_eq!(
            message,
            Message::new(NodeId(1), Stamp(4), StepId(0), carries(&["x"]))
        );
        assert!(read_message::<_, Message>(&mut reader)
            .await
            .expect("read eof")
            .is_none());
    }

    #[tokio::test]
    async fn garbage_line_is_invalid_data() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut reader = tokio::io::BufReader::new(reader);
        writer.write_all(b"not json\n").await.unwrap();

        let err = read_message::<_, Message>(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
