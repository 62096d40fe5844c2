use crate::error::RemoteError;
use std::{collections::HashMap, io::Cursor};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest single `key:value` field accepted from the wire.
pub const MAX_FIELD_SIZE: u32 = 64 * 1024;

pub const STATUS_OK: &str = "ok";
pub const STATUS_ERROR: &str = "error";

/// Key/value packet used for every request and reply crossing the
/// remote-invocation boundary. Each field is framed as a little-endian `u32`
/// length followed by `key:value`; a zero length terminates the packet.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DataPacket {
    pub fields: HashMap<String, String>,
}

// methods regarding the creation of headers
impl DataPacket {
    pub fn new() -> Self {
        Self {
            fields: HashMap::default(),
        }
    }
    /// Request packet for the named operation.
    pub fn request(op: &str) -> Self {
        Self::new().with("op", op)
    }
    pub fn ok() -> Self {
        Self::new().with("status", STATUS_OK)
    }
    pub fn error(message: impl Into<String>) -> Self {
        Self::new()
            .with("status", STATUS_ERROR)
            .with("message", message)
    }
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key.to_owned(), value.into());
        self
    }
    pub fn insert(&mut self, key: String, value: String) {
        self.fields.insert(key, value);
    }
    pub fn get(&self, key: &str) -> Result<&str, RemoteError> {
        match self.fields.get(key) {
            Some(v) => Ok(v),
            None => Err(RemoteError::Protocol(format!(
                "Can't find value of field {}.",
                key
            ))),
        }
    }
    pub fn op(&self) -> Result<&str, RemoteError> {
        self.get("op")
    }
    /// Turns an `error` status reply into `RemoteError::Rejected`.
    pub fn into_result(self) -> Result<Self, RemoteError> {
        match self.fields.get("status").map(String::as_str) {
            Some(STATUS_OK) => Ok(self),
            Some(STATUS_ERROR) => Err(RemoteError::Rejected(
                self.fields
                    .get("message")
                    .cloned()
                    .unwrap_or_else(|| "no message".to_owned()),
            )),
            _ => Err(RemoteError::Protocol("reply without status".to_owned())),
        }
    }
}

// regarding the stream encoding and decoding
impl DataPacket {
    pub async fn decode(stream: &mut (impl AsyncRead + Unpin)) -> Result<Self, RemoteError> {
        let mut fields = HashMap::new();
        loop {
            let field_size = stream.read_u32_le().await?;
            if field_size == 0 {
                break;
            }
            if field_size > MAX_FIELD_SIZE {
                return Err(RemoteError::Protocol(format!(
                    "field of {field_size} bytes exceeds limit"
                )));
            }
            let mut field_raw = vec![0u8; field_size as usize];
            stream.read_exact(&mut field_raw).await?;
            let field_str = String::from_utf8(field_raw)
                .map_err(|e| RemoteError::Protocol(format!("field is not utf-8: {e}")))?;
            match field_str.split_once(':') {
                Some((field_title, field_value)) => {
                    fields.insert(field_title.to_owned(), field_value.to_owned());
                }
                None => {
                    return Err(RemoteError::Protocol(
                        "Invalid packet structure splitter: not found".to_owned(),
                    ));
                }
            }
        }
        Ok(DataPacket { fields })
    }
    pub fn encode(&self) -> impl AsyncRead + Unpin + use<> {
        let mut buf = Vec::new();
        self.fields.iter().for_each(|(key, value)| {
            buf.extend_from_slice(&((key.len() + value.len() + 1) as u32).to_le_bytes());
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(":".as_bytes());
            buf.extend_from_slice(value.as_bytes());
        });
        buf.extend_from_slice(&0_u32.to_le_bytes());
        Cursor::new(buf)
    }
    pub async fn write_to(&self, stream: &mut (impl AsyncWrite + Unpin)) -> Result<(), RemoteError> {
        tokio::io::copy(&mut self.encode(), stream).await?;
        stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;
    #[tokio::test]
    async fn packet_reader_test() {
        let field1 = b"file_name:notes.txt";
        let field2 = b"requester:127.0.0.1:7100";
        let mut buf = Vec::new();
        buf.extend_from_slice(&(field1.len() as u32).to_le_bytes());
        buf.extend_from_slice(field1);
        buf.extend_from_slice(&(field2.len() as u32).to_le_bytes());
        buf.extend_from_slice(field2);
        buf.extend_from_slice(&0_u32.to_le_bytes());
        let mut cursor = Cursor::new(buf);
        let fields = DataPacket::decode(&mut cursor).await.unwrap();
        // only the first ':' splits, addresses keep their port
        assert_eq!(fields.get("requester").unwrap(), "127.0.0.1:7100");
        assert_eq!(fields.get("file_name").unwrap(), "notes.txt");
    }

    #[tokio::test]
    async fn oversized_field_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FIELD_SIZE + 1).to_le_bytes());
        let mut cursor = Cursor::new(buf);
        let err = DataPacket::decode(&mut cursor).await.unwrap_err();
        assert!(matches!(err, RemoteError::Protocol(_)));
    }

    #[tokio::test]
    async fn written_packet_decodes_back() {
        let packet = DataPacket::request("set_owner_file").with("file_name", "a.txt");
        let mut buf = Vec::new();
        packet.write_to(&mut buf).await.unwrap();
        let decoded = DataPacket::decode(&mut Cursor::new(buf)).await.unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn error_reply_becomes_rejected() {
        let err = DataPacket::error("file not found").into_result().unwrap_err();
        assert!(matches!(err, RemoteError::Rejected(msg) if msg == "file not found"));
        assert!(DataPacket::ok().into_result().is_ok());
        assert!(matches!(
            DataPacket::new().into_result(),
            Err(RemoteError::Protocol(_))
        ));
    }
}
