use crate::ProtocolError;

/// Client to driver command type ids, carried in the control ring buffer.
pub mod command_type {
    pub const ADD_PUBLICATION: i32 = 0x01;
    pub const ADD_EXCLUSIVE_PUBLICATION: i32 = 0x02;
    pub const REMOVE_PUBLICATION: i32 = 0x03;
    pub const ADD_SUBSCRIPTION: i32 = 0x04;
    pub const REMOVE_SUBSCRIPTION: i32 = 0x05;
    pub const CLIENT_KEEPALIVE: i32 = 0x06;
    pub const ADD_DESTINATION: i32 = 0x07;
    pub const REMOVE_DESTINATION: i32 = 0x08;
    pub const CLIENT_CLOSE: i32 = 0x09;
}

/// Driver to clients response type ids, carried in the broadcast buffer.
pub mod response_type {
    pub const ON_ERROR: i32 = 0x10;
    pub const ON_OPERATION_SUCCESS: i32 = 0x11;
    pub const ON_PUBLICATION_READY: i32 = 0x12;
    pub const ON_EXCLUSIVE_PUBLICATION_READY: i32 = 0x13;
    pub const ON_SUBSCRIPTION_READY: i32 = 0x14;
    pub const ON_AVAILABLE_IMAGE: i32 = 0x15;
    pub const ON_UNAVAILABLE_IMAGE: i32 = 0x16;
    pub const ON_COUNTER_READY: i32 = 0x17;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Generic = 0,
    InvalidChannel = 1,
    UnknownSubscription = 2,
    UnknownPublication = 3,
    StorageSpace = 4,
}

impl ErrorCode {
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => ErrorCode::InvalidChannel,
            2 => ErrorCode::UnknownSubscription,
            3 => ErrorCode::UnknownPublication,
            4 => ErrorCode::StorageSpace,
            _ => ErrorCode::Generic,
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn i32(&mut self, what: &'static str) -> Result<i32, ProtocolError> {
        let end = self.offset + 4;
        if end > self.buf.len() {
            return Err(ProtocolError::TooShort(self.buf.len(), what));
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[self.offset..end]);
        self.offset = end;
        Ok(i32::from_le_bytes(bytes))
    }

    fn i64(&mut self, what: &'static str) -> Result<i64, ProtocolError> {
        let end = self.offset + 8;
        if end > self.buf.len() {
            return Err(ProtocolError::TooShort(self.buf.len(), what));
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.buf[self.offset..end]);
        self.offset = end;
        Ok(i64::from_le_bytes(bytes))
    }

    fn string(&mut self, what: &'static str) -> Result<String, ProtocolError> {
        let length = self.i32(what)? as usize;
        let end = self.offset + length;
        if end > self.buf.len() {
            return Err(ProtocolError::BadString);
        }
        let s = String::from_utf8_lossy(&self.buf[self.offset..end]).into_owned();
        self.offset = end;
        Ok(s)
    }
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as i32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Base fields every command carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelatedMessage {
    pub client_id: i64,
    pub correlation_id: i64,
}

impl CorrelatedMessage {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.client_id.to_le_bytes());
        buf.extend_from_slice(&self.correlation_id.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(buf);
        Ok(Self {
            client_id: cursor.i64("client_id")?,
            correlation_id: cursor.i64("correlation_id")?,
        })
    }
}

/// AddPublication / AddExclusivePublication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicationMessage {
    pub client_id: i64,
    pub correlation_id: i64,
    pub stream_id: i32,
    pub channel: String,
}

impl PublicationMessage {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.client_id.to_le_bytes());
        buf.extend_from_slice(&self.correlation_id.to_le_bytes());
        buf.extend_from_slice(&self.stream_id.to_le_bytes());
        put_string(buf, &self.channel);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(buf);
        Ok(Self {
            client_id: cursor.i64("client_id")?,
            correlation_id: cursor.i64("correlation_id")?,
            stream_id: cursor.i32("stream_id")?,
            channel: cursor.string("channel")?,
        })
    }
}

/// AddSubscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionMessage {
    pub client_id: i64,
    pub correlation_id: i64,
    pub stream_id: i32,
    pub channel: String,
}

impl SubscriptionMessage {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.client_id.to_le_bytes());
        buf.extend_from_slice(&self.correlation_id.to_le_bytes());
        buf.extend_from_slice(&self.stream_id.to_le_bytes());
        put_string(buf, &self.channel);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(buf);
        Ok(Self {
            client_id: cursor.i64("client_id")?,
            correlation_id: cursor.i64("correlation_id")?,
            stream_id: cursor.i32("stream_id")?,
            channel: cursor.string("channel")?,
        })
    }
}

/// RemovePublication / RemoveSubscription by registration id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoveMessage {
    pub client_id: i64,
    pub correlation_id: i64,
    pub registration_id: i64,
}

impl RemoveMessage {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.client_id.to_le_bytes());
        buf.extend_from_slice(&self.correlation_id.to_le_bytes());
        buf.extend_from_slice(&self.registration_id.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(buf);
        Ok(Self {
            client_id: cursor.i64("client_id")?,
            correlation_id: cursor.i64("correlation_id")?,
            registration_id: cursor.i64("registration_id")?,
        })
    }
}

/// AddDestination / RemoveDestination on a multi-destination-cast
/// publication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DestinationMessage {
    pub client_id: i64,
    pub correlation_id: i64,
    pub registration_id: i64,
    pub channel: String,
}

impl DestinationMessage {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.client_id.to_le_bytes());
        buf.extend_from_slice(&self.correlation_id.to_le_bytes());
        buf.extend_from_slice(&self.registration_id.to_le_bytes());
        put_string(buf, &self.channel);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(buf);
        Ok(Self {
            client_id: cursor.i64("client_id")?,
            correlation_id: cursor.i64("correlation_id")?,
            registration_id: cursor.i64("registration_id")?,
            channel: cursor.string("channel")?,
        })
    }
}

/// PublicationReady response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicationReady {
    pub correlation_id: i64,
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub publication_limit_counter_id: i32,
    pub channel_status_counter_id: i32,
    pub log_file: String,
}

impl PublicationReady {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.correlation_id.to_le_bytes());
        buf.extend_from_slice(&self.registration_id.to_le_bytes());
        buf.extend_from_slice(&self.session_id.to_le_bytes());
        buf.extend_from_slice(&self.stream_id.to_le_bytes());
        buf.extend_from_slice(&self.publication_limit_counter_id.to_le_bytes());
        buf.extend_from_slice(&self.channel_status_counter_id.to_le_bytes());
        put_string(buf, &self.log_file);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(buf);
        Ok(Self {
            correlation_id: cursor.i64("correlation_id")?,
            registration_id: cursor.i64("registration_id")?,
            session_id: cursor.i32("session_id")?,
            stream_id: cursor.i32("stream_id")?,
            publication_limit_counter_id: cursor.i32("limit_counter")?,
            channel_status_counter_id: cursor.i32("status_counter")?,
            log_file: cursor.string("log_file")?,
        })
    }
}

/// SubscriptionReady response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionReady {
    pub correlation_id: i64,
    pub channel_status_counter_id: i32,
}

impl SubscriptionReady {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.correlation_id.to_le_bytes());
        buf.extend_from_slice(&self.channel_status_counter_id.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(buf);
        Ok(Self {
            correlation_id: cursor.i64("correlation_id")?,
            channel_status_counter_id: cursor.i32("status_counter")?,
        })
    }
}

/// AvailableImage response: a subscription gained an image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReady {
    pub correlation_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub subscription_registration_id: i64,
    pub subscriber_position_counter_id: i32,
    pub log_file: String,
    pub source_identity: String,
}

impl ImageReady {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.correlation_id.to_le_bytes());
        buf.extend_from_slice(&self.session_id.to_le_bytes());
        buf.extend_from_slice(&self.stream_id.to_le_bytes());
        buf.extend_from_slice(&self.subscription_registration_id.to_le_bytes());
        buf.extend_from_slice(&self.subscriber_position_counter_id.to_le_bytes());
        put_string(buf, &self.log_file);
        put_string(buf, &self.source_identity);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(buf);
        Ok(Self {
            correlation_id: cursor.i64("correlation_id")?,
            session_id: cursor.i32("session_id")?,
            stream_id: cursor.i32("stream_id")?,
            subscription_registration_id: cursor.i64("subscription_registration_id")?,
            subscriber_position_counter_id: cursor.i32("subscriber_position")?,
            log_file: cursor.string("log_file")?,
            source_identity: cursor.string("source_identity")?,
        })
    }
}

/// UnavailableImage response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageMessage {
    pub correlation_id: i64,
    pub subscription_registration_id: i64,
    pub stream_id: i32,
    pub channel: String,
}

impl ImageMessage {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.correlation_id.to_le_bytes());
        buf.extend_from_slice(&self.subscription_registration_id.to_le_bytes());
        buf.extend_from_slice(&self.stream_id.to_le_bytes());
        put_string(buf, &self.channel);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(buf);
        Ok(Self {
            correlation_id: cursor.i64("correlation_id")?,
            subscription_registration_id: cursor.i64("subscription_registration_id")?,
            stream_id: cursor.i32("stream_id")?,
            channel: cursor.string("channel")?,
        })
    }
}

/// Error response to the offending correlation id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorResponse {
    pub offending_correlation_id: i64,
    pub error_code: i32,
    pub message: String,
}

impl ErrorResponse {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.offending_correlation_id.to_le_bytes());
        buf.extend_from_slice(&self.error_code.to_le_bytes());
        put_string(buf, &self.message);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(buf);
        Ok(Self {
            offending_correlation_id: cursor.i64("offending_correlation_id")?,
            error_code: cursor.i32("error_code")?,
            message: cursor.string("message")?,
        })
    }
}

/// OK reply for commands with no payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationSucceeded {
    pub correlation_id: i64,
}

impl OperationSucceeded {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.correlation_id.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(buf);
        Ok(Self { correlation_id: cursor.i64("correlation_id")? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publication_message_roundtrip() {
        let msg = PublicationMessage {
            client_id: 1,
            correlation_id: 2,
            stream_id: 10,
            channel: "aqueduct:udp?endpoint=127.0.0.1:40123".to_string(),
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf);
        assert_eq!(PublicationMessage::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn publication_ready_roundtrip() {
        let msg = PublicationReady {
            correlation_id: 9,
            registration_id: 9,
            session_id: -123,
            stream_id: 10,
            publication_limit_counter_id: 4,
            channel_status_counter_id: 5,
            log_file: "/dev/shm/aqueduct/publications/9.logbuffer".to_string(),
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf);
        assert_eq!(PublicationReady::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn image_ready_roundtrip() {
        let msg = ImageReady {
            correlation_id: 3,
            session_id: 77,
            stream_id: 10,
            subscription_registration_id: 5,
            subscriber_position_counter_id: 8,
            log_file: "/dev/shm/aqueduct/images/3.logbuffer".to_string(),
            source_identity: "127.0.0.1:54321".to_string(),
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf);
        assert_eq!(ImageReady::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn error_response_roundtrip() {
        let msg = ErrorResponse {
            offending_correlation_id: 42,
            error_code: ErrorCode::UnknownPublication as i32,
            message: "unknown publication: 42".to_string(),
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf);
        let decoded = ErrorResponse::decode(&buf).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(ErrorCode::from_i32(decoded.error_code), ErrorCode::UnknownPublication);
    }

    #[test]
    fn truncated_decode_fails() {
        let msg = RemoveMessage { client_id: 1, correlation_id: 2, registration_id: 3 };
        let mut buf = Vec::new();
        msg.encode(&mut buf);
        assert!(RemoveMessage::decode(&buf[..12]).is_err());

        let mut bad_string = Vec::new();
        PublicationMessage {
            client_id: 1,
            correlation_id: 2,
            stream_id: 3,
            channel: "chan".into(),
        }
        .encode(&mut bad_string);
        bad_string.truncate(bad_string.len() - 2);
        assert_eq!(PublicationMessage::decode(&bad_string), Err(ProtocolError::BadString));
    }
}
