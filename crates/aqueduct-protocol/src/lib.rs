pub mod command;
pub mod frames;
pub mod uri;

pub use command::{
    CorrelatedMessage, DestinationMessage, ErrorCode, ErrorResponse, ImageMessage,
    ImageReady, OperationSucceeded, PublicationMessage, PublicationReady, RemoveMessage,
    SubscriptionMessage, SubscriptionReady, command_type, response_type,
};
pub use frames::{
    DataHeader, FrameFlags, FrameHeader, NakFrame, RttMeasurement, SetupFrame, StatusMessage,
};
pub use uri::{ChannelUri, ControlMode, Media, UriError};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("message of {0} bytes too short for {1}")]
    TooShort(usize, &'static str),
    #[error("string field exceeds message bounds")]
    BadString,
    #[error("unknown message type {0}")]
    UnknownType(i32),
}
