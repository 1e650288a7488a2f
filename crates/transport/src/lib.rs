//! Client side of the answering service: request validation, the incremental
//! stream decoder and the paginated result endpoint.

mod client;
mod decoder;
mod error;
mod event;
mod paging;
mod request;

pub use client::{
    BoxFuture, ChatTransport, ClientConfig, DEFAULT_CONNECT_TIMEOUT, EventSink, ReplayTransport,
    StreamClient, StreamOutcome, TerminalKind, drive_stream,
};
pub use decoder::{DecodedLine, LineDecoder};
pub use error::{
    ProtocolError, TransportError, TransportResult, ValidationError, ValidationResult,
};
pub use event::{
    CONNECTION_ERROR_FRAGMENT, RECORD_PREFIX, StreamEvent, StreamFailure, decode_record,
};
pub use paging::{HttpPageSource, PageSource, RemotePage};
pub use request::{ChatRequest, MAX_MESSAGE_CHARS, parse_dataset};
