use snafu::Snafu;

/// Rejected before any network activity.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ValidationError {
    #[snafu(display("message is empty"))]
    EmptyMessage { stage: &'static str },
    #[snafu(display("message is too long ({length} characters, max {max})"))]
    MessageTooLong {
        stage: &'static str,
        length: usize,
        max: usize,
    },
    #[snafu(display("unknown dataset '{raw}'"))]
    UnknownDataset { stage: &'static str, raw: String },
}

pub type ValidationResult<T> = Result<T, ValidationError>;

/// One stream line that could not be turned into an event. Recovered by skipping the line.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProtocolError {
    #[snafu(display("stream line {line_number} is not valid UTF-8"))]
    InvalidUtf8 {
        stage: &'static str,
        line_number: usize,
        source: std::string::FromUtf8Error,
    },
    #[snafu(display("stream line {line_number} is not a valid record: {source}"))]
    MalformedRecord {
        stage: &'static str,
        line_number: usize,
        source: serde_json::Error,
    },
    #[snafu(display("stream line {line_number} carries no text, terminal marker or error"))]
    EmptyRecord {
        stage: &'static str,
        line_number: usize,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request failed on `{stage}`: {source}"))]
    Request {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("endpoint returned status {status} on `{stage}`: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to read response body on `{stage}`: {source}"))]
    ReadBody {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("failed to decode response body on `{stage}`: {source}"))]
    DecodeBody {
        stage: &'static str,
        source: serde_json::Error,
    },
}

pub type TransportResult<T> = Result<T, TransportError>;
