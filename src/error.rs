//! Error types for pipeline setup, delivery, and encoding.

use crate::record::Signal;
use figment::Error as FigmentError;
use std::path::PathBuf;
use std::time::Duration;

/// Errors from configuration loading and pipeline setup.
///
/// Any of these aborts telemetry setup as a whole. The host application is
/// expected to log it and continue without telemetry.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Failed to extract configuration from sources.
    #[error("configuration error: {0}")]
    Extract(#[source] Box<FigmentError>),

    /// A header line had no `=` separator, or its name or value is not a valid HTTP header.
    #[error("malformed header line at index {index}")]
    MalformedHeaderLine {
        /// Zero-based index of the offending line.
        index: usize,
    },

    /// A metadata property file could not be parsed.
    #[error("failed to parse metadata file {}: line {line}", path.display())]
    MetadataParseFailed {
        /// The file that failed to parse.
        path: PathBuf,
        /// One-based line number of the first malformed line.
        line: usize,
    },

    /// The service name (`APP_NAME`) was not configured.
    #[error("service name is not configured")]
    MissingServiceName,

    /// The deployment environment (`APP_ENV`) was not configured.
    #[error("deployment environment is not configured")]
    MissingDeploymentEnvironment,

    /// Invalid endpoint URL format.
    #[error("invalid endpoint URL: {url} (must start with http:// or https://)")]
    InvalidEndpoint {
        /// The invalid URL that was provided.
        url: String,
    },

    /// A registry has already been installed as the process-global entry point.
    #[error("a provider registry is already registered for this process")]
    AlreadyRegistered,

    /// Failed to initialise tracing subscriber.
    #[error("failed to initialise tracing subscriber")]
    TracingSubscriber(#[from] tracing_subscriber::util::TryInitError),

    /// An export worker thread could not be started.
    #[error("failed to start {signal} export worker")]
    WorkerSpawn {
        /// The signal whose worker failed to start.
        signal: Signal,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A processor did not shut down cleanly.
    #[error("failed to shut down {signal} processor")]
    Shutdown {
        /// The signal whose processor failed.
        signal: Signal,
        /// Why shutdown failed.
        #[source]
        source: ProcessorError,
    },
}

impl From<FigmentError> for ConfigError {
    fn from(err: FigmentError) -> Self {
        ConfigError::Extract(Box::new(err))
    }
}

/// Errors from delivering an encoded payload to the collector.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The collector answered with a non-2xx status.
    #[error("collector returned {status}: {body}")]
    Http {
        /// HTTP status code returned by the collector.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },

    /// The request did not complete because of a connection-level failure.
    #[error("network error")]
    Network(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The request exceeded its timeout.
    #[error("request timed out")]
    Timeout,

    /// The HTTP client or request could not be constructed.
    #[error("failed to build HTTP request")]
    Client(#[source] reqwest::Error),

    /// The pipeline is shutting down and delivery was abandoned.
    #[error("export cancelled by shutdown")]
    Cancelled,
}

impl TransportError {
    pub(crate) fn http(status: u16, body: impl Into<String>) -> Self {
        Self::Http {
            status,
            body: body.into(),
        }
    }

    /// Whether another attempt could succeed.
    ///
    /// Retryable: network failures, timeouts, 408, 429 and 5xx.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => {
                matches!(status, 408 | 429) || (500..600).contains(status)
            }
            Self::Network(_) | Self::Timeout => true,
            Self::Client(_) | Self::Cancelled => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_builder() {
            Self::Client(err)
        } else {
            Self::Network(Box::new(err))
        }
    }
}

/// Errors from flushing or shutting down a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ProcessorError {
    /// The processor has been shut down.
    #[error("processor is closed")]
    Closed,

    /// The export worker did not answer in time.
    #[error("export worker did not respond within {0:?}")]
    Timeout(Duration),

    /// The export worker has exited.
    #[error("export worker is not running")]
    WorkerGone,
}

/// Errors for a single record that cannot be encoded.
///
/// The offending record is dropped; the rest of its batch is still sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum EncodeError {
    /// A span or metric had an empty name.
    #[error("{signal} record has an empty name")]
    EmptyName {
        /// Signal of the offending record.
        signal: Signal,
    },

    /// A span had an all-zero trace or span id.
    #[error("span has an invalid trace or span id")]
    InvalidSpanContext,

    /// A span ended before it started.
    #[error("span `{name}` ends before it starts")]
    EndBeforeStart {
        /// Name of the offending span.
        name: String,
    },

    /// A metric value was NaN or infinite.
    #[error("metric `{name}` has a non-finite value")]
    NonFiniteValue {
        /// Name of the offending instrument.
        name: String,
    },

    /// Serialising the request to JSON failed.
    #[error("failed to serialise {signal} request as JSON: {message}")]
    Json {
        /// Signal of the request.
        signal: Signal,
        /// Serializer message.
        message: String,
    },

    /// Compressing the payload failed.
    #[error("failed to compress payload: {message}")]
    Compression {
        /// I/O error message.
        message: String,
    },
}
