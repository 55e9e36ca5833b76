use std::fmt;

/// Broad failure classes a caller can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind
{   /// Transport or task failure before any HTTP semantics apply
    Framework
  , /// Non-2xx HTTP status
    Network
  , /// Malformed JSON body
    Parse
  , /// Well-formed JSON missing required fields
    Content
}

/// Custom error type for chatflow operations
/// Implements Clone for sending through channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error
{   /// API key is missing
    MissingApiKey
  , /// HTTP transport failed (connect, redirect, body read)
    HttpError(String)
  , /// Server answered with a non-2xx status
    ApiError
    {   status: u16
      , body: String
    }
  , /// Failed to parse a response body
    ParseError(String)
  , /// Response body is missing a required field
    MissingField(&'static str)
  , /// No choices in API response
    NoChoicesInResponse
  , /// Request violates a conversation invariant
    InvalidRequest(String)
  , /// Invalid configuration
    InvalidConfiguration(String)
  , /// Tool dispatch could not complete
    DispatchFailed(String)
  , /// Time to first byte or time between bytes exceeded
    Timeout
  , /// Generic error
    Other(String)
}

impl Error
{   /// Map onto the failure class reported to callers.
    pub fn kind(&self) -> ErrorKind
    {   match self
        {   Error::ApiError { .. } => ErrorKind::Network
          , Error::ParseError(_) => ErrorKind::Parse
          , Error::MissingField(_)
          | Error::NoChoicesInResponse => ErrorKind::Content
          , _ => ErrorKind::Framework
        }
    }

    /// HTTP status attached to the error, 0 when none was received.
    pub fn status_code(&self) -> u16
    {   match self
        {   Error::ApiError { status, .. } => *status
          , _ => 0
        }
    }
}

impl fmt::Display for Error
{   fn fmt(&self, f: &mut fmt::Formatter<'_>)
      -> fmt::Result
    {   match self
        {   Error::MissingApiKey => {
              write!(f, "Missing API key")
            }
          , Error::HttpError(msg) => {
              write!(f, "HTTP error: {}", msg)
            }
          , Error::ApiError { status, body } => {
              write!(f, "API error ({}): {}", status, body)
            }
          , Error::ParseError(msg) => {
              write!(f, "Parse error: {}", msg)
            }
          , Error::MissingField(field) => {
              write!(f,
                "Response is missing required field '{}'",
                field
              )
            }
          , Error::NoChoicesInResponse => {
              write!(f, "API response contained no choices")
            }
          , Error::InvalidRequest(msg) => {
              write!(f, "Invalid request: {}", msg)
            }
          , Error::InvalidConfiguration(msg) => {
              write!(f, "Invalid configuration: {}", msg)
            }
          , Error::DispatchFailed(msg) => {
              write!(f, "Tool dispatch failed: {}", msg)
            }
          , Error::Timeout => {
              write!(f, "Request timed out")
            }
          , Error::Other(msg) => {
              write!(f, "Error: {}", msg)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<String> for Error
{   fn from(s: String) -> Self
    {   Error::Other(s)
    }
}

impl From<&str> for Error
{   fn from(s: &str) -> Self
    {   Error::Other(s.to_string())
    }
}

impl From<serde_json::Error> for Error
{   fn from(e: serde_json::Error) -> Self
    {   Error::ParseError(e.to_string())
    }
}

impl From<reqwest::Error> for Error
{   fn from(e: reqwest::Error) -> Self
    {   if e.is_timeout()
        {   Error::Timeout
        } else
        {   Error::HttpError(e.to_string())
        }
    }
}
