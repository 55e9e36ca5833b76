//! Configuration for the chat client and its request timeouts

use std::time::Duration;
use serde::{Deserialize, Serialize};
use log::debug;

/// Default endpoint, any OpenAI-compatible chat completion URL works
pub const DEFAULT_BASE_URL: &str
  = "https://api.deepseek.com/v1/chat/completions";

const DEFAULT_STREAMING_TTFT_MS: u64 = 100 * 1000;
const DEFAULT_STREAMING_TPFT_MS: u64 = 1000;
const DEFAULT_TTFT_MS: u64 = 500 * 1000;
const DEFAULT_TPFT_MS: u64 = 100 * 1000;
const DEFAULT_REDIRECT_MAX: usize = 3;
const DEFAULT_QUEUE_CAPACITY: usize = 4096 + 2;

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig
{   /// Bearer token sent with every request
    pub api_key: String
  , /// Full chat completion endpoint URL
    pub base_url: String
  , /// Time to first byte for streaming requests
    pub streaming_ttft_ms: u64
  , /// Time between two reads for streaming requests
    pub streaming_tpft_ms: u64
  , /// Time to first byte for non-streaming requests
    pub ttft_ms: u64
  , /// Time between two reads for non-streaming requests
    pub tpft_ms: u64
  , /// Redirects followed before giving up
    pub redirect_max: usize
  , /// Tool rounds allowed per call before tools are withdrawn
    pub max_tool_rounds: usize
  , /// Chunk queue capacity when the request has no token budget
    pub default_queue_capacity: usize
}

impl Default for ClientConfig
{   fn default() -> Self
    {   ClientConfig
        {   api_key: String::new()
          , base_url: DEFAULT_BASE_URL.to_string()
          , streaming_ttft_ms: DEFAULT_STREAMING_TTFT_MS
          , streaming_tpft_ms: DEFAULT_STREAMING_TPFT_MS
          , ttft_ms: DEFAULT_TTFT_MS
          , tpft_ms: DEFAULT_TPFT_MS
          , redirect_max: DEFAULT_REDIRECT_MAX
          , max_tool_rounds: 1
          , default_queue_capacity: DEFAULT_QUEUE_CAPACITY
        }
    }
}

impl ClientConfig
{   /// Config with an API key and the default endpoint
    pub fn new(api_key: impl Into<String>) -> Self
    {   ClientConfig
        {   api_key: api_key.into()
          , ..ClientConfig::default()
        }
    }

    /// Config pointing at another OpenAI-compatible endpoint
    pub fn with_base_url(
      mut self
    , base_url: impl Into<String>
    ) -> Self
    {   self.base_url = base_url.into();
        self
    }

    /// Build from `CHATFLOW_API_KEY` (or `OPENAI_API_KEY`)
    /// and `CHATFLOW_BASE_URL`
    pub fn from_env() -> Self
    {   let api_key = std::env::var("CHATFLOW_API_KEY")
          .or_else(|_| std::env::var("OPENAI_API_KEY"))
          .unwrap_or_default();
        let mut config = ClientConfig::new(api_key);
        if let Ok(url) = std::env::var("CHATFLOW_BASE_URL")
        {   debug!("Using base url from environment: {}", url);
            config.base_url = url;
        }
        config
    }

    /// (watch, receive) timeouts for a request
    pub fn timeouts(&self, stream: bool) -> (Duration, Duration)
    {   if stream
        {   ( Duration::from_millis(self.streaming_ttft_ms)
            , Duration::from_millis(self.streaming_tpft_ms)
            )
        } else
        {   ( Duration::from_millis(self.ttft_ms)
            , Duration::from_millis(self.tpft_ms)
            )
        }
    }
}

/// Initialize env_logger once, honoring RUST_LOG
pub fn init_logger()
{   let _ = env_logger::builder()
      .is_test(cfg!(test))
      .try_init();
}
