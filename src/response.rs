//! Response-side types: one struct serves both whole responses
//! and streamed chunks, told apart by `ResponseShape`.

use serde::{Deserialize, Serialize};
use log::{debug, trace};
use crate::request::{nullable, Role, ToolCall};
use crate::error::Error;

/// Which body a choice carries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ResponseShape
{   /// Non-streaming: `choices[].message`
    #[default]
    Message
  , /// Streaming: `choices[].delta`
    Delta
}

// ===== Usage =====

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptTokensDetails
{   pub cached_tokens: u32
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionTokensDetails
{   pub reasoning_tokens: u32
}

/// Token accounting for one request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage
{   pub prompt_tokens: u32
  , pub completion_tokens: u32
  , pub total_tokens: u32
  , /// Prompt tokens served from the context cache
    pub prompt_cache_hit_tokens: u32
  , pub prompt_cache_miss_tokens: u32
  , pub reasoning_tokens: u32
  , #[serde(deserialize_with = "nullable")]
    pub prompt_tokens_details: PromptTokensDetails
  , #[serde(deserialize_with = "nullable")]
    pub completion_tokens_details: CompletionTokensDetails
}

impl Usage
{   /// Reasoning tokens whichever way the server reports them
    pub fn reasoning(&self) -> u32
    {   self.reasoning_tokens
          .max(self.completion_tokens_details.reasoning_tokens)
    }
}

// ===== Logprobs =====

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenLogprob
{   pub token: String
  , pub logprob: f64
  , /// UTF-8 bytes of the token
    #[serde(default, deserialize_with = "nullable")]
    pub bytes: Vec<u8>
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Logprob
{   #[serde(flatten)]
    pub current: TokenLogprob
  , #[serde(default, deserialize_with = "nullable")]
    pub top_logprobs: Vec<TokenLogprob>
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Logprobs
{   #[serde(default, deserialize_with = "nullable")]
    pub content: Vec<Logprob>
}

// ===== Choices =====

/// Whole message or delta, same fields either way
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChoiceMessage
{   pub role: Option<Role>
  , #[serde(deserialize_with = "nullable")]
    pub content: String
  , #[serde(deserialize_with = "nullable")]
    pub reasoning_content: String
  , #[serde(deserialize_with = "nullable")]
    pub tool_calls: Vec<ToolCall>
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Choice
{   #[serde(default)]
    pub index: u32
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<ChoiceMessage>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<ChoiceMessage>
  , #[serde(default)]
    pub finish_reason: Option<String>
  , #[serde(default)]
    pub logprobs: Option<Logprobs>
}

impl Choice
{   /// The message or delta, whichever this choice carries
    pub fn body(&self) -> Option<&ChoiceMessage>
    {   self.message.as_ref().or(self.delta.as_ref())
    }
}

// ===== Response / Chunk =====

/// A whole response (non-streaming) or one chunk (streaming)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse
{   #[serde(default)]
    pub id: String
  , #[serde(default)]
    pub object: String
  , #[serde(default)]
    pub created: u64
  , #[serde(default)]
    pub model: String
  , #[serde(default, deserialize_with = "nullable")]
    pub system_fingerprint: String
  , #[serde(default)]
    pub choices: Vec<Choice>
  , #[serde(default)]
    pub usage: Option<Usage>
  , #[serde(skip)]
    pub shape: ResponseShape
  , /// Streaming: terminal chunk of the call
    #[serde(skip)]
    pub last_chunk: bool
  , /// Set on chunks injected to report a failed call
    #[serde(skip)]
    pub error: Option<String>
}

pub type ChatCompletionResponse = ChatResponse;
pub type ChatCompletionChunk = ChatResponse;

#[derive(Deserialize)]
struct RawResponse
{   #[serde(default)]
    id: String
  , #[serde(default)]
    object: String
  , #[serde(default)]
    created: u64
  , #[serde(default)]
    model: String
  , #[serde(default, deserialize_with = "nullable")]
    system_fingerprint: String
  , choices: Option<Vec<Choice>>
  , #[serde(default)]
    usage: Option<Usage>
}

impl ChatResponse
{   /// Parse one JSON document as the given shape.
    ///
    /// Malformed JSON is a `ParseError`. A missing `choices` array or a
    /// choice without the body its shape requires is a content error, as
    /// is a whole response with zero choices. Chunks may have zero choices
    /// (trailing usage-only chunks).
    pub fn parse(
      bytes: &[u8]
    , shape: ResponseShape
    ) -> Result<ChatResponse, Error>
    {   let raw: RawResponse = serde_json::from_slice(bytes)
          .map_err(|e| {
            debug!("Response JSON rejected: {}", e);
            Error::ParseError(e.to_string())
          })?;

        let mut choices = raw.choices
          .ok_or(Error::MissingField("choices"))?;

        if shape == ResponseShape::Message && choices.is_empty()
        {   return Err(Error::NoChoicesInResponse);
        }

        for choice in choices.iter_mut()
        {   match shape
            {   ResponseShape::Message => {
                  if choice.message.is_none()
                  {   return Err(Error::MissingField("message"));
                  }
                  choice.delta = None;
                }
              , ResponseShape::Delta => {
                  if choice.delta.is_none()
                  {   return Err(Error::MissingField("delta"));
                  }
                  choice.message = None;
                }
            }
            if choice.finish_reason.as_deref() == Some("")
            {   choice.finish_reason = None;
            }
        }

        trace!("Parsed {:?} with {} choices", shape, choices.len());
        Ok(ChatResponse
        {   id: raw.id
          , object: raw.object
          , created: raw.created
          , model: raw.model
          , system_fingerprint: raw.system_fingerprint
          , choices
          , usage: raw.usage
          , shape
          , last_chunk: false
          , error: None
        })
    }

    /// Terminal chunk reporting a failure to a streaming consumer
    pub fn error_chunk(message: impl Into<String>) -> Self
    {   ChatResponse
        {   object: "chat.completion.chunk".to_string()
          , shape: ResponseShape::Delta
          , last_chunk: true
          , error: Some(message.into())
          , ..ChatResponse::default()
        }
    }

    pub fn is_stream(&self) -> bool
    {   self.shape == ResponseShape::Delta
    }

    pub fn is_error(&self) -> bool
    {   self.error.is_some()
    }

    pub fn first_choice(&self) -> Option<&Choice>
    {   self.choices.first()
    }

    /// Text of the first choice
    pub fn content(&self) -> Option<&str>
    {   self.first_choice()
          .and_then(Choice::body)
          .map(|m| m.content.as_str())
    }

    /// Tool calls carried by the first choice
    pub fn tool_calls(&self) -> &[ToolCall]
    {   self.first_choice()
          .and_then(Choice::body)
          .map(|m| m.tool_calls.as_slice())
          .unwrap_or(&[])
    }

    pub fn finish_reason(&self) -> Option<&str>
    {   self.first_choice()
          .and_then(|c| c.finish_reason.as_deref())
    }
}
