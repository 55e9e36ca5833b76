//! Request-side types for the OpenAI-compatible chat completion API

use std::collections::{BTreeMap, HashSet};
use serde::{Deserialize, Deserializer, Serialize};
use log::trace;

pub const DEFAULT_MODEL: &str = "deepseek-chat";
const DEFAULT_MAX_TOKENS: u32 = 4096;

// ===== Messages =====

/// Author of a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role
{   System
  , #[default]
    User
  , Assistant
  , Tool
}

/// One message of a conversation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message
{   pub role: Role
  , #[serde(default)]
    pub content: String
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>
  , /// Assistant only: continue from this content
    #[serde(default, skip_serializing_if = "is_false")]
    pub prefix: bool
  , /// Assistant only: chain of thought returned by reasoning models
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>
  , /// Assistant only: calls the model asked us to run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>
  , /// Tool only: id of the call this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>
}

impl Message
{   pub fn new(role: Role, content: impl Into<String>) -> Self
    {   Message
        {   role
          , content: content.into()
          , ..Message::default()
        }
    }

    pub fn system(content: impl Into<String>) -> Self
    {   Message::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self
    {   Message::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self
    {   Message::new(Role::Assistant, content)
    }

    /// Assistant turn that carries tool calls and no text
    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self
    {   Message
        {   role: Role::Assistant
          , tool_calls: calls
          , ..Message::default()
        }
    }

    /// Reply to the tool call `tool_call_id`
    pub fn tool(
      tool_call_id: impl Into<String>
    , content: impl Into<String>
    ) -> Self
    {   Message
        {   role: Role::Tool
          , content: content.into()
          , tool_call_id: Some(tool_call_id.into())
          , ..Message::default()
        }
    }
}

// ===== Tool definitions =====

/// Schema of one function parameter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterProperty
{   #[serde(rename = "type")]
    pub kind: String
  , #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String
  , #[serde(
      rename = "enum",
      default,
      skip_serializing_if = "Vec::is_empty"
    )]
    pub enum_values: Vec<String>
  , #[serde(
      rename = "default",
      default,
      skip_serializing_if = "Option::is_none"
    )]
    pub default_value: Option<String>
}

impl ParameterProperty
{   pub fn new(
      kind: impl Into<String>
    , description: impl Into<String>
    ) -> Self
    {   ParameterProperty
        {   kind: kind.into()
          , description: description.into()
          , ..ParameterProperty::default()
        }
    }
}

/// JSON-schema shaped parameter list, always of type object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParametersSchema
{   #[serde(rename = "type")]
    pub kind: String
  , pub properties: BTreeMap<String, ParameterProperty>
  , #[serde(default)]
    pub required: Vec<String>
}

impl Default for ParametersSchema
{   fn default() -> Self
    {   ParametersSchema
        {   kind: "object".to_string()
          , properties: BTreeMap::new()
          , required: vec![]
        }
    }
}

/// A function the model may call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition
{   pub name: String
  , pub description: String
  , pub parameters: ParametersSchema
}

impl FunctionDefinition
{   pub fn new(
      name: impl Into<String>
    , description: impl Into<String>
    ) -> Self
    {   FunctionDefinition
        {   name: name.into()
          , description: description.into()
          , parameters: ParametersSchema::default()
        }
    }

    /// Returns false if a parameter of that name exists already
    pub fn add_parameter(
      &mut self
    , name: impl Into<String>
    , property: ParameterProperty
    , required: bool
    ) -> bool
    {   let name = name.into();
        if self.parameters.properties.contains_key(&name)
        {   return false;
        }
        if required
        {   self.parameters.required.push(name.clone());
        }
        self.parameters.properties.insert(name, property);
        true
    }
}

/// Tool entry of the `tools` request field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool
{   #[serde(rename = "type")]
    pub kind: String
  , pub function: FunctionDefinition
}

impl From<FunctionDefinition> for Tool
{   fn from(function: FunctionDefinition) -> Self
    {   Tool
        {   kind: "function".to_string()
          , function
        }
    }
}

// ===== Tool calls =====

/// Name and raw JSON arguments of a requested call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionCall
{   #[serde(deserialize_with = "nullable")]
    pub name: String
  , #[serde(deserialize_with = "nullable")]
    pub arguments: String
}

/// A model-requested invocation of a registered function
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCall
{   #[serde(deserialize_with = "nullable")]
    pub id: String
  , #[serde(rename = "type", deserialize_with = "nullable")]
    pub kind: String
  , pub function: FunctionCall
  , /// Correlates streamed fragments, never sent back
    #[serde(skip_serializing)]
    pub index: u32
}

impl ToolCall
{   pub fn new(
      id: impl Into<String>
    , name: impl Into<String>
    , arguments: impl Into<String>
    ) -> Self
    {   ToolCall
        {   id: id.into()
          , kind: "function".to_string()
          , function: FunctionCall
            {   name: name.into()
              , arguments: arguments.into()
            }
          , index: 0
        }
    }
}

// ===== Request =====

/// Whether and how the model may call tools
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice
{   #[default]
    None
  , Auto
  , Required
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat
{   #[default]
    Text
  , JsonObject
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions
{   pub include_usage: bool
}

/// Chat completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest
{   pub messages: Vec<Message>
  , pub model: String
  , pub frequency_penalty: f64
  , pub max_tokens: Option<u32>
  , pub presence_penalty: f64
  , pub response_format: ResponseFormat
  , pub stop: Vec<String>
  , pub stream: bool
  , pub stream_options: Option<StreamOptions>
  , pub temperature: f64
  , pub top_p: f64
  , /// Sent alongside registered functions unless tool_choice is none
    pub tools: Vec<Tool>
  , pub tool_choice: ToolChoice
  , pub logprobs: bool
  , pub top_logprobs: Option<u32>
}

impl Default for ChatCompletionRequest
{   fn default() -> Self
    {   ChatCompletionRequest
        {   messages: vec![]
          , model: DEFAULT_MODEL.to_string()
          , frequency_penalty: 0.0
          , max_tokens: Some(DEFAULT_MAX_TOKENS)
          , presence_penalty: 0.0
          , response_format: ResponseFormat::Text
          , stop: vec![]
          , stream: false
          , stream_options: None
          , temperature: 1.0
          , top_p: 1.0
          , tools: vec![]
          , tool_choice: ToolChoice::None
          , logprobs: false
          , top_logprobs: None
        }
    }
}

/// Borrowed wire shape, omits fields left at their defaults
#[derive(Serialize)]
struct WireRequest<'a>
{   messages: &'a [Message]
  , model: &'a str
  , frequency_penalty: f64
  , #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>
  , presence_penalty: f64
  , #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>
  , #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String]
  , #[serde(skip_serializing_if = "is_false")]
    stream: bool
  , #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>
  , temperature: f64
  , top_p: f64
  , #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<&'a Tool>>
  , #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>
  , #[serde(skip_serializing_if = "is_false")]
    logprobs: bool
  , #[serde(skip_serializing_if = "Option::is_none")]
    top_logprobs: Option<u32>
}

impl ChatCompletionRequest
{   pub fn new(model: impl Into<String>) -> Self
    {   ChatCompletionRequest
        {   model: model.into()
          , ..ChatCompletionRequest::default()
        }
    }

    pub fn with_message(mut self, message: Message) -> Self
    {   self.messages.push(message);
        self
    }

    pub fn tools_enabled(&self) -> bool
    {   self.tool_choice != ToolChoice::None
    }

    /// Serialize to the JSON body. `registered` tools are appended
    /// after the request's own tools, skipping duplicate names.
    /// Nothing tool related is sent when tool_choice is none.
    pub fn to_json(
      &self
    , registered: &[Tool]
    ) -> Result<String, crate::error::Error>
    {   let tools = if self.tools_enabled()
        {   let mut names = HashSet::new();
            let tools: Vec<&Tool> = self.tools
              .iter()
              .chain(registered.iter())
              .filter(|t| names.insert(t.function.name.as_str()))
              .collect();
            if tools.is_empty() { None } else { Some(tools) }
        } else
        {   None
        };

        let wire = WireRequest
        {   messages: &self.messages
          , model: &self.model
          , frequency_penalty: self.frequency_penalty
          , max_tokens: self.max_tokens
          , presence_penalty: self.presence_penalty
          , response_format: match self.response_format
            {   ResponseFormat::Text => None
              , format => Some(format)
            }
          , stop: &self.stop
          , stream: self.stream
          , stream_options: if self.stream
            {   self.stream_options
            } else
            {   None
            }
          , temperature: self.temperature
          , top_p: self.top_p
          , tool_choice: if self.tools_enabled()
            {   Some(self.tool_choice)
            } else
            {   None
            }
          , tools
          , logprobs: self.logprobs
          , top_logprobs: self.top_logprobs
        };

        let body = serde_json::to_string(&wire)?;
        trace!("Serialized request: {}", body);
        Ok(body)
    }

    /// Every tool message must answer a call emitted by an
    /// earlier assistant message.
    pub fn validate(&self) -> Result<(), crate::error::Error>
    {   let mut emitted: HashSet<&str> = HashSet::new();
        for (i, message) in self.messages.iter().enumerate()
        {   match message.role
            {   Role::Assistant => {
                  emitted.extend(
                    message.tool_calls.iter().map(|c| c.id.as_str())
                  );
                }
              , Role::Tool => {
                  let id = message.tool_call_id.as_deref()
                    .unwrap_or_default();
                  if !emitted.contains(id)
                  {   return Err(crate::error::Error::InvalidRequest(
                        format!(
                          "message {} answers unknown tool call '{}'",
                          i, id
                        )
                      ));
                  }
                }
              , _ => {}
            }
        }
        Ok(())
    }
}

fn is_false(b: &bool) -> bool
{   !*b
}

/// Treat an explicit JSON null like an absent field
pub(crate) fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{   Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
