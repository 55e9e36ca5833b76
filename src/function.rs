//! Function registry and the executor the orchestrator dispatches
//! tool calls to

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use futures_util::future::BoxFuture;
use log::{debug, error, trace};
use crate::error::Error;
use crate::request::{FunctionDefinition, Tool};

/// Outcome of one function invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionResult
{   pub name: String
  , /// JSON or plain text handed back to the model
    pub result: String
  , pub success: bool
  , pub error_message: String
}

impl FunctionResult
{   pub fn ok(
      name: impl Into<String>
    , result: impl Into<String>
    ) -> Self
    {   FunctionResult
        {   name: name.into()
          , result: result.into()
          , success: true
          , error_message: String::new()
        }
    }

    pub fn failure(
      name: impl Into<String>
    , error_message: impl Into<String>
    ) -> Self
    {   FunctionResult
        {   name: name.into()
          , result: String::new()
          , success: false
          , error_message: error_message.into()
        }
    }

    /// Text for the tool message: the result, or the error on failure
    pub fn content(&self) -> &str
    {   if self.success
        {   &self.result
        } else
        {   &self.error_message
        }
    }
}

/// Handler receiving the raw JSON arguments of a call
pub type FunctionHandler
  = Arc<dyn Fn(&str) -> FunctionResult + Send + Sync>;

/// Runs tool calls for the orchestrator.
///
/// `submit` is the completion-based form used for dispatch; its error is
/// reserved for the executor itself failing (a handler panic), which
/// aborts the call. Unknown functions and handler failures come back as
/// an unsuccessful `FunctionResult` instead.
pub trait FunctionExecutor: Send + Sync + 'static
{   /// Tool definitions sent with requests that allow tools
    fn tools(&self) -> Vec<Tool>;

    fn has_function(&self, name: &str) -> bool;

    /// Run a call on the current thread
    fn execute(&self, name: &str, arguments: &str) -> FunctionResult;

    /// Run a call on the blocking pool and resolve when it is done
    fn submit(
      self: Arc<Self>
    , name: String
    , arguments: String
    ) -> BoxFuture<'static, Result<FunctionResult, Error>>
    {   run_blocking(self, name, arguments)
    }
}

/// `execute` on the blocking pool; a panicking handler fails the dispatch
fn run_blocking<E>(
  executor: Arc<E>
, name: String
, arguments: String
) -> BoxFuture<'static, Result<FunctionResult, Error>>
where
    E: FunctionExecutor + ?Sized,
{   Box::pin(async move {
      tokio::task::spawn_blocking(move || {
        executor.execute(&name, &arguments)
      })
      .await
      .map_err(|e| {
        error!("Function task failed: {}", e);
        Error::DispatchFailed(e.to_string())
      })
    })
}

struct Registered
{   definition: FunctionDefinition
  , handler: FunctionHandler
}

/// Name-keyed registry of functions and their handlers
#[derive(Default)]
pub struct FunctionManager
{   functions: RwLock<BTreeMap<String, Registered>>
}

impl std::fmt::Debug for FunctionManager
{   fn fmt(&self, f: &mut std::fmt::Formatter<'_>)
      -> std::fmt::Result
    {   f.debug_struct("FunctionManager")
          .field("functions", &self.names())
          .finish()
    }
}

impl FunctionManager
{   pub fn new() -> Self
    {   FunctionManager::default()
    }

    /// Returns false if a function of that name is registered already
    pub fn register_function<F>(
      &self
    , definition: FunctionDefinition
    , handler: F
    ) -> bool
    where
        F: Fn(&str) -> FunctionResult + Send + Sync + 'static,
    {   let mut functions = self.functions.write()
          .unwrap_or_else(PoisonError::into_inner);
        if functions.contains_key(&definition.name)
        {   debug!("Function already registered: {}", definition.name);
            return false;
        }
        debug!("Registering function: {}", definition.name);
        functions.insert(
          definition.name.clone(),
          Registered
          {   definition
            , handler: Arc::new(handler)
          }
        );
        true
    }

    pub fn get_functions(&self) -> Vec<Tool>
    {   self.functions.read()
          .unwrap_or_else(PoisonError::into_inner)
          .values()
          .map(|r| Tool::from(r.definition.clone()))
          .collect()
    }

    pub fn names(&self) -> Vec<String>
    {   self.functions.read()
          .unwrap_or_else(PoisonError::into_inner)
          .keys()
          .cloned()
          .collect()
    }

    pub fn len(&self) -> usize
    {   self.functions.read()
          .unwrap_or_else(PoisonError::into_inner)
          .len()
    }

    pub fn is_empty(&self) -> bool
    {   self.len() == 0
    }

    pub fn clear_functions(&self)
    {   debug!("Clearing registered functions");
        self.functions.write()
          .unwrap_or_else(PoisonError::into_inner)
          .clear();
    }

    fn handler(&self, name: &str) -> Option<FunctionHandler>
    {   self.functions.read()
          .unwrap_or_else(PoisonError::into_inner)
          .get(name)
          .map(|r| r.handler.clone())
    }
}

impl FunctionExecutor for FunctionManager
{   fn tools(&self) -> Vec<Tool>
    {   self.get_functions()
    }

    fn has_function(&self, name: &str) -> bool
    {   self.functions.read()
          .unwrap_or_else(PoisonError::into_inner)
          .contains_key(name)
    }

    fn execute(&self, name: &str, arguments: &str) -> FunctionResult
    {   let Some(handler) = self.handler(name) else
        {   debug!("Function not found: {}", name);
            return FunctionResult::failure(
              name,
              format!("Function not found: {}", name)
            );
        };

        trace!("Calling {} with {}", name, arguments);
        let mut result = handler(arguments);
        result.name = name.to_string();
        if !result.success && result.error_message.is_empty()
        {   result.error_message =
              format!("Function {} execution error.", name);
        }
        result
    }

    fn submit(
      self: Arc<Self>
    , name: String
    , arguments: String
    ) -> BoxFuture<'static, Result<FunctionResult, Error>>
    {   if !self.has_function(&name)
        {   let result = self.execute(&name, &arguments);
            return Box::pin(async move { Ok(result) });
        }
        run_blocking(self, name, arguments)
    }
}
