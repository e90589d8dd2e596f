//! Scripted command runner for tests.
//!
//! Answers every invocation from a closure instead of spawning the client,
//! and records what was asked of it.

use async_trait::async_trait;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use bwsync_common::{Error, Result};

use crate::runner::{CommandOutput, CommandRunner, Invocation};

type Responder = dyn Fn(&Invocation) -> CommandOutput + Send + Sync;

/// Arguments and environment of one recorded invocation, secrets exposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// A `CommandRunner` that replies with canned output.
pub struct ScriptedRunner {
    respond: Box<Responder>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedRunner {
    /// Create a runner answering with `respond`.
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&Invocation) -> CommandOutput + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// All invocations so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Subcommand of every invocation so far.
    pub fn subcommands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|call| call.args.first().cloned().unwrap_or_default())
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(RecordedCall {
            args: invocation.args().to_vec(),
            env: invocation
                .environment()
                .iter()
                .map(|(key, value)| (key.clone(), value.expose().to_string()))
                .collect(),
        });

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok((self.respond)(invocation))
    }
}
