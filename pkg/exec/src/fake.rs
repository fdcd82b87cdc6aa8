//! A scripted stand-in for the host's tools.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::{CommandOutput, CommandRunner, command_line};

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn line(&self) -> String {
        command_line(&self.program, &self.args)
    }
}

type Responder = Box<dyn Fn(&Invocation) -> CommandOutput + Send + Sync>;

/// Records every invocation and answers it from a responder closure.
pub struct ScriptedRunner {
    calls: Mutex<Vec<Invocation>>,
    responder: Responder,
}

impl ScriptedRunner {
    pub fn new(responder: impl Fn(&Invocation) -> CommandOutput + Send + Sync + 'static) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        }
    }

    /// A runner on which every command succeeds with empty output.
    pub fn succeed_all() -> Self {
        Self::new(|_| CommandOutput::ok(""))
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Recorded calls rendered as command lines.
    pub fn lines(&self) -> Vec<String> {
        self.calls().iter().map(Invocation::line).collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String]) -> CommandOutput {
        let call = Invocation {
            program: program.to_string(),
            args: args.to_vec(),
        };
        let out = (self.responder)(&call);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        out
    }
}
