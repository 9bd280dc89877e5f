//! Shared fakes for the engine tests: a command executor that records
//! instead of spawning, and a firewall backend that records anchor calls.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use crate::{
    firewall::{AnchorFamily, AnchorTable, FirewallBackend},
    shell::{CommandExecutor, CommandOutput, ShellError},
};

#[derive(Default)]
pub(crate) struct RecordingExecutor {
    commands: Mutex<Vec<String>>,
    responses: Mutex<HashMap<String, CommandOutput>>,
}

impl RecordingExecutor {
    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Canned output for a specific command; everything else succeeds
    /// with empty output.
    pub(crate) fn respond(&self, command: &str, output: CommandOutput) {
        self.responses
            .lock()
            .unwrap()
            .insert(command.to_string(), output);
    }
}

impl CommandExecutor for RecordingExecutor {
    fn execute(&self, command: &str) -> Result<CommandOutput, ShellError> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(command)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub(crate) struct RecordingFirewall {
    calls: Mutex<Vec<String>>,
}

impl RecordingFirewall {
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl FirewallBackend for RecordingFirewall {
    fn set_anchor_enabled(
        &self,
        _family: AnchorFamily,
        name: &str,
        enabled: bool,
        table: AnchorTable,
    ) {
        let verb = if enabled { "enable" } else { "disable" };
        self.calls
            .lock()
            .unwrap()
            .push(format!("{verb} {} {name}", table.name()));
    }

    fn replace_anchor(
        &self,
        _family: AnchorFamily,
        name: &str,
        rules: &[String],
        table: AnchorTable,
    ) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("replace {} {name} [{}]", table.name(), rules.join(", ")));
    }
}
