//! Tool dispatch: the built-in `terminal` tool plus discovered skills.

use std::collections::HashMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::llm::{ToolCall, ToolDef};
use crate::skills::Skill;
use crate::tools::terminal::{TerminalTool, ToolFailure, TERMINAL_TOOL};

pub struct ToolExecutor {
    terminal: TerminalTool,
    skills: HashMap<String, Skill>,
}

impl ToolExecutor {
    pub fn new(working_dir: PathBuf, skills: Vec<Skill>) -> Self {
        Self {
            terminal: TerminalTool::new(working_dir),
            skills: skills.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    /// Tool definitions for the model: `terminal` always, one per skill.
    pub fn definitions(&self) -> Vec<ToolDef> {
        let mut defs = vec![TerminalTool::definition()];
        let mut names: Vec<_> = self.skills.keys().collect();
        names.sort();
        for name in names {
            let skill = &self.skills[name];
            defs.push(ToolDef {
                name: skill.name.clone(),
                description: skill.description.clone(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            });
        }
        defs
    }

    /// Console label for a call: the resolved command line for `terminal`,
    /// `tool: name(args)` for everything else.
    pub fn display_label(&self, call: &ToolCall) -> String {
        if call.name == TERMINAL_TOOL {
            match parse_command(&call.arguments) {
                Some(command) => self.terminal.resolved_command(&command),
                None => call.arguments.clone(),
            }
        } else {
            format!("tool: {}({})", call.name, call.arguments)
        }
    }

    pub async fn execute(
        &self,
        ctx: &CancellationToken,
        call: &ToolCall,
    ) -> Result<String, ToolFailure> {
        if call.name == TERMINAL_TOOL {
            let command = parse_command(&call.arguments).ok_or_else(|| ToolFailure {
                error: "terminal tool requires command".to_string(),
                output: String::new(),
            })?;
            return self.terminal.execute(ctx, &command).await;
        }

        if let Some(skill) = self.skills.get(&call.name) {
            return Ok(format!("[skill: {}]\n{}", skill.name, skill.body));
        }

        Err(ToolFailure {
            error: format!("unknown tool: {}", call.name),
            output: String::new(),
        })
    }
}

/// Extract the command string from tool arguments: a JSON object with a
/// `command` field first, then a bare JSON string treated as the command.
fn parse_command(arguments: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(arguments) {
        if let Some(command) = value.get("command").and_then(|v| v.as_str()) {
            if !command.trim().is_empty() {
                return Some(command.to_string());
            }
            return None;
        }
        if let Some(command) = value.as_str() {
            if !command.trim().is_empty() {
                return Some(command.to_string());
            }
        }
    }
    None
}
