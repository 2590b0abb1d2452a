//! Remote command script for one Netkit host

use std::path::{Component, Path};

use crate::config::settings::DeploySettings;
use crate::utils::shell_quote;

/// A scripted remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCommand {
    pub command: String,

    /// Whether a failure aborts the deployment
    pub fatal: bool,
}

impl ScriptCommand {
    fn fatal(command: String) -> Self {
        Self {
            command,
            fatal: true,
        }
    }

    fn tolerated(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            fatal: false,
        }
    }
}

/// Commands run against a host, derived from where the archive unpacks on the remote side
#[derive(Debug, Clone)]
pub struct LabScript {
    /// Lab directory relative to the remote login directory
    lab_dir: String,

    /// Top level directory created by unpacking the archive
    rendered_top: String,

    /// Uploaded archive name
    archive: String,

    required_tools: Vec<String>,
    start_command: String,
    exit_command: String,
}

impl LabScript {
    pub fn new(lab_dir: &Path, archive: &str, settings: &DeploySettings) -> Self {
        let rendered_top = lab_dir
            .components()
            .find_map(|c| match c {
                Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
                _ => None,
            })
            .unwrap_or_default();

        Self {
            lab_dir: lab_dir.to_string_lossy().into_owned(),
            rendered_top,
            archive: archive.to_string(),
            required_tools: settings.required_tools.clone(),
            start_command: settings.start_command.clone(),
            exit_command: settings.exit_command.clone(),
        }
    }

    /// Halt and clean whatever lab ran before. Every step is tolerated.
    pub fn cleanup(&self) -> Vec<ScriptCommand> {
        vec![
            ScriptCommand::tolerated(format!("cd {}", shell_quote(&self.lab_dir))),
            ScriptCommand::tolerated("lhalt -q"),
            ScriptCommand::tolerated("lcrash -k"),
            ScriptCommand::tolerated("lclean"),
            ScriptCommand::tolerated("cd"),
        ]
    }

    /// Replace the rendered tree with the uploaded one and enter the lab directory
    pub fn extract(&self) -> Vec<ScriptCommand> {
        let mut commands = Vec::new();
        if !self.rendered_top.is_empty() {
            commands.push(ScriptCommand::fatal(format!(
                "rm -Rf {}",
                shell_quote(&self.rendered_top)
            )));
        }
        commands.push(ScriptCommand::fatal(format!(
            "tar -xzf {}",
            shell_quote(&self.archive)
        )));
        commands.push(ScriptCommand::fatal(format!(
            "cd {}",
            shell_quote(&self.lab_dir)
        )));
        commands.push(ScriptCommand::tolerated("vlist"));
        commands.push(ScriptCommand::tolerated("lclean"));
        commands
    }

    /// `(tool, command)` pairs checking each required tool is on PATH
    pub fn verify(&self) -> Vec<(String, String)> {
        self.required_tools
            .iter()
            .map(|tool| (tool.clone(), format!("command -v {}", shell_quote(tool))))
            .collect()
    }

    pub fn start(&self) -> &str {
        &self.start_command
    }

    /// Raw text that ends the interactive shell
    pub fn exit(&self) -> String {
        format!("{}\n", self.exit_command)
    }

    pub fn lab_dir(&self) -> &str {
        &self.lab_dir
    }
}
