use crate::config::types::Result;
use crate::core::types::RunCommand;
use crate::judge::adapter::{LanguageAdapter, PrepareContext};
use std::path::Path;

/// Interpreted languages that need nothing beyond `interpreter <file>`.
#[derive(Debug, Clone)]
pub struct ScriptAdapter {
    language: &'static str,
    aliases: &'static [&'static str],
    extension: &'static str,
    interpreter: &'static [&'static str],
}

impl ScriptAdapter {
    pub const fn php() -> Self {
        Self {
            language: "php",
            aliases: &[],
            extension: "php",
            interpreter: &["php"],
        }
    }

    pub const fn perl() -> Self {
        Self {
            language: "perl",
            aliases: &["pl"],
            extension: "pl",
            interpreter: &["perl"],
        }
    }
}

impl LanguageAdapter for ScriptAdapter {
    fn language(&self) -> &'static str {
        self.language
    }

    fn aliases(&self) -> &'static [&'static str] {
        self.aliases
    }

    fn extension(&self) -> &'static str {
        self.extension
    }

    fn toolchain(&self) -> &'static [&'static str] {
        let interpreter: &'static [&'static str] = self.interpreter;
        &interpreter[..1]
    }

    fn build_run_command(&self, ctx: &PrepareContext<'_>, source: &Path) -> Result<RunCommand> {
        let mut argv: Vec<String> = self.interpreter.iter().map(|s| s.to_string()).collect();
        argv.push(source.to_string_lossy().into_owned());
        Ok(RunCommand::new(argv, ctx.workspace.path()))
    }
}
