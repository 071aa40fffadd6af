use crate::config::types::Result;
use crate::core::types::RunCommand;
use crate::judge::adapter::{LanguageAdapter, PrepareContext};
use crate::judge::dependency::Dependency;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct RubyAdapter;

impl LanguageAdapter for RubyAdapter {
    fn language(&self) -> &'static str {
        "ruby"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["rb"]
    }

    fn extension(&self) -> &'static str {
        "rb"
    }

    fn toolchain(&self) -> &'static [&'static str] {
        &["ruby"]
    }

    /// Gems go to a private `GEM_HOME`; local paths land on `RUBYLIB`.
    fn install_dependencies(&self, ctx: &PrepareContext<'_>, deps: &[Dependency]) -> Result<()> {
        let gems = ctx.workspace.create_dir(Path::new(".gems"))?;
        let libs = ctx.workspace.create_dir(Path::new(".deps"))?;
        let mut packages = Vec::new();
        for dep in deps {
            match dep {
                // gem hands anything after `--` to extconf, so the
                // specifier itself must not look like an option.
                Dependency::Registry(name) => {
                    dep.check_format()?;
                    packages.push(name.clone());
                }
                Dependency::LocalPath(path) => {
                    ctx.stage_local(path, &libs)?;
                }
            }
        }
        if packages.is_empty() {
            return Ok(());
        }

        let mut argv = vec![
            "gem".to_string(),
            "install".to_string(),
            "--no-document".to_string(),
            "--install-dir".to_string(),
            gems.to_string_lossy().into_owned(),
        ];
        argv.extend(packages);
        ctx.run_installer(RunCommand::new(argv, ctx.workspace.path()))
    }

    fn build_run_command(&self, ctx: &PrepareContext<'_>, source: &Path) -> Result<RunCommand> {
        let gems = ctx.workspace.path().join(".gems");
        Ok(RunCommand::new(
            ["ruby".to_string(), source.to_string_lossy().into_owned()],
            ctx.workspace.path(),
        )
        .env("GEM_HOME", gems.to_string_lossy())
        .env("GEM_PATH", gems.to_string_lossy())
        .env("RUBYLIB", ctx.workspace.deps_dir().to_string_lossy()))
    }
}
