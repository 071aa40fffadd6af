use crate::config::types::Result;
use crate::core::limits::ResourceLimits;
use crate::core::types::RunCommand;
use crate::judge::adapter::{LanguageAdapter, PrepareContext};
use crate::judge::dependency::Dependency;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct JavaScriptAdapter;

impl LanguageAdapter for JavaScriptAdapter {
    fn language(&self) -> &'static str {
        "javascript"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["js", "node", "nodejs"]
    }

    fn extension(&self) -> &'static str {
        "js"
    }

    fn toolchain(&self) -> &'static [&'static str] {
        &["node"]
    }

    /// npm installs into `<workspace>/node_modules`, which `require` finds
    /// from the program's directory. Install scripts are disabled.
    fn install_dependencies(&self, ctx: &PrepareContext<'_>, deps: &[Dependency]) -> Result<()> {
        let modules = ctx.workspace.create_dir(Path::new("node_modules"))?;
        let mut packages = Vec::new();
        for dep in deps {
            match dep {
                Dependency::Registry(name) => {
                    dep.check_format()?;
                    packages.push(name.clone());
                }
                Dependency::LocalPath(path) => {
                    ctx.stage_local(path, &modules)?;
                }
            }
        }
        if packages.is_empty() {
            return Ok(());
        }

        let workspace = ctx.workspace.path().to_string_lossy().into_owned();
        ctx.run_installer(
            RunCommand::new(npm_install_argv(&workspace, packages), ctx.workspace.path())
                .env("npm_config_cache", format!("{workspace}/.npm"))
                .env("npm_config_update_notifier", "false"),
        )
    }

    fn build_run_command(&self, ctx: &PrepareContext<'_>, source: &Path) -> Result<RunCommand> {
        Ok(RunCommand::new(
            ["node".to_string(), source.to_string_lossy().into_owned()],
            ctx.workspace.path(),
        ))
    }

    /// V8 reserves address space and worker threads up front.
    fn run_limits(&self, limits: ResourceLimits) -> ResourceLimits {
        limits.with_floors(512 * 1024 * 1024, 32)
    }
}

fn npm_install_argv(prefix: &str, packages: Vec<String>) -> Vec<String> {
    let mut argv = vec![
        "npm".to_string(),
        "install".to_string(),
        "--prefix".to_string(),
        prefix.to_string(),
        "--no-audit".to_string(),
        "--no-fund".to_string(),
        "--no-package-lock".to_string(),
        "--ignore-scripts".to_string(),
        "--omit=dev".to_string(),
        "--".to_string(),
    ];
    argv.extend(packages);
    argv
}
