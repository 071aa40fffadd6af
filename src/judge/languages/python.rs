use crate::config::types::Result;
use crate::core::types::RunCommand;
use crate::judge::adapter::{LanguageAdapter, PrepareContext};
use crate::judge::dependency::Dependency;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct PythonAdapter;

impl LanguageAdapter for PythonAdapter {
    fn language(&self) -> &'static str {
        "python"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["py", "python3"]
    }

    fn extension(&self) -> &'static str {
        "py"
    }

    fn toolchain(&self) -> &'static [&'static str] {
        &["python3"]
    }

    /// Registry packages go through `pip --target`; local paths are copied
    /// next to them. Both end up on `PYTHONPATH`.
    fn install_dependencies(&self, ctx: &PrepareContext<'_>, deps: &[Dependency]) -> Result<()> {
        let target = ctx.workspace.create_dir(Path::new(".deps"))?;
        let mut packages = Vec::new();
        for dep in deps {
            match dep {
                Dependency::Registry(name) => {
                    dep.check_format()?;
                    packages.push(name.clone());
                }
                Dependency::LocalPath(path) => {
                    ctx.stage_local(path, &target)?;
                }
            }
        }
        if packages.is_empty() {
            return Ok(());
        }

        ctx.run_installer(
            RunCommand::new(pip_install_argv(&target, packages), ctx.workspace.path())
                .env("PYTHONNOUSERSITE", "1"),
        )
    }

    fn build_run_command(&self, ctx: &PrepareContext<'_>, source: &Path) -> Result<RunCommand> {
        Ok(RunCommand::new(
            ["python3".to_string(), "-u".to_string(), source.to_string_lossy().into_owned()],
            ctx.workspace.path(),
        )
        .env("PYTHONPATH", ctx.workspace.deps_dir().to_string_lossy())
        .env("PYTHONDONTWRITEBYTECODE", "1")
        .env("PYTHONNOUSERSITE", "1")
        .env("PYTHONIOENCODING", "utf-8"))
    }
}

/// `--` ends pip's option parsing so no package name is read as a flag.
fn pip_install_argv(target: &Path, packages: Vec<String>) -> Vec<String> {
    let mut argv = vec![
        "python3".to_string(),
        "-m".to_string(),
        "pip".to_string(),
        "install".to_string(),
        "--disable-pip-version-check".to_string(),
        "--no-input".to_string(),
        "--no-cache-dir".to_string(),
        "--target".to_string(),
        target.to_string_lossy().into_owned(),
        "--".to_string(),
    ];
    argv.extend(packages);
    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packages_follow_option_terminator() {
        let argv = pip_install_argv(Path::new("/ws/.deps"), vec!["requests".into(), "six==1.16.0".into()]);
        let split = argv.iter().position(|a| a == "--").expect("terminator");
        assert_eq!(&argv[split + 1..], ["requests", "six==1.16.0"]);
        assert_eq!(argv[split - 1], "/ws/.deps");
    }
}
