use crate::config::types::Result;
use crate::core::types::RunCommand;
use crate::judge::adapter::{LanguageAdapter, PrepareContext};
use std::path::Path;

const BINARY_NAME: &str = "program";

/// Ahead-of-time compiled C and C++.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeAdapter {
    C,
    Cpp,
}

impl NativeAdapter {
    fn compiler(&self) -> &'static str {
        match self {
            NativeAdapter::C => "gcc",
            NativeAdapter::Cpp => "g++",
        }
    }

    fn compile_argv(&self, source: &Path, output: &Path) -> Vec<String> {
        let mut argv = vec![self.compiler().to_string()];
        match self {
            NativeAdapter::C => argv.extend(["-std=c11".to_string(), "-O2".to_string()]),
            NativeAdapter::Cpp => argv.extend(["-std=c++17".to_string(), "-O2".to_string()]),
        }
        argv.extend([
            "-pipe".to_string(),
            "-o".to_string(),
            output.to_string_lossy().into_owned(),
            source.to_string_lossy().into_owned(),
            "-lm".to_string(),
        ]);
        argv
    }
}

impl LanguageAdapter for NativeAdapter {
    fn language(&self) -> &'static str {
        match self {
            NativeAdapter::C => "c",
            NativeAdapter::Cpp => "cpp",
        }
    }

    fn aliases(&self) -> &'static [&'static str] {
        match self {
            NativeAdapter::C => &[],
            NativeAdapter::Cpp => &["c++", "cxx", "cc"],
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            NativeAdapter::C => "c",
            NativeAdapter::Cpp => "cpp",
        }
    }

    fn toolchain(&self) -> &'static [&'static str] {
        match self {
            NativeAdapter::C => &["gcc"],
            NativeAdapter::Cpp => &["g++"],
        }
    }

    fn build_run_command(&self, ctx: &PrepareContext<'_>, source: &Path) -> Result<RunCommand> {
        let binary = ctx.workspace.path().join(BINARY_NAME);
        ctx.run_compiler(RunCommand::new(
            self.compile_argv(source, &binary),
            ctx.workspace.path(),
        ))?;
        Ok(RunCommand::new(
            [binary.to_string_lossy().into_owned()],
            ctx.workspace.path(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_argv_links_libm_last() {
        let argv = NativeAdapter::C.compile_argv(Path::new("/ws/main.c"), Path::new("/ws/program"));
        assert_eq!(argv.first().map(String::as_str), Some("gcc"));
        assert_eq!(argv.last().map(String::as_str), Some("-lm"));
        assert!(argv.contains(&"/ws/main.c".to_string()));

        let argv = NativeAdapter::Cpp.compile_argv(Path::new("/ws/main.cpp"), Path::new("/ws/program"));
        assert_eq!(argv[0], "g++");
        assert!(argv.contains(&"-std=c++17".to_string()));
    }
}
