use crate::config::types::Result;
use crate::core::limits::ResourceLimits;
use crate::core::types::RunCommand;
use crate::judge::adapter::{LanguageAdapter, PrepareContext};
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct JavaAdapter;

const DEFAULT_CLASS: &str = "Main";

/// Name of the first `public class`, or `Main`. javac requires the file to
/// be named after it.
pub fn detect_public_class(source: &str) -> String {
    for line in source.lines() {
        let mut tokens = line.split(|c: char| c.is_whitespace() || c == '{').filter(|t| !t.is_empty());
        let mut saw_public = false;
        while let Some(token) = tokens.next() {
            match token {
                "public" => saw_public = true,
                "final" | "abstract" | "static" | "strictfp" if saw_public => {}
                "class" if saw_public => {
                    // `Box<T>` and `Box<K, V>` are named `Box`.
                    let name = tokens.next().map(|n| n.split('<').next().unwrap_or(n));
                    if let Some(name) = name.filter(|n| is_java_identifier(n)) {
                        return name.to_string();
                    }
                    break;
                }
                _ => break,
            }
        }
    }
    DEFAULT_CLASS.to_string()
}

fn is_java_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

impl LanguageAdapter for JavaAdapter {
    fn language(&self) -> &'static str {
        "java"
    }

    fn extension(&self) -> &'static str {
        "java"
    }

    fn toolchain(&self) -> &'static [&'static str] {
        &["javac", "java"]
    }

    fn source_file_name(&self, source: &str) -> String {
        format!("{}.java", detect_public_class(source))
    }

    fn build_run_command(&self, ctx: &PrepareContext<'_>, source: &Path) -> Result<RunCommand> {
        let classes = ctx.workspace.create_dir(Path::new("classes"))?;
        let classes = classes.to_string_lossy().into_owned();
        let class_name = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_CLASS.to_string());

        ctx.run_compiler(RunCommand::new(
            [
                "javac".to_string(),
                "-encoding".to_string(),
                "UTF-8".to_string(),
                "-J-Xmx512m".to_string(),
                "-d".to_string(),
                classes.clone(),
                source.to_string_lossy().into_owned(),
            ],
            ctx.workspace.path(),
        ))?;

        Ok(RunCommand::new(
            [
                "java".to_string(),
                "-Xmx256m".to_string(),
                "-Xss1m".to_string(),
                "-XX:+UseSerialGC".to_string(),
                "-Dfile.encoding=UTF-8".to_string(),
                "-cp".to_string(),
                classes,
                class_name,
            ],
            ctx.workspace.path(),
        ))
    }

    /// The JVM maps a large heap and starts a dozen threads before `main`.
    fn run_limits(&self, limits: ResourceLimits) -> ResourceLimits {
        limits.with_floors(1024 * 1024 * 1024, 256)
    }
}
