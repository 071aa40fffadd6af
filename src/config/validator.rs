// Startup validation of runner settings.
// Errors are fatal; warnings are logged and startup continues.

use crate::config::settings::{RunnerConfig, SandboxMode};
use crate::config::types::{ExecutionError, Result};
use log::warn;

#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate a runner config, failing on anything that would make the runner unusable.
pub fn validate_config(config: &RunnerConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::default();

    validate_capacity(config, &mut result);
    validate_limits(config, &mut result);
    validate_paths(config, &mut result);

    for warning in &result.warnings {
        warn!("config: {}", warning);
    }

    if !result.is_valid() {
        return Err(ExecutionError::Config(result.errors.join("; ")));
    }
    Ok(result)
}

fn validate_capacity(config: &RunnerConfig, result: &mut ValidationResult) {
    if config.max_concurrent == 0 {
        result.add_error("max_concurrent must be at least 1".to_string());
    }
    if config.max_source_bytes == 0 {
        result.add_error("max_source_bytes must be positive".to_string());
    }
    if config.max_output_bytes == 0 {
        result.add_error("max_output_bytes must be positive".to_string());
    }
    if config.max_queue > 0 && config.queue_wait_ms == 0 {
        result.add_warning("queue_wait_ms is 0; queued requests will be rejected immediately".to_string());
    }
}

fn validate_limits(config: &RunnerConfig, result: &mut ValidationResult) {
    if config.timeout_ms == 0 {
        result.add_error("timeout_ms must be positive".to_string());
    }
    if config.install_timeout_ms == 0 || config.compile_timeout_ms == 0 {
        result.add_error("install_timeout_ms and compile_timeout_ms must be positive".to_string());
    }
    if let Some(memory) = config.limits.memory_bytes {
        if memory < 16 * 1024 * 1024 {
            result.add_error(format!("memory limit {memory} bytes is below the 16 MiB floor"));
        }
    }
    if config.limits.max_processes == Some(0) {
        result.add_error("max_processes must be at least 1".to_string());
    }
    if config.limits.max_open_files.map_or(false, |n| n < 8) {
        result.add_error("max_open_files must allow at least 8 descriptors".to_string());
    }
    if config.kill_grace_ms > config.timeout_ms {
        result.add_warning(format!(
            "kill_grace_ms ({}) exceeds timeout_ms ({})",
            config.kill_grace_ms, config.timeout_ms
        ));
    }
    for (language, overrides) in &config.languages {
        if overrides.timeout_ms == Some(0) {
            result.add_error(format!("languages.{language}.timeout_ms must be positive"));
        }
    }
}

fn validate_paths(config: &RunnerConfig, result: &mut ValidationResult) {
    if !config.scratch_root.is_absolute() {
        result.add_error(format!(
            "scratch_root must be absolute: {}",
            config.scratch_root.display()
        ));
    }
    for root in &config.local_dependency_roots {
        if !root.is_absolute() {
            result.add_error(format!(
                "local dependency root must be absolute: {}",
                root.display()
            ));
        }
    }
    for system in &config.sandbox.system_paths {
        if !system.is_absolute() {
            result.add_error(format!("system path must be absolute: {}", system.display()));
        } else if system.parent().is_none() {
            result.add_error("system paths cannot include the filesystem root".to_string());
        } else if config.scratch_root.starts_with(system) {
            result.add_warning(format!(
                "scratch_root {} lies inside system path {}",
                config.scratch_root.display(),
                system.display()
            ));
        }
    }
    if config.sandbox.run_as_uid == 0 || config.sandbox.run_as_gid == 0 {
        result.add_error("run_as_uid and run_as_gid must not be 0".to_string());
    }
    if config.sandbox.mode == SandboxMode::Permissive
        && !config.sandbox.isolate_network
        && !config.sandbox.isolate_filesystem
    {
        result.add_warning("sandbox isolation is fully disabled".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let result = validate_config(&RunnerConfig::default()).expect("valid");
        assert!(result.is_valid());
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let config = RunnerConfig {
            max_concurrent: 0,
            ..RunnerConfig::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("max_concurrent"));
    }

    #[test]
    fn test_relative_paths_are_rejected() {
        let mut config = RunnerConfig::default();
        config.scratch_root = "scratch".into();
        config.sandbox.system_paths.push("relative".into());
        let err = validate_config(&config).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("scratch_root"));
        assert!(message.contains("system path"));
    }

    #[test]
    fn test_root_sandbox_identity_is_rejected() {
        let mut config = RunnerConfig::default();
        config.sandbox.run_as_uid = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("run_as_uid"));
    }
}
