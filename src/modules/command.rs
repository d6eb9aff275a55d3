//! Command module - Execute commands on the target host
//!
//! The command line is sent through the unit's [`Connection`], so the same
//! module works for every transport.

use async_trait::async_trait;
use serde_json::Value;

use super::{
    Diff, Module, ModuleArgs, ModuleCapabilities, ModuleContext, ModuleDoc, ModuleError,
    ModuleOutput, ModuleResult, ParamExt,
};
use crate::connection::{Connection, ExecuteOptions};

/// Module for executing commands
pub struct CommandModule;

impl CommandModule {
    fn command_line(args: &ModuleArgs) -> ModuleResult<String> {
        if let Some(argv) = args.get_vec_string("argv")? {
            if argv.is_empty() {
                return Err(ModuleError::InvalidParameter(
                    "argv cannot be empty".to_string(),
                ));
            }
            return Ok(argv
                .iter()
                .map(|arg| shell_quote(arg))
                .collect::<Vec<_>>()
                .join(" "));
        }

        let cmd = args.get_string_required("cmd")?;
        if cmd.trim().is_empty() {
            return Err(ModuleError::InvalidParameter(
                "cmd cannot be empty".to_string(),
            ));
        }
        Ok(cmd)
    }

    fn options(args: &ModuleArgs) -> ModuleResult<ExecuteOptions> {
        let mut options = ExecuteOptions::new();
        if let Some(chdir) = args.get_string("chdir")? {
            options = options.with_cwd(chdir);
        }
        if let Some(Value::Object(env)) = args.get("env") {
            for (key, value) in env {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                options = options.with_env(key.clone(), value);
            }
        }
        if let Some(timeout) = args.get_i64("timeout")? {
            let timeout = u64::try_from(timeout).map_err(|_| {
                ModuleError::InvalidParameter("timeout must be positive".to_string())
            })?;
            options = options.with_timeout(timeout);
        }
        Ok(options)
    }

    /// `creates`/`removes` guards; returns an unchanged output when the command should not run
    async fn check_guards(
        connection: &dyn Connection,
        args: &ModuleArgs,
    ) -> ModuleResult<Option<ModuleOutput>> {
        if let Some(creates) = args.get_string("creates")? {
            if path_exists(connection, &creates).await? {
                return Ok(Some(ModuleOutput::ok(format!(
                    "Skipped, '{}' exists",
                    creates
                ))));
            }
        }
        if let Some(removes) = args.get_string("removes")? {
            if !path_exists(connection, &removes).await? {
                return Ok(Some(ModuleOutput::ok(format!(
                    "Skipped, '{}' does not exist",
                    removes
                ))));
            }
        }
        Ok(None)
    }
}

async fn path_exists(connection: &dyn Connection, path: &str) -> ModuleResult<bool> {
    let result = connection
        .execute(&format!("test -e {}", shell_quote(path)), None)
        .await?;
    Ok(result.success)
}

fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[async_trait]
impl Module for CommandModule {
    fn name(&self) -> &'static str {
        "command"
    }

    fn description(&self) -> &'static str {
        "Execute commands on the target host"
    }

    fn capabilities(&self) -> ModuleCapabilities {
        ModuleCapabilities {
            check_mode: true,
            diff_mode: true,
        }
    }

    fn documentation(&self) -> ModuleDoc {
        let mut doc = ModuleDoc::new(self.name(), self.description())
            .option("cmd", false, "Command line to run")
            .option("argv", false, "Command as a list of arguments")
            .option("chdir", false, "Working directory")
            .option("env", false, "Extra environment variables")
            .option("creates", false, "Skip when this path exists")
            .option("removes", false, "Run only when this path exists")
            .option("timeout", false, "Seconds before the command is aborted");
        doc.capabilities = self.capabilities();
        doc
    }

    fn validate(&self, args: &ModuleArgs) -> ModuleResult<()> {
        if !args.contains_key("cmd") && !args.contains_key("argv") {
            return Err(ModuleError::MissingParameter(
                "Either 'cmd' or 'argv' must be provided".to_string(),
            ));
        }
        Ok(())
    }

    async fn run(
        &self,
        context: &ModuleContext,
        connection: &dyn Connection,
        args: &ModuleArgs,
    ) -> ModuleResult<ModuleOutput> {
        if let Some(output) = Self::check_guards(connection, args).await? {
            return Ok(output);
        }

        let command = Self::command_line(args)?;

        if context.check_mode {
            let mut output = ModuleOutput::changed(format!("Would execute: {}", command));
            if context.diff_mode {
                output = output.with_diff(Diff::new("(none)", format!("Execute: {}", command)));
            }
            return Ok(output);
        }

        let options = Self::options(args)?;
        let result = connection.execute(&command, Some(options)).await?;

        let output = if result.success {
            ModuleOutput::changed(format!("Command '{}' executed successfully", command))
        } else {
            let detail = if result.stderr.trim().is_empty() {
                result.stdout.trim()
            } else {
                result.stderr.trim()
            };
            ModuleOutput::failed(format!(
                "Command '{}' failed with exit code {}: {}",
                command, result.exit_code, detail
            ))
        };

        Ok(output.with_command_output(
            Some(result.stdout),
            Some(result.stderr),
            Some(result.exit_code),
        ))
    }
}
