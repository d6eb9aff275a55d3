//! Debug module - Print debug messages and variable values
//!
//! Runs entirely on the control node; the connection is never used.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::{
    Module, ModuleArgs, ModuleCapabilities, ModuleContext, ModuleDoc, ModuleError, ModuleOutput,
    ModuleResult, ParamExt,
};
use crate::connection::Connection;
use crate::executor::condition::ConditionEvaluator;

/// Module for printing debug messages and variable values
pub struct DebugModule;

impl DebugModule {
    fn format_value(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            _ => serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
        }
    }
}

#[async_trait]
impl Module for DebugModule {
    fn name(&self) -> &'static str {
        "debug"
    }

    fn description(&self) -> &'static str {
        "Print debug messages or variable values"
    }

    fn capabilities(&self) -> ModuleCapabilities {
        ModuleCapabilities {
            check_mode: true,
            diff_mode: false,
        }
    }

    fn documentation(&self) -> ModuleDoc {
        let mut doc = ModuleDoc::new(self.name(), self.description())
            .option("msg", false, "Message to print")
            .option("var", false, "Variable or expression to print")
            .option("verbosity", false, "Minimum verbosity needed to print");
        doc.capabilities = self.capabilities();
        doc
    }

    fn validate(&self, args: &ModuleArgs) -> ModuleResult<()> {
        if args.contains_key("msg") && args.contains_key("var") {
            return Err(ModuleError::InvalidParameter(
                "Cannot specify both 'msg' and 'var' parameters".to_string(),
            ));
        }
        if let Some(var) = args.get("var") {
            if !var.is_string() {
                return Err(ModuleError::InvalidParameter(
                    "'var' parameter must be a string".to_string(),
                ));
            }
        }
        args.get_i64("verbosity")?;
        Ok(())
    }

    async fn run(
        &self,
        context: &ModuleContext,
        _connection: &dyn Connection,
        args: &ModuleArgs,
    ) -> ModuleResult<ModuleOutput> {
        let required_verbosity = args.get_i64("verbosity")?.unwrap_or(0);
        if i64::from(context.verbosity) < required_verbosity {
            return Ok(ModuleOutput::skipped("Skipped due to verbosity level")
                .with_data("skipped_reason", "verbosity"));
        }

        if let Some(var_name) = args.get_string("var")? {
            let evaluator = ConditionEvaluator::new(context.vars.clone());
            let value = evaluator
                .evaluate_value(&var_name)
                .map_err(|e| ModuleError::InvalidParameter(e.to_string()))?;
            let (message, value) = match value {
                Some(value) => (
                    format!("{}: {}", var_name, Self::format_value(&value)),
                    value,
                ),
                None => (
                    format!("{}: VARIABLE IS NOT DEFINED!", var_name),
                    Value::String("VARIABLE IS NOT DEFINED!".to_string()),
                ),
            };
            info!(host = %context.host, "{}", message);
            return Ok(ModuleOutput::ok(message).with_data(var_name, value));
        }

        let message = match args.get("msg") {
            Some(msg) => Self::format_value(msg),
            None => "Hello world!".to_string(),
        };
        info!(host = %context.host, "{}", message);
        Ok(ModuleOutput::ok(message.clone()).with_data("msg", message))
    }
}
