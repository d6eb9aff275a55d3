//! Assert module - Fail task if conditions are not met
//!
//! Conditions use the same expression language as `when`, evaluated against
//! the unit's variables on the control node.

use async_trait::async_trait;
use serde_json::Value;

use super::{
    Module, ModuleArgs, ModuleCapabilities, ModuleContext, ModuleDoc, ModuleError, ModuleOutput,
    ModuleResult, ParamExt,
};
use crate::connection::Connection;
use crate::executor::condition::{Condition, ConditionEvaluator};

/// Module for asserting conditions are true
pub struct AssertModule;

impl AssertModule {
    fn conditions(args: &ModuleArgs) -> ModuleResult<Vec<String>> {
        match args.get("that") {
            Some(Value::String(s)) => Ok(vec![s.clone()]),
            Some(Value::Bool(b)) => Ok(vec![b.to_string()]),
            Some(Value::Array(items)) => Ok(items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()),
            Some(_) => Err(ModuleError::InvalidParameter(
                "'that' parameter must be a string or list of strings".to_string(),
            )),
            None => Err(ModuleError::MissingParameter("that".to_string())),
        }
    }
}

#[async_trait]
impl Module for AssertModule {
    fn name(&self) -> &'static str {
        "assert"
    }

    fn description(&self) -> &'static str {
        "Assert that given expressions are true"
    }

    fn required_params(&self) -> &[&'static str] {
        &["that"]
    }

    fn capabilities(&self) -> ModuleCapabilities {
        ModuleCapabilities {
            check_mode: true,
            diff_mode: false,
        }
    }

    fn documentation(&self) -> ModuleDoc {
        let mut doc = ModuleDoc::new(self.name(), self.description())
            .option("that", true, "Expressions that must all be true")
            .option("fail_msg", false, "Message used when an assertion fails")
            .option("success_msg", false, "Message used when all assertions pass")
            .option("quiet", false, "Suppress the list of evaluated expressions");
        doc.capabilities = self.capabilities();
        doc
    }

    fn validate(&self, args: &ModuleArgs) -> ModuleResult<()> {
        for condition in Self::conditions(args)? {
            ConditionEvaluator::parse(&condition)
                .map_err(|e| ModuleError::InvalidParameter(e.to_string()))?;
        }
        Ok(())
    }

    async fn run(
        &self,
        context: &ModuleContext,
        _connection: &dyn Connection,
        args: &ModuleArgs,
    ) -> ModuleResult<ModuleOutput> {
        let conditions = Self::conditions(args)?;
        let fail_msg = match args.get_string("fail_msg")? {
            Some(msg) => Some(msg),
            None => args.get_string("msg")?,
        };
        let success_msg = args.get_string("success_msg")?;
        let quiet = args.get_bool_or("quiet", false);

        let evaluator = ConditionEvaluator::new(context.vars.clone());
        for condition in &conditions {
            let passed = evaluator
                .evaluate_when(Some(&Condition::expr(condition.as_str())))
                .map_err(|e| ModuleError::ExecutionFailed(e.to_string()))?;
            if !passed {
                let message = fail_msg.unwrap_or_else(|| "Assertion failed".to_string());
                return Ok(ModuleOutput::failed(message)
                    .with_data("assertion", condition.clone())
                    .with_data("evaluated_to", false));
            }
        }

        let message = success_msg.unwrap_or_else(|| "All assertions passed".to_string());
        let mut output = ModuleOutput::ok(message);
        if !quiet {
            output = output.with_data(
                "evaluated",
                conditions.into_iter().map(Value::String).collect::<Vec<_>>(),
            );
        }
        Ok(output)
    }
}
