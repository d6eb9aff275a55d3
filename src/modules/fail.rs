//! Fail module - Fail the task with a custom message

use async_trait::async_trait;

use super::{
    Module, ModuleArgs, ModuleCapabilities, ModuleContext, ModuleOutput, ModuleResult, ParamExt,
};
use crate::connection::Connection;

const DEFAULT_MSG: &str = "Failed as requested from task";

/// Module that always fails
pub struct FailModule;

#[async_trait]
impl Module for FailModule {
    fn name(&self) -> &'static str {
        "fail"
    }

    fn description(&self) -> &'static str {
        "Fail with a custom message"
    }

    fn capabilities(&self) -> ModuleCapabilities {
        ModuleCapabilities {
            check_mode: true,
            diff_mode: false,
        }
    }

    async fn run(
        &self,
        _context: &ModuleContext,
        _connection: &dyn Connection,
        args: &ModuleArgs,
    ) -> ModuleResult<ModuleOutput> {
        let msg = args
            .get_string("msg")?
            .unwrap_or_else(|| DEFAULT_MSG.to_string());
        Ok(ModuleOutput::failed(msg))
    }
}
