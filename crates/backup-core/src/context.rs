use std::sync::Arc;

use crate::config::EngineConfig;
use crate::tools::{SystemToolRunner, ToolRunner};

/// Everything a pipeline invocation needs, built once and passed down.
#[derive(Clone)]
pub struct BackupContext {
    pub config: Arc<EngineConfig>,
    pub runner: Arc<dyn ToolRunner>,
}

impl BackupContext {
    pub fn new(config: EngineConfig, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            config: Arc::new(config),
            runner,
        }
    }

    /// Context that shells out to the real `mysql`/`mysqldump`/`gpg`.
    pub fn with_system_tools(config: EngineConfig) -> Self {
        Self::new(config, Arc::new(SystemToolRunner))
    }
}
