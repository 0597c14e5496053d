use thiserror::Error;

/// Conditions that end the pass: logged, and the process exits non-zero.
/// State already persisted by the time one of these surfaces stays persisted.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("plan from server was malformed: {0}")]
    PlanMalformed(String),

    #[error("unable to reach server: {0}")]
    TransmissionFailed(String),
}

/// Per-plugin failures. These fold into the checkin batch as error entries
/// and never abort the pass or touch other plugins' records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginError {
    #[error("plugin would not compile: {0}")]
    LoadFailed(String),

    #[error("plugin took longer than {0}s to run")]
    TimedOut(u64),

    #[error("plugin raised during its run: {0}")]
    RunFailed(String),
}

impl PluginError {
    /// Subject/body pair for the error entry reported to the server.
    pub fn to_entry(&self) -> (String, Option<String>) {
        match self {
            PluginError::LoadFailed(message) => {
                ("Plugin would not compile.".to_string(), Some(message.clone()))
            }
            PluginError::TimedOut(secs) => {
                (format!("Plugin took longer than {}s to run.", secs), None)
            }
            PluginError::RunFailed(message) => {
                ("Plugin raised during its run.".to_string(), Some(message.clone()))
            }
        }
    }
}
