//! Tunnel and process errors

use thiserror::Error;

use crate::scripts::ScriptKey;

pub type TunnelResult<T> = Result<T, TunnelError>;

/// An OS command could not be run to completion
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} was terminated by a signal")]
    Killed { program: String },
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Missing tunnel script: {0}")]
    MissingScript(ScriptKey),

    #[error("Tunnel script matrix is incomplete: {}", format_keys(.0))]
    IncompleteMatrix(Vec<ScriptKey>),

    /// A rendered script ran and exited non-zero
    #[error("{key} script exited with status {code}: {stderr}")]
    Establish {
        key: ScriptKey,
        code: i32,
        stderr: String,
    },

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Node {uid} has no {attribute}")]
    MissingAttribute { uid: String, attribute: &'static str },
}

fn format_keys(keys: &[ScriptKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
