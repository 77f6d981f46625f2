//! Error types
//!
//! Only malformed input is an error. Failing to resolve a value or to gather enough
//! evidence is an ordinary analysis outcome and never surfaces here.

use thiserror::Error;

use crate::ir::{BlockId, FuncId, InstId};

/// Structural problems that make a single function unanalysable
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IrError {
    #[error("function {name}: block {block} has no terminator")]
    MissingTerminator { name: String, block: BlockId },

    #[error("function {name}: terminator {inst} is not the last instruction of {block}")]
    MisplacedTerminator {
        name: String,
        block: BlockId,
        inst: InstId,
    },

    #[error("function {name}: {inst} jumps to {target}, which belongs to another function")]
    ForeignSuccessor {
        name: String,
        inst: InstId,
        target: BlockId,
    },

    #[error("function {name}: {inst} uses {operand}, which is defined in another function")]
    ForeignOperand {
        name: String,
        inst: InstId,
        operand: InstId,
    },

    #[error("function {name}: phi {inst} has incoming block {block} that is not a predecessor")]
    BadPhiIncoming {
        name: String,
        inst: InstId,
        block: BlockId,
    },

    #[error("function {name}: {inst} uses an argument of {owner} or one out of range")]
    BadArgument {
        name: String,
        inst: InstId,
        owner: FuncId,
    },
}

/// Malformed interval data read back from a serialized document
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntervalError {
    #[error("range [{low}, {high}] has its bounds inverted")]
    InvertedRange { low: i32, high: i32 },
}

/// Problems with user-supplied configuration
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("{key} must be within [0, 1], got {value}")]
    OutOfRange { key: String, value: f64 },

    #[error("malformed configuration document: {0}")]
    Json(String),
}

/// Errors surfaced by the analysis driver
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("rejected malformed function: {0}")]
    Ir(#[from] IrError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("no function named {0} in the program")]
    UnknownFunction(String),

    #[error("shared analysis tables poisoned by a panicking worker")]
    LockPoisoned,
}
