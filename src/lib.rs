//! Error-return interval learning and error-check violation finding
//!
//! The library works on a whole program held in an arena IR ([`ir`]). It learns, for
//! every function, the interval of integer values it returns on error, from the way
//! callers check those values and from the error-handling code that follows the
//! checks. It then reports call sites that leave errors unchecked, check them wrongly,
//! truncate them, or break the sign convention of their return type.
//!
//! [`pipeline::analyze`] runs everything with the default collaborators; embedding
//! tools with their own indirect-call or alias information use [`pipeline::Analyzer`].

pub mod callgraph;
pub mod cfg;
pub mod checks;
pub mod config;
pub mod context;
pub mod error;
pub mod interval;
pub mod ir;
pub mod learn;
pub mod paths;
pub mod pipeline;
pub mod resolve;
pub mod summary;
pub mod violations;
pub mod vsa;

pub use callgraph::{AliasOracle, BasicAliasOracle, CallGraph};
pub use config::AnalysisConfig;
pub use error::{AnalysisError, ConfigError, IntervalError, IrError};
pub use interval::{Interval, Range};
pub use pipeline::{AnalysisOutcome, Analyzer, analyze};
pub use violations::{SourceLocation, ViolationKind, ViolationRecord};
