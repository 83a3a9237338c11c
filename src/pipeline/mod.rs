pub mod attachment;
pub mod csv_validation;
pub mod content; // Per-system content sniffing ahead of dispatch
pub mod dispatch;
pub mod engine; // External converter process adapter
pub mod packaging;
pub mod session_log;
pub mod processor;

pub use dispatch::{ConversionEngine, Direction, EngineRegistry, Serialization, SystemId};
pub use processor::{
    ConversionPipeline, ConversionResponse, FromStandardForm, PipelineError, ToStandardForm,
};
pub use session_log::SessionLog;
