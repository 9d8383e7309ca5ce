pub mod pipeline;
pub mod status;
pub mod step;

pub use pipeline::{ArgDef, PipelineDef, PipelineDefError, StageDef, TaskDef};
pub use status::{worse, NodeStatus, PipelineStatus};
pub use step::{ScriptLang, StepDef};
