pub mod icons;
pub mod pipeline_progress;

pub use pipeline_progress::{PipelineUI, UiMode, format_duration};
