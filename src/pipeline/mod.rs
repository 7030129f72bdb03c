pub mod controller;
pub mod gateway;
pub mod latest;
pub mod preprocess;

pub use controller::{Pipeline, PipelineError, PipelineEvent, PipelineParts};
pub use gateway::{
    Completion, DetectionError, DetectionGateway, DetectionListener, GatewayOptions, GatewayState,
    SubmitOutcome,
};
pub use latest::{latest_frame_channel, FrameReceiver, FrameSender};
pub use preprocess::{FramePreprocessor, PreprocessError, PreprocessedImage};
