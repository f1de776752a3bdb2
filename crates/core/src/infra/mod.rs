pub mod audio_probe;
pub mod backend;
pub mod dispatcher;
pub mod generator;
pub mod layout;
pub mod materializer;
pub mod metrics;
pub mod probe;
pub mod status;
