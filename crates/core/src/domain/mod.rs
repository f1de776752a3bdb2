pub mod error;
pub mod job;
pub mod params;
pub mod settings;
