pub mod config;
pub mod factor;
pub mod landmark;
pub mod mapper;
pub mod matching;
pub mod refine;
pub mod smoother;

pub use config::MappingConfig;
pub use landmark::{LandmarkStore, PlaneLandmark};
pub use mapper::{MapObserver, Mapper, MapperError};
