pub mod cache;
pub mod matching;
pub mod model;
pub mod pipeline;
pub mod remote;
pub mod sources;
pub mod tracing;

pub mod util {
    pub mod env;
}
