pub mod delete;
pub mod jobs;
pub mod references;
pub mod system;
