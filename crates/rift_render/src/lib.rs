pub mod backend;
pub mod camera;
pub mod graph;
pub mod pass;
pub mod settings;
pub mod window;
