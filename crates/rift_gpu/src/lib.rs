pub mod composite;
pub mod headless;
pub mod pool;
