pub mod cast;
pub mod layers;
pub mod math;
pub mod portal;
pub mod trace;
