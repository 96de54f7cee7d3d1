pub mod defer;
pub mod timer;
