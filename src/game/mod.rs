pub mod constants;
pub mod input_buffer;
pub mod sandbox;
pub mod simulation;
