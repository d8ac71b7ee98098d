pub mod config;
pub mod exchange;
pub mod geometry;
pub mod io;
pub mod loop_closing;
pub mod mapping;
pub mod system;
pub mod timing;
pub mod viz;
