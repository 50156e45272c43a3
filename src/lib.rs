pub mod adjoint_forcing;
pub mod archive;
pub mod config;
pub mod constants;
pub mod context;
pub mod data;
pub mod date_tags;
pub mod errors;
pub mod model;
pub mod obs_operator;
pub mod precon;
pub mod time_grid;
pub mod variational;
pub mod weights;
