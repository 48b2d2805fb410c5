#[macro_use]
extern crate log;

#[cfg(test)]
#[macro_use]
extern crate registry_test;

pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod logging;
pub mod model;
pub mod qr;
pub mod registry;
pub mod sweeper;

pub use config::Config;
pub use error::{Error, Result};
pub use gate::Gate;
pub use registry::{Registry, RegistryBuilder, SurveyStatus};
