pub mod action;
pub mod adoption;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ledger;
pub mod sim;
pub mod targets;
pub mod thermostat;
pub mod topics;
pub mod types;
pub mod wire;

pub use adoption::RestoreSnapshot;
pub use bus::{DeviceBus, DeviceFeatures, DeviceState};
pub use config::{NetworkConfig, RuntimeConfig, WrapperConfig};
pub use error::{CommandError, CommandErrorKind, ConfigError, ControllerError, ErrorClass};
pub use thermostat::{ClimateController, TemperatureRequest};
pub use topics::*;
pub use types::{
    ControllerStatus, DeviceRole, HvacAction, HvacMode, RoleMap, RunningMode, SensorKind,
};
pub use wire::{CommandErrorReport, DeviceCommand, DeviceStateReport};
