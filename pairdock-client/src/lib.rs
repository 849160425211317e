pub mod address;
pub mod clipboard;
pub mod config;
pub mod confirmation;
pub mod controller;
pub mod logging;
pub mod render;

pub use controller::{
    Collaborators, CopyError, PairingScreenController, PairingSettings, RefreshSignal,
    ScreenOptions, ScreenUpdate,
};
