pub mod error;
pub mod settings;

pub use error::{GatewayError, GatewayResult, Outcome};
pub use settings::{Settings, SettingsPatch};
