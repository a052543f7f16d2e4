use clap::Parser;
use rotor_common::SettingsPatch;

#[derive(Parser)]
#[command(name = "rotor", about = "Gemini protocol gateway with credential rotation")]
pub(crate) struct Cli {
    #[arg(long)]
    pub(crate) host: Option<String>,
    #[arg(long)]
    pub(crate) port: Option<u16>,
    /// Directory holding one JSON document per credential.
    #[arg(long)]
    pub(crate) credentials_dir: Option<String>,
    #[arg(long)]
    pub(crate) calls_per_rotation: Option<u32>,
    #[arg(long)]
    pub(crate) compatibility_mode: Option<bool>,
}

impl Cli {
    pub(crate) fn into_patch(self) -> SettingsPatch {
        SettingsPatch {
            host: self.host,
            port: self.port,
            credentials_dir: self.credentials_dir,
            calls_per_rotation: self.calls_per_rotation,
            compatibility_mode: self.compatibility_mode,
            ..SettingsPatch::default()
        }
    }
}
