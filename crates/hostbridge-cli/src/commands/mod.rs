pub mod completions;
pub mod doctor;
pub mod gc;
pub mod launch;
pub mod list;
pub mod provision;
pub mod reset;
pub mod rollback;
pub mod verify;

use hostbridge_core::{CoreError, ErrorClass, ProvisioningError, ProvisioningManager};
use hostbridge_fetch::FetchConfig;
use hostbridge_schema::SessionConfig;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MANIFEST_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;
pub const EXIT_INCOMPATIBLE: u8 = 4;
pub const EXIT_CRASHED: u8 = 5;

/// Everything a command needs from the global flags.
pub struct Context {
    pub session: SessionConfig,
    pub json: bool,
}

impl Context {
    pub fn store(&self) -> &Path {
        &self.session.store_root
    }

    pub fn manager(&self) -> Result<ProvisioningManager, CommandError> {
        let fetch = match self.session.fetch_config {
            Some(ref path) => FetchConfig::load(path).map_err(CommandError::input)?,
            None => FetchConfig::default(),
        };
        Ok(ProvisioningManager::with_fetch_config(self.store(), fetch))
    }
}

/// A failed command: the message for stderr and the process exit code.
#[derive(Debug)]
pub struct CommandError {
    pub code: u8,
    pub message: String,
}

impl CommandError {
    pub fn input(e: impl std::fmt::Display) -> Self {
        Self {
            code: EXIT_MANIFEST_ERROR,
            message: e.to_string(),
        }
    }
}

pub fn exit_code(class: ErrorClass) -> u8 {
    match class {
        ErrorClass::Input => EXIT_MANIFEST_ERROR,
        ErrorClass::Provisioning => EXIT_STORE_ERROR,
        ErrorClass::IncompatibleRuntime => EXIT_INCOMPATIBLE,
        ErrorClass::Usage | ErrorClass::Internal => EXIT_FAILURE,
    }
}

impl From<CoreError> for CommandError {
    fn from(e: CoreError) -> Self {
        Self {
            code: exit_code(e.class()),
            message: e.to_string(),
        }
    }
}

impl From<ProvisioningError> for CommandError {
    fn from(e: ProvisioningError) -> Self {
        CoreError::from(e).into()
    }
}

impl From<String> for CommandError {
    fn from(message: String) -> Self {
        Self {
            code: EXIT_FAILURE,
            message,
        }
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, CommandError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| CommandError::from(format!("JSON serialization failed: {e}")))
}

fn plain_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spinner(msg: &str) -> ProgressBar {
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    let pb = ProgressBar::new_spinner();
    pb.set_style(style);
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// A byte-counting bar for one archive transfer.
pub fn transfer_bar(pb: &ProgressBar, total: u64) {
    let style = ProgressStyle::with_template(
        "{spinner:.cyan} {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ");
    pb.set_style(style);
    pb.set_length(total);
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_status(status: &str) -> String {
    use console::Style;
    match status {
        "installed" | "exited" => Style::new().green().apply_to(status).to_string(),
        "running" => Style::new().cyan().bold().apply_to(status).to_string(),
        "downloading" | "verifying" => Style::new().yellow().apply_to(status).to_string(),
        "corrupt" | "crashed" => Style::new().red().bold().apply_to(status).to_string(),
        "superseded" | "absent" => Style::new().dim().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}
