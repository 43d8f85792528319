pub mod config;
pub mod errors;

pub use config::{apply_overrides, load_config, AppConfig, ConfigOverrides, LimitSettings};
pub use errors::AppError;

use serde::Serialize;

/// Flash messages accumulated over one request. Additive: errors from a
/// batched operation surface as multiple entries in the order encountered,
/// and info flashes never clear earlier error flashes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Flashes {
    pub error_flashes: Vec<String>,
    pub info_flashes: Vec<String>,
}

impl Flashes {
    pub fn error(&mut self, msg: impl Into<String>) {
        self.error_flashes.push(msg.into());
    }

    pub fn info(&mut self, msg: impl Into<String>) {
        self.info_flashes.push(msg.into());
    }

    pub fn is_empty(&self) -> bool {
        self.error_flashes.is_empty() && self.info_flashes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::Flashes;

    #[test]
    fn flashes_accumulate_in_order() {
        let mut flashes = Flashes::default();
        flashes.error("first");
        flashes.info("sent a.txt");
        flashes.error("second");

        assert_eq!(flashes.error_flashes, vec!["first", "second"]);
        assert_eq!(flashes.info_flashes, vec!["sent a.txt"]);
        assert!(!flashes.is_empty());
    }
}
