use std::sync::{Mutex, PoisonError};

use arboard::Clipboard;

pub trait ClipboardSink: Send + Sync {
    fn set_text(&self, value: &str) -> Result<(), String>;
}

/// The system pasteboard. A fresh handle is opened per write since some
/// platforms invalidate long-lived handles.
#[derive(Debug, Default)]
pub struct SystemClipboard;

impl ClipboardSink for SystemClipboard {
    fn set_text(&self, value: &str) -> Result<(), String> {
        let mut clipboard = Clipboard::new().map_err(|err| err.to_string())?;
        clipboard
            .set_text(value.to_owned())
            .map_err(|err| err.to_string())
    }
}

/// In-process clipboard, used by headless hosts and tests.
#[derive(Debug, Default)]
pub struct MemoryClipboard {
    contents: Mutex<Option<String>>,
}

impl MemoryClipboard {
    pub fn contents(&self) -> Option<String> {
        self.contents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ClipboardSink for MemoryClipboard {
    fn set_text(&self, value: &str) -> Result<(), String> {
        *self.contents.lock().unwrap_or_else(PoisonError::into_inner) = Some(value.to_owned());
        Ok(())
    }
}
