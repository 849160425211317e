use std::time::Duration;

pub const COPY_CONFIRMATION_MESSAGE: &str = "Copied! Keep it safe";
pub const COPY_CONFIRMATION_TTL: Duration = Duration::from_millis(2500);

/// Transient "copied" message.
///
/// Every [`CopyConfirmation::show`] returns a ticket; only the ticket of the
/// most recent show may clear the message, so a timer left over from an
/// earlier copy can never hide a newer confirmation early.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CopyConfirmation {
    message: Option<String>,
    ticket: u64,
}

impl CopyConfirmation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn show(&mut self, message: impl Into<String>) -> u64 {
        self.ticket += 1;
        self.message = Some(message.into());
        self.ticket
    }

    /// Returns `true` if the message was cleared.
    pub fn expire(&mut self, ticket: u64) -> bool {
        if ticket != self.ticket || self.message.is_none() {
            return false;
        }
        self.message = None;
        true
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_ticket_does_not_clear_newer_message() {
        let mut confirmation = CopyConfirmation::new();
        let first = confirmation.show(COPY_CONFIRMATION_MESSAGE);
        let second = confirmation.show(COPY_CONFIRMATION_MESSAGE);

        assert!(!confirmation.expire(first));
        assert_eq!(confirmation.message(), Some(COPY_CONFIRMATION_MESSAGE));

        assert!(confirmation.expire(second));
        assert_eq!(confirmation.message(), None);
        assert!(!confirmation.expire(second));
    }
}
