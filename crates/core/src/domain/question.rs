// Question / Answer exchange

use serde::{Deserialize, Serialize};

/// Mid-transaction request for client input.
///
/// The transaction makes no forward progress until a matching
/// [`Answer`] arrives or its owning session goes away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Question {
    /// Packages failed signature checks; install anyway?
    InstallUntrusted { untrusted_items: Vec<String> },
    /// Insert the named medium into the drive
    MediaChange { media: String, drive: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Answer {
    InstallUntrusted { install_untrusted: bool },
    MediaChange { media_changed: bool },
}

impl Question {
    /// The answer used when nobody is left to ask
    pub fn decline(&self) -> Answer {
        match self {
            Question::InstallUntrusted { .. } => Answer::InstallUntrusted {
                install_untrusted: false,
            },
            Question::MediaChange { .. } => Answer::MediaChange {
                media_changed: false,
            },
        }
    }
}

impl Answer {
    /// True if this answer is of the kind `question` expects
    pub fn answers(&self, question: &Question) -> bool {
        matches!(
            (self, question),
            (Answer::InstallUntrusted { .. }, Question::InstallUntrusted { .. })
                | (Answer::MediaChange { .. }, Question::MediaChange { .. })
        )
    }

    /// True if the transaction should keep going after this answer
    pub fn proceeds(&self) -> bool {
        match self {
            Answer::InstallUntrusted { install_untrusted } => *install_untrusted,
            Answer::MediaChange { media_changed } => *media_changed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_kind_must_match() {
        let q = Question::InstallUntrusted {
            untrusted_items: vec!["pkgX".to_string()],
        };
        assert!(Answer::InstallUntrusted {
            install_untrusted: true
        }
        .answers(&q));
        assert!(!Answer::MediaChange {
            media_changed: true
        }
        .answers(&q));
    }

    #[test]
    fn test_decline_does_not_proceed() {
        let q = Question::MediaChange {
            media: "Debian DVD 1".to_string(),
            drive: "/media/cdrom".to_string(),
        };
        let answer = q.decline();
        assert!(answer.answers(&q));
        assert!(!answer.proceeds());
    }
}
