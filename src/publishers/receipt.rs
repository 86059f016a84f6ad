use super::{Letter, PublisherError};

/// The outcome of one publish attempt for one [`Letter`].
///
/// Exactly one receipt is emitted for every letter a [`Publisher`](super::Publisher)
/// accepted. On failure the letter is handed back so it can be resubmitted.
#[derive(Debug)]
pub struct PublishReceipt {
    pub letter_id: u64,
    pub success: bool,
    /// Set iff `success` is `false`.
    pub error: Option<PublisherError>,
    /// Set iff `success` is `false`.
    pub failed_letter: Option<Letter>,
}

impl PublishReceipt {
    pub(crate) fn new(letter: Letter, outcome: Result<(), PublisherError>) -> Self {
        match outcome {
            Ok(()) => Self {
                letter_id: letter.letter_id,
                success: true,
                error: None,
                failed_letter: None,
            },
            Err(error) => Self {
                letter_id: letter.letter_id,
                success: false,
                error: Some(error),
                failed_letter: Some(letter),
            },
        }
    }

    /// Take the failed letter back, e.g. to queue it again.
    pub fn into_failed_letter(self) -> Option<Letter> {
        self.failed_letter
    }
}
