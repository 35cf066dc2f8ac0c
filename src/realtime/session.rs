/// Lifecycle of the remote response currently being generated.
///
/// `begin` on `response.created`, `finish` on `response.done` once playback
/// has drained, `cancel` when a barge-in cancels it locally.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResponseSession {
    in_progress: bool,
    transcript: String,
}

impl ResponseSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new response started; the previous transcript is discarded.
    pub fn begin(&mut self) {
        self.in_progress = true;
        self.transcript.clear();
    }

    pub fn append_transcript(&mut self, delta: &str) {
        self.transcript.push_str(delta);
    }

    /// Mark done. Returns whether a response was in progress.
    pub fn finish(&mut self) -> bool {
        std::mem::replace(&mut self.in_progress, false)
    }

    /// Local cancel; same state change as `finish`, kept separate for logs.
    pub fn cancel(&mut self) -> bool {
        self.finish()
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
