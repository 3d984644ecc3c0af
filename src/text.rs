use std::time::{Duration, Instant};

/// Drops carriage returns, turns newlines into spaces and collapses runs of
/// spaces.
pub fn cleanup_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\r' => {}
            '\n' | ' ' => {
                if !out.ends_with(' ') {
                    out.push(' ');
                }
            }
            other => out.push(other),
        }
    }
    out.trim().to_string()
}

/// `"Card Holder name"` -> `"cardHolderName"`.
pub fn to_camel_case(text: &str) -> String {
    let mut words = text.split(' ');
    let mut out = words.next().unwrap_or_default().to_lowercase();
    for word in words {
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(&chars.as_str().to_lowercase());
        }
    }
    out
}

/// Run start captured by the caller and passed to whatever reports elapsed
/// time.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    started: Instant,
}

impl RunClock {
    pub fn start() -> Self {
        Self::from_instant(Instant::now())
    }

    pub fn from_instant(started: Instant) -> Self {
        Self { started }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn format_elapsed(&self) -> String {
        format_duration(self.elapsed())
    }
}

/// `HH:MM:SS.ss`
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs_f64();
    let hours = (total / 3600.0).floor();
    let minutes = ((total - hours * 3600.0) / 60.0).floor();
    let seconds = total - hours * 3600.0 - minutes * 60.0;
    format!("{:02}:{:02}:{:05.2}", hours as u64, minutes as u64, seconds)
}
